// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Mock collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};

use stockpile::{
    AssetStore, AuthState, CacheOrder, CancelFlag, ContentFetcher, DataEvent, DataLayer,
    FetchOutcome, Item, ItemStatus, NetworkChange, NetworkMonitor, OfflineStatus, Orchestrator,
    OrchestratorConfig, OrchestratorDeps, PersistError, PrefChange, PreferenceStore, View,
};

/// Content fetcher with scripted outcomes, an optional gate to keep fetches
/// in flight, and call accounting.
pub struct MockFetcher {
    outcomes: Mutex<HashMap<String, FetchOutcome>>,
    default_outcome: Mutex<FetchOutcome>,
    /// Items whose fetch has started, in start order
    pub started: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
    panics: Mutex<Vec<String>>,
    gated: AtomicBool,
    gate: Semaphore,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(HashMap::new()),
            default_outcome: Mutex::new(FetchOutcome::Success {
                encoding: Some("utf-8".into()),
                mime: Some("text/html".into()),
            }),
            started: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            panics: Mutex::new(Vec::new()),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    /// Make the fetch for one item panic instead of returning an outcome.
    pub fn set_panic(&self, item_id: &str) {
        self.panics.lock().unwrap().push(item_id.to_string());
    }

    /// Script the outcome for one item (by id).
    pub fn set_outcome(&self, item_id: &str, outcome: FetchOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(item_id.to_string(), outcome);
    }

    pub fn set_default_outcome(&self, outcome: FetchOutcome) {
        *self.default_outcome.lock().unwrap() = outcome;
    }

    /// Make fetches block until released (they still poll the cancel flag).
    pub fn hold(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Let `n` held fetches proceed.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    pub fn start_order(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentFetcher for MockFetcher {
    async fn fetch(&self, item: &Item, _refresh: bool, cancelled: &CancelFlag) -> FetchOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(item.id.clone());

        let should_panic = self.panics.lock().unwrap().iter().any(|id| *id == item.id);
        if should_panic {
            panic!("scripted fetch crash for {}", item.id);
        }

        if self.gated.load(Ordering::SeqCst) {
            // Cooperative: check the cancel flag between short waits.
            loop {
                if cancelled.is_cancelled() {
                    return FetchOutcome::Cancelled;
                }
                match tokio::time::timeout(Duration::from_millis(5), self.gate.acquire()).await {
                    Ok(Ok(permit)) => {
                        permit.forget();
                        break;
                    }
                    _ => continue,
                }
            }
        }

        if cancelled.is_cancelled() {
            return FetchOutcome::Cancelled;
        }
        self.outcomes
            .lock()
            .unwrap()
            .get(&item.id)
            .cloned()
            .unwrap_or_else(|| self.default_outcome.lock().unwrap().clone())
    }
}

/// One persisted status record.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedStatus {
    pub item_id: String,
    pub view: View,
    pub status: OfflineStatus,
    pub encoding: Option<String>,
    pub mime: Option<String>,
}

/// In-memory data layer.
pub struct MockData {
    pub items: Mutex<Vec<Item>>,
    pub saved: Mutex<Vec<SavedStatus>>,
    pub storage_unavailable: AtomicBool,
    pub initial_sync_done: AtomicBool,
    pub events: broadcast::Sender<DataEvent>,
}

impl MockData {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            items: Mutex::new(Vec::new()),
            saved: Mutex::new(Vec::new()),
            storage_unavailable: AtomicBool::new(false),
            initial_sync_done: AtomicBool::new(true),
            events,
        })
    }

    pub fn add(&self, item: Item) {
        self.items.lock().unwrap().push(item);
    }

    pub fn saved_statuses(&self) -> Vec<SavedStatus> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataLayer for MockData {
    async fn unread_items(
        &self,
        _order: CacheOrder,
        host: Option<&str>,
    ) -> anyhow::Result<Vec<Item>> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.status == ItemStatus::Unread)
            .filter(|i| match host {
                Some(h) => i.host.as_deref() == Some(h),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn save_offline_status(
        &self,
        item: &Item,
        view: View,
        status: OfflineStatus,
        encoding: Option<String>,
        mime: Option<String>,
    ) -> Result<(), PersistError> {
        if self.storage_unavailable.load(Ordering::SeqCst) {
            return Err(PersistError::StorageUnavailable);
        }
        self.saved.lock().unwrap().push(SavedStatus {
            item_id: item.id.clone(),
            view,
            status,
            encoding,
            mime,
        });
        // Keep the item snapshots in step so a re-scan sees the new status
        let mut items = self.items.lock().unwrap();
        if let Some(stored) = items.iter_mut().find(|i| i.id == item.id) {
            match view {
                View::Article => stored.article_status = status,
                View::Web => stored.web_status = status,
            }
        }
        Ok(())
    }

    fn initial_sync_complete(&self) -> bool {
        self.initial_sync_done.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<DataEvent> {
        self.events.subscribe()
    }
}

pub struct MockAssets {
    pub authorized: AtomicBool,
    pub restricted: AtomicBool,
    pub order: Mutex<CacheOrder>,
    pub diagnose_calls: AtomicUsize,
    pub cache_cleared: broadcast::Sender<()>,
}

impl MockAssets {
    pub fn new() -> Arc<Self> {
        let (cache_cleared, _) = broadcast::channel(4);
        Arc::new(Self {
            authorized: AtomicBool::new(true),
            restricted: AtomicBool::new(false),
            order: Mutex::new(CacheOrder::KeepNewest),
            diagnose_calls: AtomicUsize::new(0),
            cache_cleared,
        })
    }
}

#[async_trait]
impl AssetStore for MockAssets {
    fn is_download_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }
    fn is_offline_downloading_restricted(&self) -> bool {
        self.restricted.load(Ordering::SeqCst)
    }
    fn cache_order(&self) -> CacheOrder {
        *self.order.lock().unwrap()
    }
    fn subscribe_cache_cleared(&self) -> broadcast::Receiver<()> {
        self.cache_cleared.subscribe()
    }
    async fn diagnose_storage(&self) {
        self.diagnose_calls.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockPrefs {
    pub article: AtomicBool,
    pub web: AtomicBool,
    pub wifi_only: AtomicBool,
    pub suspended: Mutex<Option<DateTime<Utc>>>,
    pub changes: broadcast::Sender<PrefChange>,
}

impl MockPrefs {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(4);
        Arc::new(Self {
            article: AtomicBool::new(true),
            web: AtomicBool::new(true),
            wifi_only: AtomicBool::new(false),
            suspended: Mutex::new(None),
            changes,
        })
    }
}

impl PreferenceStore for MockPrefs {
    fn download_article_view(&self) -> bool {
        self.article.load(Ordering::SeqCst)
    }
    fn download_web_view(&self) -> bool {
        self.web.load(Ordering::SeqCst)
    }
    fn wifi_only(&self) -> bool {
        self.wifi_only.load(Ordering::SeqCst)
    }
    fn last_suspended(&self) -> Option<DateTime<Utc>> {
        *self.suspended.lock().unwrap()
    }
    fn set_last_suspended(&self, at: Option<DateTime<Utc>>) {
        *self.suspended.lock().unwrap() = at;
    }
    fn subscribe(&self) -> broadcast::Receiver<PrefChange> {
        self.changes.subscribe()
    }
}

pub struct MockNetwork {
    pub online: AtomicBool,
    pub wifi: AtomicBool,
    pub stable_since: Mutex<Option<DateTime<Utc>>>,
    pub changes: broadcast::Sender<NetworkChange>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        let (changes, _) = broadcast::channel(4);
        Arc::new(Self {
            online: AtomicBool::new(true),
            wifi: AtomicBool::new(true),
            // Long past: the stability window is satisfied
            stable_since: Mutex::new(Some(Utc::now() - ChronoDuration::hours(1))),
            changes,
        })
    }

    /// Flip to a non-Wi-Fi network and notify subscribers.
    pub fn switch_to_cellular(&self) {
        self.wifi.store(false, Ordering::SeqCst);
        let _ = self.changes.send(NetworkChange {
            online: true,
            wifi: false,
        });
    }
}

impl NetworkMonitor for MockNetwork {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
    fn is_wifi(&self) -> bool {
        self.wifi.load(Ordering::SeqCst)
    }
    fn stable_since(&self) -> Option<DateTime<Utc>> {
        *self.stable_since.lock().unwrap()
    }
    fn subscribe(&self) -> broadcast::Receiver<NetworkChange> {
        self.changes.subscribe()
    }
}

pub struct MockAuth(pub AtomicBool);

impl MockAuth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(true)))
    }
}

impl AuthState for MockAuth {
    fn is_logged_in(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A fully permissive environment: logged in, stable Wi-Fi, storage
/// headroom, both views enabled.
pub struct TestEnv {
    pub article: Arc<MockFetcher>,
    pub web: Arc<MockFetcher>,
    pub data: Arc<MockData>,
    pub assets: Arc<MockAssets>,
    pub prefs: Arc<MockPrefs>,
    pub network: Arc<MockNetwork>,
    pub auth: Arc<MockAuth>,
}

impl TestEnv {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self {
            article: MockFetcher::new(),
            web: MockFetcher::new(),
            data: MockData::new(),
            assets: MockAssets::new(),
            prefs: MockPrefs::new(),
            network: MockNetwork::new(),
            auth: MockAuth::new(),
        }
    }

    pub fn deps(&self) -> OrchestratorDeps {
        OrchestratorDeps {
            article_fetcher: self.article.clone(),
            web_fetcher: self.web.clone(),
            data: self.data.clone(),
            assets: self.assets.clone(),
            prefs: self.prefs.clone(),
            network: self.network.clone(),
            auth: self.auth.clone(),
        }
    }

    pub fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            shutdown_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.deps(), self.config())
    }

    pub fn orchestrator_with(&self, config: OrchestratorConfig) -> Orchestrator {
        Orchestrator::new(self.deps(), config)
    }

    /// Add an unread, not-yet-downloaded item to the data layer.
    pub fn add_item(&self, id: &str) -> Item {
        let item = Item::new(id, Utc::now());
        self.data.add(item.clone());
        item
    }
}

/// Poll until `check` holds, panicking after two seconds.
pub async fn wait_until<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}

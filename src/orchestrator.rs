// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Top-level download orchestrator.
//!
//! Owns the session and the scheduler, applies the gating policy, exposes
//! the public operations (predownload scan, on-demand download, cancel,
//! suspend, retry), and reacts to external triggers (sync completion,
//! new-item events, preference changes, network changes, cache clears).
//!
//! All orchestrator state lives behind one coarse lock: these operations are
//! O(session size) bookkeeping, never per-byte work, and the lock is never
//! held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::policy::GatingPolicy;
use crate::scheduler::{PoolJob, TaskScheduler};
use crate::session::Session;
use crate::task::{DownloadCallback, DownloadTask, TaskContext, TaskRun};
use crate::traits::{
    AssetStore, AuthState, ContentFetcher, DataLayer, DataEvent, NetworkMonitor, PreferenceStore,
};
use crate::types::{DownloadPriority, Item, View};

/// External collaborators the orchestrator is constructed over.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub article_fetcher: Arc<dyn ContentFetcher>,
    pub web_fetcher: Arc<dyn ContentFetcher>,
    pub data: Arc<dyn DataLayer>,
    pub assets: Arc<dyn AssetStore>,
    pub prefs: Arc<dyn PreferenceStore>,
    pub network: Arc<dyn NetworkMonitor>,
    pub auth: Arc<dyn AuthState>,
}

struct CoreState {
    /// `None` between teardown and restart; every gating check fails closed
    /// while the pools are absent.
    scheduler: Option<TaskScheduler>,
    /// Exists exactly while at least one task is queued or running.
    session: Option<Session>,
    /// One-shot flag consumed by the next predownload scan.
    retries_allowed: bool,
}

pub(crate) struct OrchestratorCore {
    deps: OrchestratorDeps,
    config: OrchestratorConfig,
    policy: GatingPolicy,
    task_ctx: Arc<TaskContext>,
    state: Mutex<CoreState>,
    listeners: Mutex<HashMap<u64, Arc<dyn Fn() + Send + Sync>>>,
    next_listener_id: AtomicU64,
}

/// Cancel token returned from listener registration.
///
/// Dropping the handle does *not* unsubscribe; call [`cancel`](Self::cancel).
pub struct ListenerHandle {
    id: u64,
    core: Weak<OrchestratorCore>,
}

impl ListenerHandle {
    /// Remove the listener. Safe to call after the orchestrator is gone.
    pub fn cancel(self) {
        if let Some(core) = self.core.upgrade() {
            core.listeners.lock().unwrap().remove(&self.id);
        }
    }
}

/// Coordinates everything queued or running for offline downloading.
#[derive(Clone)]
pub struct Orchestrator {
    core: Arc<OrchestratorCore>,
}

impl Orchestrator {
    /// Build the orchestrator, spawn its pools, and wire the reactive
    /// triggers. Must be called within a tokio runtime.
    pub fn new(deps: OrchestratorDeps, config: OrchestratorConfig) -> Self {
        let policy = GatingPolicy::new(
            deps.auth.clone(),
            deps.network.clone(),
            deps.prefs.clone(),
            deps.assets.clone(),
            config.clone(),
        );

        let core = Arc::new_cyclic(|weak: &Weak<OrchestratorCore>| {
            let task_ctx = Arc::new(TaskContext {
                article_fetcher: deps.article_fetcher.clone(),
                web_fetcher: deps.web_fetcher.clone(),
                data: deps.data.clone(),
                assets: deps.assets.clone(),
                policy: policy.clone(),
                core: weak.clone(),
            });
            OrchestratorCore {
                deps: deps.clone(),
                policy,
                task_ctx,
                state: Mutex::new(CoreState {
                    scheduler: Some(TaskScheduler::new(
                        config.coordinator_pool_size,
                        config.worker_pool_size,
                    )),
                    session: None,
                    retries_allowed: false,
                }),
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(0),
                config,
            }
        });

        spawn_event_loops(&core);
        Self { core }
    }

    /// Scan every unread item matching the configured views and enqueue the
    /// missing downloads.
    pub async fn predownload_scan(&self) {
        self.core.scan(None).await;
    }

    /// Same, restricted to one host (used after a configuration change
    /// affecting only that host's reachability).
    pub async fn predownload_scan_host(&self, host: &str) {
        self.core.scan(Some(host)).await;
    }

    /// Per-item orchestration: enqueue whichever enabled views this item is
    /// missing. `is_new` marks a just-saved item (higher priority, tolerant
    /// of a transient storage-limit overshoot).
    pub fn on_item_became_eligible(&self, item: &Item, is_new: bool) {
        self.core.item_eligible(item, is_new, false);
    }

    /// On-demand download at high priority, bypassing the preference and
    /// storage-limit gates: the user explicitly asked. If the subsystem is
    /// torn down the callback fires immediately with no status.
    pub fn download(
        &self,
        item: &Item,
        view: View,
        refresh: bool,
        callback: Option<DownloadCallback>,
    ) {
        self.core
            .enqueue(item, view, DownloadPriority::High, refresh, false, callback);
    }

    /// Cancels every active task except high-priority ones (manual downloads
    /// continue). Closes the session if that empties it.
    pub fn cancel_predownloading(&self) {
        self.core.cancel_predownloading();
    }

    /// Unconditionally ends the session and tears the pools down. Used on
    /// logout and when the offline cache is cleared; idempotent.
    pub async fn cancel_all(&self) {
        self.core.cancel_all().await;
    }

    /// Teardown phase 1: stop all work and drop the pools so every gating
    /// check fails closed.
    pub async fn stop_modifying_user_data(&self) {
        self.core.cancel_all().await;
    }

    /// Teardown phase 2: abandon the session unconditionally.
    pub fn delete_user_data(&self) {
        let had_session = {
            let mut state = self.core.state.lock().unwrap();
            state.session.take().is_some()
        };
        if had_session {
            self.core.notify_listeners();
        }
    }

    /// Teardown phase 3: recreate the pools for the next session (for
    /// example a different user logging in).
    pub fn restart(&self) {
        let mut state = self.core.state.lock().unwrap();
        if state.scheduler.is_none() {
            state.scheduler = Some(TaskScheduler::new(
                self.core.config.coordinator_pool_size,
                self.core.config.worker_pool_size,
            ));
            info!("download pools restarted");
        }
    }

    /// Pause automatic downloading for the suspension window. Items saved
    /// after this moment keep flowing.
    pub fn suspend_auto_download(&self) {
        self.core.deps.prefs.set_last_suspended(Some(Utc::now()));
        info!("auto-download suspended");
    }

    /// Clear a suspension before its window expires.
    pub fn release_auto_download(&self) {
        self.core.deps.prefs.set_last_suspended(None);
    }

    /// Make `Failed` views eligible again for exactly the next scan.
    pub fn allow_retries(&self) {
        self.core.state.lock().unwrap().retries_allowed = true;
    }

    /// Distinct items with at least one pending predownload view.
    pub fn predownloading_count(&self) -> usize {
        let state = self.core.state.lock().unwrap();
        state
            .session
            .as_ref()
            .map(|s| s.predownloading_count())
            .unwrap_or(0)
    }

    /// Items fully resolved in the current session.
    pub fn predownloaded_count(&self) -> usize {
        let state = self.core.state.lock().unwrap();
        state
            .session
            .as_ref()
            .map(|s| s.predownloaded_count())
            .unwrap_or(0)
    }

    /// Is anything queued or running?
    pub fn is_downloading(&self) -> bool {
        self.core.state.lock().unwrap().session.is_some()
    }

    /// Register a state-change listener. The callback receives no payload;
    /// it re-reads the accessors. It must not mutate orchestrator state.
    pub fn on_download_state_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.core.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.core
            .listeners
            .lock()
            .unwrap()
            .insert(id, Arc::new(listener));
        ListenerHandle {
            id,
            core: Arc::downgrade(&self.core),
        }
    }

    /// Run a sub-fetch on the workers pool. Returns `false` when the
    /// subsystem is torn down. Meant for fetch implementations that want
    /// parallel sub-fetches without managing their own threads.
    pub fn submit_work<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = self.core.state.lock().unwrap();
        match &state.scheduler {
            Some(scheduler) => scheduler.work(fut),
            None => false,
        }
    }
}

impl OrchestratorCore {
    pub(crate) fn pools_alive(&self) -> bool {
        self.state.lock().unwrap().scheduler.is_some()
    }

    async fn scan(&self, host: Option<&str>) {
        if !self.policy.allowed(None, false, self.pools_alive()) {
            debug!("predownload scan skipped by gating policy");
            return;
        }
        // One-shot: the flag covers exactly this scan.
        let retry = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.retries_allowed)
        };

        let order = self.deps.assets.cache_order();
        let items = match self.deps.data.unread_items(order, host).await {
            Ok(items) => items,
            Err(err) => {
                warn!("predownload scan query failed: {err:#}");
                return;
            }
        };
        info!(items = items.len(), retry, ?host, "predownload scan");
        for item in &items {
            self.item_eligible(item, false, retry);
        }
    }

    fn item_eligible(&self, item: &Item, is_new: bool, retry: bool) {
        if !self.policy.allowed(Some(item), is_new, self.pools_alive()) {
            return;
        }
        let priority = if is_new {
            DownloadPriority::NewItem
        } else {
            DownloadPriority::Normal
        };
        for view in self.policy.enabled_views() {
            if item.offline_status(view).needs_download(retry) {
                self.enqueue(item, view, priority, false, true, None);
            }
        }
    }

    /// The dedup core. At most one tracked task per (item, view): a second
    /// request joins the existing task (escalating it when high priority)
    /// unless a refresh forces a fresh fetch, which supersedes it.
    fn enqueue(
        &self,
        item: &Item,
        view: View,
        priority: DownloadPriority,
        refresh: bool,
        predownload: bool,
        mut callback: Option<DownloadCallback>,
    ) {
        let key = item.key(view);
        let mut superseded: Option<Arc<DownloadTask>> = None;
        let mut joined: Option<(Arc<DownloadTask>, Option<DownloadCallback>)> = None;
        let mut submitted = false;

        {
            let mut state = self.state.lock().unwrap();
            if state.scheduler.is_none() {
                drop(state);
                debug!(item = %item.id, ?view, "enqueue refused: subsystem torn down");
                if let Some(cb) = callback {
                    cb(item, view, None);
                }
                return;
            }
            let CoreState {
                scheduler,
                session: session_slot,
                ..
            } = &mut *state;
            let Some(scheduler) = scheduler.as_ref() else {
                return;
            };
            let session = session_slot.get_or_insert_with(Session::new);

            if !refresh {
                if let Some(existing) = session.task(&key) {
                    if priority == DownloadPriority::High {
                        scheduler.escalate(
                            &TaskRun {
                                task: existing.clone(),
                                ctx: self.task_ctx.clone(),
                            },
                            priority.queue_rank(),
                        );
                    }
                    // Attach the callback outside the lock: it may fire user
                    // code immediately if the task is already terminal.
                    joined = Some((existing.clone(), callback.take()));
                }
            } else if let Some(existing) = session.task(&key) {
                existing.cancel();
                superseded = Some(existing.clone());
            }

            if joined.is_none() {
                let task = Arc::new(DownloadTask::new(
                    item.clone(),
                    view,
                    priority,
                    refresh,
                    predownload,
                ));
                if let Some(cb) = callback {
                    // Freshly queued, cannot be terminal: this only pushes.
                    task.add_callback(cb);
                }
                session.submitted(&task);
                let job: Arc<dyn PoolJob> = Arc::new(TaskRun {
                    task: task.clone(),
                    ctx: self.task_ctx.clone(),
                });
                submitted = scheduler.submit(job);
                if !submitted {
                    // Shutdown race; undo the bookkeeping without counting
                    // the item as completed.
                    session.retract(&task);
                    if session.is_empty() {
                        *session_slot = None;
                    }
                }
                debug!(item = %item.id, ?view, ?priority, refresh, "download enqueued");
            }
        }

        if let Some((existing, cb)) = joined {
            if let Some(cb) = cb {
                existing.add_callback(cb);
            }
            return;
        }
        if let Some(old) = superseded {
            self.finish_if_queued(&old);
        }
        if submitted {
            self.notify_listeners();
        }
    }

    fn cancel_predownloading(&self) {
        let victims: Vec<Arc<DownloadTask>> = {
            let state = self.state.lock().unwrap();
            match state.session.as_ref() {
                Some(session) => session
                    .tasks()
                    .into_iter()
                    .filter(|t| t.priority() != DownloadPriority::High)
                    .collect(),
                None => return,
            }
        };
        info!(count = victims.len(), "cancelling predownloads");
        for task in &victims {
            task.cancel();
        }
        // Still-queued tasks finish right here; running ones report when
        // they observe the flag.
        for task in &victims {
            self.finish_if_queued(task);
        }
        self.notify_listeners();
    }

    pub(crate) async fn cancel_all(&self) {
        let (scheduler, tasks) = {
            let mut state = self.state.lock().unwrap();
            let scheduler = state.scheduler.take();
            let tasks = state
                .session
                .take()
                .map(|s| s.tasks())
                .unwrap_or_default();
            (scheduler, tasks)
        };
        if scheduler.is_none() && tasks.is_empty() {
            // Already torn down; nothing to do and nothing to notify.
            return;
        }
        info!(active = tasks.len(), "cancelling all download work");
        for task in &tasks {
            task.cancel();
        }
        for task in &tasks {
            if let Some(callbacks) = task.complete_if_queued() {
                for cb in callbacks {
                    cb(task.item(), task.view(), None);
                }
            }
        }
        if let Some(scheduler) = scheduler {
            scheduler.terminate(self.config.shutdown_grace).await;
        }
        if !tasks.is_empty() {
            self.notify_listeners();
        }
    }

    /// Session bookkeeping for a task that reached a terminal state, then a
    /// listener poke. Never called with the state lock held.
    pub(crate) fn task_finished(&self, task: &Arc<DownloadTask>) {
        self.session_finished(task);
        self.notify_listeners();
    }

    fn session_finished(&self, task: &Arc<DownloadTask>) {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.session.as_mut() {
            session.finished(task);
            if session.is_empty() {
                state.session = None;
                debug!("download session closed");
            }
        }
    }

    /// Finish off a task that was cancelled before it started running.
    fn finish_if_queued(&self, task: &Arc<DownloadTask>) {
        if let Some(callbacks) = task.complete_if_queued() {
            self.session_finished(task);
            for cb in callbacks {
                cb(task.item(), task.view(), None);
            }
        }
    }

    fn notify_listeners(&self) {
        let snapshot: Vec<Arc<dyn Fn() + Send + Sync>> =
            self.listeners.lock().unwrap().values().cloned().collect();
        for listener in snapshot {
            listener();
        }
    }
}

/// Wire the reactive triggers: one small loop per collaborator stream, each
/// holding only a weak reference so a dropped orchestrator shuts them down.
fn spawn_event_loops(core: &Arc<OrchestratorCore>) {
    // (a) + (b): sync completions and newly-unread items
    let mut data_rx = core.deps.data.subscribe();
    let weak = Arc::downgrade(core);
    tokio::spawn(async move {
        loop {
            match data_rx.recv().await {
                Ok(event) => {
                    let Some(core) = weak.upgrade() else { break };
                    match event {
                        DataEvent::SyncCompleted => core.scan(None).await,
                        DataEvent::ItemBecameUnread(item) => {
                            // Once the initial fetch is complete, the
                            // post-sync scan covers new items instead.
                            if !core.deps.data.initial_sync_complete() {
                                core.item_eligible(&item, true, false);
                            }
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "data event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // (c): network no longer satisfying a Wi-Fi-only requirement
    let mut network_rx = core.deps.network.subscribe();
    let weak = Arc::downgrade(core);
    tokio::spawn(async move {
        loop {
            match network_rx.recv().await {
                Ok(_) => {
                    let Some(core) = weak.upgrade() else { break };
                    if core.deps.prefs.wifi_only() && !core.deps.network.is_wifi() {
                        core.cancel_predownloading();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // (d): download preference changed while work was in flight
    let mut prefs_rx = core.deps.prefs.subscribe();
    let weak = Arc::downgrade(core);
    tokio::spawn(async move {
        loop {
            match prefs_rx.recv().await {
                Ok(change) => {
                    let Some(core) = weak.upgrade() else { break };
                    debug!(?change, "download preference changed");
                    let in_flight = core.state.lock().unwrap().session.is_some();
                    if in_flight {
                        core.cancel_predownloading();
                        core.scan(None).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // (e): offline cache fully cleared
    let mut cache_rx = core.deps.assets.subscribe_cache_cleared();
    let weak = Arc::downgrade(core);
    tokio::spawn(async move {
        loop {
            match cache_rx.recv().await {
                Ok(()) => {
                    let Some(core) = weak.upgrade() else { break };
                    info!("offline cache cleared, stopping downloads");
                    core.cancel_all().await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Collaborator contracts the orchestrator consumes.
//!
//! The orchestrator owns no fetch, storage, sync, or preference logic of its
//! own; everything byte-shaped lives behind these seams. All implementations
//! must be individually thread-safe; the orchestrator does not serialize
//! access to them beyond its own bookkeeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::types::{CacheOrder, Item, OfflineStatus, View};

/// Cooperative cancellation flag shared between the orchestrator and a
/// running fetch.
///
/// Cancellation is message passing, not interruption: a fetcher that never
/// checks the flag will not actually stop. Fetchers must poll at safe points.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one content fetch, as reported by a view's fetcher.
///
/// Each variant maps to exactly one [`OfflineStatus`], except `Cancelled`
/// which records nothing at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Content stored as text/structured form
    Success {
        encoding: Option<String>,
        mime: Option<String>,
    },
    /// Content stored as a raw file asset instead
    SuccessAsAsset { mime: Option<String> },
    /// Attempted but incomplete
    Partial {
        encoding: Option<String>,
        mime: Option<String>,
    },
    /// Permanently undownloadable; never retried
    PermanentFailure,
    /// Failed for an unremarkable reason; retryable on request
    GenericFailure,
    /// The fetcher observed the cancel flag and stopped
    Cancelled,
}

/// Byte-level fetch/parse logic for one view type.
///
/// May parallelize internal sub-fetches through
/// [`Orchestrator::submit_work`](crate::Orchestrator::submit_work) instead of
/// managing its own threads.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Fetch one view of one item. `refresh` forces a re-fetch even if
    /// content already exists.
    async fn fetch(&self, item: &Item, refresh: bool, cancelled: &CancelFlag) -> FetchOutcome;
}

/// Failure persisting an offline status through the data layer.
#[derive(Debug, Error)]
pub enum PersistError {
    /// The underlying storage location is gone (SD card removed, volume
    /// unmounted). Non-retryable and cross-cutting: the whole subsystem
    /// cancels and the asset store diagnoses the problem to the user.
    #[error("storage location unavailable")]
    StorageUnavailable,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Events published by the data layer.
#[derive(Debug, Clone)]
pub enum DataEvent {
    /// An item just became unread (saved or un-archived)
    ItemBecameUnread(Item),
    /// A background sync finished
    SyncCompleted,
}

/// The sync/query layer: reads item state, persists offline statuses.
#[async_trait]
pub trait DataLayer: Send + Sync {
    /// All unread items, in the given cache order, optionally restricted to
    /// one host. The orchestrator filters views itself.
    async fn unread_items(
        &self,
        order: CacheOrder,
        host: Option<&str>,
    ) -> anyhow::Result<Vec<Item>>;

    /// Persist the outcome of a download attempt for one view, along with
    /// any encoding/mime metadata the fetcher reported.
    async fn save_offline_status(
        &self,
        item: &Item,
        view: View,
        status: OfflineStatus,
        encoding: Option<String>,
        mime: Option<String>,
    ) -> Result<(), PersistError>;

    /// Has the initial full fetch for this account completed? While it has
    /// not (guest mode, pre-initial-fetch), newly-unread items are downloaded
    /// as they arrive rather than waiting for the next sync.
    fn initial_sync_complete(&self) -> bool;

    /// Subscribe to item/sync events.
    fn subscribe(&self) -> broadcast::Receiver<DataEvent>;
}

/// Asset/file storage: headroom accounting, eviction ordering, and the
/// cache-cleared event.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Is there storage headroom for more offline content?
    fn is_download_authorized(&self) -> bool;

    /// Has offline downloading been administratively restricted?
    fn is_offline_downloading_restricted(&self) -> bool;

    /// Which end of the cache gets evicted first when space runs low.
    fn cache_order(&self) -> CacheOrder;

    /// Fires once whenever the cache has been fully cleared.
    fn subscribe_cache_cleared(&self) -> broadcast::Receiver<()>;

    /// Diagnose an unavailable storage location to the user. Called on the
    /// fatal storage path; the orchestrator does not wait on the outcome.
    async fn diagnose_storage(&self);
}

/// Preference change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefChange {
    DownloadArticle,
    DownloadWeb,
    WifiOnly,
}

/// User preference storage.
pub trait PreferenceStore: Send + Sync {
    /// Should article views be predownloaded?
    fn download_article_view(&self) -> bool;

    /// Should full web views be predownloaded?
    fn download_web_view(&self) -> bool;

    /// Is downloading restricted to Wi-Fi?
    fn wifi_only(&self) -> bool;

    /// When automatic downloading was last suspended, if ever.
    fn last_suspended(&self) -> Option<DateTime<Utc>>;

    /// Record or clear the suspension moment.
    fn set_last_suspended(&self, at: Option<DateTime<Utc>>);

    /// Subscribe to preference changes.
    fn subscribe(&self) -> broadcast::Receiver<PrefChange>;
}

/// Network status snapshot accompanying a change notification. Handlers
/// re-read the monitor rather than trusting a stale payload; the snapshot is
/// informational.
#[derive(Debug, Clone, Copy)]
pub struct NetworkChange {
    pub online: bool,
    pub wifi: bool,
}

/// Network status monitoring.
pub trait NetworkMonitor: Send + Sync {
    /// Is there connectivity right now?
    fn is_online(&self) -> bool;

    /// Is the current network Wi-Fi?
    fn is_wifi(&self) -> bool;

    /// When connectivity last became continuously stable, if it currently is.
    fn stable_since(&self) -> Option<DateTime<Utc>>;

    /// Subscribe to network status changes.
    fn subscribe(&self) -> broadcast::Receiver<NetworkChange>;
}

/// Login/session state.
pub trait AuthState: Send + Sync {
    fn is_logged_in(&self) -> bool;
}

// ============================================================================
// TESTS
// ============================================================================

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core value types for offline downloading.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A downloadable representation of a saved item.
///
/// An item may need zero, one, or both views depending on the user's
/// download preferences.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum View {
    /// Parsed article representation (stored as text/structured form)
    Article,
    /// Full web representation (page plus assets)
    Web,
}

impl View {
    /// All views, in the order scans consider them.
    pub fn all() -> [View; 2] {
        [View::Article, View::Web]
    }
}

/// Outcome recorded for one (item, view) download attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OfflineStatus {
    /// Never attempted (implicit default)
    NotDownloaded,
    /// Fully available offline, stored as text/structured form
    Offline,
    /// Fully available offline, stored as a raw file asset
    OfflineAsAsset,
    /// Attempted but incomplete; silently retried on the next scan
    Partial,
    /// Attempted and failed; retried only when retries are explicitly allowed
    Failed,
    /// Permanently undownloadable; never retried
    Invalid,
}

impl Default for OfflineStatus {
    fn default() -> Self {
        OfflineStatus::NotDownloaded
    }
}

impl OfflineStatus {
    /// Returns true if this view is already fully available offline.
    pub fn is_offline(&self) -> bool {
        matches!(self, OfflineStatus::Offline | OfflineStatus::OfflineAsAsset)
    }

    /// Returns true if a scan should (re-)download a view in this state.
    ///
    /// `retry_allowed` is the one-shot flag consumed by a predownload scan:
    /// it makes `Failed` eligible again. `Partial` always retries; `Invalid`
    /// never does.
    pub fn needs_download(&self, retry_allowed: bool) -> bool {
        match self {
            OfflineStatus::NotDownloaded => true,
            OfflineStatus::Partial => true,
            OfflineStatus::Failed => retry_allowed,
            OfflineStatus::Invalid => false,
            OfflineStatus::Offline | OfflineStatus::OfflineAsAsset => false,
        }
    }
}

/// Priority level for download tasks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum DownloadPriority {
    /// Background batch scan
    Normal,
    /// A just-saved item; may transiently exceed the storage limit because
    /// eviction elsewhere will reclaim the space
    NewItem,
    /// Interactive/on-demand; the user explicitly asked, so storage-limit
    /// gating does not apply
    High,
}

impl DownloadPriority {
    /// Map the domain priority onto the scheduler's queue rank.
    ///
    /// Higher ranks drain first; FIFO within a rank. The scheduler only ever
    /// sees ranks, never this enum.
    pub fn queue_rank(self) -> u8 {
        match self {
            DownloadPriority::Normal => 0,
            DownloadPriority::NewItem => 1,
            DownloadPriority::High => 2,
        }
    }

    /// Inverse of [`queue_rank`](Self::queue_rank), saturating at `High`.
    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 => DownloadPriority::Normal,
            1 => DownloadPriority::NewItem,
            _ => DownloadPriority::High,
        }
    }
}

impl Default for DownloadPriority {
    fn default() -> Self {
        DownloadPriority::Normal
    }
}

/// Read-state of a saved item, as the data layer reports it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemStatus {
    Unread,
    Archived,
}

/// Cache-priority ordering the asset store applies when space runs low.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CacheOrder {
    /// Newest items are kept; oldest are evicted first
    KeepNewest,
    /// Oldest items are kept; newest are evicted first
    KeepOldest,
}

/// Snapshot of a saved item, as read from the data layer.
///
/// The orchestrator never mutates an item directly; it only asks the data
/// layer to persist new offline statuses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    /// Stable identity key
    pub id: String,
    /// Read-state (scans only consider unread items)
    pub status: ItemStatus,
    /// When the user saved the item
    pub time_added: DateTime<Utc>,
    /// Offline status of the article view
    pub article_status: OfflineStatus,
    /// Offline status of the web view
    pub web_status: OfflineStatus,
    /// Host of the item's URL, for host-filtered scans
    pub host: Option<String>,
}

impl Item {
    /// Create a freshly-saved, not-yet-downloaded item snapshot.
    pub fn new(id: impl Into<String>, time_added: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: ItemStatus::Unread,
            time_added,
            article_status: OfflineStatus::NotDownloaded,
            web_status: OfflineStatus::NotDownloaded,
            host: None,
        }
    }

    /// The recorded offline status for one view.
    pub fn offline_status(&self, view: View) -> OfflineStatus {
        match view {
            View::Article => self.article_status,
            View::Web => self.web_status,
        }
    }

    /// The download key identifying one view of this item.
    pub fn key(&self, view: View) -> DownloadKey {
        DownloadKey {
            item_id: self.id.clone(),
            view,
        }
    }
}

/// Identity of one unit of download work: at most one active task may exist
/// per key at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownloadKey {
    pub item_id: String,
    pub view: View,
}

// ============================================================================
// TESTS
// ============================================================================

// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! stockpile - background offline-download orchestrator
//!
//! Keeps an offline-readable copy of the content a user has saved by
//! downloading one or more views (article, full web) per item, subject to
//! user preference, storage limits, and network conditions. Automatic work
//! runs unobtrusively in the background, an interactive request jumps the
//! queue, and cancellation, storage loss, or shutdown never leave device
//! state inconsistent.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐    ┌───────────────┐    ┌──────────────────┐
//! │ Orchestrator │───▶│ TaskScheduler │───▶│ DownloadTask (xN)│
//! │ (gating,     │    │ (coordinators │    │ fetch → persist  │
//! │  dedup,      │    │  + workers)   │    │ → callbacks      │
//! │  session)    │    └───────────────┘    └────────┬─────────┘
//! └──────┬───────┘                                  │
//!        ▼                                          ▼
//! ┌──────────────┐                         ┌──────────────────┐
//! │ Session      │                         │ ContentFetcher / │
//! │ (per-burst   │                         │ DataLayer /      │
//! │  bookkeeping)│                         │ AssetStore seams │
//! └──────────────┘                         └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use stockpile::{Orchestrator, OrchestratorConfig, OrchestratorDeps, View};
//!
//! # async fn example(deps: OrchestratorDeps) {
//! // Create the orchestrator (spawns its pools and reactive wiring)
//! let orchestrator = Orchestrator::new(deps, OrchestratorConfig::default());
//!
//! // Background scan of everything the user saved
//! orchestrator.predownload_scan().await;
//!
//! // The user opened an item: jump the queue
//! # let item = stockpile::Item::new("item-1", chrono::Utc::now());
//! orchestrator.download(&item, View::Article, false, Some(Box::new(|item, view, status| {
//!     println!("{} {:?} -> {:?}", item.id, view, status);
//! })));
//! # }
//! ```

pub mod config;
pub mod orchestrator;
pub mod policy;
pub mod scheduler;
pub mod session;
pub mod task;
pub mod traits;
pub mod types;

// Re-export the public surface
pub use config::OrchestratorConfig;
pub use orchestrator::{ListenerHandle, Orchestrator, OrchestratorDeps};
pub use policy::GatingPolicy;
pub use scheduler::{PoolJob, TaskScheduler, WorkerPool};
pub use session::Session;
pub use task::{DownloadCallback, DownloadTask};
pub use traits::{
    AssetStore, AuthState, CancelFlag, ContentFetcher, DataEvent, DataLayer, FetchOutcome,
    NetworkChange, NetworkMonitor, PersistError, PrefChange, PreferenceStore,
};
pub use types::{
    CacheOrder, DownloadKey, DownloadPriority, Item, ItemStatus, OfflineStatus, View,
};

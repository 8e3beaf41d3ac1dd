// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One unit of download work: fetch one view of one item, persist the
//! outcome, fan out completion callbacks.
//!
//! A task runs at most once; re-running requires a new task created through a
//! refresh enqueue. Terminal state is sticky, and a callback registered after
//! the task is terminal fires synchronously on the registering thread.

use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, warn};

use crate::orchestrator::OrchestratorCore;
use crate::policy::GatingPolicy;
use crate::scheduler::PoolJob;
use crate::traits::{AssetStore, CancelFlag, ContentFetcher, DataLayer, FetchOutcome, PersistError};
use crate::types::{DownloadKey, DownloadPriority, Item, OfflineStatus, View};

/// Completion callback: `(item, view, status)` where `status` is `None` when
/// nothing was recorded (cancellation, crash, policy denial).
pub type DownloadCallback = Box<dyn FnOnce(&Item, View, Option<OfflineStatus>) + Send + 'static>;

enum TaskState {
    Queued,
    Running,
    /// Terminal. `None` means no status was recorded.
    Done(Option<OfflineStatus>),
}

/// One queued or running (item, view) download.
pub struct DownloadTask {
    key: DownloadKey,
    item: Item,
    rank: AtomicU8,
    refresh: bool,
    predownload: bool,
    cancelled: CancelFlag,
    state: Mutex<TaskState>,
    callbacks: Mutex<Vec<DownloadCallback>>,
}

impl DownloadTask {
    pub fn new(
        item: Item,
        view: View,
        priority: DownloadPriority,
        refresh: bool,
        predownload: bool,
    ) -> Self {
        Self {
            key: item.key(view),
            item,
            rank: AtomicU8::new(priority.queue_rank()),
            refresh,
            predownload,
            cancelled: CancelFlag::new(),
            state: Mutex::new(TaskState::Queued),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> &DownloadKey {
        &self.key
    }

    pub fn item(&self) -> &Item {
        &self.item
    }

    pub fn view(&self) -> View {
        self.key.view
    }

    /// Was this task created by the automatic predownload path (as opposed
    /// to an explicit on-demand request)?
    pub fn is_predownload(&self) -> bool {
        self.predownload
    }

    /// Does this task force a re-fetch of already-downloaded content?
    pub fn is_refresh(&self) -> bool {
        self.refresh
    }

    /// Current priority, read back from the live rank cell.
    pub fn priority(&self) -> DownloadPriority {
        DownloadPriority::from_rank(self.rank.load(Ordering::SeqCst))
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancelled
    }

    /// Signal cooperative cancellation. A running fetch observes the flag at
    /// its own safe points; a queued task is finished off by
    /// [`complete_if_queued`](Self::complete_if_queued).
    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    /// Atomically claim the Queued → Running transition. Returns false if
    /// the task is not queued anymore (already claimed, or finished off
    /// while still in the queue).
    fn try_claim(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            TaskState::Queued => {
                *state = TaskState::Running;
                true
            }
            _ => false,
        }
    }

    /// Move to the terminal state and drain the callback set.
    ///
    /// Returns `None` if the task was already terminal (completion happens
    /// exactly once); otherwise the callbacks for the caller to fire after
    /// its own bookkeeping.
    fn complete(&self, status: Option<OfflineStatus>) -> Option<Vec<DownloadCallback>> {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, TaskState::Done(_)) {
                return None;
            }
            *state = TaskState::Done(status);
        }
        let callbacks: Vec<DownloadCallback> = self.callbacks.lock().unwrap().drain(..).collect();
        Some(callbacks)
    }

    /// Finish a task that never started running (cancelled while queued).
    /// Returns the callbacks to fire, or `None` if it had already started
    /// or finished.
    pub(crate) fn complete_if_queued(&self) -> Option<Vec<DownloadCallback>> {
        {
            let state = self.state.lock().unwrap();
            if !matches!(*state, TaskState::Queued) {
                return None;
            }
        }
        self.complete(None)
    }

    /// The recorded terminal status: `None` while not terminal,
    /// `Some(status)` once done.
    pub fn terminal_status(&self) -> Option<Option<OfflineStatus>> {
        match *self.state.lock().unwrap() {
            TaskState::Done(status) => Some(status),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_status().is_some()
    }

    /// Register a completion callback. If the task is already terminal the
    /// callback fires immediately on this thread.
    pub fn add_callback(&self, callback: DownloadCallback) {
        let fire_now = {
            let state = self.state.lock().unwrap();
            match *state {
                TaskState::Done(status) => Some(status),
                _ => None,
            }
        };
        match fire_now {
            Some(status) => callback(&self.item, self.view(), status),
            None => self.callbacks.lock().unwrap().push(callback),
        }
    }

    pub(crate) fn escalate_rank(&self, rank: u8) {
        self.rank.fetch_max(rank, Ordering::SeqCst);
    }
}

/// Everything a running task needs from the outside world.
pub(crate) struct TaskContext {
    pub article_fetcher: Arc<dyn ContentFetcher>,
    pub web_fetcher: Arc<dyn ContentFetcher>,
    pub data: Arc<dyn DataLayer>,
    pub assets: Arc<dyn AssetStore>,
    pub policy: GatingPolicy,
    pub core: Weak<OrchestratorCore>,
}

impl TaskContext {
    fn fetcher_for(&self, view: View) -> &Arc<dyn ContentFetcher> {
        match view {
            View::Article => &self.article_fetcher,
            View::Web => &self.web_fetcher,
        }
    }
}

/// Pairs a task with its context so the coordinators pool can run it.
pub(crate) struct TaskRun {
    pub task: Arc<DownloadTask>,
    pub ctx: Arc<TaskContext>,
}

#[async_trait]
impl PoolJob for TaskRun {
    fn rank(&self) -> u8 {
        self.task.rank.load(Ordering::SeqCst)
    }

    fn escalate(&self, rank: u8) {
        self.task.escalate_rank(rank);
    }

    fn cancel(&self) {
        self.task.cancel();
    }

    async fn run(self: Arc<Self>) {
        run_download(self.task.clone(), self.ctx.clone()).await;
    }
}

/// Map a fetch outcome to the status (and metadata) to persist.
///
/// `Cancelled` records nothing so a future scan re-attempts like new. A web
/// partial while the network is currently stable is kept as fully offline:
/// instability was the likely original cause and it has since resolved, so
/// the partial result is good enough rather than retrying forever.
fn map_outcome(
    view: View,
    outcome: FetchOutcome,
    network_stable: bool,
) -> Option<(OfflineStatus, Option<String>, Option<String>)> {
    match outcome {
        FetchOutcome::Success { encoding, mime } => Some((OfflineStatus::Offline, encoding, mime)),
        FetchOutcome::SuccessAsAsset { mime } => Some((OfflineStatus::OfflineAsAsset, None, mime)),
        FetchOutcome::Partial { encoding, mime } => {
            if view == View::Web && network_stable {
                Some((OfflineStatus::Offline, encoding, mime))
            } else {
                Some((OfflineStatus::Partial, encoding, mime))
            }
        }
        FetchOutcome::PermanentFailure => Some((OfflineStatus::Invalid, None, None)),
        FetchOutcome::GenericFailure => Some((OfflineStatus::Failed, None, None)),
        FetchOutcome::Cancelled => None,
    }
}

/// Run one download task end to end.
pub(crate) async fn run_download(task: Arc<DownloadTask>, ctx: Arc<TaskContext>) {
    if !task.try_claim() {
        // Finished off while still queued; already reported.
        return;
    }

    let view = task.view();

    if task.cancel_flag().is_cancelled() {
        finish(&task, &ctx, None);
        return;
    }

    // Conditions may have shifted between enqueue and now. Normal-priority
    // background work re-checks the gate; accepted high-priority work always
    // runs, and new-item work was already admitted under its exemption.
    if task.is_predownload() && task.priority() == DownloadPriority::Normal {
        // A dead core means the subsystem is gone: fail closed.
        let pools_alive = ctx
            .core
            .upgrade()
            .map(|core| core.pools_alive())
            .unwrap_or(false);
        if !ctx.policy.allowed(Some(task.item()), false, pools_alive) {
            debug!(item = %task.item().id, ?view, "gating revoked queued download");
            finish(&task, &ctx, None);
            return;
        }
    }

    let fetcher = ctx.fetcher_for(view).clone();
    let fetch = {
        let item = task.item().clone();
        let refresh = task.is_refresh();
        let flag = task.cancel_flag().clone();
        async move { fetcher.fetch(&item, refresh, &flag).await }
    };
    let outcome = match AssertUnwindSafe(fetch).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            // Contained at the task boundary; previous status is retained.
            error!(item = %task.item().id, ?view, "fetcher panicked");
            finish(&task, &ctx, None);
            return;
        }
    };
    debug!(item = %task.item().id, ?view, ?outcome, "fetch finished");

    let Some((status, encoding, mime)) = map_outcome(view, outcome, ctx.policy.network_stable())
    else {
        finish(&task, &ctx, None);
        return;
    };

    match ctx
        .data
        .save_offline_status(task.item(), view, status, encoding, mime)
        .await
    {
        Ok(()) => finish(&task, &ctx, Some(status)),
        Err(PersistError::StorageUnavailable) => {
            // Bigger than this one task: stop the whole subsystem and let
            // the asset store explain the problem to the user.
            warn!(item = %task.item().id, "storage unavailable, cancelling subsystem");
            if let Some(core) = ctx.core.upgrade() {
                let assets = ctx.assets.clone();
                tokio::spawn(async move {
                    core.cancel_all().await;
                    assets.diagnose_storage().await;
                });
            }
            finish(&task, &ctx, None);
        }
        Err(PersistError::Other(err)) => {
            error!(item = %task.item().id, ?view, "failed to persist status: {err:#}");
            finish(&task, &ctx, None);
        }
    }
}

/// Report a terminal state: session bookkeeping first, then callbacks,
/// each exactly once.
fn finish(task: &Arc<DownloadTask>, ctx: &Arc<TaskContext>, status: Option<OfflineStatus>) {
    let Some(callbacks) = task.complete(status) else {
        return;
    };
    if let Some(core) = ctx.core.upgrade() {
        core.task_finished(task);
    }
    for callback in callbacks {
        callback(task.item(), task.view(), status);
    }
}

// ============================================================================
// TESTS
// ============================================================================

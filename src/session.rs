// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bookkeeping for one contiguous burst of downloading.
//!
//! A session exists exactly while at least one download task is queued or
//! running: created on first enqueue after being empty, dropped the instant
//! it empties again. Nothing here locks: every operation assumes the
//! orchestrator's lock is held.

use std::collections::HashMap;
use std::sync::Arc;

use crate::task::DownloadTask;
use crate::types::DownloadKey;

/// Mutable record of everything queued or running in the current burst.
#[derive(Default)]
pub struct Session {
    /// Active task per (item, view) key. The enqueue logic guarantees at
    /// most one tracked task per key.
    active: HashMap<DownloadKey, Arc<DownloadTask>>,
    /// Outstanding predownload views per item.
    pending_views: HashMap<String, usize>,
    /// Items whose every requested view has resolved this session.
    completed_items: usize,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly submitted task under its key.
    ///
    /// Predownload tasks also count toward the item's pending-view counter;
    /// on-demand tasks are tracked for dedup but not for progress.
    pub fn submitted(&mut self, task: &Arc<DownloadTask>) {
        self.active.insert(task.key().clone(), task.clone());
        if task.is_predownload() {
            *self
                .pending_views
                .entry(task.key().item_id.clone())
                .or_insert(0) += 1;
        }
    }

    /// Record a task reaching a terminal state.
    ///
    /// The active map only drops the entry if it still points at this task;
    /// a superseded task (refresh) must not evict its replacement. An item
    /// counts as completed once its last pending view resolves, success and
    /// failure alike.
    pub fn finished(&mut self, task: &Arc<DownloadTask>) {
        let key = task.key();
        if let Some(current) = self.active.get(key) {
            if Arc::ptr_eq(current, task) {
                self.active.remove(key);
            }
        }
        if task.is_predownload() {
            if let Some(pending) = self.pending_views.get_mut(&key.item_id) {
                *pending -= 1;
                if *pending == 0 {
                    self.pending_views.remove(&key.item_id);
                    self.completed_items += 1;
                }
            }
        }
    }

    /// Undo a submission that never reached the queue.
    ///
    /// Like [`finished`](Self::finished) but the item is not counted as
    /// completed: the work never happened.
    pub fn retract(&mut self, task: &Arc<DownloadTask>) {
        let key = task.key();
        if let Some(current) = self.active.get(key) {
            if Arc::ptr_eq(current, task) {
                self.active.remove(key);
            }
        }
        if task.is_predownload() {
            if let Some(pending) = self.pending_views.get_mut(&key.item_id) {
                *pending -= 1;
                if *pending == 0 {
                    self.pending_views.remove(&key.item_id);
                }
            }
        }
    }

    /// The active task for a key, if any.
    pub fn task(&self, key: &DownloadKey) -> Option<&Arc<DownloadTask>> {
        self.active.get(key)
    }

    /// Snapshot of every active task.
    pub fn tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.active.values().cloned().collect()
    }

    /// Number of distinct items with at least one pending predownload view
    /// (not the number of tasks; one item can have two views in flight).
    pub fn predownloading_count(&self) -> usize {
        self.pending_views.len()
    }

    /// Items fully resolved in this session.
    pub fn predownloaded_count(&self) -> usize {
        self.completed_items
    }

    /// True once nothing is queued or running.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

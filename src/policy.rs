// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Gating policy: is predownloading allowed right now?
//!
//! Pure decision logic over current conditions. No state of its own, no side
//! effects; safe to call repeatedly and concurrently. Checks run in order and
//! short-circuit on the first failure.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::traits::{AssetStore, AuthState, NetworkMonitor, PreferenceStore};
use crate::types::{CacheOrder, Item, View};

/// Read-only gate consulted before any automatic download work.
#[derive(Clone)]
pub struct GatingPolicy {
    auth: Arc<dyn AuthState>,
    network: Arc<dyn NetworkMonitor>,
    prefs: Arc<dyn PreferenceStore>,
    assets: Arc<dyn AssetStore>,
    config: OrchestratorConfig,
}

impl GatingPolicy {
    pub fn new(
        auth: Arc<dyn AuthState>,
        network: Arc<dyn NetworkMonitor>,
        prefs: Arc<dyn PreferenceStore>,
        assets: Arc<dyn AssetStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            auth,
            network,
            prefs,
            assets,
            config,
        }
    }

    /// Is predownloading of `item` (or of anything, when `None`) allowed
    /// right now?
    ///
    /// `pools_alive` is whether the scheduler pools currently exist; between
    /// teardown and restart every check fails closed through it.
    pub fn allowed(&self, item: Option<&Item>, is_new_item: bool, pools_alive: bool) -> bool {
        // 1. Subsystem not torn down
        if !pools_alive {
            debug!("gating: denied, subsystem is torn down");
            return false;
        }

        // 2. Authenticated
        if !self.auth.is_logged_in() {
            debug!("gating: denied, not logged in");
            return false;
        }

        // 3. Connectivity stable for the grace window
        if !self.network_stable() {
            debug!("gating: denied, network not stable long enough");
            return false;
        }

        // 4. Wi-Fi-only preference
        if self.prefs.wifi_only() && !self.network.is_wifi() {
            debug!("gating: denied, Wi-Fi required but not on Wi-Fi");
            return false;
        }

        // 5. Suspension window; items added strictly after the suspension
        //    moment keep flowing while a bulk run is paused
        if let Some(suspended_at) = self.prefs.last_suspended() {
            let window = ChronoDuration::from_std(self.config.suspension_window)
                .unwrap_or_else(|_| ChronoDuration::hours(1));
            let within_window = Utc::now() - suspended_at < window;
            let added_after = item.map(|i| i.time_added > suspended_at).unwrap_or(false);
            if within_window && !added_after {
                debug!("gating: denied, auto-download suspended");
                return false;
            }
        }

        // 6. Something must be configured to download
        if self.enabled_views().is_empty() {
            debug!("gating: denied, no downloadable view configured");
            return false;
        }

        // 7. Storage headroom, unless this is a brand-new item under
        //    keep-newest ordering (eviction will reclaim the space)
        let over_limit_tolerated =
            is_new_item && self.assets.cache_order() == CacheOrder::KeepNewest;
        if !over_limit_tolerated {
            if !self.assets.is_download_authorized() {
                debug!("gating: denied, no storage headroom");
                return false;
            }
            if self.assets.is_offline_downloading_restricted() {
                debug!("gating: denied, offline downloading restricted");
                return false;
            }
        }

        true
    }

    /// The views the user has asked to predownload, in scan order.
    pub fn enabled_views(&self) -> Vec<View> {
        let mut views = Vec::with_capacity(2);
        if self.prefs.download_article_view() {
            views.push(View::Article);
        }
        if self.prefs.download_web_view() {
            views.push(View::Web);
        }
        views
    }

    /// Has connectivity been continuously present for at least the stability
    /// window? Also used by the task layer to decide whether a partial web
    /// result is good enough to keep.
    pub fn network_stable(&self) -> bool {
        if !self.network.is_online() {
            return false;
        }
        let window = ChronoDuration::from_std(self.config.network_stability_window)
            .unwrap_or_else(|_| ChronoDuration::minutes(1));
        match self.network.stable_since() {
            Some(since) => Utc::now() - since >= window,
            None => false,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

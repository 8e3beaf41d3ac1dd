// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Orchestrator configuration.
//!
//! The stability and suspension windows are policy knobs, not load-bearing
//! constants; hosts (and tests) may shrink or stretch them freely.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default window the network must have been stable for before automatic
/// downloading proceeds (1 minute).
pub const DEFAULT_NETWORK_STABILITY_WINDOW: Duration = Duration::from_secs(60);

/// Default window during which a suspension blocks automatic downloading
/// (1 hour).
pub const DEFAULT_SUSPENSION_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Default bounded wait when terminating the worker pools (5 seconds).
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Tunable parameters for the download orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Size of the coordinators pool (one slot per running download task)
    pub coordinator_pool_size: usize,
    /// Size of the workers pool (parallel sub-fetches for web downloads)
    pub worker_pool_size: usize,
    /// How long connectivity must have been stable before automatic
    /// downloads are allowed
    pub network_stability_window: Duration,
    /// How long a suspension keeps automatic downloads paused
    pub suspension_window: Duration,
    /// Upper bound on the wait for pool shutdown during teardown
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            coordinator_pool_size: 4,
            worker_pool_size: 4,
            network_stability_window: DEFAULT_NETWORK_STABILITY_WINDOW,
            suspension_window: DEFAULT_SUSPENSION_WINDOW,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

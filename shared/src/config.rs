use crate::state::CorrectionThresholds;
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_RATE: u32 = 60;
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const CLIENT_TIMEOUT_SECS: u64 = 5;

/// Fixed-step simulation and reconciliation parameters. Client and server
/// must agree on `fixed_dt` and `substeps` for predictions to match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub fixed_dt: f32,
    pub substeps: u32,
    /// Catch-up steps allowed in a single `tick` before the rest of the
    /// backlog is dropped.
    pub max_steps_per_tick: u32,
    pub history_capacity: usize,
    pub input_capacity: usize,
    /// Samples repeated in every outgoing input packet.
    pub redundant_inputs: usize,
    pub max_replay_frames: u32,
    /// Server broadcasts a snapshot every this many frames.
    pub broadcast_interval: u32,
    pub min_broadcast_speed: f32,
    pub thresholds: CorrectionThresholds,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / DEFAULT_TICK_RATE as f32,
            substeps: 1,
            max_steps_per_tick: 8,
            history_capacity: 120,
            input_capacity: 128,
            redundant_inputs: 10,
            max_replay_frames: 90,
            broadcast_interval: 2,
            min_broadcast_speed: 0.001,
            thresholds: CorrectionThresholds::default(),
        }
    }
}

impl SimulationConfig {
    pub fn with_tick_rate(tick_rate: u32) -> Self {
        Self {
            fixed_dt: 1.0 / tick_rate.max(1) as f32,
            ..Default::default()
        }
    }

    pub fn tick_rate(&self) -> f32 {
        1.0 / self.fixed_dt
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockSyncConfig {
    /// Seconds between time probes.
    pub probe_interval: f64,
    pub window: usize,
    /// Fraction dropped from each end of the sorted window.
    pub trim_fraction: f64,
    pub smoothing: f64,
    /// Samples with rtt at or above `best_rtt * outlier_factor` are rejected.
    pub outlier_factor: f64,
    pub warmup_samples: usize,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            probe_interval: 1.0,
            window: 15,
            trim_fraction: 0.2,
            smoothing: 0.1,
            outlier_factor: 1.2,
            warmup_samples: 5,
        }
    }
}

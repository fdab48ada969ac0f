use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_PRESENT_INTERVAL_MS, DEFAULT_SURFACE_QUEUE_DEPTH};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SurfaceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// How long each presented buffer stays on screen before it is recycled.
    #[serde(default = "default_present_interval_ms")]
    pub present_interval_ms: u64,
    /// Buffers the surface accepts before `present` starts failing.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl SurfaceConfig {
    pub fn present_interval(&self) -> Duration {
        Duration::from_millis(self.present_interval_ms)
    }
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            present_interval_ms: default_present_interval_ms(),
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_present_interval_ms() -> u64 {
    DEFAULT_PRESENT_INTERVAL_MS
}

fn default_queue_depth() -> usize {
    DEFAULT_SURFACE_QUEUE_DEPTH
}

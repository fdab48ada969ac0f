use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::REMOTE_LINK_DEPTH;

/// Which engine binding the runner constructs.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// In-process filter engine on a worker thread.
    #[default]
    Software,
    /// Engine hosted behind a message link, reached through a proxy.
    Remote,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,
    /// Simulated processing time per buffer pair.
    #[serde(default)]
    pub latency_ms: u64,
    /// Frames the remote link buffers before a send reports `WouldBlock`.
    #[serde(default = "default_link_depth")]
    pub link_depth: usize,
}

impl EngineConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            latency_ms: 0,
            link_depth: default_link_depth(),
        }
    }
}

fn default_link_depth() -> usize {
    REMOTE_LINK_DEPTH
}

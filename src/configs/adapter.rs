use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_INPUT_BUFFER_COUNT, DEFAULT_OUTPUT_BUFFER_COUNT, DEFAULT_SURFACE_POLL_INTERVAL_MS,
    DEFAULT_SURFACE_POLL_RETRIES,
};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AdapterConfig {
    /// Prefix used on every log line emitted by the adapter.
    #[serde(default = "default_name")]
    pub name: String,
    /// Delay between two checks for display-surface buffers during shutdown.
    #[serde(default = "default_surface_poll_interval_ms")]
    pub surface_poll_interval_ms: u64,
    /// Checks made before the remaining surface buffers are force-reclaimed.
    #[serde(default = "default_surface_poll_retries")]
    pub surface_poll_retries: u32,
    /// Input buffers allocated when the stream parameters do not ask for a count.
    #[serde(default = "default_input_buffer_count")]
    pub input_buffer_count: usize,
    #[serde(default = "default_output_buffer_count")]
    pub output_buffer_count: usize,
}

impl AdapterConfig {
    pub fn surface_poll_interval(&self) -> Duration {
        Duration::from_millis(self.surface_poll_interval_ms)
    }

    /// Upper bound on how long shutdown waits for the display surface.
    pub fn surface_poll_budget(&self) -> Duration {
        self.surface_poll_interval() * self.surface_poll_retries
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            surface_poll_interval_ms: default_surface_poll_interval_ms(),
            surface_poll_retries: default_surface_poll_retries(),
            input_buffer_count: default_input_buffer_count(),
            output_buffer_count: default_output_buffer_count(),
        }
    }
}

fn default_name() -> String {
    "adapter".to_string()
}

fn default_surface_poll_interval_ms() -> u64 {
    DEFAULT_SURFACE_POLL_INTERVAL_MS
}

fn default_surface_poll_retries() -> u32 {
    DEFAULT_SURFACE_POLL_RETRIES
}

fn default_input_buffer_count() -> usize {
    DEFAULT_INPUT_BUFFER_COUNT
}

fn default_output_buffer_count() -> usize {
    DEFAULT_OUTPUT_BUFFER_COUNT
}

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Node of the adapter state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum AdapterState {
    Uninitialized = 0,
    Initialized = 1,
    Configured = 2,
    LoadedToActive = 3,
    Active = 4,
    OutputPortReconfiguring = 5,
    Flushing = 6,
    ActiveToIdle = 7,
    IdleToLoaded = 8,
}

impl AdapterState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Initialized,
            2 => Self::Configured,
            3 => Self::LoadedToActive,
            4 => Self::Active,
            5 => Self::OutputPortReconfiguring,
            6 => Self::Flushing,
            7 => Self::ActiveToIdle,
            8 => Self::IdleToLoaded,
            _ => Self::Uninitialized,
        }
    }

    /// States waiting on an asynchronous completion. Control requests are
    /// queued, never executed, while one of these is current.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::LoadedToActive
                | Self::OutputPortReconfiguring
                | Self::Flushing
                | Self::ActiveToIdle
                | Self::IdleToLoaded
        )
    }

    /// States in which buffers circulate.
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Active | Self::OutputPortReconfiguring)
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Counters updated by the adapter loop and readable from any thread.
#[derive(Default)]
pub struct AdapterStats {
    pub input_queued: AtomicU64,
    pub input_completed: AtomicU64,
    pub output_queued: AtomicU64,
    pub output_completed: AtomicU64,
    pub stale_dropped: AtomicU64,
    pub unknown_dropped: AtomicU64,
    pub would_block: AtomicU64,
    pub flushes: AtomicU64,
    pub reconfigurations: AtomicU64,
    pub surface_force_reclaimed: AtomicU64,
}

impl AdapterStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            input_queued: self.input_queued.load(Ordering::Relaxed),
            input_completed: self.input_completed.load(Ordering::Relaxed),
            output_queued: self.output_queued.load(Ordering::Relaxed),
            output_completed: self.output_completed.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            unknown_dropped: self.unknown_dropped.load(Ordering::Relaxed),
            would_block: self.would_block.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            reconfigurations: self.reconfigurations.load(Ordering::Relaxed),
            surface_force_reclaimed: self.surface_force_reclaimed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub input_queued: u64,
    pub input_completed: u64,
    pub output_queued: u64,
    pub output_completed: u64,
    pub stale_dropped: u64,
    pub unknown_dropped: u64,
    pub would_block: u64,
    pub flushes: u64,
    pub reconfigurations: u64,
    pub surface_force_reclaimed: u64,
}

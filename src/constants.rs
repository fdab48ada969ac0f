//! Central constants for the adapter, the engines and the display surface.
//!
//! Defaults that also appear in `configs/` are referenced from there so the
//! config file and the code never disagree.

// ── Ports ────────────────────────────────────────────────────────────────────

/// Input buffers per port when neither the stream nor the config asks for a count.
pub const DEFAULT_INPUT_BUFFER_COUNT: usize = 4;

/// Output buffers per port when neither the stream nor the config asks for a count.
pub const DEFAULT_OUTPUT_BUFFER_COUNT: usize = 4;

/// Hard ceiling on buffers per port; larger requests fail allocation.
pub const MAX_BUFFERS_PER_PORT: usize = 64;

// ── PCM ──────────────────────────────────────────────────────────────────────

/// Default stream sample rate (Hz).
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default stream channel count.
pub const DEFAULT_CHANNELS: u16 = 2;

/// Audio buffers carry 20 ms of interleaved i16 PCM (1/50 s).
pub const FRAMES_PER_SECOND: u32 = 50;

/// Bytes per interleaved i16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

pub const INT16_MAX_F: f32 = 32_767.0;
pub const INT16_MIN_F: f32 = -32_768.0;

// ── Byte pool ────────────────────────────────────────────────────────────────

/// Maximum total bytes held by one port pool (4 MB).
pub const MAX_POOL_BYTES: usize = 4 * 1_024 * 1_024;

/// Maximum buffers per same-size bucket.
pub const MAX_BUCKET_ENTRIES: usize = 16;

/// Smallest region handed out by the pool.
pub const MIN_POOL_REGION: usize = 1_024;

/// Largest region the pool keeps for reuse (16 MB).
pub const MAX_POOL_REGION: usize = 16 * 1_024 * 1_024;

// ── Shutdown ─────────────────────────────────────────────────────────────────

/// Delay between two checks for surface-held buffers while shutting down.
pub const DEFAULT_SURFACE_POLL_INTERVAL_MS: u64 = 10;

/// Checks made before surface-held buffers are force-reclaimed (500 ms total).
pub const DEFAULT_SURFACE_POLL_RETRIES: u32 = 50;

// ── Fences ───────────────────────────────────────────────────────────────────

/// Delay between two checks of an input fence the client has not signalled.
pub const FENCE_CHECK_INTERVAL_MS: u64 = 2;

// ── Display surface ──────────────────────────────────────────────────────────

/// How long a presented buffer stays on screen before it is recycled (~60 Hz).
pub const DEFAULT_PRESENT_INTERVAL_MS: u64 = 16;

/// Buffers the surface may hold at once before `present` fails.
pub const DEFAULT_SURFACE_QUEUE_DEPTH: usize = 3;

// ── Remote engine ────────────────────────────────────────────────────────────

/// Frames buffered on each direction of the remote link.
pub const REMOTE_LINK_DEPTH: usize = 64;


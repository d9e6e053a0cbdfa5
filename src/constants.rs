//! Engine-wide constants for tuning and configuration.
//!
//! Centralizes magic numbers to make them discoverable and configurable.

/// Default IMAP port when TLS is enabled.
pub const DEFAULT_IMAP_PORT: u16 = 993;

/// Maximum reconnect attempts per operation (spec §4.3).
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Base reconnect delay; attempt `k` waits `RECONNECT_BASE_SECS * 2^(k-1)`.
pub const RECONNECT_BASE_SECS: u64 = 1;

/// Transport handshake timeout.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Per-read inactivity timeout.
pub const READ_INACTIVITY_TIMEOUT_SECS: u64 = 60;

/// Default message size above which the streaming fetch path is used.
pub const DEFAULT_STREAM_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;

/// Chunk size used when copying a streamed literal to its destination file.
pub const STREAM_COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Default number of history entries retained.
pub const DEFAULT_HISTORY_RETENTION: usize = 200;

/// Maximum length of a generated filename sender-slug.
pub const MAX_SLUG_LEN: usize = 40;

// === Rate-limit presets (spec §4.4) ===

pub const BALANCED_BASE_MS: u64 = 100;
pub const BALANCED_MAX_MS: u64 = 30_000;
pub const BALANCED_MULTIPLIER: f64 = 2.0;

pub const CONSERVATIVE_BASE_MS: u64 = 500;
pub const CONSERVATIVE_MAX_MS: u64 = 60_000;
pub const CONSERVATIVE_MULTIPLIER: f64 = 3.0;

pub const AGGRESSIVE_BASE_MS: u64 = 50;
pub const AGGRESSIVE_MAX_MS: u64 = 10_000;
pub const AGGRESSIVE_MULTIPLIER: f64 = 1.5;

/// Decay factor applied to the effective delay after a throttle-free success.
pub const SUCCESS_DECAY_FACTOR: f64 = 0.9;

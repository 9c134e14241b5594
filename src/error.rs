// src/error.rs
//
// Semantic error kinds and per-session counters.
// Per-frame errors (FrameError, DecodeError) are counted and logged but never
// propagate past the frame builder; session-level errors reach the manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;

// ============================================================================
// Error Kinds
// ============================================================================

/// Errors surfaced by the ingestion core.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Invalid framing config, unknown checksum name, malformed project.
    /// Raised at `connect()`; the manager stays Disconnected.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport open failed, I/O error mid-session, remote closed.
    /// Handled by the manager's reconnect policy.
    #[error("transport error: {0}")]
    Transport(String),

    /// Checksum mismatch, oversize buffer, unterminated frame at disconnect.
    /// Counted, never fatal.
    #[error("frame error: {0}")]
    Frame(String),

    /// Script runtime exception, channel-count mismatch, numeric parse
    /// failure. Drops the offending frame only.
    #[error("decode error: {0}")]
    Decode(String),

    /// Internal invariant violated. Unwinds to the manager, which disconnects.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StreamError {
    /// Whether this error ends the session when it reaches the manager.
    pub fn is_session_level(&self) -> bool {
        matches!(
            self,
            StreamError::Config(_) | StreamError::Transport(_) | StreamError::Fatal(_)
        )
    }
}

/// Recommended process exit codes for CLI wrappers. The core never exits a
/// process itself.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const CONFIG_ERROR: i32 = 2;
    pub const TRANSPORT_FAILED: i32 = 3;
    pub const PROJECT_LOAD_FAILED: i32 = 4;
}

// ============================================================================
// Session Counters
// ============================================================================

/// Upper bounds (exclusive, in microseconds) of the backpressure
/// blocked-duration histogram buckets. The last bucket is unbounded.
const BLOCKED_BUCKETS_US: [u64; 6] = [100, 1_000, 10_000, 100_000, 1_000_000, 10_000_000];

/// Lock-free counters shared across the acquisition, framer, and ingest
/// threads. No error is dropped without one of these moving.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Bytes received from the transport (pre-framing).
    pub rx_bytes: AtomicU64,
    /// Bytes accepted by `write()`.
    pub tx_bytes: AtomicU64,
    /// Frames that passed framing and checksum validation.
    pub frames_extracted: AtomicU64,
    /// Telemetry frames handed to the dispatch hub.
    pub frames_built: AtomicU64,
    /// Checksum mismatches.
    pub checksum_errors: AtomicU64,
    /// Buffer-oversize trims (high-water policy).
    pub oversize_errors: AtomicU64,
    /// Frames left unterminated in the buffer at disconnect.
    pub unterminated_frames: AtomicU64,
    /// Frames dropped by the builder (script error, count mismatch, bad JSON).
    pub decode_errors: AtomicU64,
    /// Per-field numeric parse failures (frame still delivered).
    pub parse_errors: AtomicU64,
    /// Times the framer blocked on a full frame queue.
    pub backpressure_events: AtomicU64,
    /// Histogram of how long the framer stayed blocked, bucketed per
    /// `BLOCKED_BUCKETS_US` plus one overflow bucket.
    blocked_histogram: [AtomicU64; 7],
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one blocked-enqueue episode.
    pub fn record_backpressure(&self, blocked_for: Duration) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
        let us = blocked_for.as_micros() as u64;
        let bucket = BLOCKED_BUCKETS_US
            .iter()
            .position(|&limit| us < limit)
            .unwrap_or(BLOCKED_BUCKETS_US.len());
        self.blocked_histogram[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the blocked-duration histogram (bucket counts, in
    /// `BLOCKED_BUCKETS_US` order, overflow last).
    pub fn blocked_histogram(&self) -> [u64; 7] {
        let mut out = [0u64; 7];
        for (i, bucket) in self.blocked_histogram.iter().enumerate() {
            out[i] = bucket.load(Ordering::Relaxed);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_level_classification() {
        assert!(StreamError::Config("x".into()).is_session_level());
        assert!(StreamError::Transport("x".into()).is_session_level());
        assert!(StreamError::Fatal("x".into()).is_session_level());
        assert!(!StreamError::Frame("x".into()).is_session_level());
        assert!(!StreamError::Decode("x".into()).is_session_level());
    }

    #[test]
    fn backpressure_histogram_buckets() {
        let stats = SessionStats::new();
        stats.record_backpressure(Duration::from_micros(50)); // bucket 0
        stats.record_backpressure(Duration::from_micros(500)); // bucket 1
        stats.record_backpressure(Duration::from_secs(60)); // overflow
        let hist = stats.blocked_histogram();
        assert_eq!(hist[0], 1);
        assert_eq!(hist[1], 1);
        assert_eq!(hist[6], 1);
        assert_eq!(stats.backpressure_events.load(Ordering::Relaxed), 3);
    }
}

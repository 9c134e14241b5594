// src/framing.rs
//
// Frame delimitation policies and the extractor that recovers application
// frames from the byte accumulator, across arbitrary chunk boundaries.

use serde::{Deserialize, Serialize};

use crate::checksums::ChecksumKind;
use crate::error::StreamError;
use crate::ring_buffer::RingBuffer;

/// Default high-water mark for the byte accumulator (10 MiB).
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// How application frames are delimited inside the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDetection {
    /// Frame is everything up to the next end sequence.
    #[serde(alias = "endDelimiter")]
    EndDelimiter,
    /// Frame is the bytes between a start sequence and the next end sequence.
    #[serde(alias = "startAndEndDelimiter")]
    StartAndEndDelimiter,
    /// Frame runs from one start sequence to the beginning of the next.
    #[serde(alias = "startOnly")]
    StartOnly,
    /// Every appended chunk is a frame (framing performed upstream).
    #[serde(alias = "noDelimiters")]
    NoDelimiters,
}

/// Immutable per-session framing parameters.
/// Changing them requires draining and reconfiguring the frame reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramingConfig {
    pub detection: FrameDetection,
    #[serde(default)]
    pub start_sequence: Vec<u8>,
    #[serde(default)]
    pub end_sequence: Vec<u8>,
    #[serde(default = "default_checksum")]
    pub checksum: ChecksumKind,
    /// High-water mark: oldest half of the buffer is dropped when it grows
    /// past this without yielding a frame.
    #[serde(default = "default_max_buffer")]
    pub max_buffer_bytes: usize,
}

fn default_checksum() -> ChecksumKind {
    ChecksumKind::None
}

fn default_max_buffer() -> usize {
    DEFAULT_MAX_BUFFER_BYTES
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            detection: FrameDetection::EndDelimiter,
            start_sequence: Vec::new(),
            end_sequence: b"\n".to_vec(),
            checksum: ChecksumKind::None,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

impl FramingConfig {
    /// Build a config from descriptor fields, resolving the checksum by its
    /// registry name.
    pub fn from_parts(
        detection: FrameDetection,
        start_sequence: Vec<u8>,
        end_sequence: Vec<u8>,
        checksum_name: &str,
    ) -> Result<Self, StreamError> {
        let checksum = ChecksumKind::from_name(checksum_name).ok_or_else(|| {
            StreamError::Config(format!("unknown checksum algorithm '{}'", checksum_name))
        })?;
        Self {
            detection,
            start_sequence,
            end_sequence,
            checksum,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
        .validated()
    }

    /// Validate delimiter requirements and normalise degenerate cases.
    /// `StartAndEndDelimiter` with identical sequences collapses to
    /// `EndDelimiter` semantics.
    pub fn validated(mut self) -> Result<Self, StreamError> {
        match self.detection {
            FrameDetection::EndDelimiter => {
                if self.end_sequence.is_empty() {
                    return Err(StreamError::Config(
                        "end-delimiter framing requires a non-empty end sequence".into(),
                    ));
                }
            }
            FrameDetection::StartAndEndDelimiter => {
                if self.start_sequence.is_empty() || self.end_sequence.is_empty() {
                    return Err(StreamError::Config(
                        "start/end framing requires non-empty start and end sequences".into(),
                    ));
                }
                if self.start_sequence == self.end_sequence {
                    self.detection = FrameDetection::EndDelimiter;
                    self.start_sequence.clear();
                }
            }
            FrameDetection::StartOnly => {
                if self.start_sequence.is_empty() {
                    return Err(StreamError::Config(
                        "start-only framing requires a non-empty start sequence".into(),
                    ));
                }
            }
            FrameDetection::NoDelimiters => {}
        }
        if self.max_buffer_bytes == 0 {
            return Err(StreamError::Config("max_buffer_bytes must be non-zero".into()));
        }
        Ok(self)
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// What one `push_bytes`/`drain` pass produced.
#[derive(Debug, Default)]
pub struct ExtractReport {
    /// Validated frames, in stream order.
    pub frames: Vec<Vec<u8>>,
    /// Frames dropped on digest mismatch (or span shorter than the digest).
    pub checksum_errors: u32,
    /// High-water trims applied.
    pub oversize_trims: u32,
    /// Set by `drain` when bytes were left without a terminating delimiter.
    pub unterminated: bool,
}

/// Stateful extractor: owns the byte accumulator and applies one framing
/// policy to it. Lives on the framer thread.
pub struct FrameExtractor {
    config: FramingConfig,
    buffer: RingBuffer,
}

impl FrameExtractor {
    pub fn new(config: FramingConfig) -> Self {
        Self {
            config,
            buffer: RingBuffer::new(),
        }
    }

    pub fn config(&self) -> &FramingConfig {
        &self.config
    }

    /// Unconsumed bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and extract every frame that can be produced.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> ExtractReport {
        let mut report = ExtractReport::default();
        if self.config.detection == FrameDetection::NoDelimiters {
            self.buffer.append(chunk);
            self.extract_chunk_frame(&mut report);
            return report;
        }

        self.buffer.append(chunk);
        self.extract_delimited(&mut report);

        // High-water policy: no frame came out and the buffer keeps growing.
        if report.frames.is_empty() && self.buffer.len() > self.config.max_buffer_bytes {
            self.buffer.consume(self.buffer.len() / 2);
            report.oversize_trims += 1;
        }
        report
    }

    /// Final pass at disconnect: extract what remains, flag leftovers.
    pub fn drain(&mut self) -> ExtractReport {
        let mut report = ExtractReport::default();
        match self.config.detection {
            FrameDetection::NoDelimiters => self.extract_chunk_frame(&mut report),
            _ => self.extract_delimited(&mut report),
        }
        if !self.buffer.is_empty() {
            report.unterminated = true;
            self.buffer.consume(self.buffer.len());
        }
        report
    }

    fn extract_delimited(&mut self, report: &mut ExtractReport) {
        loop {
            let produced = match self.config.detection {
                FrameDetection::EndDelimiter => self.next_end_delimited(report),
                FrameDetection::StartAndEndDelimiter => self.next_start_end_delimited(report),
                FrameDetection::StartOnly => self.next_start_delimited(report),
                FrameDetection::NoDelimiters => unreachable!(),
            };
            if !produced {
                break;
            }
        }
    }

    /// EndDelimiter: frame is `[0, end)`; consume through the delimiter.
    /// Returns false when no complete frame is buffered.
    fn next_end_delimited(&mut self, report: &mut ExtractReport) -> bool {
        let end = &self.config.end_sequence;
        let Some(pos) = self.buffer.find(end, 0) else {
            return false;
        };
        let span = self.buffer.as_slice()[..pos].to_vec();
        self.buffer.consume(pos + end.len());
        self.accept_span(span, report);
        true
    }

    /// StartAndEndDelimiter: resync to the latest start, then cut at the next
    /// end. Bytes before the start are discarded.
    fn next_start_end_delimited(&mut self, report: &mut ExtractReport) -> bool {
        let start_len = self.config.start_sequence.len();
        let Some(start) = self.buffer.find(&self.config.start_sequence, 0) else {
            // Keep a possible partial start at the tail, drop the rest.
            let keep = start_len.saturating_sub(1);
            let len = self.buffer.len();
            if len > keep {
                self.buffer.consume(len - keep);
            }
            return false;
        };
        if start > 0 {
            self.buffer.consume(start);
        }

        let next_start = self.buffer.find(&self.config.start_sequence, start_len);
        let end = self.buffer.find(&self.config.end_sequence, start_len);
        match (end, next_start) {
            (Some(e), Some(s2)) if s2 < e => {
                // Another start before the end: discard the earlier one.
                self.buffer.consume(s2);
                true
            }
            (Some(e), _) => {
                let span = self.buffer.as_slice()[start_len..e].to_vec();
                self.buffer.consume(e + self.config.end_sequence.len());
                self.accept_span(span, report);
                true
            }
            (None, Some(s2)) => {
                // No end yet; resync to the newer start.
                self.buffer.consume(s2);
                true
            }
            (None, None) => false,
        }
    }

    /// StartOnly: a frame is only complete once the *next* start appears.
    fn next_start_delimited(&mut self, report: &mut ExtractReport) -> bool {
        let start_len = self.config.start_sequence.len();
        let Some(start) = self.buffer.find(&self.config.start_sequence, 0) else {
            let keep = start_len.saturating_sub(1);
            let len = self.buffer.len();
            if len > keep {
                self.buffer.consume(len - keep);
            }
            return false;
        };
        if start > 0 {
            self.buffer.consume(start);
        }
        let Some(next) = self.buffer.find(&self.config.start_sequence, start_len) else {
            return false;
        };
        let span = self.buffer.as_slice()[start_len..next].to_vec();
        self.buffer.consume(next);
        self.accept_span(span, report);
        true
    }

    /// NoDelimiters: the whole buffer is one frame. With a checksum, the
    /// digest is the buffer tail; too few bytes means wait for more.
    fn extract_chunk_frame(&mut self, report: &mut ExtractReport) {
        let digest_len = self.config.checksum.digest_len();
        let len = self.buffer.len();
        if len == 0 || len < digest_len {
            return;
        }
        let span = self.buffer.as_slice().to_vec();
        self.buffer.consume(len);
        self.accept_span(span, report);
    }

    /// Validate the digest at the tail of the span (when configured) and emit
    /// the payload. Empty payloads are dropped.
    fn accept_span(&self, span: Vec<u8>, report: &mut ExtractReport) {
        let digest_len = self.config.checksum.digest_len();
        let payload = if digest_len > 0 {
            if span.len() < digest_len {
                report.checksum_errors += 1;
                return;
            }
            let (payload, digest) = span.split_at(span.len() - digest_len);
            if self.config.checksum.compute(payload) != digest {
                report.checksum_errors += 1;
                return;
            }
            payload.to_vec()
        } else {
            span
        };
        if payload.is_empty() {
            return;
        }
        report.frames.push(payload);
    }
}

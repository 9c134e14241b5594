// src/frame_reader.rs
//
// Framer worker: a dedicated thread that owns the byte accumulator, extracts
// frames per the configured policy, and feeds the frame queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::SessionStats;
use crate::frame_queue::FrameProducer;
use crate::framing::{ExtractReport, FrameExtractor, FramingConfig};
use crate::tlog;

/// How often the framer wakes to poll its stop flag when idle.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Handle to a running framer thread.
///
/// Bytes sent through [`FrameReader::feed`] are appended to the accumulator on
/// the worker thread; validated frames come out on the frame queue. Stopping
/// drains the accumulator up to the last complete frame before the thread
/// exits.
pub struct FrameReader {
    chunk_tx: Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameReader {
    /// Spawn the framer thread.
    pub fn spawn(config: FramingConfig, queue: FrameProducer, stats: Arc<SessionStats>) -> Self {
        let (chunk_tx, chunk_rx) = unbounded::<Vec<u8>>();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = std::thread::Builder::new()
            .name("framer".into())
            .spawn(move || run_framer(config, chunk_rx, queue, stats, stop_flag))
            .expect("failed to spawn framer thread");

        Self {
            chunk_tx,
            stop,
            handle: Some(handle),
        }
    }

    /// Hand a received chunk to the framer thread. Delivery order is the call
    /// order; this is the only producer.
    pub fn feed(&self, chunk: Vec<u8>) {
        let _ = self.chunk_tx.send(chunk);
    }

    /// Detached feeder for the event pump. The reader stays the sole owner of
    /// the thread; feeders only push chunks.
    pub fn feeder(&self) -> FrameFeeder {
        FrameFeeder {
            chunk_tx: self.chunk_tx.clone(),
        }
    }

    /// Signal the worker to drain and exit, then join it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Cloneable handle that pushes chunks to the framer thread.
#[derive(Clone)]
pub struct FrameFeeder {
    chunk_tx: Sender<Vec<u8>>,
}

impl FrameFeeder {
    pub fn feed(&self, chunk: Vec<u8>) {
        let _ = self.chunk_tx.send(chunk);
    }
}

impl Drop for FrameReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_framer(
    config: FramingConfig,
    chunks: Receiver<Vec<u8>>,
    queue: FrameProducer,
    stats: Arc<SessionStats>,
    stop: Arc<AtomicBool>,
) {
    let mut extractor = FrameExtractor::new(config);

    loop {
        match chunks.recv_timeout(IDLE_POLL) {
            Ok(chunk) => {
                stats.rx_bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                let report = extractor.push_bytes(&chunk);
                if !apply_report(report, &queue, &stats) {
                    return; // consumer gone
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        // Stop is only honoured between chunks, never mid-frame.
        if stop.load(Ordering::SeqCst) {
            break;
        }
    }

    // Drain pending chunks, then the accumulator, before exiting.
    while let Ok(chunk) = chunks.try_recv() {
        stats.rx_bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        let report = extractor.push_bytes(&chunk);
        if !apply_report(report, &queue, &stats) {
            return;
        }
    }
    let report = extractor.drain();
    if report.unterminated {
        tlog!("[framer] Discarding unterminated frame data at shutdown");
    }
    apply_report(report, &queue, &stats);
}

/// Push extracted frames into the queue (blocking on backpressure) and fold
/// the report into the session counters. Returns false when the consumer side
/// of the queue has hung up.
fn apply_report(report: ExtractReport, queue: &FrameProducer, stats: &SessionStats) -> bool {
    stats
        .checksum_errors
        .fetch_add(report.checksum_errors as u64, Ordering::Relaxed);
    stats
        .oversize_errors
        .fetch_add(report.oversize_trims as u64, Ordering::Relaxed);
    if report.unterminated {
        stats.unterminated_frames.fetch_add(1, Ordering::Relaxed);
    }

    for frame in report.frames {
        match queue.enqueue(frame) {
            Ok(blocked) => {
                if !blocked.is_zero() {
                    stats.record_backpressure(blocked);
                }
                stats.frames_extracted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_queue::frame_queue;
    use crate::framing::FrameDetection;

    fn newline_config() -> FramingConfig {
        FramingConfig {
            detection: FrameDetection::EndDelimiter,
            end_sequence: b"\n".to_vec(),
            ..FramingConfig::default()
        }
    }

    #[test]
    fn frames_flow_from_feed_to_queue() {
        let (tx, rx) = frame_queue(16);
        let stats = Arc::new(SessionStats::new());
        let reader = FrameReader::spawn(newline_config(), tx, stats.clone());

        reader.feed(b"one\ntw".to_vec());
        reader.feed(b"o\n".to_vec());
        reader.stop();

        assert_eq!(rx.try_dequeue(), Some(b"one".to_vec()));
        assert_eq!(rx.try_dequeue(), Some(b"two".to_vec()));
        assert_eq!(rx.try_dequeue(), None);
        assert_eq!(stats.frames_extracted.load(Ordering::Relaxed), 2);
        assert_eq!(stats.rx_bytes.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn stop_drains_buffered_chunks() {
        let (tx, rx) = frame_queue(256);
        let stats = Arc::new(SessionStats::new());
        let reader = FrameReader::spawn(newline_config(), tx, stats);

        for i in 0..100 {
            reader.feed(format!("frame-{}\n", i).into_bytes());
        }
        reader.stop();

        let mut count = 0;
        while rx.try_dequeue().is_some() {
            count += 1;
        }
        assert_eq!(count, 100);
    }

    #[test]
    fn backpressure_blocks_without_dropping() {
        let (tx, rx) = frame_queue(2);
        let stats = Arc::new(SessionStats::new());
        let reader = FrameReader::spawn(newline_config(), tx, stats.clone());

        for i in 0..20 {
            reader.feed(format!("{}\n", i).into_bytes());
        }
        // Slow consumer: drain with a delay so the framer has to block.
        std::thread::sleep(Duration::from_millis(50));
        let mut seen = Vec::new();
        loop {
            match rx.dequeue_timeout(Duration::from_millis(200)) {
                Ok(Some(frame)) => seen.push(frame),
                _ => break,
            }
            if seen.len() == 20 {
                break;
            }
        }
        reader.stop();

        assert_eq!(seen.len(), 20);
        let expected: Vec<Vec<u8>> = (0..20).map(|i| format!("{}", i).into_bytes()).collect();
        assert_eq!(seen, expected);
        assert!(stats.backpressure_events.load(Ordering::Relaxed) > 0);
    }
}

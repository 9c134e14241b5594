// src/frame_queue.rs
//
// Bounded FIFO handoff between the framer thread (single producer) and the
// ingest thread (single consumer).

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

/// Default queue capacity (raw frames).
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Create a frame queue with the given capacity (minimum 1).
pub fn frame_queue(capacity: usize) -> (FrameProducer, FrameConsumer) {
    let (tx, rx) = bounded(capacity.max(1));
    (FrameProducer { tx }, FrameConsumer { rx })
}

/// Producer end, owned by the framer thread.
#[derive(Clone)]
pub struct FrameProducer {
    tx: Sender<Vec<u8>>,
}

impl FrameProducer {
    /// Non-blocking enqueue. Returns the frame back when the queue is full or
    /// the consumer is gone.
    pub fn try_enqueue(&self, frame: Vec<u8>) -> Result<(), Vec<u8>> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) | Err(TrySendError::Disconnected(frame)) => Err(frame),
        }
    }

    /// Blocking enqueue. Validated frames are never dropped; when the queue is
    /// full this parks the framer thread and reports how long it was blocked.
    /// Returns `Err(frame)` only when the consumer has hung up.
    pub fn enqueue(&self, frame: Vec<u8>) -> Result<Duration, Vec<u8>> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(Duration::ZERO),
            Err(TrySendError::Disconnected(frame)) => Err(frame),
            Err(TrySendError::Full(frame)) => {
                let blocked_at = Instant::now();
                match self.tx.send(frame) {
                    Ok(()) => Ok(blocked_at.elapsed()),
                    Err(e) => Err(e.into_inner()),
                }
            }
        }
    }
}

/// Consumer end, owned by the ingest thread.
pub struct FrameConsumer {
    rx: Receiver<Vec<u8>>,
}

impl FrameConsumer {
    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Dequeue with a timeout so the ingest loop can poll its stop flag.
    /// `Ok(None)` is a timeout; `Err(Closed)` means the producer hung up and
    /// the queue is drained.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, QueueClosed> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueClosed),
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// The producer dropped and every queued frame has been consumed.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueClosed;

// src/plugins.rs
//
// Plugin broadcaster: publishes every built frame as newline-delimited JSON
// to any subscribed local socket client, best effort per client.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::StreamError;
use crate::project::TelemetryFrame;
use crate::tlog;

/// TCP broadcast server for plugin clients.
///
/// The accept loop and the writer task run on the tokio runtime; `broadcast`
/// is synchronous and only enqueues, so the ingest thread never waits on a
/// slow client. A client that fails a write is dropped; the others are
/// unaffected.
pub struct PluginServer {
    addr: SocketAddr,
    line_tx: mpsc::UnboundedSender<String>,
    client_count: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl PluginServer {
    /// Bind the listener and spawn the accept/writer tasks.
    /// Must be called from within a tokio runtime.
    pub async fn bind(addr: SocketAddr) -> Result<Self, StreamError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StreamError::Transport(format!("plugin server bind {}: {}", addr, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| StreamError::Transport(format!("plugin server addr: {}", e)))?;

        let (client_tx, client_rx) = mpsc::unbounded_channel::<OwnedWriteHalf>();
        let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
        let client_count = Arc::new(AtomicUsize::new(0));

        let accept_task = tokio::spawn(accept_loop(listener, client_tx));
        let writer_task = tokio::spawn(writer_loop(client_rx, line_rx, client_count.clone()));

        tlog!("[plugins] Listening on {}", addr);
        Ok(Self {
            addr,
            line_tx,
            client_count,
            accept_task,
            writer_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Currently subscribed clients.
    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    /// Serialize the frame and queue it for every subscribed client.
    pub fn broadcast(&self, frame: &TelemetryFrame) {
        match serde_json::to_string(frame) {
            Ok(json) => {
                let _ = self.line_tx.send(json);
            }
            Err(e) => tlog!("[plugins] Failed to serialize frame: {}", e),
        }
    }

    /// Stop accepting and drop all clients.
    pub fn close(self) {
        self.accept_task.abort();
        self.writer_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, client_tx: mpsc::UnboundedSender<OwnedWriteHalf>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tlog!("[plugins] Client connected: {}", peer);
                let (_read_half, write_half) = stream.into_split();
                if client_tx.send(write_half).is_err() {
                    return;
                }
            }
            Err(e) => {
                tlog!("[plugins] Accept error: {}", e);
                return;
            }
        }
    }
}

async fn writer_loop(
    mut client_rx: mpsc::UnboundedReceiver<OwnedWriteHalf>,
    mut line_rx: mpsc::UnboundedReceiver<String>,
    client_count: Arc<AtomicUsize>,
) {
    let mut clients: Vec<OwnedWriteHalf> = Vec::new();

    loop {
        tokio::select! {
            new_client = client_rx.recv() => {
                match new_client {
                    Some(client) => {
                        clients.push(client);
                        client_count.store(clients.len(), Ordering::Relaxed);
                    }
                    None => return,
                }
            }
            line = line_rx.recv() => {
                let Some(line) = line else { return };
                let mut message = line.into_bytes();
                message.push(b'\n');

                // Best effort per client: a failed write evicts that client only.
                let mut alive = Vec::with_capacity(clients.len());
                for mut client in clients.drain(..) {
                    match client.write_all(&message).await {
                        Ok(()) => alive.push(client),
                        Err(e) => tlog!("[plugins] Dropping client: {}", e),
                    }
                }
                clients = alive;
                client_count.store(clients.len(), Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{DatasetValue, TelemetryFrame};
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpStream;

    fn sample_frame() -> TelemetryFrame {
        let mut frame = TelemetryFrame::quick_plot(2);
        let mut values = [1.5, -3.25].iter();
        for dataset in frame.datasets_mut() {
            dataset.value = DatasetValue::Number(*values.next().unwrap());
        }
        frame
    }

    #[tokio::test]
    async fn broadcasts_ndjson_to_subscribers() {
        let server = PluginServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut lines = BufReader::new(stream).lines();

        // Wait for the writer task to register the client.
        for _ in 0..100 {
            if server.client_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(server.client_count(), 1);

        let frame = sample_frame();
        server.broadcast(&frame);

        let line = lines.next_line().await.unwrap().unwrap();
        let decoded: TelemetryFrame = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded, frame);

        server.close();
    }

    #[tokio::test]
    async fn slow_or_dead_clients_do_not_affect_others() {
        let server = PluginServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let dead = TcpStream::connect(server.local_addr()).await.unwrap();
        let alive = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut lines = BufReader::new(alive).lines();

        for _ in 0..100 {
            if server.client_count() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        drop(dead);

        let frame = sample_frame();
        // Two broadcasts: the first may still succeed into the dead socket's
        // buffers, the second must reach the surviving client either way.
        server.broadcast(&frame);
        server.broadcast(&frame);

        let line = lines.next_line().await.unwrap().unwrap();
        let decoded: TelemetryFrame = serde_json::from_str(&line).unwrap();
        assert_eq!(decoded, frame);

        server.close();
    }
}

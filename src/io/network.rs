// src/io/network.rs
//
// Network driver: TCP client, single-peer TCP server, and UDP with optional
// multicast membership. Read loops run as tokio tasks and push chunks to the
// event channel.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use crate::error::StreamError;
use crate::tlog;

use super::{Driver, DriverEvent, DriverState, EventSender, StateCell};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTransport {
    #[default]
    TcpClient,
    TcpServer,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub transport: NetworkTransport,
    /// Remote host (TCP client, UDP send target). Ignored for TCP server.
    #[serde(default)]
    pub host: String,
    /// Remote port (TCP client) or local listen port (TCP server, UDP).
    pub port: u16,
    /// Optional IPv4 multicast group to join (UDP only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multicast_group: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: NetworkTransport::TcpClient,
            host: String::new(),
            port: 0,
            multicast_group: None,
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Where `write()` lands, depending on the transport variant.
enum WriteTarget {
    Tcp(OwnedWriteHalf),
    Udp(Arc<UdpSocket>, SocketAddr),
}

type SharedWriter = Arc<Mutex<Option<WriteTarget>>>;

pub struct NetworkDriver {
    config: NetworkConfig,
    state: StateCell,
    writer: SharedWriter,
    tasks: Vec<JoinHandle<()>>,
}

impl NetworkDriver {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            state: StateCell::new(),
            writer: Arc::new(Mutex::new(None)),
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl Driver for NetworkDriver {
    async fn open(&mut self, events: EventSender) -> Result<(), StreamError> {
        if self.state.get() == DriverState::Open {
            return Ok(());
        }
        if !self.configuration_ok() {
            return Err(StreamError::Config("network endpoint not configured".into()));
        }
        self.state.transition(DriverState::Opening, &events).await;

        let result = match self.config.transport {
            NetworkTransport::TcpClient => self.open_tcp_client(&events).await,
            NetworkTransport::TcpServer => self.open_tcp_server(&events).await,
            NetworkTransport::Udp => self.open_udp(&events).await,
        };
        match result {
            Ok(()) => {
                self.state.transition(DriverState::Open, &events).await;
                Ok(())
            }
            Err(e) => {
                self.state.transition(DriverState::Failing, &events).await;
                let _ = events.send(DriverEvent::Error(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Ok(mut guard) = self.writer.lock() {
            *guard = None;
        }
        self.state.set(DriverState::Closed);
        tlog!("[network] Closed");
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<usize, StreamError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| StreamError::Fatal("network writer mutex poisoned".into()))?;
        match guard.as_mut() {
            Some(WriteTarget::Tcp(half)) => half
                .try_write(bytes)
                .map_err(|e| StreamError::Transport(format!("tcp write: {}", e))),
            Some(WriteTarget::Udp(socket, target)) => socket
                .try_send_to(bytes, *target)
                .map_err(|e| StreamError::Transport(format!("udp send: {}", e))),
            None => Err(StreamError::Transport("no connected peer".into())),
        }
    }

    fn is_writable(&self) -> bool {
        self.state.get() == DriverState::Open
            && self.writer.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn configuration_ok(&self) -> bool {
        if self.config.port == 0 {
            return false;
        }
        match self.config.transport {
            NetworkTransport::TcpClient => !self.config.host.is_empty(),
            NetworkTransport::TcpServer => true,
            NetworkTransport::Udp => {
                if let Some(group) = &self.config.multicast_group {
                    group.parse::<Ipv4Addr>().map(|ip| ip.is_multicast()).unwrap_or(false)
                } else {
                    true
                }
            }
        }
    }

    fn state(&self) -> DriverState {
        self.state.get()
    }

    fn kind(&self) -> &'static str {
        "network"
    }
}

impl NetworkDriver {
    async fn open_tcp_client(&mut self, events: &EventSender) -> Result<(), StreamError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| StreamError::Transport(format!("tcp connect {}: {}", addr, e)))?;
        tlog!("[network] Connected to {}", addr);

        let (read_half, write_half) = stream.into_split();
        if let Ok(mut guard) = self.writer.lock() {
            *guard = Some(WriteTarget::Tcp(write_half));
        }
        self.tasks.push(tokio::spawn(run_tcp_read_loop(
            read_half,
            self.state.clone(),
            events.clone(),
        )));
        Ok(())
    }

    async fn open_tcp_server(&mut self, events: &EventSender) -> Result<(), StreamError> {
        let bind = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| StreamError::Transport(format!("tcp bind {}: {}", bind, e)))?;
        tlog!("[network] Listening on {}", bind);

        let writer = self.writer.clone();
        let state = self.state.clone();
        let events = events.clone();
        self.tasks.push(tokio::spawn(async move {
            // One peer at a time; a new connection replaces a dead one.
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        tlog!("[network] Peer connected: {}", peer);
                        let (read_half, write_half) = stream.into_split();
                        if let Ok(mut guard) = writer.lock() {
                            *guard = Some(WriteTarget::Tcp(write_half));
                        }
                        run_tcp_read_loop_peer(read_half, &events).await;
                        if let Ok(mut guard) = writer.lock() {
                            *guard = None;
                        }
                        tlog!("[network] Peer disconnected: {}", peer);
                    }
                    Err(e) => {
                        state.transition(DriverState::Failing, &events).await;
                        let _ = events.send(DriverEvent::Error(format!("accept: {}", e))).await;
                        return;
                    }
                }
            }
        }));
        Ok(())
    }

    async fn open_udp(&mut self, events: &EventSender) -> Result<(), StreamError> {
        let bind = format!("0.0.0.0:{}", self.config.port);
        let socket = UdpSocket::bind(&bind)
            .await
            .map_err(|e| StreamError::Transport(format!("udp bind {}: {}", bind, e)))?;

        if let Some(group) = &self.config.multicast_group {
            let group: Ipv4Addr = group
                .parse()
                .map_err(|e| StreamError::Config(format!("bad multicast group '{}': {}", group, e)))?;
            socket
                .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                .map_err(|e| StreamError::Transport(format!("multicast join {}: {}", group, e)))?;
            tlog!("[network] Joined multicast group {}", group);
        }
        tlog!("[network] UDP bound on {}", bind);

        let socket = Arc::new(socket);
        if !self.config.host.is_empty() {
            let target: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
                .parse()
                .map_err(|e| StreamError::Config(format!("bad udp target: {}", e)))?;
            if let Ok(mut guard) = self.writer.lock() {
                *guard = Some(WriteTarget::Udp(socket.clone(), target));
            }
        }

        let events = events.clone();
        self.tasks.push(tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, _peer)) if n > 0 => {
                        let _ = events.send(DriverEvent::Data(buf[..n].to_vec())).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events.send(DriverEvent::Error(format!("udp recv: {}", e))).await;
                        return;
                    }
                }
            }
        }));
        Ok(())
    }
}

/// Read loop for the TCP client: a broken link moves the driver to Failing.
async fn run_tcp_read_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    state: StateCell,
    events: EventSender,
) {
    let mut buf = [0u8; 2048];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => {
                state.transition(DriverState::Failing, &events).await;
                let _ = events.send(DriverEvent::Error("remote closed connection".into())).await;
                return;
            }
            Ok(n) => {
                let _ = events.send(DriverEvent::Data(buf[..n].to_vec())).await;
            }
            Err(e) => {
                state.transition(DriverState::Failing, &events).await;
                let _ = events.send(DriverEvent::Error(format!("tcp read: {}", e))).await;
                return;
            }
        }
    }
}

/// Read loop for one server-side peer: a broken peer is not a driver failure,
/// the server keeps listening.
async fn run_tcp_read_loop_peer(mut read_half: tokio::net::tcp::OwnedReadHalf, events: &EventSender) {
    let mut buf = [0u8; 2048];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                let _ = events.send(DriverEvent::Data(buf[..n].to_vec())).await;
            }
            Err(_) => return,
        }
    }
}

// src/manager.rs
//
// Session lifecycle. The manager owns the active transport driver, the
// framer thread, the ingest thread, and the dispatch hub, and wires the
// driver's event channel into them at connect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::builder::{FrameBuilder, OperatingMode};
use crate::dispatch::{DispatchConfig, DispatchHub, DispatchReceivers};
use crate::error::{SessionStats, StreamError};
use crate::frame_queue::{frame_queue, FrameConsumer, DEFAULT_QUEUE_CAPACITY};
use crate::frame_reader::FrameReader;
use crate::framing::FramingConfig;
use crate::io::{make_driver, BusConfig, BusKind, Driver, DriverEvent, DriverState, EVENT_CHANNEL_CAPACITY};
use crate::plugins::PluginServer;
use crate::project::ProjectDescriptor;
use crate::tlog;

/// How often the ingest thread polls for shutdown while idle.
const INGEST_POLL: Duration = Duration::from_millis(100);

// ============================================================================
// Reconnect Policy
// ============================================================================

/// Exponential backoff for reopening a failing transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,
    /// Jitter amplitude as a fraction of the delay (0.10 = ±10 %).
    pub jitter: f64,
    /// Give up after this many failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            factor: 2.0,
            cap: Duration::from_secs(8),
            jitter: 0.10,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `n` (0-based). Jitter is deterministic per
    /// attempt so schedules are reproducible in tests.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = base.min(self.cap.as_secs_f64());
        // Weyl-sequence hash of the attempt number, mapped to [-1, 1].
        let hash = (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let unit = (hash >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0;
        let jittered = capped * (1.0 + self.jitter * unit);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

// ============================================================================
// Session Configuration and Events
// ============================================================================

/// Construct-time configuration for a manager. The core never touches
/// persistent settings; the embedding application owns those.
pub struct ManagerConfig {
    pub operating_mode: OperatingMode,
    pub project: Option<ProjectDescriptor>,
    /// Framing used outside project-file mode (the project declares its own).
    pub framing: FramingConfig,
    pub queue_capacity: usize,
    pub dispatch: DispatchConfig,
    /// Local address for the plugin broadcaster; `None` disables it.
    pub plugin_listen: Option<std::net::SocketAddr>,
    pub reconnect: ReconnectPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            operating_mode: OperatingMode::QuickPlot,
            project: None,
            framing: FramingConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dispatch: DispatchConfig::default(),
            plugin_listen: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Lifecycle state of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerState {
    Disconnected,
    Connected,
    Paused,
}

/// Session-level notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DriverStateChanged(DriverState),
    TransportError(String),
    /// A reopen attempt failed; the next one follows after backoff.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The attempt limit was reached; the session stays down.
    ReconnectGaveUp { attempts: u32 },
    Reconnected,
}

/// Receiver ends handed out by `connect()`.
#[derive(Debug)]
pub struct SessionHandles {
    pub dispatch: DispatchReceivers,
    pub events: Receiver<SessionEvent>,
}

// ============================================================================
// Manager
// ============================================================================

type SharedDriver = Arc<AsyncMutex<Box<dyn Driver>>>;

/// Owns the transport, the framer, and the ingest pipeline.
/// Exactly one transport is active per manager.
pub struct Manager {
    config: ManagerConfig,
    driver: Option<SharedDriver>,
    bus_kind: Option<BusKind>,
    paused: Arc<AtomicBool>,
    connected: bool,
    stats: Arc<SessionStats>,
    framer: Option<FrameReader>,
    ingest: Option<std::thread::JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            driver: None,
            bus_kind: None,
            paused: Arc::new(AtomicBool::new(false)),
            connected: false,
            stats: Arc::new(SessionStats::new()),
            framer: None,
            ingest: None,
            pump: None,
        }
    }

    pub fn stats(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// The selected bus family, when one was picked via `set_bus_type` or
    /// `configure` (caller-installed drivers have none).
    pub fn bus_kind(&self) -> Option<BusKind> {
        self.bus_kind
    }

    pub fn state(&self) -> ManagerState {
        if !self.connected {
            ManagerState::Disconnected
        } else if self.paused.load(Ordering::Relaxed) {
            ManagerState::Paused
        } else {
            ManagerState::Connected
        }
    }

    /// Select the transport family with default settings.
    /// Only legal while disconnected.
    pub fn set_bus_type(&mut self, kind: BusKind) -> Result<(), StreamError> {
        let config = match kind {
            BusKind::Serial => BusConfig::Serial(Default::default()),
            BusKind::Network => BusConfig::Network(Default::default()),
            BusKind::BluetoothLe => BusConfig::BluetoothLe(Default::default()),
            BusKind::Modbus => BusConfig::Modbus(Default::default()),
        };
        self.configure(config)
    }

    /// Install a fully configured transport. Only legal while disconnected.
    pub fn configure(&mut self, config: BusConfig) -> Result<(), StreamError> {
        if self.connected {
            return Err(StreamError::Config(
                "cannot reconfigure the bus while connected".into(),
            ));
        }
        self.bus_kind = Some(config.kind());
        self.driver = Some(Arc::new(AsyncMutex::new(make_driver(config))));
        Ok(())
    }

    /// Swap the operating mode. Only legal while disconnected.
    pub fn set_operating_mode(&mut self, mode: OperatingMode) -> Result<(), StreamError> {
        self.ensure_disconnected("operating mode")?;
        self.config.operating_mode = mode;
        Ok(())
    }

    /// Replace the project descriptor. Only legal while disconnected; the
    /// skeleton snapshot taken at connect stays immutable for the session.
    pub fn set_project(&mut self, project: Option<ProjectDescriptor>) -> Result<(), StreamError> {
        self.ensure_disconnected("project")?;
        if let Some(project) = &project {
            project.validate()?;
        }
        self.config.project = project;
        Ok(())
    }

    /// Replace the framing parameters used outside project-file mode.
    /// Only legal while disconnected: the framer must drain before a swap.
    pub fn set_framing(&mut self, framing: FramingConfig) -> Result<(), StreamError> {
        self.ensure_disconnected("framing config")?;
        self.config.framing = framing.validated()?;
        Ok(())
    }

    /// Resize the frame queue used by the next session.
    pub fn set_queue_capacity(&mut self, capacity: usize) -> Result<(), StreamError> {
        self.ensure_disconnected("queue capacity")?;
        self.config.queue_capacity = capacity.max(1);
        Ok(())
    }

    fn ensure_disconnected(&self, what: &str) -> Result<(), StreamError> {
        if self.connected {
            Err(StreamError::Config(format!(
                "cannot change {} while connected",
                what
            )))
        } else {
            Ok(())
        }
    }

    /// Install a caller-provided driver (mock transports, tests).
    pub fn install_driver(&mut self, driver: Box<dyn Driver>) -> Result<(), StreamError> {
        if self.connected {
            return Err(StreamError::Config(
                "cannot replace the driver while connected".into(),
            ));
        }
        self.bus_kind = None;
        self.driver = Some(Arc::new(AsyncMutex::new(driver)));
        Ok(())
    }

    /// Validate configuration, open the transport, start the framer and
    /// ingest threads, and wire everything together.
    pub async fn connect(&mut self) -> Result<SessionHandles, StreamError> {
        if self.connected {
            return Err(StreamError::Config("already connected".into()));
        }
        let driver = self
            .driver
            .clone()
            .ok_or_else(|| StreamError::Config("no bus selected".into()))?;
        if !driver.lock().await.configuration_ok() {
            return Err(StreamError::Config("transport configuration incomplete".into()));
        }

        // Resolve framing and build the mode-specific frame builder. Project
        // problems (bad checksum name, bad script) surface here, before any
        // thread starts.
        let (framing, builder) = match self.config.operating_mode {
            OperatingMode::ProjectFile => {
                let project = self.config.project.as_ref().ok_or_else(|| {
                    StreamError::Config("project-file mode requires a project descriptor".into())
                })?;
                (project.framing_config()?, FrameBuilder::for_project(project)?)
            }
            OperatingMode::QuickPlot => (
                self.config.framing.clone().validated()?,
                FrameBuilder::quick_plot(),
            ),
            OperatingMode::DeviceSendsJson => (
                self.config.framing.clone().validated()?,
                FrameBuilder::device_sends_json(),
            ),
        };

        self.paused.store(false, Ordering::Relaxed);

        // Dispatch hub and sinks.
        let (mut hub, receivers) = DispatchHub::new(
            DispatchConfig {
                coalesce_period: self.config.dispatch.coalesce_period,
                console_format: self.config.dispatch.console_format,
                csv_dir: self.config.dispatch.csv_dir.clone(),
            },
            self.paused.clone(),
        );
        if let Some(addr) = self.config.plugin_listen {
            hub.set_plugin_server(PluginServer::bind(addr).await?);
        }
        let raw_forwarder = hub.raw_forwarder();

        // Frame queue, framer thread, ingest thread.
        let (producer, consumer) = frame_queue(self.config.queue_capacity);
        let framer = FrameReader::spawn(framing, producer, self.stats.clone());
        let feeder = framer.feeder();
        let ingest = spawn_ingest_thread(consumer, builder, hub, self.stats.clone());

        // Driver events and the pump that routes them.
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (session_tx, session_rx) = unbounded();

        // A failed open is a transport error, not a config error: the session
        // comes up anyway and the reconnect policy works on the link.
        if let Err(e) = driver.lock().await.open(events_tx.clone()).await {
            tlog!("[manager] Open failed, entering reconnect: {}", e);
            let _ = events_tx.send(DriverEvent::Error(e.to_string())).await;
            let _ = events_tx.send(DriverEvent::State(DriverState::Failing)).await;
        }

        self.pump = Some(tokio::spawn(run_event_pump(
            events_rx,
            events_tx,
            driver.clone(),
            feeder,
            raw_forwarder,
            session_tx,
            self.config.reconnect.clone(),
        )));

        self.framer = Some(framer);
        self.ingest = Some(ingest);
        self.connected = true;
        tlog!("[manager] Connected");

        Ok(SessionHandles {
            dispatch: receivers,
            events: session_rx,
        })
    }

    /// Stop everything: the pump, the transport, the framer (drain + join),
    /// and the ingest thread (drain + join).
    pub async fn disconnect(&mut self) -> Result<(), StreamError> {
        if !self.connected {
            return Ok(());
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(driver) = &self.driver {
            driver.lock().await.close().await?;
        }
        if let Some(framer) = self.framer.take() {
            framer.stop();
        }
        if let Some(ingest) = self.ingest.take() {
            let _ = ingest.join();
        }
        self.connected = false;
        self.paused.store(false, Ordering::Relaxed);
        tlog!("[manager] Disconnected");
        Ok(())
    }

    /// Gate frame and console delivery. Acquisition and framing continue.
    pub fn pause(&mut self) {
        if self.connected {
            self.paused.store(true, Ordering::Relaxed);
        }
    }

    pub fn resume(&mut self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Forward bytes to the transport. Returns the bytes accepted.
    pub async fn write(&self, bytes: &[u8]) -> Result<usize, StreamError> {
        let driver = self
            .driver
            .as_ref()
            .ok_or_else(|| StreamError::Config("no bus selected".into()))?;
        let accepted = driver.lock().await.write(bytes)?;
        self.stats.tx_bytes.fetch_add(accepted as u64, Ordering::Relaxed);
        Ok(accepted)
    }
}

// ============================================================================
// Ingest Thread
// ============================================================================

fn spawn_ingest_thread(
    consumer: FrameConsumer,
    mut builder: FrameBuilder,
    mut hub: DispatchHub,
    stats: Arc<SessionStats>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("ingest".into())
        .spawn(move || {
            loop {
                match consumer.dequeue_timeout(INGEST_POLL) {
                    Ok(Some(raw)) => match builder.build(&raw) {
                        Ok(result) => {
                            stats
                                .parse_errors
                                .fetch_add(result.parse_failures as u64, Ordering::Relaxed);
                            stats.frames_built.fetch_add(1, Ordering::Relaxed);
                            hub.dispatch(&result);
                        }
                        Err(e) => {
                            stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                            tlog!("[ingest] Dropped frame: {}", e);
                        }
                    },
                    // Idle: push out any coalesced values.
                    Ok(None) => hub.flush(),
                    Err(_) => break,
                }
            }
            hub.close();
        })
        .expect("failed to spawn ingest thread")
}

// ============================================================================
// Event Pump and Reconnect
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn run_event_pump(
    mut events_rx: mpsc::Receiver<DriverEvent>,
    events_tx: mpsc::Sender<DriverEvent>,
    driver: SharedDriver,
    feeder: crate::frame_reader::FrameFeeder,
    raw_forwarder: crate::dispatch::RawForwarder,
    session_tx: Sender<SessionEvent>,
    policy: ReconnectPolicy,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            DriverEvent::Data(chunk) => {
                raw_forwarder.forward(&chunk);
                feeder.feed(chunk);
            }
            DriverEvent::State(state) => {
                let _ = session_tx.send(SessionEvent::DriverStateChanged(state));
                if state == DriverState::Failing {
                    reconnect_with_backoff(
                        &mut events_rx,
                        &events_tx,
                        &driver,
                        &feeder,
                        &raw_forwarder,
                        &session_tx,
                        &policy,
                    )
                    .await;
                }
            }
            DriverEvent::Error(reason) => {
                tlog!("[manager] Transport error: {}", reason);
                let _ = session_tx.send(SessionEvent::TransportError(reason));
            }
        }
    }
}

/// Reopen loop: close, wait per the backoff schedule, try again. Events that
/// arrive while waiting are drained so open attempts can never wedge on a
/// full channel.
async fn reconnect_with_backoff(
    events_rx: &mut mpsc::Receiver<DriverEvent>,
    events_tx: &mpsc::Sender<DriverEvent>,
    driver: &SharedDriver,
    feeder: &crate::frame_reader::FrameFeeder,
    raw_forwarder: &crate::dispatch::RawForwarder,
    session_tx: &Sender<SessionEvent>,
    policy: &ReconnectPolicy,
) {
    let mut attempt: u32 = 0;
    loop {
        if let Some(limit) = policy.max_attempts {
            if attempt >= limit {
                tlog!("[manager] Giving up after {} reconnect attempts", attempt);
                let _ = session_tx.send(SessionEvent::ReconnectGaveUp { attempts: attempt });
                return;
            }
        }

        let delay = policy.delay(attempt);
        let _ = session_tx.send(SessionEvent::ReconnectScheduled { attempt, delay });
        tokio::time::sleep(delay).await;

        // Keep the stream flowing: deliver any data the old link produced
        // before failing, and drop stale state noise.
        while let Ok(event) = events_rx.try_recv() {
            if let DriverEvent::Data(chunk) = event {
                raw_forwarder.forward(&chunk);
                feeder.feed(chunk);
            }
        }

        let mut guard = driver.lock().await;
        let _ = guard.close().await;
        match guard.open(events_tx.clone()).await {
            Ok(()) => {
                tlog!("[manager] Reconnected after {} failed attempt(s)", attempt);
                let _ = session_tx.send(SessionEvent::Reconnected);
                return;
            }
            Err(e) => {
                attempt += 1;
                let _ = session_tx.send(SessionEvent::TransportError(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        let nominal = [250u64, 500, 1000, 2000, 4000, 8000, 8000];
        for (attempt, &expected_ms) in nominal.iter().enumerate() {
            let delay = policy.delay(attempt as u32).as_secs_f64() * 1000.0;
            let expected = expected_ms as f64;
            assert!(
                (delay - expected).abs() <= expected * 0.10 + 1e-6,
                "attempt {}: {} ms not within ±10 % of {} ms",
                attempt,
                delay,
                expected
            );
        }
    }

    #[test]
    fn backoff_jitter_is_deterministic() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(3), policy.delay(3));
    }

    #[test]
    fn state_reflects_connection_and_pause() {
        let manager = Manager::new(ManagerConfig::default());
        assert_eq!(manager.state(), ManagerState::Disconnected);
    }

    #[tokio::test]
    async fn connect_without_bus_is_a_config_error() {
        let mut manager = Manager::new(ManagerConfig::default());
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }

    #[tokio::test]
    async fn project_mode_requires_a_project() {
        let mut manager = Manager::new(ManagerConfig {
            operating_mode: OperatingMode::ProjectFile,
            ..ManagerConfig::default()
        });
        manager.set_bus_type(BusKind::Network).unwrap();
        // Unconfigured network driver fails the configuration check first;
        // give it a valid endpoint so the project check is what trips.
        manager
            .configure(BusConfig::Network(crate::io::NetworkConfig {
                transport: crate::io::NetworkTransport::TcpClient,
                host: "127.0.0.1".into(),
                port: 9,
                multicast_group: None,
            }))
            .unwrap();
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, StreamError::Config(_)));
    }
}

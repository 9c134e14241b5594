// src/io/mod.rs
//
// Transport driver abstraction. Each concrete driver normalizes one physical
// medium into the same contract: open it with an event channel, receive byte
// chunks and state changes back, write bytes out.

pub mod ble;
pub mod modbus;
pub mod network;
pub mod serial;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StreamError;

pub use ble::BleConfig;
pub use modbus::{ModbusConfig, ModbusTransport, PollGroup, RegisterType};
pub use network::{NetworkConfig, NetworkTransport};
pub use serial::{Parity, SerialConfig};

/// Capacity of the driver event channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// States and Events
// ============================================================================

/// Link state of a transport driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Closed,
    Opening,
    Open,
    Failing,
}

/// Events pushed by a driver to whoever opened it.
/// Thread affinity: emitted from the driver's own I/O task or thread.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// A received chunk, in reception order.
    Data(Vec<u8>),
    /// The link state changed.
    State(DriverState),
    /// A transport-level error. Transient errors also move the state to
    /// `Failing`; the manager decides whether to reopen.
    Error(String),
}

pub type EventSender = mpsc::Sender<DriverEvent>;
pub type EventReceiver = mpsc::Receiver<DriverEvent>;

/// Shared link-state cell. Setting the state emits a `State` event when a
/// sender is attached.
#[derive(Clone, Default)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(DriverState::Closed as u8)))
    }

    pub(crate) fn get(&self) -> DriverState {
        match self.0.load(Ordering::SeqCst) {
            0 => DriverState::Closed,
            1 => DriverState::Opening,
            2 => DriverState::Open,
            _ => DriverState::Failing,
        }
    }

    pub(crate) fn set(&self, state: DriverState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Set the state and notify from async context.
    pub(crate) async fn transition(&self, state: DriverState, events: &EventSender) {
        self.set(state);
        let _ = events.send(DriverEvent::State(state)).await;
    }

    /// Set the state and notify from a blocking thread.
    pub(crate) fn transition_blocking(&self, state: DriverState, events: &EventSender) {
        self.set(state);
        let _ = events.blocking_send(DriverEvent::State(state));
    }
}

// ============================================================================
// Driver Trait
// ============================================================================

/// Uniform transport contract regardless of physical medium.
#[async_trait]
pub trait Driver: Send {
    /// Open the device and start pushing events into `events`.
    /// Opening an already-open driver is a no-op.
    async fn open(&mut self, events: EventSender) -> Result<(), StreamError>;

    /// Release resources. Must succeed from any state, including `Failing`.
    async fn close(&mut self) -> Result<(), StreamError>;

    /// Accept bytes for transmission. Returns the number of bytes accepted;
    /// may block up to a bounded timeout but never indefinitely.
    fn write(&self, bytes: &[u8]) -> Result<usize, StreamError>;

    fn is_readable(&self) -> bool {
        self.state() == DriverState::Open
    }

    fn is_writable(&self) -> bool;

    /// Whether the current configuration is complete enough to open.
    fn configuration_ok(&self) -> bool;

    fn state(&self) -> DriverState;

    /// Short identifier for logs (e.g. "serial", "modbus").
    fn kind(&self) -> &'static str;
}

// ============================================================================
// Bus Selection
// ============================================================================

/// The transport families a manager can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    Serial,
    Network,
    BluetoothLe,
    Modbus,
}

/// Per-bus configuration, tagged by bus kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "bus", rename_all = "snake_case")]
pub enum BusConfig {
    Serial(SerialConfig),
    Network(NetworkConfig),
    BluetoothLe(BleConfig),
    Modbus(ModbusConfig),
}

impl BusConfig {
    pub fn kind(&self) -> BusKind {
        match self {
            BusConfig::Serial(_) => BusKind::Serial,
            BusConfig::Network(_) => BusKind::Network,
            BusConfig::BluetoothLe(_) => BusKind::BluetoothLe,
            BusConfig::Modbus(_) => BusKind::Modbus,
        }
    }
}

/// Instantiate the driver for a bus configuration.
pub fn make_driver(config: BusConfig) -> Box<dyn Driver> {
    match config {
        BusConfig::Serial(config) => Box::new(serial::SerialDriver::new(config)),
        BusConfig::Network(config) => Box::new(network::NetworkDriver::new(config)),
        BusConfig::BluetoothLe(config) => Box::new(ble::BleDriver::new(config)),
        BusConfig::Modbus(config) => Box::new(modbus::ModbusDriver::new(config)),
    }
}

// src/io/serial.rs
//
// Serial port driver. Cross-platform via the serialport crate; the blocking
// read loop runs on a spawn_blocking thread and pushes chunks to the event
// channel.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::StreamError;
use crate::tlog;

use super::{Driver, DriverEvent, DriverState, EventSender, StateCell};

/// Read timeout for the blocking loop; bounds the stop-flag latency.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default)]
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }
}

fn to_serialport_data_bits(bits: u8) -> serialport::DataBits {
    match bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    }
}

fn to_serialport_stop_bits(bits: u8) -> serialport::StopBits {
    match bits {
        2 => serialport::StopBits::Two,
        _ => serialport::StopBits::One,
    }
}

fn to_serialport_parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn to_serialport_flow_control(flow: FlowControl) -> serialport::FlowControl {
    match flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Software => serialport::FlowControl::Software,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
    }
}

// ============================================================================
// Port Enumeration
// ============================================================================

/// Information about an available serial port.
#[derive(Debug, Clone, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// List available serial ports.
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices;
/// the cu (calling unit) devices are non-blocking and preferred for outgoing
/// connections.
pub fn available_ports() -> Result<Vec<SerialPortInfo>, StreamError> {
    let ports = serialport::available_ports()
        .map_err(|e| StreamError::Transport(format!("failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => {
                    ("USB".to_string(), info.manufacturer, info.product)
                }
                serialport::SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None),
                serialport::SerialPortType::PciPort => ("PCI".to_string(), None, None),
                serialport::SerialPortType::Unknown => ("Unknown".to_string(), None, None),
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
            }
        })
        .collect())
}

// ============================================================================
// Driver
// ============================================================================

type SharedPort = Arc<Mutex<Option<Box<dyn serialport::SerialPort>>>>;

pub struct SerialDriver {
    config: SerialConfig,
    state: StateCell,
    stop_flag: Arc<AtomicBool>,
    port: SharedPort,
    read_task: Option<JoinHandle<()>>,
}

impl SerialDriver {
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            state: StateCell::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            port: Arc::new(Mutex::new(None)),
            read_task: None,
        }
    }
}

#[async_trait]
impl Driver for SerialDriver {
    async fn open(&mut self, events: EventSender) -> Result<(), StreamError> {
        if self.state.get() == DriverState::Open {
            return Ok(());
        }
        if !self.configuration_ok() {
            return Err(StreamError::Config("serial port not configured".into()));
        }
        self.state.transition(DriverState::Opening, &events).await;

        let opened = serialport::new(&self.config.port, self.config.baud_rate)
            .data_bits(to_serialport_data_bits(self.config.data_bits))
            .stop_bits(to_serialport_stop_bits(self.config.stop_bits))
            .parity(to_serialport_parity(self.config.parity))
            .flow_control(to_serialport_flow_control(self.config.flow_control))
            .timeout(READ_TIMEOUT)
            .open();

        let port = match opened {
            Ok(port) => port,
            Err(e) => {
                let reason = format!("failed to open {}: {}", self.config.port, e);
                self.state.transition(DriverState::Failing, &events).await;
                let _ = events.send(DriverEvent::Error(reason.clone())).await;
                return Err(StreamError::Transport(reason));
            }
        };

        if let Ok(mut guard) = self.port.lock() {
            *guard = Some(port);
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        self.state.transition(DriverState::Open, &events).await;
        tlog!(
            "[serial] Opened {} (baud {}, {}{}{})",
            self.config.port,
            self.config.baud_rate,
            self.config.data_bits,
            match self.config.parity {
                Parity::None => "N",
                Parity::Odd => "O",
                Parity::Even => "E",
            },
            self.config.stop_bits
        );

        let port = self.port.clone();
        let stop_flag = self.stop_flag.clone();
        let state = self.state.clone();
        self.read_task = Some(tokio::task::spawn_blocking(move || {
            run_read_loop(port, stop_flag, state, events)
        }));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(task) = self.read_task.take() {
            let _ = task.await;
        }
        if let Ok(mut guard) = self.port.lock() {
            *guard = None;
        }
        self.state.set(DriverState::Closed);
        tlog!("[serial] Closed {}", self.config.port);
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<usize, StreamError> {
        let mut guard = self
            .port
            .lock()
            .map_err(|_| StreamError::Fatal("serial port mutex poisoned".into()))?;
        let port = guard
            .as_mut()
            .ok_or_else(|| StreamError::Transport("serial port not open".into()))?;
        port.write_all(bytes)
            .and_then(|_| port.flush())
            .map_err(|e| StreamError::Transport(format!("serial write: {}", e)))?;
        Ok(bytes.len())
    }

    fn is_writable(&self) -> bool {
        self.state.get() == DriverState::Open
    }

    fn configuration_ok(&self) -> bool {
        !self.config.port.is_empty()
            && self.config.baud_rate > 0
            && (5..=8).contains(&self.config.data_bits)
            && (1..=2).contains(&self.config.stop_bits)
    }

    fn state(&self) -> DriverState {
        self.state.get()
    }

    fn kind(&self) -> &'static str {
        "serial"
    }
}

/// Blocking read loop. Exits on stop flag, EOF, or hard I/O error.
fn run_read_loop(port: SharedPort, stop_flag: Arc<AtomicBool>, state: StateCell, events: EventSender) {
    let mut buf = [0u8; 256];

    while !stop_flag.load(Ordering::SeqCst) {
        let read_result = match port.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(port) => port.read(&mut buf),
                None => return,
            },
            Err(_) => {
                state.transition_blocking(DriverState::Failing, &events);
                let _ = events.blocking_send(DriverEvent::Error("serial port mutex poisoned".into()));
                return;
            }
        };

        match read_result {
            Ok(n) if n > 0 => {
                let _ = events.blocking_send(DriverEvent::Data(buf[..n].to_vec()));
            }
            Ok(_) => {
                // EOF - port disconnected
                state.transition_blocking(DriverState::Failing, &events);
                let _ = events.blocking_send(DriverEvent::Error("serial port disconnected".into()));
                return;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                state.transition_blocking(DriverState::Failing, &events);
                let _ = events.blocking_send(DriverEvent::Error(format!("serial read: {}", e)));
                return;
            }
        }
    }
}

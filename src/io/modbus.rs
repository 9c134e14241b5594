// src/io/modbus.rs
//
// Modbus driver - a synthetic transport. A poll loop issues register reads
// and serializes each response into a comma-separated ASCII line terminated
// by '\n', pushed through the normal data channel. Framing downstream then
// treats it like any other newline-delimited stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tokio_modbus::client::{self, rtu, tcp};
use tokio_modbus::prelude::*;

use crate::error::StreamError;
use crate::tlog;

use super::{Driver, DriverEvent, DriverState, EventSender, StateCell};

// ============================================================================
// Configuration
// ============================================================================

/// Register type for Modbus polling.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Holding,
    Input,
    Coil,
    Discrete,
}

/// A single poll group - one register read operation on a timer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollGroup {
    pub register_type: RegisterType,
    /// Protocol-level start address (0-based).
    pub start_register: u16,
    /// Number of registers (or coils) to read.
    pub count: u16,
    /// Poll interval in milliseconds.
    pub interval_ms: u64,
}

/// Physical Modbus link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "link", rename_all = "snake_case")]
pub enum ModbusTransport {
    Tcp { host: String, port: u16 },
    Rtu { port: String, baud_rate: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModbusConfig {
    pub transport: ModbusTransport,
    /// Modbus unit/slave ID (1-247).
    pub unit_id: u8,
    pub polls: Vec<PollGroup>,
    /// Stop polling a group after this many consecutive errors (0 = never).
    #[serde(default)]
    pub max_register_errors: u32,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            transport: ModbusTransport::Tcp {
                host: "127.0.0.1".into(),
                port: 502,
            },
            unit_id: 1,
            polls: Vec::new(),
            max_register_errors: 0,
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

pub struct ModbusDriver {
    config: ModbusConfig,
    state: StateCell,
    cancel_flag: Arc<AtomicBool>,
    task_handles: Vec<JoinHandle<()>>,
}

impl ModbusDriver {
    pub fn new(config: ModbusConfig) -> Self {
        Self {
            config,
            state: StateCell::new(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            task_handles: Vec::new(),
        }
    }

    async fn connect(&self) -> Result<client::Context, StreamError> {
        match &self.config.transport {
            ModbusTransport::Tcp { host, port } => {
                let addr: SocketAddr = format!("{}:{}", host, port)
                    .parse()
                    .map_err(|e| StreamError::Config(format!("invalid server address: {}", e)))?;
                tcp::connect_slave(addr, Slave(self.config.unit_id))
                    .await
                    .map_err(|e| {
                        StreamError::Transport(format!("modbus tcp connect {}: {}", addr, e))
                    })
            }
            ModbusTransport::Rtu { port, baud_rate } => {
                let builder = tokio_serial::new(port.as_str(), *baud_rate);
                let stream = tokio_serial::SerialStream::open(&builder).map_err(|e| {
                    StreamError::Transport(format!("modbus rtu open {}: {}", port, e))
                })?;
                Ok(rtu::attach_slave(stream, Slave(self.config.unit_id)))
            }
        }
    }
}

#[async_trait]
impl Driver for ModbusDriver {
    async fn open(&mut self, events: EventSender) -> Result<(), StreamError> {
        if self.state.get() == DriverState::Open {
            return Ok(());
        }
        if !self.configuration_ok() {
            return Err(StreamError::Config(
                "modbus driver needs a unit id and at least one poll group".into(),
            ));
        }
        self.state.transition(DriverState::Opening, &events).await;
        self.cancel_flag.store(false, Ordering::Relaxed);

        let ctx = match self.connect().await {
            Ok(ctx) => ctx,
            Err(e) => {
                self.state.transition(DriverState::Failing, &events).await;
                let _ = events.send(DriverEvent::Error(e.to_string())).await;
                return Err(e);
            }
        };
        let ctx: Arc<Mutex<client::Context>> = Arc::new(Mutex::new(ctx));

        tlog!(
            "[modbus] Connected (unit {}), {} poll group(s)",
            self.config.unit_id,
            self.config.polls.len()
        );

        for poll in &self.config.polls {
            self.task_handles.push(spawn_poll_task(
                poll.clone(),
                ctx.clone(),
                self.cancel_flag.clone(),
                self.config.max_register_errors,
                events.clone(),
            ));
        }
        self.state.transition(DriverState::Open, &events).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.cancel_flag.store(true, Ordering::Relaxed);
        for handle in self.task_handles.drain(..) {
            let _ = handle.await;
        }
        self.state.set(DriverState::Closed);
        tlog!("[modbus] Stopped");
        Ok(())
    }

    /// The Modbus driver is a polling reader; there is no raw write path.
    fn write(&self, _bytes: &[u8]) -> Result<usize, StreamError> {
        Err(StreamError::Transport(
            "modbus driver does not support raw transmission".into(),
        ))
    }

    fn is_writable(&self) -> bool {
        false
    }

    fn configuration_ok(&self) -> bool {
        (1..=247).contains(&self.config.unit_id)
            && !self.config.polls.is_empty()
            && self.config.polls.iter().all(|p| p.count > 0 && p.interval_ms > 0)
    }

    fn state(&self) -> DriverState {
        self.state.get()
    }

    fn kind(&self) -> &'static str {
        "modbus"
    }
}

// ============================================================================
// Poll Task
// ============================================================================

fn spawn_poll_task(
    poll: PollGroup,
    ctx: Arc<Mutex<client::Context>>,
    cancel_flag: Arc<AtomicBool>,
    max_register_errors: u32,
    events: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(Duration::from_millis(poll.interval_ms));
        let type_name = match poll.register_type {
            RegisterType::Holding => "holding",
            RegisterType::Input => "input",
            RegisterType::Coil => "coil",
            RegisterType::Discrete => "discrete",
        };
        let mut consecutive_errors: u32 = 0;

        loop {
            timer.tick().await;
            if cancel_flag.load(Ordering::Relaxed) {
                break;
            }

            let mut ctx = ctx.lock().await;

            // tokio-modbus read methods return Result<Result<Vec<T>, Exception>>
            // Outer Result = IO error, Inner Result = Modbus exception
            let result: Result<Vec<u8>, String> = match poll.register_type {
                RegisterType::Holding => {
                    match ctx.read_holding_registers(poll.start_register, poll.count).await {
                        Ok(Ok(data)) => Ok(registers_to_line(&data)),
                        Ok(Err(exc)) => Err(format!("Modbus exception: {}", exc)),
                        Err(e) => Err(format!("IO error: {}", e)),
                    }
                }
                RegisterType::Input => {
                    match ctx.read_input_registers(poll.start_register, poll.count).await {
                        Ok(Ok(data)) => Ok(registers_to_line(&data)),
                        Ok(Err(exc)) => Err(format!("Modbus exception: {}", exc)),
                        Err(e) => Err(format!("IO error: {}", e)),
                    }
                }
                RegisterType::Coil => match ctx.read_coils(poll.start_register, poll.count).await {
                    Ok(Ok(data)) => Ok(coils_to_line(&data)),
                    Ok(Err(exc)) => Err(format!("Modbus exception: {}", exc)),
                    Err(e) => Err(format!("IO error: {}", e)),
                },
                RegisterType::Discrete => {
                    match ctx.read_discrete_inputs(poll.start_register, poll.count).await {
                        Ok(Ok(data)) => Ok(coils_to_line(&data)),
                        Ok(Err(exc)) => Err(format!("Modbus exception: {}", exc)),
                        Err(e) => Err(format!("IO error: {}", e)),
                    }
                }
            };

            // Release the lock before emitting
            drop(ctx);

            match result {
                Ok(line) => {
                    consecutive_errors = 0;
                    let _ = events.send(DriverEvent::Data(line)).await;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tlog!(
                        "[modbus] Error reading {} registers at {}: {} ({}/{})",
                        type_name,
                        poll.start_register,
                        e,
                        consecutive_errors,
                        if max_register_errors > 0 {
                            max_register_errors.to_string()
                        } else {
                            "unlimited".to_string()
                        }
                    );
                    let _ = events
                        .send(DriverEvent::Error(format!(
                            "modbus read error ({} @ {}): {}",
                            type_name, poll.start_register, e
                        )))
                        .await;

                    if max_register_errors > 0 && consecutive_errors >= max_register_errors {
                        tlog!(
                            "[modbus] Stopped polling {} reg {} after {} consecutive errors",
                            type_name,
                            poll.start_register,
                            consecutive_errors
                        );
                        break;
                    }
                }
            }
        }
    })
}

// ============================================================================
// Line Synthesis
// ============================================================================

/// Serialize register values as a comma-separated decimal line.
/// The newline terminator lets the framer reuse end-delimited framing.
pub fn registers_to_line(registers: &[u16]) -> Vec<u8> {
    let mut line = registers
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",")
        .into_bytes();
    line.push(b'\n');
    line
}

/// Serialize coil/discrete values as a comma-separated 0/1 line.
pub fn coils_to_line(coils: &[bool]) -> Vec<u8> {
    let mut line = coils
        .iter()
        .map(|&c| if c { "1" } else { "0" })
        .collect::<Vec<_>>()
        .join(",")
        .into_bytes();
    line.push(b'\n');
    line
}

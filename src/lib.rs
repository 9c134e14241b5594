// src/lib.rs
//
// streamlab - ingestion and dispatch core for a real-time telemetry
// workstation.

//! Byte streams come in from a transport driver (serial, TCP/UDP, Bluetooth
//! LE, or a synthetic Modbus poller), a dedicated framer thread recovers
//! application frames under the configured delimitation and checksum policy,
//! the ingest thread turns each raw frame into a structured telemetry frame,
//! and a dispatch hub fans the result out to the visualization aggregator,
//! the CSV writer, and the plugin broadcaster without ever blocking the
//! presentation layer.
//!
//! Module map:
//!
//! - **`io`**: the [`io::Driver`] contract and the concrete transports.
//! - **`ring_buffer`** / **`framing`** / **`frame_reader`**: byte
//!   accumulation and frame extraction on the framer thread.
//! - **`frame_queue`**: bounded handoff between the framer and ingest threads.
//! - **`checksums`**: the named digest registry used by framing.
//! - **`project`** / **`builder`** / **`script`**: the telemetry data model
//!   and the three operating modes, including the embedded decoder script.
//! - **`dispatch`** / **`csv_writer`** / **`plugins`**: the sink fan-out.
//! - **`manager`**: session lifecycle, pause/resume, reconnect backoff.
//! - **`error`**: semantic error kinds and per-session counters.

pub mod builder;
pub mod checksums;
pub mod csv_writer;
pub mod dispatch;
pub mod error;
pub mod frame_queue;
pub mod frame_reader;
pub mod framing;
pub mod io;
pub mod logging;
pub mod manager;
pub mod plugins;
pub mod project;
pub mod ring_buffer;
pub mod script;

pub use builder::{BuildResult, FrameBuilder, OperatingMode};
pub use checksums::ChecksumKind;
pub use dispatch::{ConsoleFormat, DispatchConfig, DispatchReceivers, LineEnding, VizEvent};
pub use error::{SessionStats, StreamError};
pub use framing::{FrameDetection, FramingConfig};
pub use io::{BusConfig, BusKind, Driver, DriverEvent, DriverState};
pub use manager::{Manager, ManagerConfig, ManagerState, ReconnectPolicy, SessionEvent, SessionHandles};
pub use project::{Dataset, DatasetValue, Group, ProjectDescriptor, TelemetryFrame};

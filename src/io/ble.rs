// src/io/ble.rs
//
// Bluetooth LE driver. Scans for a peripheral advertising the configured
// GATT service, subscribes to the notify characteristic for inbound data,
// and writes through the write characteristic when one is configured.

use async_trait::async_trait;
use btleplug::api::{Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use uuid::Uuid;

use crate::error::StreamError;
use crate::tlog;

use super::{Driver, DriverEvent, DriverState, EventSender, StateCell};

/// How long a scan waits between peripheral sweeps.
const SCAN_POLL: Duration = Duration::from_millis(250);

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleConfig {
    /// Optional advertised-name filter; empty matches on service alone.
    #[serde(default)]
    pub device_name: String,
    /// GATT service to scan for.
    pub service_uuid: Uuid,
    /// Characteristic that notifies inbound data.
    pub notify_characteristic: Uuid,
    /// Characteristic accepting outbound writes, when the device has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_characteristic: Option<Uuid>,
    /// Give up scanning after this long.
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_ms: u64,
}

fn default_scan_timeout() -> u64 {
    10_000
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            service_uuid: Uuid::nil(),
            notify_characteristic: Uuid::nil(),
            write_characteristic: None,
            scan_timeout_ms: default_scan_timeout(),
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

pub struct BleDriver {
    config: BleConfig,
    state: StateCell,
    peripheral: Option<Peripheral>,
    write_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleDriver {
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            state: StateCell::new(),
            peripheral: None,
            write_tx: None,
            tasks: Vec::new(),
        }
    }

    /// Find the peripheral advertising our service (and name, when set).
    async fn discover_peripheral(&self, adapter: &Adapter) -> Result<Peripheral, StreamError> {
        let filter = ScanFilter {
            services: vec![self.config.service_uuid],
        };
        adapter
            .start_scan(filter)
            .await
            .map_err(|e| StreamError::Transport(format!("ble scan: {}", e)))?;

        let deadline = Instant::now() + Duration::from_millis(self.config.scan_timeout_ms);
        let found = loop {
            if let Ok(peripherals) = adapter.peripherals().await {
                let mut matched = None;
                for peripheral in peripherals {
                    let properties = peripheral.properties().await.ok().flatten();
                    let Some(properties) = properties else { continue };
                    let service_match = properties.services.contains(&self.config.service_uuid);
                    let name_match = self.config.device_name.is_empty()
                        || properties
                            .local_name
                            .as_deref()
                            .map(|n| n.contains(&self.config.device_name))
                            .unwrap_or(false);
                    if service_match && name_match {
                        matched = Some(peripheral);
                        break;
                    }
                }
                if let Some(peripheral) = matched {
                    break peripheral;
                }
            }
            if Instant::now() >= deadline {
                let _ = adapter.stop_scan().await;
                return Err(StreamError::Transport(format!(
                    "no peripheral advertising {} found within {} ms",
                    self.config.service_uuid, self.config.scan_timeout_ms
                )));
            }
            sleep(SCAN_POLL).await;
        };
        let _ = adapter.stop_scan().await;
        Ok(found)
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

#[async_trait]
impl Driver for BleDriver {
    async fn open(&mut self, events: EventSender) -> Result<(), StreamError> {
        if self.state.get() == DriverState::Open {
            return Ok(());
        }
        if !self.configuration_ok() {
            return Err(StreamError::Config("ble service/characteristic not configured".into()));
        }
        self.state.transition(DriverState::Opening, &events).await;

        let result = self.open_inner(&events).await;
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
        self.write_tx = None;
        if let Some(peripheral) = self.peripheral.take() {
            let _ = peripheral.disconnect().await;
        }
        self.state.set(DriverState::Closed);
        tlog!("[ble] Disconnected");
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<usize, StreamError> {
        match &self.write_tx {
            Some(tx) => {
                tx.send(bytes.to_vec())
                    .map_err(|_| StreamError::Transport("ble writer stopped".into()))?;
                Ok(bytes.len())
            }
            None => Err(StreamError::Transport("ble device has no write characteristic".into())),
        }
    }

    fn is_writable(&self) -> bool {
        self.write_tx.is_some() && self.state.get() == DriverState::Open
    }

    fn configuration_ok(&self) -> bool {
        !self.config.service_uuid.is_nil() && !self.config.notify_characteristic.is_nil()
    }

    fn state(&self) -> DriverState {
        self.state.get()
    }

    fn kind(&self) -> &'static str {
        "ble"
    }
}

impl BleDriver {
    async fn open_inner(&mut self, events: &EventSender) -> Result<(), StreamError> {
        let manager = Manager::new()
            .await
            .map_err(|e| StreamError::Transport(format!("ble manager: {}", e)))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| StreamError::Transport(format!("ble adapters: {}", e)))?
            .into_iter()
            .next()
            .ok_or_else(|| StreamError::Transport("no bluetooth adapter found".into()))?;

        let peripheral = self.discover_peripheral(&adapter).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| StreamError::Transport(format!("ble connect: {}", e)))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| StreamError::Transport(format!("ble discover services: {}", e)))?;

        let notify_char = find_characteristic(&peripheral, self.config.notify_characteristic)
            .ok_or_else(|| {
                StreamError::Config(format!(
                    "notify characteristic {} not found",
                    self.config.notify_characteristic
                ))
            })?;
        if !notify_char.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE) {
            return Err(StreamError::Config(format!(
                "characteristic {} does not support notifications",
                notify_char.uuid
            )));
        }
        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| StreamError::Transport(format!("ble subscribe: {}", e)))?;

        tlog!("[ble] Subscribed to {}", notify_char.uuid);

        // Notification pump
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| StreamError::Transport(format!("ble notifications: {}", e)))?;
        let notify_uuid = self.config.notify_characteristic;
        let events_clone = events.clone();
        let state = self.state.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == notify_uuid {
                    let _ = events_clone.send(DriverEvent::Data(notification.value)).await;
                }
            }
            state.transition(DriverState::Failing, &events_clone).await;
            let _ = events_clone
                .send(DriverEvent::Error("ble notification stream ended".into()))
                .await;
        }));

        // Writer task, when the device exposes a writable characteristic.
        if let Some(write_uuid) = self.config.write_characteristic {
            let write_char = find_characteristic(&peripheral, write_uuid).ok_or_else(|| {
                StreamError::Config(format!("write characteristic {} not found", write_uuid))
            })?;
            let write_type = if write_char.properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
            {
                WriteType::WithoutResponse
            } else {
                WriteType::WithResponse
            };
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            let writer_peripheral = peripheral.clone();
            self.tasks.push(tokio::spawn(async move {
                while let Some(bytes) = rx.recv().await {
                    if let Err(e) = writer_peripheral.write(&write_char, &bytes, write_type).await {
                        tlog!("[ble] Write failed: {}", e);
                    }
                }
            }));
            self.write_tx = Some(tx);
        }

        self.peripheral = Some(peripheral);
        Ok(())
    }
}

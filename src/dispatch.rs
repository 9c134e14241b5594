// src/dispatch.rs
//
// Fan-out stage: routes built frames to the visualization aggregator, CSV
// writer, and plugin broadcaster, and raw bytes to the console sink. All
// delivery happens on the ingest thread; sinks that can stall own their own
// workers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::builder::BuildResult;
use crate::csv_writer::CsvSink;
use crate::plugins::PluginServer;
use crate::project::{DatasetValue, TelemetryFrame};

/// Default visualization flush period (~20 Hz).
pub const DEFAULT_COALESCE_PERIOD: Duration = Duration::from_millis(50);

// ============================================================================
// Visualization Aggregator
// ============================================================================

/// Events delivered to the visualization collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum VizEvent {
    /// The skeleton changed shape; per-dataset series must be rebuilt.
    StructuralChange(TelemetryFrame),
    /// Coalesced latest values, keyed by dataset index. Intermediate values
    /// between two flushes are dropped (last write wins).
    Update(Vec<(u32, DatasetValue)>),
}

/// Coalesces per-dataset updates behind a fixed flush period so rendering
/// never sees more than ~1/period updates per second.
struct VizAggregator {
    tx: Sender<VizEvent>,
    period: Duration,
    pending: BTreeMap<u32, DatasetValue>,
    /// None until the first flush, which therefore happens immediately.
    last_flush: Option<Instant>,
}

impl VizAggregator {
    fn new(tx: Sender<VizEvent>, period: Duration) -> Self {
        Self {
            tx,
            period,
            pending: BTreeMap::new(),
            last_flush: None,
        }
    }

    fn push(&mut self, result: &BuildResult) {
        if result.structural_change {
            self.pending.clear();
            let _ = self.tx.send(VizEvent::StructuralChange(result.frame.clone()));
        }
        for dataset in result.frame.datasets() {
            self.pending.insert(dataset.index, dataset.value.clone());
        }
        let due = self.last_flush.map_or(true, |t| t.elapsed() >= self.period);
        if due {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let updates: Vec<(u32, DatasetValue)> = std::mem::take(&mut self.pending).into_iter().collect();
        let _ = self.tx.send(VizEvent::Update(updates));
        self.last_flush = Some(Instant::now());
    }
}

// ============================================================================
// Console Sink
// ============================================================================

/// How pre-framing bytes are rendered in the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleFormat {
    /// Space-separated uppercase hex pairs.
    Hex,
    /// Lossy UTF-8 text.
    Text(LineEnding),
}

/// Line-ending treatment for text consoles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineEnding {
    /// Pass data through untouched.
    Keep,
    /// Normalize CRLF and lone CR to LF.
    Normalize,
    /// Remove CR and LF entirely.
    Strip,
}

fn format_console(bytes: &[u8], format: ConsoleFormat) -> String {
    match format {
        ConsoleFormat::Hex => hex::encode_upper(bytes)
            .as_bytes()
            .chunks(2)
            .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(" "),
        ConsoleFormat::Text(ending) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            match ending {
                LineEnding::Keep => text,
                LineEnding::Normalize => text.replace("\r\n", "\n").replace('\r', "\n"),
                LineEnding::Strip => text.replace(['\r', '\n'], ""),
            }
        }
    }
}

// ============================================================================
// Dispatch Hub
// ============================================================================

/// Receiver ends handed to the presentation layer.
#[derive(Debug)]
pub struct DispatchReceivers {
    pub viz: Receiver<VizEvent>,
    pub console: Receiver<String>,
}

/// Hub configuration.
pub struct DispatchConfig {
    pub coalesce_period: Duration,
    pub console_format: ConsoleFormat,
    /// CSV output directory; `None` disables the CSV sink.
    pub csv_dir: Option<std::path::PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            coalesce_period: DEFAULT_COALESCE_PERIOD,
            console_format: ConsoleFormat::Text(LineEnding::Keep),
            csv_dir: None,
        }
    }
}

/// Routes each built frame to every sink, and raw bytes to the console.
/// While paused, nothing is delivered anywhere.
pub struct DispatchHub {
    paused: Arc<AtomicBool>,
    viz: VizAggregator,
    console_tx: Sender<String>,
    console_format: ConsoleFormat,
    csv: Option<CsvSink>,
    plugins: Option<PluginServer>,
}

impl DispatchHub {
    pub fn new(config: DispatchConfig, paused: Arc<AtomicBool>) -> (Self, DispatchReceivers) {
        let (viz_tx, viz_rx) = unbounded();
        let (console_tx, console_rx) = unbounded();
        let csv = config.csv_dir.map(CsvSink::spawn);
        let hub = Self {
            paused,
            viz: VizAggregator::new(viz_tx, config.coalesce_period),
            console_tx,
            console_format: config.console_format,
            csv,
            plugins: None,
        };
        (
            hub,
            DispatchReceivers {
                viz: viz_rx,
                console: console_rx,
            },
        )
    }

    /// Attach a running plugin broadcaster.
    pub fn set_plugin_server(&mut self, server: PluginServer) {
        self.plugins = Some(server);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Deliver one built frame to every frame sink, in ingest order.
    pub fn dispatch(&mut self, result: &BuildResult) {
        if self.is_paused() {
            return;
        }
        self.viz.push(result);
        if let Some(csv) = &self.csv {
            csv.enqueue(&result.frame);
        }
        if let Some(plugins) = &self.plugins {
            plugins.broadcast(&result.frame);
        }
    }

    /// Forward pre-framing bytes to the console sink.
    pub fn forward_raw(&self, bytes: &[u8]) {
        self.raw_forwarder().forward(bytes);
    }

    /// Detached console forwarder for the acquisition side, so raw bytes can
    /// be mirrored without touching the hub's frame path.
    pub fn raw_forwarder(&self) -> RawForwarder {
        RawForwarder {
            tx: self.console_tx.clone(),
            format: self.console_format,
            paused: self.paused.clone(),
        }
    }

    /// Push out any coalesced values still pending.
    pub fn flush(&mut self) {
        self.viz.flush();
    }

    /// Shut down owned sinks (CSV worker joins; plugin tasks abort).
    pub fn close(mut self) {
        self.viz.flush();
        if let Some(csv) = self.csv.take() {
            csv.close();
        }
        if let Some(plugins) = self.plugins.take() {
            plugins.close();
        }
    }
}

/// Cloneable console forwarder honouring the pause gate.
#[derive(Clone)]
pub struct RawForwarder {
    tx: Sender<String>,
    format: ConsoleFormat,
    paused: Arc<AtomicBool>,
}

impl RawForwarder {
    pub fn forward(&self, bytes: &[u8]) {
        if self.paused.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.tx.send(format_console(bytes, self.format));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(values: &[f64], structural_change: bool) -> BuildResult {
        let mut frame = TelemetryFrame::quick_plot(values.len());
        for (dataset, value) in frame.datasets_mut().zip(values.iter()) {
            dataset.value = DatasetValue::Number(*value);
        }
        BuildResult {
            frame,
            structural_change,
            parse_failures: 0,
        }
    }

    fn hub_with_period(period: Duration) -> (DispatchHub, DispatchReceivers, Arc<AtomicBool>) {
        let paused = Arc::new(AtomicBool::new(false));
        let (hub, receivers) = DispatchHub::new(
            DispatchConfig {
                coalesce_period: period,
                ..DispatchConfig::default()
            },
            paused.clone(),
        );
        (hub, receivers, paused)
    }

    #[test]
    fn structural_change_precedes_update() {
        let (mut hub, receivers, _) = hub_with_period(Duration::ZERO);
        hub.dispatch(&built(&[1.0, 2.0], true));

        match receivers.viz.try_recv().unwrap() {
            VizEvent::StructuralChange(frame) => assert_eq!(frame.dataset_count(), 2),
            other => panic!("expected structural change, got {:?}", other),
        }
        match receivers.viz.try_recv().unwrap() {
            VizEvent::Update(values) => {
                assert_eq!(values.len(), 2);
                assert_eq!(values[0], (1, DatasetValue::Number(1.0)));
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn coalescing_is_last_write_wins() {
        // A long period means only the explicit flush emits, carrying the
        // latest value per dataset.
        let (mut hub, receivers, _) = hub_with_period(Duration::from_secs(3600));
        hub.dispatch(&built(&[1.0], true));
        // StructuralChange and the initial flush pass through; drain both.
        assert!(matches!(
            receivers.viz.try_recv().unwrap(),
            VizEvent::StructuralChange(_)
        ));
        assert!(matches!(receivers.viz.try_recv().unwrap(), VizEvent::Update(_)));

        hub.dispatch(&built(&[2.0], false));
        hub.dispatch(&built(&[3.0], false));
        assert!(receivers.viz.try_recv().is_err());

        hub.flush();
        match receivers.viz.try_recv().unwrap() {
            VizEvent::Update(values) => assert_eq!(values, vec![(1, DatasetValue::Number(3.0))]),
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn pause_gates_every_sink() {
        let (mut hub, receivers, paused) = hub_with_period(Duration::ZERO);
        paused.store(true, Ordering::Relaxed);

        hub.dispatch(&built(&[1.0], true));
        hub.forward_raw(b"raw");
        assert!(receivers.viz.try_recv().is_err());
        assert!(receivers.console.try_recv().is_err());

        paused.store(false, Ordering::Relaxed);
        hub.dispatch(&built(&[2.0], true));
        assert!(receivers.viz.try_recv().is_ok());
    }

    #[test]
    fn console_formats_bytes() {
        assert_eq!(format_console(&[0xDE, 0xAD, 0x0A], ConsoleFormat::Hex), "DE AD 0A");
        assert_eq!(
            format_console(b"a\r\nb\rc", ConsoleFormat::Text(LineEnding::Normalize)),
            "a\nb\nc"
        );
        assert_eq!(
            format_console(b"a\r\nb", ConsoleFormat::Text(LineEnding::Strip)),
            "ab"
        );
        assert_eq!(
            format_console(b"a\r\nb", ConsoleFormat::Text(LineEnding::Keep)),
            "a\r\nb"
        );
    }
}

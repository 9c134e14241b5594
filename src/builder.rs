// src/builder.rs
//
// Turns validated raw frames into telemetry frames according to the
// operating mode. Runs on the ingest thread; failures here drop the
// offending frame and nothing else.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::project::{PayloadEncoding, ProjectDescriptor, TelemetryFrame};
use crate::script::DecoderHost;

// ============================================================================
// Types
// ============================================================================

/// How raw frames become telemetry frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Values are mapped onto a user-declared project layout.
    ProjectFile,
    /// Comma-separated values with an auto-generated layout.
    #[default]
    QuickPlot,
    /// The device sends the full frame structure as JSON.
    DeviceSendsJson,
}

/// A successfully built frame, plus whether the skeleton changed shape.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildResult {
    pub frame: TelemetryFrame,
    /// Consumers must rebuild their per-dataset state before applying the
    /// frame when this is set.
    pub structural_change: bool,
    /// Numeric channels whose string failed to parse (previous value kept).
    pub parse_failures: u32,
}

// ============================================================================
// Frame Builder
// ============================================================================

enum ModeState {
    Project {
        skeleton: TelemetryFrame,
        encoding: PayloadEncoding,
        decoder: Option<DecoderHost>,
        first_frame: bool,
    },
    QuickPlot {
        skeleton: Option<TelemetryFrame>,
    },
    DeviceJson {
        skeleton: Option<TelemetryFrame>,
    },
}

/// Passive transformer from raw frame bytes to telemetry frames.
pub struct FrameBuilder {
    state: ModeState,
}

impl FrameBuilder {
    /// Project-file mode. Takes an immutable snapshot of the declared layout
    /// and compiles the decoder script; both happen once, at connect.
    pub fn for_project(descriptor: &ProjectDescriptor) -> Result<Self, StreamError> {
        descriptor.validate()?;
        let decoder = match &descriptor.decoder {
            Some(source) => Some(DecoderHost::compile(&source.source)?),
            None => None,
        };
        Ok(Self {
            state: ModeState::Project {
                skeleton: descriptor.skeleton(),
                encoding: descriptor.payload_encoding,
                decoder,
                first_frame: true,
            },
        })
    }

    /// Quick-plot mode: comma-separated values, auto-generated series.
    pub fn quick_plot() -> Self {
        Self {
            state: ModeState::QuickPlot { skeleton: None },
        }
    }

    /// Device-sends-JSON mode: the frame itself carries the layout.
    pub fn device_sends_json() -> Self {
        Self {
            state: ModeState::DeviceJson { skeleton: None },
        }
    }

    pub fn mode(&self) -> OperatingMode {
        match self.state {
            ModeState::Project { .. } => OperatingMode::ProjectFile,
            ModeState::QuickPlot { .. } => OperatingMode::QuickPlot,
            ModeState::DeviceJson { .. } => OperatingMode::DeviceSendsJson,
        }
    }

    /// Build one telemetry frame. `Err(Decode)` drops this frame only.
    pub fn build(&mut self, raw: &[u8]) -> Result<BuildResult, StreamError> {
        match &mut self.state {
            ModeState::Project {
                skeleton,
                encoding,
                decoder,
                first_frame,
            } => {
                let payload = decode_payload(raw, *encoding)?;
                let channels = match decoder {
                    Some(host) => host.parse(&payload)?,
                    // decoder: null in the descriptor selects the built-in
                    // default decoder, a plain comma split (the stock parse
                    // function upstream tools ship does exactly this).
                    None => split_csv(&payload),
                };
                if channels.len() != skeleton.dataset_count() {
                    return Err(StreamError::Decode(format!(
                        "channel count mismatch: script produced {}, project declares {}",
                        channels.len(),
                        skeleton.dataset_count()
                    )));
                }

                let mut parse_failures = 0;
                for dataset in skeleton.datasets_mut() {
                    let value = &channels[(dataset.index - 1) as usize];
                    if !dataset.assign(value) {
                        parse_failures += 1;
                    }
                }
                let structural_change = std::mem::take(first_frame);
                Ok(BuildResult {
                    frame: skeleton.clone(),
                    structural_change,
                    parse_failures,
                })
            }

            ModeState::QuickPlot { skeleton } => {
                let text = String::from_utf8_lossy(raw);
                let columns = split_csv(text.trim());
                if columns.is_empty() {
                    return Err(StreamError::Decode("quick-plot frame has no columns".into()));
                }

                let rebuild = skeleton
                    .as_ref()
                    .map(|s| s.dataset_count() != columns.len())
                    .unwrap_or(true);
                if rebuild {
                    *skeleton = None;
                }
                let frame =
                    skeleton.get_or_insert_with(|| TelemetryFrame::quick_plot(columns.len()));

                let mut parse_failures = 0;
                for (dataset, value) in frame.datasets_mut().zip(columns.iter()) {
                    if !dataset.assign(value) {
                        parse_failures += 1;
                    }
                }
                Ok(BuildResult {
                    frame: frame.clone(),
                    structural_change: rebuild,
                    parse_failures,
                })
            }

            ModeState::DeviceJson { skeleton } => {
                let frame: TelemetryFrame = serde_json::from_slice(raw)
                    .map_err(|e| StreamError::Decode(format!("frame is not valid JSON: {}", e)))?;
                if frame.dataset_count() == 0 {
                    return Err(StreamError::Decode(
                        "JSON frame declares no datasets".into(),
                    ));
                }

                let structural_change = skeleton
                    .as_ref()
                    .map(|s| !same_shape(s, &frame))
                    .unwrap_or(true);
                *skeleton = Some(frame.clone());
                Ok(BuildResult {
                    frame,
                    structural_change,
                    parse_failures: 0,
                })
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Convert raw frame bytes into the text the decoder script consumes.
fn decode_payload(raw: &[u8], encoding: PayloadEncoding) -> Result<String, StreamError> {
    match encoding {
        PayloadEncoding::PlainText => Ok(String::from_utf8_lossy(raw).into_owned()),
        PayloadEncoding::Hexadecimal => {
            // Tolerate whitespace and separators between hex digits.
            let digits: String = String::from_utf8_lossy(raw)
                .chars()
                .filter(|c| c.is_ascii_hexdigit())
                .collect();
            let bytes = hex::decode(&digits)
                .map_err(|e| StreamError::Decode(format!("invalid hex payload: {}", e)))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        PayloadEncoding::Base64 => {
            let text: String = String::from_utf8_lossy(raw)
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text.as_bytes())
                .map_err(|e| StreamError::Decode(format!("invalid base64 payload: {}", e)))?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        // One char per byte so scripts can index arbitrary binary payloads.
        PayloadEncoding::Binary => Ok(raw.iter().map(|&b| b as char).collect()),
    }
}

fn split_csv(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split(',').map(|s| s.trim().to_string()).collect()
}

/// Shape equality: same groups, dataset counts, and titles; values ignored.
fn same_shape(a: &TelemetryFrame, b: &TelemetryFrame) -> bool {
    a.groups.len() == b.groups.len()
        && a.groups.iter().zip(b.groups.iter()).all(|(ga, gb)| {
            ga.title == gb.title
                && ga.datasets.len() == gb.datasets.len()
                && ga
                    .datasets
                    .iter()
                    .zip(gb.datasets.iter())
                    .all(|(da, db)| da.title == db.title && da.widget == db.widget)
        })
}

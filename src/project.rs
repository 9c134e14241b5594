// src/project.rs
//
// Project descriptor (the user-declared telemetry layout) and the runtime
// telemetry frame model built from it.

use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::framing::{FrameDetection, FramingConfig};

// ============================================================================
// Project Descriptor
// ============================================================================

/// How raw frame bytes are converted before the decoder script sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PayloadEncoding {
    #[default]
    PlainText,
    Hexadecimal,
    Base64,
    Binary,
}

/// Decoder script declared by the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderSource {
    /// Script language tag (informational; the host runs one engine).
    pub language: String,
    pub source: String,
}

/// One scalar channel as declared in the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetDescriptor {
    pub title: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub widget: String,
    /// 1-based channel position; the dataset value is filled from
    /// `channels[index - 1]`.
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_high: Option<f64>,
    #[serde(default)]
    pub fft: bool,
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub graph: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// An ordered collection of datasets sharing a widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDescriptor {
    pub title: String,
    #[serde(default)]
    pub widget: String,
    pub datasets: Vec<DatasetDescriptor>,
}

/// The project descriptor: framing, decoding, and telemetry layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDescriptor {
    pub title: String,
    #[serde(default)]
    pub decoder: Option<DecoderSource>,
    #[serde(default)]
    pub frame_start: String,
    #[serde(default)]
    pub frame_end: String,
    pub frame_detection: FrameDetection,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
    pub groups: Vec<GroupDescriptor>,
}

impl ProjectDescriptor {
    /// Parse a descriptor from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, StreamError> {
        let descriptor: ProjectDescriptor = serde_json::from_str(json)
            .map_err(|e| StreamError::Config(format!("malformed project descriptor: {}", e)))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Structural validation: non-empty layout, sane channel indices.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.groups.iter().all(|g| g.datasets.is_empty()) {
            return Err(StreamError::Config(
                "project declares no datasets".into(),
            ));
        }
        let count = self.dataset_count() as u32;
        let mut seen = vec![false; count as usize];
        for group in &self.groups {
            for dataset in &group.datasets {
                if dataset.index == 0 || dataset.index > count {
                    return Err(StreamError::Config(format!(
                        "dataset '{}' has channel index {} outside 1..={}",
                        dataset.title, dataset.index, count
                    )));
                }
                let slot = (dataset.index - 1) as usize;
                if seen[slot] {
                    return Err(StreamError::Config(format!(
                        "channel index {} is declared twice",
                        dataset.index
                    )));
                }
                seen[slot] = true;
            }
        }
        Ok(())
    }

    /// The framing parameters this project declares.
    pub fn framing_config(&self) -> Result<FramingConfig, StreamError> {
        FramingConfig::from_parts(
            self.frame_detection,
            self.frame_start.as_bytes().to_vec(),
            self.frame_end.as_bytes().to_vec(),
            if self.checksum.is_empty() { "none" } else { &self.checksum },
        )
    }

    /// Total declared datasets across all groups.
    pub fn dataset_count(&self) -> usize {
        self.groups.iter().map(|g| g.datasets.len()).sum()
    }

    /// Build the value-less runtime skeleton for this project.
    pub fn skeleton(&self) -> TelemetryFrame {
        TelemetryFrame {
            title: self.title.clone(),
            groups: self
                .groups
                .iter()
                .map(|g| Group {
                    title: g.title.clone(),
                    widget: g.widget.clone(),
                    datasets: g.datasets.iter().map(Dataset::from_descriptor).collect(),
                })
                .collect(),
        }
    }
}

// ============================================================================
// Runtime Telemetry Model
// ============================================================================

/// A dataset value: textual channels stay strings, numeric channels parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatasetValue {
    Number(f64),
    Text(String),
}

impl Default for DatasetValue {
    fn default() -> Self {
        DatasetValue::Text(String::new())
    }
}

impl DatasetValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DatasetValue::Number(n) => Some(*n),
            DatasetValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Dataset widget kinds that render a numeric scalar. Anything not listed
/// (LED, terminal, plain datagrid cells, ...) displays text as-is.
const NUMERIC_WIDGETS: [&str; 7] = [
    "plot",
    "gauge",
    "bar",
    "compass",
    "accelerometer",
    "gyroscope",
    "fft",
];

/// One scalar channel with its current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub title: String,
    #[serde(default)]
    pub units: String,
    #[serde(default)]
    pub widget: String,
    #[serde(default)]
    pub value: DatasetValue,
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_high: Option<f64>,
    #[serde(default)]
    pub fft: bool,
    #[serde(default)]
    pub log: bool,
    #[serde(default)]
    pub graph: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_depth: Option<u32>,
}

impl Dataset {
    fn from_descriptor(d: &DatasetDescriptor) -> Self {
        Self {
            title: d.title.clone(),
            units: d.units.clone(),
            widget: d.widget.clone(),
            value: DatasetValue::default(),
            index: d.index,
            alarm_low: d.alarm_low,
            alarm_high: d.alarm_high,
            fft: d.fft,
            log: d.log,
            graph: d.graph,
            history_depth: d.history_depth,
        }
    }

    /// Whether this channel carries numbers.
    ///
    /// The descriptor has no explicit type field, so the type is derived from
    /// what consumes the value: a scalar widget kind, plotting, FFT, or alarm
    /// thresholds all need a number. Everything else keeps the decoded string
    /// verbatim.
    pub fn is_numeric(&self) -> bool {
        NUMERIC_WIDGETS
            .iter()
            .any(|w| self.widget.eq_ignore_ascii_case(w))
            || self.graph
            || self.fft
            || self.alarm_low.is_some()
            || self.alarm_high.is_some()
    }

    /// Assign a decoded channel string, respecting numeric typing. A numeric
    /// channel keeps its previous value when the string does not parse;
    /// returns false in that case.
    pub fn assign(&mut self, raw: &str) -> bool {
        if self.is_numeric() {
            match raw.trim().parse::<f64>() {
                Ok(n) => {
                    self.value = DatasetValue::Number(n);
                    true
                }
                Err(_) => false,
            }
        } else {
            self.value = DatasetValue::Text(raw.to_string());
            true
        }
    }
}

/// An ordered collection of datasets rendered together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub title: String,
    #[serde(default)]
    pub widget: String,
    pub datasets: Vec<Dataset>,
}

/// One decoded telemetry sample: the structural skeleton plus current values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    pub title: String,
    pub groups: Vec<Group>,
}

impl TelemetryFrame {
    /// Auto-generated single-group skeleton for quick-plot mode.
    pub fn quick_plot(columns: usize) -> Self {
        TelemetryFrame {
            title: "Quick Plot".to_string(),
            groups: vec![Group {
                title: "Quick Plot".to_string(),
                widget: "multiplot".to_string(),
                datasets: (0..columns)
                    .map(|i| Dataset {
                        title: format!("Series {}", i + 1),
                        units: String::new(),
                        widget: "plot".to_string(),
                        value: DatasetValue::default(),
                        index: (i + 1) as u32,
                        alarm_low: None,
                        alarm_high: None,
                        fft: false,
                        log: false,
                        graph: true,
                        history_depth: None,
                    })
                    .collect(),
            }],
        }
    }

    pub fn dataset_count(&self) -> usize {
        self.groups.iter().map(|g| g.datasets.len()).sum()
    }

    /// Datasets in declaration order.
    pub fn datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.groups.iter().flat_map(|g| g.datasets.iter())
    }

    /// Mutable datasets in declaration order.
    pub fn datasets_mut(&mut self) -> impl Iterator<Item = &mut Dataset> {
        self.groups.iter_mut().flat_map(|g| g.datasets.iter_mut())
    }
}

/// Small two-channel project used across the crate's tests.
#[cfg(test)]
pub(crate) const SAMPLE_PROJECT: &str = r#"{
        "title": "Weather Station",
        "decoder": { "language": "js", "source": "fn parse(s) { s.split(\";\") }" },
        "frameStart": "$",
        "frameEnd": "\n",
        "frameDetection": "end_delimiter",
        "checksum": "none",
        "payloadEncoding": "PlainText",
        "groups": [
            { "title": "Ambient", "widget": "datagrid", "datasets": [
                { "title": "Temp", "units": "C", "widget": "gauge", "index": 1, "graph": true },
                { "title": "Hum", "units": "%", "widget": "bar", "index": 2, "graph": true }
            ] }
        ]
    }"#;

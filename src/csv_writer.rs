// src/csv_writer.rs
//
// CSV persistence sink. A background worker drains a row queue and writes
// one file per connection session; the ingest thread only pays for an
// enqueue.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use chrono::{DateTime, Local};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::project::{DatasetValue, TelemetryFrame};
use crate::tlog;

/// Handle to the CSV worker thread. Dropping it (or calling `close`) drains
/// the queue, flushes, and joins the worker.
pub struct CsvSink {
    tx: Option<Sender<CsvJob>>,
    handle: Option<JoinHandle<()>>,
}

struct CsvJob {
    received_at: DateTime<Local>,
    frame: TelemetryFrame,
}

impl CsvSink {
    /// Spawn the worker. Files are created lazily inside `output_dir` once the
    /// first frame arrives.
    pub fn spawn(output_dir: PathBuf) -> Self {
        let (tx, rx) = unbounded::<CsvJob>();
        let handle = std::thread::Builder::new()
            .name("csv-writer".into())
            .spawn(move || run_writer(output_dir, rx))
            .expect("failed to spawn csv writer thread");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Queue one frame for persistence, stamped with the current time.
    pub fn enqueue(&self, frame: &TelemetryFrame) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(CsvJob {
                received_at: Local::now(),
                frame: frame.clone(),
            });
        }
    }

    /// Drain, flush, and join the worker.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Worker
// ============================================================================

struct OpenFile {
    writer: csv::Writer<File>,
    /// Column identity of the file: one `<group>/<dataset> (<units>)` label
    /// per dataset, used to detect structural changes.
    columns: Vec<String>,
}

fn run_writer(output_dir: PathBuf, rx: Receiver<CsvJob>) {
    let mut current: Option<OpenFile> = None;

    // The channel closing is the shutdown signal; everything queued before
    // that still gets written.
    while let Ok(job) = rx.recv() {
        let columns = column_labels(&job.frame);

        let rotate = match &current {
            Some(open) => open.columns != columns,
            None => true,
        };
        if rotate {
            if let Some(mut open) = current.take() {
                let _ = open.writer.flush();
            }
            match open_session_file(&output_dir, &job.frame.title, &columns) {
                Ok(open) => current = Some(open),
                Err(e) => {
                    tlog!("[csv] Failed to open output file: {}", e);
                    continue;
                }
            }
        }

        if let Some(open) = &mut current {
            let mut record = Vec::with_capacity(columns.len() + 1);
            record.push(job.received_at.format("%Y-%m-%dT%H:%M:%S%.3f").to_string());
            for dataset in job.frame.datasets() {
                record.push(match &dataset.value {
                    DatasetValue::Number(n) => format!("{}", n),
                    DatasetValue::Text(s) => s.clone(),
                });
            }
            if let Err(e) = open.writer.write_record(&record) {
                tlog!("[csv] Write error: {}", e);
                continue;
            }
            let _ = open.writer.flush();
        }
    }

    if let Some(mut open) = current.take() {
        let _ = open.writer.flush();
    }
}

fn column_labels(frame: &TelemetryFrame) -> Vec<String> {
    frame
        .groups
        .iter()
        .flat_map(|g| {
            g.datasets.iter().map(move |d| {
                if d.units.is_empty() {
                    format!("{}/{}", g.title, d.title)
                } else {
                    format!("{}/{} ({})", g.title, d.title, d.units)
                }
            })
        })
        .collect()
}

fn open_session_file(
    output_dir: &Path,
    title: &str,
    columns: &[String],
) -> Result<OpenFile, String> {
    std::fs::create_dir_all(output_dir)
        .map_err(|e| format!("cannot create {}: {}", output_dir.display(), e))?;

    // Colons are invalid in Windows file names, so the stamp uses dashes.
    let stamp = Local::now().format("%Y-%m-%dT%H-%M-%S%.3f");
    let safe_title: String = title
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let mut path = output_dir.join(format!("{}_{}.csv", safe_title, stamp));
    // Same-millisecond rotation (structural change) must not clobber the
    // previous session file.
    let mut suffix = 1;
    while path.exists() {
        path = output_dir.join(format!("{}_{}-{}.csv", safe_title, stamp, suffix));
        suffix += 1;
    }

    let file = File::create(&path).map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    let mut writer = csv::Writer::from_writer(file);

    let mut header = Vec::with_capacity(columns.len() + 1);
    header.push("Timestamp".to_string());
    header.extend_from_slice(columns);
    writer
        .write_record(&header)
        .map_err(|e| format!("cannot write header: {}", e))?;
    writer.flush().map_err(|e| format!("cannot flush header: {}", e))?;

    tlog!("[csv] Logging to {}", path.display());
    Ok(OpenFile {
        writer,
        columns: columns.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::TelemetryFrame;

    fn sample_frame(values: &[f64]) -> TelemetryFrame {
        let mut frame = TelemetryFrame::quick_plot(values.len());
        for (dataset, value) in frame.datasets_mut().zip(values.iter()) {
            dataset.value = DatasetValue::Number(*value);
        }
        frame
    }

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::spawn(dir.path().to_path_buf());
        sink.enqueue(&sample_frame(&[1.0, 2.0, 3.0]));
        sink.enqueue(&sample_frame(&[4.0, 5.0, 6.0]));
        sink.close();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("Quick_Plot_"), "{}", name);
        assert!(name.ends_with(".csv"));

        let mut reader = csv::Reader::from_path(&entries[0]).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(
            headers.iter().collect::<Vec<_>>(),
            vec![
                "Timestamp",
                "Quick Plot/Series 1",
                "Quick Plot/Series 2",
                "Quick Plot/Series 3"
            ]
        );

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        // Numeric round-trip to representable precision.
        assert_eq!(rows[0].get(1).unwrap().parse::<f64>().unwrap(), 1.0);
        assert_eq!(rows[1].get(3).unwrap().parse::<f64>().unwrap(), 6.0);
    }

    #[test]
    fn structural_change_rotates_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::spawn(dir.path().to_path_buf());
        sink.enqueue(&sample_frame(&[1.0, 2.0]));
        sink.enqueue(&sample_frame(&[1.0, 2.0, 3.0]));
        sink.close();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 2);
    }
}

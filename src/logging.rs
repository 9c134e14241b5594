// src/logging.rs
//
// Crate-wide logging: timestamped lines on stderr, optionally mirrored to a
// per-session log file.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Mirror target for log lines. Behind a mutex because every thread logs.
#[doc(hidden)]
pub static MIRROR: Mutex<Option<BufWriter<File>>> = Mutex::new(None);

/// Stamp one formatted message and write it to stderr and, when a mirror is
/// active, to the session log file. Called by `tlog!`; not meant for direct
/// use.
#[doc(hidden)]
pub fn emit(args: std::fmt::Arguments<'_>) {
    let line = format!("{} {}", chrono::Local::now().format("%H:%M:%S%.3f"), args);
    eprintln!("{}", line);

    if let Ok(mut mirror) = MIRROR.lock() {
        if let Some(file) = mirror.as_mut() {
            // A dead file target must not take logging down with it.
            if writeln!(file, "{}", line).and_then(|_| file.flush()).is_err() {
                *mirror = None;
                eprintln!("[logging] Session log write failed, mirror disabled");
            }
        }
    }
}

/// Start mirroring log output to a fresh timestamped file under `dir`.
/// Replaces (and flushes) any previous mirror. Returns the log file path.
pub fn mirror_to_file(dir: &Path) -> std::io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("streamlab-{}.log", stamp));
    let file = File::options().create(true).append(true).open(&path)?;

    if let Ok(mut mirror) = MIRROR.lock() {
        if let Some(mut previous) = mirror.replace(BufWriter::new(file)) {
            let _ = previous.flush();
        }
    }
    emit(format_args!("[logging] Session log: {}", path.display()));
    Ok(path)
}

/// Stop mirroring and flush whatever is buffered.
pub fn stop_mirror() {
    if let Ok(mut mirror) = MIRROR.lock() {
        if let Some(mut file) = mirror.take() {
            let _ = file.flush();
        }
    }
}

/// Timestamped logging macro used across the crate.
/// Prepends `HH:MM:SS.mmm` local time and honours the session log mirror.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {
        $crate::logging::emit(format_args!($($arg)*))
    };
}

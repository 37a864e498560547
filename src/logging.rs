use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing_subscriber::fmt::MakeWriter;

/// Console transcripts kept per work directory.
pub const KEEP_TRANSCRIPTS: usize = 10;

// ── DeferredFileWriter ───────────────────────────────────

/// A `MakeWriter` that discards output until `handle.set_file(path)` is
/// called, then appends to that file.
///
/// The subscriber is installed before the recipe (and so the work
/// directory) is known.
#[derive(Clone)]
pub struct DeferredFileWriter {
    inner: Arc<Mutex<Option<File>>>,
}

/// Activation handle for a [`DeferredFileWriter`].
#[derive(Clone)]
pub struct DeferredFileHandle {
    inner: Arc<Mutex<Option<File>>>,
}

impl DeferredFileWriter {
    pub fn new() -> (Self, DeferredFileHandle) {
        let inner = Arc::new(Mutex::new(None));
        (
            Self {
                inner: inner.clone(),
            },
            DeferredFileHandle { inner },
        )
    }
}

impl DeferredFileHandle {
    /// Start appending to `path`, creating parent directories.
    pub fn set_file(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.inner.lock().unwrap() = Some(file);
        Ok(())
    }
}

pub struct DeferredWriter {
    inner: Arc<Mutex<Option<File>>>,
}

impl std::io::Write for DeferredWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.inner.lock().unwrap();
        match guard.as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut guard = self.inner.lock().unwrap();
        match guard.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for DeferredFileWriter {
    type Writer = DeferredWriter;

    fn make_writer(&'a self) -> Self::Writer {
        DeferredWriter {
            inner: self.inner.clone(),
        }
    }
}

// ── ConsoleTranscript ────────────────────────────────────

/// Raw copy of everything the guest printed on its serial console.
///
/// Created as `<timestamp>_console_running.log`; [`finish`](Self::finish)
/// renames it to `_ok.log` or `_failed.log`.
pub struct ConsoleTranscript {
    file: File,
    path: PathBuf,
}

impl ConsoleTranscript {
    pub fn create(logs_dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let path = logs_dir.join(format!("{}_console_running.log", utc_timestamp()));
        let file = File::create(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append console bytes. Transcript errors never fail a provisioning run.
    pub fn record(&mut self, bytes: &[u8]) {
        if let Err(e) = self.file.write_all(bytes) {
            tracing::debug!(error = %e, "console transcript write failed");
        }
    }

    pub fn finish(mut self, success: bool) -> PathBuf {
        let _ = self.file.flush();
        let suffix = if success { "ok" } else { "failed" };
        let renamed = self
            .path
            .file_name()
            .and_then(|f| f.to_str())
            .map(|f| f.replace("_running.log", &format!("_{suffix}.log")));
        match renamed {
            Some(name) => {
                let new_path = self.path.with_file_name(name);
                match fs::rename(&self.path, &new_path) {
                    Ok(()) => new_path,
                    Err(_) => self.path,
                }
            }
            None => self.path,
        }
    }
}

// ── Log rotation ─────────────────────────────────────────

/// Delete the oldest finished transcripts, keeping at most `keep`.
pub fn rotate_transcripts(logs_dir: &Path, keep: usize) {
    let Ok(entries) = fs::read_dir(logs_dir) else {
        return;
    };

    let mut finished: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name().and_then(|f| f.to_str()).is_some_and(|f| {
                f.contains("_console_") && (f.ends_with("_ok.log") || f.ends_with("_failed.log"))
            })
        })
        .collect();

    // Timestamp prefix sorts chronologically.
    finished.sort();

    if finished.len() > keep {
        for old in &finished[..finished.len() - keep] {
            let _ = fs::remove_file(old);
        }
    }
}

// ── Timestamp helper ─────────────────────────────────────

/// Current UTC time as `YYYY-MM-DDTHH-MM-SS`.
pub fn utc_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_timestamp(secs)
}

pub(crate) fn format_timestamp(secs: u64) -> String {
    let days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    // Howard Hinnant's civil_from_days
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}-{minutes:02}-{seconds:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_epoch() {
        assert_eq!(format_timestamp(0), "1970-01-01T00-00-00");
    }

    #[test]
    fn timestamp_leap_day() {
        // 2024-02-29 12:34:56 UTC
        assert_eq!(format_timestamp(1709210096), "2024-02-29T12-34-56");
    }

    #[test]
    fn transcript_finish_renames() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = ConsoleTranscript::create(dir.path()).unwrap();
        t.record(b"login: ");
        let running = t.path().to_path_buf();
        let done = t.finish(false);
        assert!(!running.exists());
        assert!(done.to_str().unwrap().ends_with("_console_failed.log"));
        assert_eq!(fs::read(&done).unwrap(), b"login: ");
    }

    #[test]
    fn rotation_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            let name = format!("2024-01-0{}T00-00-00_console_ok.log", i + 1);
            fs::write(dir.path().join(name), b"").unwrap();
        }
        fs::write(dir.path().join("2024-01-09T00-00-00_console_running.log"), b"").unwrap();
        fs::write(dir.path().join("mkvm.log"), b"").unwrap();

        rotate_transcripts(dir.path(), 2);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "2024-01-04T00-00-00_console_ok.log",
                "2024-01-05T00-00-00_console_ok.log",
                "2024-01-09T00-00-00_console_running.log",
                "mkvm.log",
            ]
        );
    }
}

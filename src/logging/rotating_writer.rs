//! Size-based rotating file writer, used as the `tracing-subscriber` file sink.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

struct Inner {
    path: PathBuf,
    max_bytes: u64,
    max_backups: usize,
    file: File,
    written: u64,
}

impl Inner {
    fn open(path: PathBuf, max_bytes: u64, max_backups: usize) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            max_bytes,
            max_backups,
            file,
            written,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        for idx in (1..self.max_backups).rev() {
            let from = self.backup_path(idx);
            let to = self.backup_path(idx + 1);
            if from.exists() {
                let _ = std::fs::rename(from, to);
            }
        }
        if self.max_backups > 0 {
            let _ = std::fs::rename(&self.path, self.backup_path(1));
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn backup_path(&self, idx: usize) -> PathBuf {
        let mut name = self.path.clone();
        let ext = name
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        name.set_extension(format!("{ext}.{idx}"));
        name
    }
}

impl Write for Inner {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_backups > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// A `Clone`-able, size-rotating file writer usable as a `tracing-subscriber`
/// `MakeWriter`. Rotation keeps `max_backups` numbered copies (`.1` most
/// recent, `.max_backups` oldest), matching the `logging.max_rotated_files`
/// config knob.
#[derive(Clone)]
pub struct RotatingFileWriter {
    inner: Arc<Mutex<Inner>>,
}

impl RotatingFileWriter {
    pub fn new(path: PathBuf, max_bytes: u64, max_backups: usize) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner::open(path, max_bytes, max_backups)?)),
        })
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .expect("rotating log writer mutex poisoned")
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner
            .lock()
            .expect("rotating log writer mutex poisoned")
            .flush()
    }
}

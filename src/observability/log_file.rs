//! Size-capped log file
//!
//! Appends to a single file. When the next write would push it past the cap,
//! the file is moved to `<path>.1` (replacing any older backup) and a fresh
//! one is started. Wrapped in `tracing_appender::non_blocking` by
//! [`init_logging`](super::logging::init_logging).

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Default cap for one log file, in bytes
pub const DEFAULT_MAX_LOG_BYTES: u64 = 1_000_000;

/// Log file writer that rotates once it reaches `max_bytes`
#[derive(Debug)]
pub struct SizeCappedFile {
    path: PathBuf,
    max_bytes: u64,
    file: File,
    written: u64,
}

impl SizeCappedFile {
    /// Open `path` for appending, counting what is already there
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        let written = file.metadata()?.len();

        Ok(Self {
            path,
            max_bytes: max_bytes.max(1),
            file,
            written,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Where the previous file goes on rotation
    pub fn backup_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".1");
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        fs::rename(&self.path, self.backup_path())?;
        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for SizeCappedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A single oversized line still lands in a fresh file
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
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

use crate::error::ResourceLeak;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Transfer event sink. Every hook defaults to doing nothing.
pub trait Logger: Send + Sync {
    fn start_transfer(&self, _dst: &str) {}
    fn chunk_sent(&self, _dst: &str, _sequence: u64, _bytes: u64) {}
    fn transfer_done(&self, _dst: &str, _bytes: u64, _chunks: u64) {}
    fn leak(&self, _leak: &ResourceLeak) {}
    fn error(&self, _context: &str, _path: &str, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

/// Appends one timestamped line per event to a file.
pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn start_transfer(&self, dst: &str) {
        self.line(&format!("START dst={dst}"));
    }
    fn chunk_sent(&self, dst: &str, sequence: u64, bytes: u64) {
        self.line(&format!("CHUNK dst={dst} seq={sequence} bytes={bytes}"));
    }
    fn transfer_done(&self, dst: &str, bytes: u64, chunks: u64) {
        self.line(&format!("DONE dst={dst} bytes={bytes} chunks={chunks}"));
    }
    fn leak(&self, leak: &ResourceLeak) {
        self.line(&format!("LEAK {leak}"));
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("SUMMARY files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}

//! Audit Log File
//!
//! The append-only JSON Lines file holding the challenge header and the
//! tagged entries. Appends are flushed to stable storage before they are
//! reported as done, and a failed append is cut back to the previous
//! length so the file never ends in a partial line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::audit::entry::HeaderLine;
use crate::crypto::Challenge;
use crate::error::SentinelError;

#[derive(Debug, Clone)]
pub struct AuditLogFile {
    log_path: PathBuf,
}

impl AuditLogFile {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Missing or zero-length.
    pub fn is_blank(&self) -> Result<bool, SentinelError> {
        match std::fs::metadata(&self.log_path) {
            Ok(meta) => Ok(meta.len() == 0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Start a new log with its challenge header. Refuses to touch a file
    /// that already has content.
    pub fn create(&self, challenge: &Challenge) -> Result<(), SentinelError> {
        if !self.is_blank()? {
            return Err(SentinelError::AlreadyInitialized);
        }
        if let Some(parent) = self.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", HeaderLine::new(challenge).to_line()?)?;
        file.sync_all()?;

        debug!("Created audit log {:?}", self.log_path);
        Ok(())
    }

    /// Append one line and fsync it.
    pub fn append_line(&self, line: &str) -> Result<(), SentinelError> {
        let mut file = OpenOptions::new().append(true).open(&self.log_path)?;
        let original_len = file.metadata()?.len();

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let written = file.write_all(&buf).and_then(|_| file.sync_data());
        if let Err(e) = written {
            if let Err(trunc) = file.set_len(original_len).and_then(|_| file.sync_data()) {
                error!(
                    "Failed to truncate {:?} back to {} bytes after a failed append: {}",
                    self.log_path, original_len, trunc
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn open_reader(&self) -> Result<BufReader<File>, SentinelError> {
        Ok(BufReader::new(File::open(&self.log_path)?))
    }

    pub fn read_challenge(&self) -> Result<Challenge, SentinelError> {
        let mut first = String::new();
        self.open_reader()?.read_line(&mut first)?;
        if first.trim().is_empty() {
            return Err(SentinelError::MalformedLogLine {
                line: 1,
                reason: "log is empty".to_string(),
            });
        }
        HeaderLine::parse(first.trim_end())
    }

    pub fn first_entry(&self) -> Result<Option<(usize, String)>, SentinelError> {
        for (index, line) in self.open_reader()?.lines().enumerate().skip(1) {
            let line = line?;
            if !line.trim().is_empty() {
                return Ok(Some((index + 1, line)));
            }
        }
        Ok(None)
    }

    /// The last tagged line and its 1-based line number, or `None` when
    /// the log holds only its header.
    pub fn last_entry(&self) -> Result<Option<(usize, String)>, SentinelError> {
        let mut last = None;
        for (index, line) in self.open_reader()?.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            last = Some((index + 1, line));
        }
        Ok(last.filter(|(lineno, _)| *lineno > 1))
    }
}

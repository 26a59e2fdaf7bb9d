//! Per-recipient wrapping of secret shares for out-of-band distribution.

use std::io::Write;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::SentinelError;

pub trait ShareEncryptor {
    /// Produce the text block handed to `recipient` for one share.
    fn encrypt(&self, recipient: &str, share: &str) -> Result<String, SentinelError>;
}

/// Wraps shares with GnuPG public-key encryption.
#[derive(Debug, Clone)]
pub struct GpgShareEncryptor {
    program: String,
}

impl Default for GpgShareEncryptor {
    fn default() -> Self {
        Self {
            program: "gpg2".to_string(),
        }
    }
}

impl GpgShareEncryptor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn describe_recipient(&self, recipient: &str) -> Result<String, SentinelError> {
        let output = Command::new(&self.program)
            .args(["-k", recipient])
            .output()
            .map_err(|e| SentinelError::ShareEncryption(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(SentinelError::ShareEncryption(format!(
                "failed to find pubkey for recipient {:?}: {}",
                recipient,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl ShareEncryptor for GpgShareEncryptor {
    fn encrypt(&self, recipient: &str, share: &str) -> Result<String, SentinelError> {
        let listing = self.describe_recipient(recipient)?;

        debug!("Encrypting share for {}", recipient);
        let mut child = Command::new(&self.program)
            .args(["-e", "-a", "-r", recipient])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SentinelError::ShareEncryption(format!("failed to run {}: {}", self.program, e)))?;

        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| SentinelError::ShareEncryption("stdin unavailable".to_string()))?;
            stdin
                .write_all(format!("{}\n", share).as_bytes())
                .map_err(|e| SentinelError::ShareEncryption(format!("failed to write share: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| SentinelError::ShareEncryption(format!("{} failed: {}", self.program, e)))?;
        if !output.status.success() {
            return Err(SentinelError::ShareEncryption(format!(
                "failed to encrypt for recipient {:?}: {}",
                recipient,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(format!(
            "{}\n{}",
            listing,
            String::from_utf8_lossy(&output.stdout)
        ))
    }
}

//! Hardware challenge-response token
//!
//! The token holds the root secret as its HMAC-SHA1 key and answers a
//! challenge with `HMAC-SHA1(root, challenge)`, which is exactly the first
//! chain secret. The root never leaves the token after programming.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::TokenConfig;
use crate::crypto::chain::{ChainSecret, Challenge, RootSecret};
use crate::error::SentinelError;

#[async_trait]
pub trait ChallengeResponseToken: Send + Sync {
    /// Ask the token for the first chain secret of a log. May block until
    /// a human touches the token.
    async fn respond(&self, challenge: &Challenge) -> Result<ChainSecret, SentinelError>;

    /// Replace the token's HMAC key with `secret`. Destroys any previous
    /// programming of the slot.
    async fn program(&self, secret: &RootSecret) -> Result<(), SentinelError>;
}

/// A YubiKey driven through the `ykchalresp` / `ykpersonalize` tools.
#[derive(Debug, Clone)]
pub struct YubikeyToken {
    slot: u8,
    timeout: Duration,
    chalresp_program: String,
    personalize_program: String,
}

impl YubikeyToken {
    pub fn new(config: &TokenConfig) -> Self {
        Self {
            slot: config.slot,
            timeout: Duration::from_secs(config.timeout_secs),
            chalresp_program: config.chalresp_program.clone(),
            personalize_program: config.personalize_program.clone(),
        }
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<String, SentinelError> {
        debug!("Running {} for token slot {}", program, self.slot);

        let child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SentinelError::TokenUnavailable(format!("failed to run {}: {}", program, e)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                SentinelError::TokenUnavailable(format!("{} did not complete: {}", program, e))
            })?,
            Err(_) => return Err(SentinelError::TokenTimeout(self.timeout)),
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_failure(program, &stderr))
    }
}

fn classify_failure(program: &str, stderr: &str) -> SentinelError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no yubikey") || lower.contains("not found") || lower.contains("no device") {
        SentinelError::TokenUnavailable(format!("{}: {}", program, stderr))
    } else {
        SentinelError::TokenDeclined(format!("{}: {}", program, stderr))
    }
}

fn parse_response(text: &str) -> Result<ChainSecret, SentinelError> {
    let bytes = hex::decode(text.trim())
        .map_err(|e| SentinelError::TokenDeclined(format!("unreadable token response: {}", e)))?;
    ChainSecret::from_bytes(&bytes)
        .map_err(|e| SentinelError::TokenDeclined(format!("unexpected token response: {}", e)))
}

#[async_trait]
impl ChallengeResponseToken for YubikeyToken {
    async fn respond(&self, challenge: &Challenge) -> Result<ChainSecret, SentinelError> {
        info!("If the token is flashing, please touch it");
        let args = vec![
            format!("-{}", self.slot),
            "-H".to_string(),
            "-x".to_string(),
            challenge.to_hex(),
        ];
        let out = self.run(&self.chalresp_program, args).await?;
        parse_response(&out)
    }

    async fn program(&self, secret: &RootSecret) -> Result<(), SentinelError> {
        warn!("Overwriting token slot {}", self.slot);
        let args = vec![
            format!("-{}", self.slot),
            format!("-a{}", secret.to_hex()),
            "-ochal-resp".to_string(),
            "-ochal-hmac".to_string(),
            "-ochal-btn-trig".to_string(),
            "-ohmac-lt64".to_string(),
            "-y".to_string(),
        ];
        self.run(&self.personalize_program, args).await?;
        info!("Wrote secret to token slot {}", self.slot);
        Ok(())
    }
}

//! One-time initialization of a new audit chain.
//!
//! Generates the root secret and challenge, splits the root into shares,
//! seeds the store with secret_0 and writes the log header. The root
//! itself is only ever held in memory and is wiped when this returns.

use tracing::{info, warn};

use crate::audit::log_file::AuditLogFile;
use crate::crypto::shamir::MAX_SHARES;
use crate::crypto::{split, ChallengeResponseToken, Challenge, RootSecret, ShareEncryptor};
use crate::database::{metadata, Database};
use crate::error::SentinelError;

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub shares: usize,
    pub threshold: usize,
    /// One recipient per share, or empty for plain shares.
    pub recipients: Vec<String>,
    pub program_token: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            shares: 3,
            threshold: 2,
            recipients: Vec::new(),
            program_token: false,
        }
    }
}

impl BootstrapOptions {
    pub fn validate(&self) -> Result<(), SentinelError> {
        if self.threshold < 1 || self.threshold > self.shares || self.shares > MAX_SHARES {
            return Err(SentinelError::InvalidParameters(format!(
                "need 1 <= threshold ({}) <= shares ({}) <= {}",
                self.threshold, self.shares, MAX_SHARES
            )));
        }
        if !self.recipients.is_empty() && self.recipients.len() != self.shares {
            return Err(SentinelError::InvalidParameters(format!(
                "{} recipients given for {} shares",
                self.recipients.len(),
                self.shares
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct IssuedShare {
    pub recipient: Option<String>,
    /// Plain `t-i-hex` share, or the encrypted block for `recipient`.
    pub text: String,
}

#[derive(Debug)]
pub struct BootstrapOutcome {
    pub challenge: Challenge,
    pub shares: Vec<IssuedShare>,
    pub token_programmed: bool,
    pub token_error: Option<SentinelError>,
}

pub async fn bootstrap(
    db: &Database,
    log: &AuditLogFile,
    options: &BootstrapOptions,
    encryptor: Option<&dyn ShareEncryptor>,
    token: Option<&dyn ChallengeResponseToken>,
) -> Result<BootstrapOutcome, SentinelError> {
    if db.is_initialized().await? || !log.is_blank()? {
        return Err(SentinelError::AlreadyInitialized);
    }
    options.validate()?;
    if !options.recipients.is_empty() && encryptor.is_none() {
        return Err(SentinelError::InvalidParameters(
            "recipients given but no share encryptor available".to_string(),
        ));
    }
    if options.program_token && token.is_none() {
        return Err(SentinelError::TokenUnavailable("no token configured".to_string()));
    }

    let root = RootSecret::generate();
    let challenge = Challenge::generate();
    let secret_0 = root.derive_initial(&challenge);

    // Wrap every share before writing any state, so a bad recipient
    // leaves nothing behind.
    let mut issued = Vec::with_capacity(options.shares);
    for share in split(root.as_bytes(), options.shares, options.threshold)? {
        let plain = share.to_string();
        let issued_share = match (options.recipients.get(issued.len()), encryptor) {
            (Some(recipient), Some(encryptor)) => IssuedShare {
                recipient: Some(recipient.clone()),
                text: encryptor.encrypt(recipient, &plain)?,
            },
            _ => IssuedShare {
                recipient: None,
                text: plain,
            },
        };
        issued.push(issued_share);
    }

    let mut tx = db.pool().begin().await?;
    metadata::store_initial(&mut tx, &challenge, &secret_0).await?;
    log.create(&challenge)?;
    if let Err(e) = tx.commit().await {
        if let Err(rm) = std::fs::remove_file(log.path()) {
            warn!("Failed to remove {:?} after aborted bootstrap: {}", log.path(), rm);
        }
        return Err(e.into());
    }
    info!(
        "Initialized audit chain at {:?} with {} of {} shares",
        log.path(),
        options.threshold,
        options.shares
    );

    let (token_programmed, token_error) = match token.filter(|_| options.program_token) {
        Some(token) => match token.program(&root).await {
            Ok(()) => (true, None),
            Err(e) => {
                warn!("Token programming failed; the shares remain valid: {}", e);
                (false, Some(e))
            }
        },
        None => (false, None),
    };

    Ok(BootstrapOutcome {
        challenge,
        shares: issued,
        token_programmed,
        token_error,
    })
}

//! Provision a hardware token with the audit chain root secret, e.g. a
//! replacement token rebuilt from shares.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::info;

use changelog_sentinel::audit::{AuditLogFile, ChainVerifier};
use changelog_sentinel::config::AppConfig;
use changelog_sentinel::crypto::{ChallengeResponseToken, RootSecret, YubikeyToken};

#[derive(Parser)]
#[command(name = "program-token")]
#[command(about = "Write the root secret into a challenge-response token")]
struct Cli {
    /// Root secret as hex, or comma-separated shares
    #[arg(short, long)]
    secret: String,

    /// Configuration file (token settings, audit log path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Check the secret against the first entry of this log before writing
    #[arg(long)]
    check_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    let root = RootSecret::from_input(&cli.secret)?;

    if let Some(path) = &cli.check_log {
        let log = AuditLogFile::new(path.clone());
        let challenge = log.read_challenge()?;
        let (_, first) = log
            .first_entry()?
            .ok_or_else(|| anyhow!("{:?} has no entries to check against", path))?;
        if !ChainVerifier::default().validate_root(&root, &challenge, &first)? {
            return Err(anyhow!("secret does not match the first entry of {:?}", path));
        }
        info!("Secret matches {:?}", path);
    }

    let token = YubikeyToken::new(&config.token);
    token.program(&root).await?;
    println!("Token slot {} programmed.", config.token.slot);
    Ok(())
}

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::error;

use changelog_sentinel::audit::{AuditLogFile, ChainVerifier, DEFAULT_MAX_ELISION};
use changelog_sentinel::config::TokenConfig;
use changelog_sentinel::crypto::{ChainSecret, ChallengeResponseToken, RootSecret, YubikeyToken};
use changelog_sentinel::error::SentinelError;

#[derive(Parser)]
#[command(name = "verify-audit-log")]
#[command(about = "Verify a hash-chain signed changelog audit log")]
struct Cli {
    /// Path to the audit log (JSON Lines)
    log: PathBuf,

    /// Root secret as hex, or comma-separated shares
    #[arg(short, long, conflicts_with = "yubikey", required_unless_present = "yubikey")]
    secret: Option<String>,

    /// Obtain secret_0 from the hardware token
    #[arg(short, long)]
    yubikey: bool,

    /// Token slot to use with --yubikey
    #[arg(long, default_value_t = 2)]
    slot: u8,

    /// Missing entries tolerated between two lines
    #[arg(long, default_value_t = DEFAULT_MAX_ELISION)]
    max_elision: usize,

    #[arg(short, long)]
    verbose: bool,

    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.quiet {
        tracing::Level::ERROR
    } else if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<SentinelError>() {
                Some(SentinelError::ChainVerificationMismatch {
                    line,
                    included,
                    computed,
                    step,
                }) => {
                    eprintln!("Line {} failed verification:", line);
                    eprintln!("Included tag   = {}", included);
                    eprintln!("Calculated tag = {} (at step {})", computed, step);
                }
                _ => error!("{}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let log = AuditLogFile::new(cli.log.clone());
    let challenge = log.read_challenge()?;

    let secret_0: ChainSecret = match &cli.secret {
        Some(text) => root_from_input(text)?.derive_initial(&challenge),
        None => {
            let token = YubikeyToken::new(&TokenConfig {
                slot: cli.slot,
                ..TokenConfig::default()
            });
            eprintln!("If the token is flashing, please touch it");
            token.respond(&challenge).await?
        }
    };

    let verifier = ChainVerifier::new(cli.max_elision);
    let report = verifier.verify_file(log.path(), move |_| Ok(secret_0))?;

    for warning in &report.warnings {
        eprintln!("WARNING: {}", warning);
    }
    eprintln!("Log validated ok");
    if cli.verbose {
        eprintln!(
            "{} entries, last serial {:?}, {} duplicates",
            report.entries, report.last_serial, report.duplicates
        );
    }
    Ok(())
}

fn root_from_input(text: &str) -> Result<RootSecret> {
    RootSecret::from_input(text).map_err(|e| anyhow!("--secret is neither hex nor a share list: {}", e))
}

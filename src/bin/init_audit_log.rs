//! Initialize a new forward-secure audit log.
//!
//! Generates the root secret, prints (or encrypts) its shares, seeds the
//! metadata store and writes the log header. Refuses to run twice.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::info;

use changelog_sentinel::audit::AuditLogFile;
use changelog_sentinel::bootstrap::{bootstrap, BootstrapOptions};
use changelog_sentinel::config::AppConfig;
use changelog_sentinel::crypto::{ChallengeResponseToken, GpgShareEncryptor, ShareEncryptor, YubikeyToken};
use changelog_sentinel::database::Database;

#[derive(Parser)]
#[command(name = "init-audit-log")]
#[command(about = "Generate the audit chain root secret and initialize the log")]
struct Cli {
    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of shares to split the root secret into
    #[arg(short = 'n', long, default_value_t = 3)]
    shares: usize,

    /// Shares required to reconstruct the root secret
    #[arg(short = 'r', long, default_value_t = 2)]
    threshold: usize,

    /// Encrypt each share to one GnuPG recipient (one per share)
    #[arg(long, value_delimiter = ',')]
    recipients: Vec<String>,

    /// Also program the root secret into the hardware token
    #[arg(short = 'y', long)]
    yubikey: bool,

    /// Do not ask for confirmation
    #[arg(long)]
    yes: bool,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(io::stderr)
        .init();

    let config = AppConfig::load(cli.config.as_deref())?;
    let options = BootstrapOptions {
        shares: cli.shares,
        threshold: cli.threshold,
        recipients: cli.recipients.clone(),
        program_token: cli.yubikey,
    };
    options.validate()?;

    if !cli.yes && !confirm(&config, &options)? {
        return Err(anyhow!("aborted"));
    }

    let database = Database::new(&config.database_url).await?;
    database.run_migrations().await?;
    let log = AuditLogFile::new(config.audit_log_path.clone());

    let gpg = GpgShareEncryptor::default();
    let encryptor: Option<&dyn ShareEncryptor> = if options.recipients.is_empty() {
        None
    } else {
        Some(&gpg)
    };
    let yubikey = YubikeyToken::new(&config.token);
    let token: Option<&dyn ChallengeResponseToken> = if cli.yubikey { Some(&yubikey) } else { None };

    let outcome = bootstrap(&database, &log, &options, encryptor, token).await?;

    println!(
        "Any {} of these {} shares reconstruct the root secret:",
        options.threshold, options.shares
    );
    for share in &outcome.shares {
        match &share.recipient {
            Some(recipient) => println!("\n=== share for {} ===\n{}", recipient, share.text.trim_end()),
            None => println!("{}", share.text),
        }
    }

    if let Some(e) = &outcome.token_error {
        eprintln!("WARNING: failed to program the token ({}); the shares above are still valid", e);
    } else if outcome.token_programmed {
        println!("Root secret written to the token.");
    }

    println!(
        "The daemon suppresses notifications until it first catches up with the changelog; \
         pass --initial-sync to repeat that after a restore."
    );
    info!("Log initialized at {:?}", log.path());
    Ok(())
}

fn confirm(config: &AppConfig, options: &BootstrapOptions) -> Result<bool> {
    eprintln!(
        "About to initialize {:?} using {} with a {}-of-{} root secret split.",
        config.audit_log_path, config.database_url, options.threshold, options.shares
    );
    if options.program_token {
        eprintln!("Token slot {} will be overwritten.", config.token.slot);
    }
    eprint!("Continue? [y/N] ");
    io::stderr().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim().eq_ignore_ascii_case("y"))
}

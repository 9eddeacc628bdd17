//! CLI Entry Point for zptess
//!
//! Provides command-line interface for:
//! - Monitoring both photometers without persistence (`read`)
//! - Running a calibration session (`calibrate`)
//! - Checking stored sessions for consistency (`verify`)
//! - Repairing stored round standard deviations (`repair`)
//!
//! # Usage
//!
//! ```bash
//! zptess --config config/zptess.toml calibrate
//! zptess verify --session 2024-05-02T22:00:00Z --scope rounds
//! zptess repair --stddev --dry-run
//! ```

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use zptess::calibration::{Calibrator, ReadMode};
use zptess::config::ZptessConfig;
use zptess::logging::{self, LogFormat, TracingConfig};
use zptess::model::{Role, SessionId};
use zptess::store::{Gateway, MemoryStore};
use zptess::verifier::{repair_stddev, Scope, Verifier};

#[derive(Parser)]
#[command(name = "zptess")]
#[command(about = "Zero-point calibration of TESS photometers", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/zptess.toml")]
    config: PathBuf,

    /// Log format (compact, pretty, json); overrides the configuration
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print readings from both photometers until Ctrl-C
    Read,

    /// Run one calibration session and store its results
    Calibrate,

    /// Check stored sessions for consistency
    Verify {
        /// Session start (RFC 3339); all sessions if omitted
        #[arg(long, value_parser = parse_session)]
        session: Option<SessionId>,

        /// Layers to check: summary, rounds, samples or all
        #[arg(long, default_value = "all")]
        scope: Scope,
    },

    /// Repair stored round statistics
    Repair {
        /// Recompute round standard deviations about their central value
        #[arg(long)]
        stddev: bool,

        /// Session start (RFC 3339); all sessions if omitted
        #[arg(long, value_parser = parse_session)]
        session: Option<SessionId>,

        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
    },
}

fn parse_session(s: &str) -> Result<SessionId, String> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(SessionId(t.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .map(|t| SessionId(t.and_utc()))
        .map_err(|e| format!("invalid session timestamp '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ZptessConfig::load_from(&cli.config)?;
    config.validate()?;
    let mut log_config = TracingConfig::from_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_ansi(std::io::stdout().is_terminal());
    if let Some(format) = cli.log_format {
        log_config = log_config.with_format(format);
    }
    logging::init(log_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Read => read(&config).await,
        Commands::Calibrate => calibrate(config).await,
        Commands::Verify { session, scope } => verify(&config, session, scope).await,
        Commands::Repair {
            stddev,
            session,
            dry_run,
        } => {
            if !stddev {
                bail!("nothing to repair; pass --stddev");
            }
            repair(&config, session, dry_run).await
        }
    }
}

fn print_lines(mut lines: broadcast::Receiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match lines.recv().await {
                Ok(line) => println!("{}", line),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("... {} lines skipped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn read(config: &ZptessConfig) -> Result<()> {
    let reader = ReadMode::start(config).await?;
    let printers: Vec<_> = Role::ALL
        .iter()
        .map(|role| print_lines(reader.lines(*role)))
        .collect();

    tokio::signal::ctrl_c().await?;
    reader.stop().await?;
    for printer in printers {
        printer.abort();
    }
    Ok(())
}

async fn calibrate(config: ZptessConfig) -> Result<()> {
    let store_path = config.application.store_path.clone();
    let store = Arc::new(MemoryStore::open(&store_path).await?);
    let calibrator = Calibrator::new(config, store.clone() as Arc<dyn Gateway>);
    let printers: Vec<_> = Role::ALL
        .iter()
        .map(|role| print_lines(calibrator.signals(*role).lines()))
        .collect();

    let outcome = tokio::select! {
        outcome = calibrator.run() => outcome,
        _ = tokio::signal::ctrl_c() => {
            for printer in printers {
                printer.abort();
            }
            store.save(&store_path).await?;
            bail!("calibration interrupted");
        }
    };
    for printer in printers {
        printer.abort();
    }
    store.save(&store_path).await?;

    let outcome = outcome?;
    let test = &outcome.test.1;
    match outcome.zero_point() {
        Some(zp) => println!(
            "Session {}: new zero point {:.2} (previous {}), written to device: {}",
            outcome.session,
            zp,
            test.prev_zp.map_or_else(|| "unknown".to_string(), |p| format!("{:.2}", p)),
            test.upd_flag.unwrap_or(false)
        ),
        None => println!("Session {}: no zero point could be computed", outcome.session),
    }
    Ok(())
}

async fn verify(config: &ZptessConfig, session: Option<SessionId>, scope: Scope) -> Result<()> {
    let store = MemoryStore::open(&config.application.store_path).await?;
    let report = Verifier::new(&store).verify(session, scope).await?;
    for violation in &report.violations {
        println!("{}", violation);
    }
    println!(
        "Checked {} summaries, {} rounds, {} samples: {} violations",
        report.summaries,
        report.rounds,
        report.samples,
        report.violations.len()
    );
    if !report.is_clean() {
        bail!("consistency check failed");
    }
    Ok(())
}

async fn repair(config: &ZptessConfig, session: Option<SessionId>, dry_run: bool) -> Result<()> {
    let store_path = &config.application.store_path;
    let store = MemoryStore::open(store_path).await?;
    let report = repair_stddev(&store, session, dry_run).await?;
    for fix in &report.fixed {
        println!(
            "[{}] [{}] round #{}: {:?} => {:.3}",
            fix.session, fix.role, fix.seq, fix.old, fix.new
        );
    }
    for fix in &report.unexplained {
        println!(
            "[{}] [{}] round #{}: stored {:?}, computed {:.3} (left unchanged)",
            fix.session, fix.role, fix.seq, fix.old, fix.new
        );
    }
    if !dry_run && !report.fixed.is_empty() {
        store.save(store_path).await?;
    }
    println!(
        "Examined {} rounds: {} fixed{}, {} unexplained",
        report.examined,
        report.fixed.len(),
        if dry_run { " (dry run)" } else { "" },
        report.unexplained.len()
    );
    Ok(())
}

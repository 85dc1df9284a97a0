//! iptsyncd entry point.
//!
//! Loads the desired-state file, runs one reconciliation cycle and exits.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use iptsync_rules::Family;
use iptsyncd::{load_desired_state, ExecRunner, SyncMgr, SystemAccounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FamilyArg {
    Ipv4,
    Ipv6,
    Both,
}

impl FamilyArg {
    fn families(self) -> Vec<Family> {
        match self {
            FamilyArg::Ipv4 => vec![Family::V4],
            FamilyArg::Ipv6 => vec![Family::V6],
            FamilyArg::Both => Family::all().to_vec(),
        }
    }
}

/// Reconciles iptables rules with a desired-state file
#[derive(Parser, Debug)]
#[command(name = "iptsyncd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Desired-state JSON file
    #[arg(short = 'r', long)]
    rules: PathBuf,

    /// Protocol families to manage
    #[arg(short = 'f', long, value_enum, default_value = "both")]
    family: FamilyArg,

    /// Read the live rules from a saved dump instead of the save tool
    #[arg(long)]
    dump_file: Option<PathBuf>,

    /// Print the command plan without executing it
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Execute commands even when reading from --dump-file
    #[arg(long)]
    apply: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

/// Initialize tracing/logging.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let families = args.family.families();
    let desired = load_desired_state(&args.rules)
        .with_context(|| format!("loading {}", args.rules.display()))?;

    let mut dry_run = args.dry_run;
    let mut mgr = SyncMgr::new(ExecRunner)
        .with_families(families.clone())
        .with_accounts(SystemAccounts);

    if let Some(path) = &args.dump_file {
        let [family] = families.as_slice() else {
            bail!("--dump-file needs a single --family");
        };
        mgr = mgr.with_dump_file(*family, path.clone());
        dry_run |= !args.apply;
    }
    let mut mgr = mgr.with_dry_run(dry_run);

    let report = mgr.run_cycle(&desired).await.context("reconciliation failed")?;
    if report.is_converged() {
        info!("Rules already in sync");
    }
    if dry_run {
        for cmd in &report.commands {
            println!("{cmd}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("--- Starting iptsyncd ---");

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

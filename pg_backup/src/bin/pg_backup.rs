//! `pg_backup` entrypoint: parses arguments, wires up tracing, and hands
//! off to the orchestrator. Argument validation beyond what `clap` gives us
//! for free is deliberately thin; the orchestrator is where real decisions
//! (mode resolution, retention, snapshot use) get made.

use std::process::ExitCode as ProcessExitCode;
use std::str::FromStr;

use camino::Utf8PathBuf;
use clap::Parser;
use postgres::Config as PgConfig;
use tracing::error;

use pg_backup::backup::BackupMode;
use pg_backup::error::BackupError;
use pg_backup::orchestrator::{self, RunConfig};
use pg_backup::progress::NullProgress;
use utils::signals::Interrupt;

#[derive(Parser)]
#[command(name = "pg_backup", about = "Block-level physical backup of a PostgreSQL cluster")]
struct Cli {
    /// Root of the on-disk backup catalog.
    #[arg(long)]
    catalog: Utf8PathBuf,

    /// PGDATA of the server being backed up.
    #[arg(long)]
    pgdata: Utf8PathBuf,

    /// Connection string for the primary (or the only server, if not
    /// backing up from a standby).
    #[arg(long)]
    primary_conninfo: String,

    /// Connection string for a standby to copy files from, leaving the
    /// primary free of the read load; the control calls that must happen on
    /// the primary (begin/stop backup) still go there.
    #[arg(long)]
    standby_conninfo: Option<String>,

    /// PGDATA of the standby named by `--standby-conninfo`, polled (along
    /// with the primary's) for the archive-status marker.
    #[arg(long)]
    standby_pgdata: Option<Utf8PathBuf>,

    #[arg(long, value_enum, default_value = "full")]
    mode: CliMode,

    #[arg(long)]
    with_serverlog: bool,

    #[arg(long)]
    compress: bool,

    #[arg(long)]
    no_checksums: bool,

    /// Fall back to a FULL backup instead of failing when no validated base
    /// is available for an incremental.
    #[arg(long)]
    full_backup_on_error: bool,

    #[arg(long)]
    fast_checkpoint: bool,

    #[arg(long, default_value = "pg_backup")]
    backup_label: String,

    #[arg(long, default_value_t = 8)]
    keep_generations: usize,

    #[arg(long, default_value_t = 30)]
    keep_days: i64,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliMode {
    Full,
    Incremental,
    Archive,
}

impl From<CliMode> for BackupMode {
    fn from(m: CliMode) -> BackupMode {
        match m {
            CliMode::Full => BackupMode::Full,
            CliMode::Incremental => BackupMode::Incremental,
            CliMode::Archive => BackupMode::Archive,
        }
    }
}

fn main() -> ProcessExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run() {
        Ok(()) => ProcessExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.user_message());
            error!(error = %e, "pg_backup exiting with error");
            ProcessExitCode::from(e.exit_code().as_i32() as u8)
        }
    }
}

fn run() -> Result<(), BackupError> {
    let cli = Cli::parse();
    let interrupt = Interrupt::install().map_err(BackupError::System)?;

    let primary_config = PgConfig::from_str(&cli.primary_conninfo)
        .map_err(|e| BackupError::args(format!("invalid --primary-conninfo: {e}")))?;
    let standby_config = cli
        .standby_conninfo
        .as_deref()
        .map(PgConfig::from_str)
        .transpose()
        .map_err(|e| BackupError::args(format!("invalid --standby-conninfo: {e}")))?;

    let config = RunConfig {
        catalog_root: cli.catalog,
        pgdata: cli.pgdata,
        requested_mode: cli.mode.into(),
        with_serverlog: cli.with_serverlog,
        compress_data: cli.compress,
        checksums_enabled: !cli.no_checksums,
        full_backup_on_error: cli.full_backup_on_error,
        fast_checkpoint: cli.fast_checkpoint,
        backup_label: cli.backup_label,
        primary_config,
        standby_config,
        standby_pgdata: cli.standby_pgdata,
        keep_generations: cli.keep_generations,
        keep_days: cli.keep_days,
    };

    let mut progress = NullProgress;
    let backup = orchestrator::run(&config, &interrupt, &mut progress)?;
    println!("backup {} completed ({})", backup.id, backup.backup_mode);
    Ok(())
}

//! migration-gate - Migration-Consistency Gate
//!
//! Fails a deployment pipeline when the application's declared models have
//! changed without a corresponding migration.
//!
//! The gate:
//! - Loads the declared model manifest
//! - Reads the applied migration log (directory or PostgreSQL table, read-only)
//! - Replays the log and computes the pending diff
//! - Exits 0 when nothing is pending, non-zero otherwise

mod config;
mod db;
mod declared;
mod diff;
mod error;
mod gate;
mod migration;
mod report;
mod schema;

use crate::config::{ConfigError, LogSourceConfig, Overrides, Settings};
use crate::declared::ManifestModelSource;
use crate::error::{CheckFailure, ExitPolicy, GateError};
use crate::gate::{GateOutcome, MigrationGate};
use crate::migration::log::{DirectoryMigrationLog, PostgresMigrationLog};
use crate::migration::LogBackend;
use crate::report::Reporter;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "migration-gate", version, about = "Fail when model changes have no recorded migration")]
struct Cli {
    /// Configuration profile (config/<profile>.toml)
    #[arg(long, env = "GATE_PROFILE", default_value = "dev")]
    profile: String,

    /// Declared model manifest
    #[arg(long, env = "GATE_MODELS")]
    models: Option<PathBuf>,

    /// Migration directory root
    #[arg(long, env = "GATE_MIGRATIONS")]
    migrations: Option<PathBuf>,

    /// Read the applied log from PostgreSQL instead of the directory
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Only check these apps (repeatable)
    #[arg(long = "app", value_name = "LABEL")]
    apps: Vec<String>,

    /// Exit 2 instead of 1 when the diff cannot be computed
    #[arg(long, env = "GATE_DISTINCT_EXIT_CODES")]
    distinct_exit_codes: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            models: self.models.clone(),
            migrations: self.migrations.clone(),
            database_url: self.database_url.clone(),
            apps: self.apps.clone(),
            distinct_exit_codes: self.distinct_exit_codes,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    // .env must be in place before clap reads env fallbacks
    let env_loaded = Settings::load_env();
    init_tracing();

    let cli = Cli::parse();
    run(cli, env_loaded).await
}

async fn run(cli: Cli, env_loaded: Result<(), ConfigError>) -> anyhow::Result<ExitCode> {
    let mut reporter = Reporter::new(std::io::stdout());
    reporter.start()?;

    let settings = env_loaded.and_then(|_| Settings::load(&cli.profile, cli.overrides()));
    let policy = exit_policy(cli.distinct_exit_codes, settings.as_ref().ok());

    let result = match settings {
        Ok(settings) => {
            info!("📋 Configuration loaded (profile: {})", settings.profile);
            check(&settings).await
        }
        Err(e) => Err(CheckFailure::from(GateError::from(e))),
    };

    let status = finish(&mut reporter, &result, policy)?;
    Ok(ExitCode::from(status))
}

/// Loaded settings decide; without them only the command-line flag counts
fn exit_policy(cli_distinct: bool, settings: Option<&Settings>) -> ExitPolicy {
    if settings.map_or(cli_distinct, |s| s.distinct_exit_codes) {
        ExitPolicy::Distinct
    } else {
        ExitPolicy::Collapsed
    }
}

/// Report the result and return the process exit status
fn finish<W: Write>(
    reporter: &mut Reporter<W>,
    result: &Result<GateOutcome, CheckFailure>,
    policy: ExitPolicy,
) -> std::io::Result<u8> {
    match result {
        Ok(_) => {
            reporter.success()?;
            Ok(0)
        }
        Err(failure) => {
            match failure {
                CheckFailure::PendingChangesDetected(diff) => {
                    warn!(kind = failure.kind(), "{} pending change(s)", diff.len());
                }
                CheckFailure::DiffComputationFailed(cause) => {
                    error!(kind = failure.kind(), "❌ {}", cause);
                }
            }
            reporter.failure(failure)?;
            Ok(failure.exit_code(policy))
        }
    }
}

/// Wire the configured sources into a gate and run it
async fn check(settings: &Settings) -> Result<GateOutcome, CheckFailure> {
    let models = ManifestModelSource::new(&settings.models);

    let log = match &settings.log_source {
        LogSourceConfig::Directory(root) => LogBackend::Directory(DirectoryMigrationLog::new(root)),
        LogSourceConfig::Database { database, table } => {
            let pool = db::create_pool(database)?;
            LogBackend::Database(PostgresMigrationLog::new(pool, table))
        }
    };

    MigrationGate::new(models, log, settings.apps.clone()).check().await
}

/// Initialize tracing; stdout is reserved for the report
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,migration_gate=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .compact(),
        )
        .init();
}

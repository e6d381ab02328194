pub mod config;
pub mod db {
    #[cfg(test)]
    pub mod memory;
    pub mod models;
    pub mod store;
}
pub mod ingest {
    pub mod classify;
    pub mod decode;
    pub mod pipeline;
    pub mod registry;
    pub mod writer;
}
pub mod schema;
pub mod services {
    pub mod mqtt;
    pub mod replay;
    pub mod workers;
}
pub mod utils;

use crate::config::Config;
use crate::db::store::{PgStore, TelemetryStore};
use crate::ingest::pipeline::IngestPipeline;
use crate::services::workers::WorkerPool;
use crate::services::{mqtt, replay};
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    env_file: Option<PathBuf>,
    replay: Option<PathBuf>,
}

fn apply_database_migrations(conn: &mut PgConnection) -> Result<(), String> {
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(applied) => {
            if applied.is_empty() {
                info!("Database schema is up to date; no migrations were applied");
            } else {
                let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
                info!("Applied {} database migration(s): {}", applied.len(), names);
            }
            Ok(())
        }
        Err(e) => Err(format!("Applying database migrations failed: {}", e)),
    }
}

fn run(args: &CliArgs) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (database={}, default_device={}, workers={}, queue={}, db_pool={})",
        cfg.redacted_database_url(),
        cfg.default_device_name,
        cfg.ingest_workers,
        cfg.ingest_queue_capacity,
        cfg.db_pool_size
    );

    // 2) Connect DB
    let store = PgStore::connect(&cfg.database_url, cfg.db_pool_size.get())?;
    info!("Connected to database");

    // 3) Apply pending database migrations
    {
        let mut conn = store
            .pool()
            .get()
            .map_err(|e| format!("DB connection failed: {}", e))?;
        apply_database_migrations(&mut conn)?;
    }

    // 4) Pipeline and workers
    let store: Arc<dyn TelemetryStore> = Arc::new(store);
    let pipeline = Arc::new(IngestPipeline::new(store, cfg.default_device_name.clone()));
    let pool = WorkerPool::start(pipeline.clone(), cfg.ingest_workers, cfg.ingest_queue_capacity)?;

    // 5) Feed messages
    let result = match &args.replay {
        Some(path) => {
            info!("Replaying payloads from {}", path.display());
            replay::run_file(path, &pool).map(|_| ())
        }
        None => mqtt::run(&cfg.mqtt, &pool),
    };

    pool.shutdown();
    info!("Ingest stats: {}", pipeline.stats());
    result
}

fn parse_cli<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = std::ffi::OsString>,
{
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();

    fn set_once(slot: &mut Option<PathBuf>, flag: &str, value: Option<&str>) -> Result<(), String> {
        if slot.is_some() {
            return Err(format!("`{flag}` provided more than once"));
        }
        match value {
            Some(v) if !v.is_empty() => {
                *slot = Some(PathBuf::from(v));
                Ok(())
            }
            _ => Err(format!("`{flag}` requires a path argument")),
        }
    }

    while let Some(arg) = args.next() {
        let arg = arg
            .into_string()
            .map_err(|_| "argument contains invalid UTF-8".to_string())?;
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg.clone(), None),
        };
        let slot = match flag.as_str() {
            "--env-file" => &mut parsed.env_file,
            "--replay" => &mut parsed.replay,
            "--" => break,
            other => return Err(format!("unrecognised argument: {}", other)),
        };
        let value = match inline {
            Some(v) => Some(v),
            None => args.next().and_then(|v| v.into_string().ok()),
        };
        set_once(slot, &flag, value.as_deref())?;
    }

    Ok(parsed)
}

/// Load the env file named on the command line, or `./.env` if present.
/// Returns the loaded path and whether it was given explicitly.
fn load_env(args: &CliArgs) -> Result<Option<(PathBuf, bool)>, String> {
    let (path, explicit) = match &args.env_file {
        Some(path) => {
            if !path.is_file() {
                return Err(format!("env file not found: {}", path.display()));
            }
            (path.clone(), true)
        }
        None => {
            let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
            let default_path = cwd.join(".env");
            if !default_path.is_file() {
                return Ok(None);
            }
            (default_path, false)
        }
    };
    config::load_env_file(&path)?;
    Ok(Some((path, explicit)))
}

fn main() {
    let loaded = parse_cli(std::env::args_os().skip(1)).and_then(|args| load_env(&args).map(|env| (args, env)));
    let (args, loaded_env) = match loaded {
        Ok(v) => v,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some((path, explicit)) = loaded_env.as_ref() {
        let origin = if *explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, path.display());
    }

    info!(
        "motor-telemetry-ingester {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&args) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}

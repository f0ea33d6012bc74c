//! fabsyncd: keeps fabric inventory records reconciled with their cluster
//! control planes.
//!
//! The daemon:
//! - opens the inventory and audit databases (or in-memory stores with `--dev`)
//! - optionally imports fabrics and desired resources from a JSON file
//! - rebuilds circuit breaker state from the stored failure counters
//! - runs the scheduler, restarting it if the task dies
//! - drains in-flight reconciliations on SIGINT/SIGTERM

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fabsync_engine::{
    BreakerConfig, Clock, EngineConfig, FakeConnector, HttpConnector, MemoryAuditTrail,
    MemoryStore, RedbAuditTrail, RedbStore, SyncEngine, SystemClock,
};

mod import;

const RESTART_DELAY: Duration = Duration::from_secs(5);

/// fabsync daemon
#[derive(Parser, Debug)]
#[command(name = "fabsyncd", version, about)]
struct Args {
    /// Data directory for the inventory and audit databases
    #[arg(short, long, env = "FABSYNC_DATA_DIR", default_value = "/var/lib/fabsync")]
    data_dir: PathBuf,

    /// Run in development mode (in-memory stores, fake cluster)
    #[arg(long, env = "FABSYNC_DEV")]
    dev: bool,

    /// Import fabrics and desired resources from a JSON file at start-up
    #[arg(long, env = "FABSYNC_IMPORT")]
    import: Option<PathBuf>,

    /// Seconds between two scheduler ticks
    #[arg(long, env = "FABSYNC_TICK_SECS", default_value_t = 30)]
    tick_secs: u64,

    /// Maximum number of concurrent reconciliations
    #[arg(long, env = "FABSYNC_MAX_CONCURRENT", default_value_t = 4)]
    max_concurrent: usize,

    /// Wall-clock budget of one reconciliation attempt in seconds
    #[arg(long, env = "FABSYNC_ATTEMPT_TIMEOUT_SECS", default_value_t = 180)]
    attempt_timeout_secs: u64,

    /// Timeout of a single cluster API request in seconds
    #[arg(long, env = "FABSYNC_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    /// Consecutive failures that open a fabric's circuit
    #[arg(long, env = "FABSYNC_FAILURE_THRESHOLD", default_value_t = 5)]
    failure_threshold: u32,

    /// Base circuit cool-down in seconds, doubled per failure
    #[arg(long, env = "FABSYNC_BASE_COOLDOWN_SECS", default_value_t = 10)]
    base_cooldown_secs: u64,

    /// Upper bound of the circuit cool-down in seconds
    #[arg(long, env = "FABSYNC_MAX_COOLDOWN_SECS", default_value_t = 1800)]
    max_cooldown_secs: u64,

    /// Authentication failures in a row before a fabric is parked in error
    #[arg(long, env = "FABSYNC_AUTH_RETRY_LIMIT", default_value_t = 3)]
    auth_retry_limit: u32,

    /// Number of recent attempts summarized in the state view
    #[arg(long, env = "FABSYNC_HISTORY_SUMMARY_LEN", default_value_t = 20)]
    history_summary_len: usize,

    /// Sync interval for imported fabrics that do not set one
    #[arg(long, env = "FABSYNC_DEFAULT_SYNC_INTERVAL_SECS", default_value_t = 300)]
    default_sync_interval_secs: u64,

    /// Accept invalid TLS certificates from cluster endpoints
    #[arg(long, env = "FABSYNC_INSECURE_TLS")]
    insecure_tls: bool,

    /// Log as JSON lines
    #[arg(long, env = "FABSYNC_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        let defaults = BreakerConfig::default();
        EngineConfig {
            tick_interval: Duration::from_secs(self.tick_secs),
            max_concurrent: self.max_concurrent,
            attempt_timeout: Duration::from_secs(self.attempt_timeout_secs),
            auth_retry_limit: self.auth_retry_limit,
            history_summary_len: self.history_summary_len,
            breaker: BreakerConfig {
                failure_threshold: self.failure_threshold,
                base_cooldown: Duration::from_secs(self.base_cooldown_secs),
                max_cooldown: Duration::from_secs(self.max_cooldown_secs),
                ..defaults
            },
        }
    }
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("fabsync_engine=info".parse()?)
        .add_directive("fabsyncd=info".parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn build_engine(args: &Args) -> Result<SyncEngine> {
    let config = args.engine_config();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    if args.dev {
        warn!("Development mode: in-memory inventory and audit trail, fake cluster");
        let engine = SyncEngine::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(FakeConnector::new()),
            Arc::new(MemoryAuditTrail::new()),
            clock,
        )?;
        return Ok(engine);
    }

    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("Failed to create data directory {}", args.data_dir.display()))?;

    let inventory_path = args.data_dir.join("inventory.redb");
    info!("Opening inventory at {:?}", inventory_path);
    let store = RedbStore::open(&inventory_path).context("Failed to open inventory database")?;

    let audit_path = args.data_dir.join("audit.redb");
    info!("Opening audit trail at {:?}", audit_path);
    let audit = RedbAuditTrail::open(&audit_path).context("Failed to open audit database")?;

    let connector = HttpConnector::new()
        .with_request_timeout(Duration::from_secs(args.request_timeout_secs))
        .with_insecure_tls(args.insecure_tls);
    if args.insecure_tls {
        warn!("TLS certificate verification disabled for cluster endpoints");
    }

    let engine = SyncEngine::new(
        config,
        Arc::new(store),
        Arc::new(connector),
        Arc::new(audit),
        clock,
    )?;
    Ok(engine)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting fabsyncd");
    let engine = build_engine(&args)?;

    if let Some(path) = &args.import {
        let file = import::load(path).await?;
        import::apply(&engine, file, args.default_sync_interval_secs).await?;
    }

    let failing = engine
        .restore()
        .await
        .context("Failed to restore circuit state")?;
    if failing > 0 {
        warn!(failing, "Fabrics resume with a failure streak");
    }

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut scheduler = engine.start();
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                break;
            }
            result = scheduler.join() => {
                match result {
                    Ok(()) => warn!("Scheduler exited unexpectedly, restarting"),
                    Err(e) => error!(error = %e, "Scheduler task failed, restarting"),
                }
                tokio::time::sleep(RESTART_DELAY).await;
                scheduler = engine.start();
            }
        }
    }

    let health = scheduler.health();
    if health.in_flight > 0 {
        info!(in_flight = health.in_flight, "Waiting for in-flight reconciliations");
    }
    let grace = engine.config().attempt_timeout + RESTART_DELAY;
    match tokio::time::timeout(grace, scheduler.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Scheduler task failed during shutdown"),
        Err(_) => warn!("Timed out waiting for in-flight reconciliations"),
    }

    info!(
        ticks = health.ticks,
        dispatched = health.dispatched_total,
        suppressed = health.suppressed_total,
        crashed = health.crashed_total,
        "Shutdown complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_a_valid_config() {
        let args = Args::try_parse_from(["fabsyncd"]).unwrap();
        assert!(!args.dev);
        assert_eq!(args.data_dir, PathBuf::from("/var/lib/fabsync"));
        let config = args.engine_config();
        assert_eq!(config, EngineConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::try_parse_from([
            "fabsyncd",
            "--dev",
            "--tick-secs",
            "5",
            "--max-concurrent",
            "16",
            "--failure-threshold",
            "3",
            "--max-cooldown-secs",
            "600",
        ])
        .unwrap();
        assert!(args.dev);
        let config = args.engine_config();
        assert_eq!(config.tick_interval, Duration::from_secs(5));
        assert_eq!(config.max_concurrent, 16);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.max_cooldown, Duration::from_secs(600));
    }

    #[test]
    fn zero_workers_fail_validation() {
        let args = Args::try_parse_from(["fabsyncd", "--max-concurrent", "0"]).unwrap();
        assert!(args.engine_config().validate().is_err());
        assert!(build_engine(&Args { dev: true, ..args }).is_err());
    }

    #[test]
    fn redb_stores_live_in_the_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("state");
        let args = Args::try_parse_from([
            "fabsyncd",
            "--data-dir",
            data_dir.to_str().unwrap(),
        ])
        .unwrap();
        build_engine(&args).unwrap();
        assert!(data_dir.join("inventory.redb").exists());
        assert!(data_dir.join("audit.redb").exists());
    }
}

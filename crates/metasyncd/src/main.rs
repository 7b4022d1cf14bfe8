// # metasyncd - Range Sync Daemon
//
// Thin integration layer: reads configuration from the environment, wires
// the config store, secret reader, instance registry, engine and controller
// together, and translates signals.
//
// ## Configuration
//
// All daemon configuration is done via environment variables. Sources,
// targets and sync specs live in the JSON config document.
//
// - `METASYNC_CONFIG_PATH`: Config document (required)
// - `METASYNC_STATUS_PATH`: Status file (default: `<config dir>/status.json`)
// - `METASYNC_SECRETS_DIR`: Mounted secrets root (`<ns>/<name>/<key>` files)
// - `METASYNC_WORKERS`: Concurrent cycles (default 4)
// - `METASYNC_SUCCESS_REQUEUE_SECS`: Delay after a completed cycle (default 60)
// - `METASYNC_FAILURE_REQUEUE_SECS`: Delay after an aborted cycle (default 300)
// - `METASYNC_CYCLE_TIMEOUT_SECS`: Deadline for one cycle (default 120)
// - `METASYNC_MODE`: `live` (default) or `dry-run`
// - `METASYNC_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Signals
//
// - SIGHUP: re-read the config document and trigger affected specs
// - SIGTERM / SIGINT: cancel in-flight calls and exit
//
// ## Example
//
// ```bash
// export METASYNC_CONFIG_PATH=/etc/metasync/config.json
// export METASYNC_STATUS_PATH=/var/lib/metasync/status.json
// export METASYNC_SECRETS_DIR=/etc/metasync/secrets
//
// metasyncd
// ```

mod factory;

use anyhow::{Context, Result};
use factory::DaemonFactory;
use metasync_core::traits::{ConfigStore, SecretReader};
use metasync_core::{
    Controller, DirectorySecretReader, EngineConfig, EngineEvent, FileConfigStore,
    InstanceRegistry, MemorySecretReader, SyncEngine,
};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Time allowed for the controller to stop after a shutdown signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the engine event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum MetasyncExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<MetasyncExitCode> for ExitCode {
    fn from(code: MetasyncExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration
#[derive(Debug)]
struct Config {
    config_path: PathBuf,
    status_path: PathBuf,
    secrets_dir: Option<PathBuf>,
    engine: EngineConfig,
    dry_run: bool,
    log_level: String,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        let config_path: PathBuf = env::var("METASYNC_CONFIG_PATH")
            .context(
                "METASYNC_CONFIG_PATH is required. \
                Set it via: export METASYNC_CONFIG_PATH=/etc/metasync/config.json",
            )?
            .into();

        let status_path = match env::var("METASYNC_STATUS_PATH") {
            Ok(path) => PathBuf::from(path),
            Err(_) => config_path
                .parent()
                .map(|dir| dir.join("status.json"))
                .unwrap_or_else(|| PathBuf::from("status.json")),
        };

        let mut engine = EngineConfig::default();
        if let Some(workers) = parse_var("METASYNC_WORKERS")? {
            engine.workers = workers;
        }
        if let Some(secs) = parse_var("METASYNC_SUCCESS_REQUEUE_SECS")? {
            engine.success_requeue_secs = secs;
        }
        if let Some(secs) = parse_var("METASYNC_FAILURE_REQUEUE_SECS")? {
            engine.failure_requeue_secs = secs;
        }
        if let Some(secs) = parse_var("METASYNC_CYCLE_TIMEOUT_SECS")? {
            engine.cycle_timeout_secs = secs;
        }

        let mode = env::var("METASYNC_MODE").unwrap_or_else(|_| "live".to_string());
        let dry_run = match mode.to_lowercase().as_str() {
            "live" => false,
            "dry-run" => true,
            other => anyhow::bail!(
                "METASYNC_MODE '{}' is not valid. Valid modes: live, dry-run",
                other
            ),
        };

        Ok(Self {
            config_path,
            status_path,
            secrets_dir: env::var("METASYNC_SECRETS_DIR").ok().map(PathBuf::from),
            engine,
            dry_run,
            log_level: env::var("METASYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if !self.config_path.is_file() {
            anyhow::bail!(
                "METASYNC_CONFIG_PATH does not point to a file: {}",
                self.config_path.display()
            );
        }

        if let Some(parent) = self.status_path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            anyhow::bail!(
                "METASYNC_STATUS_PATH parent directory does not exist: {}. \
                Create it first: sudo mkdir -p {}",
                parent.display(),
                parent.display()
            );
        }

        if let Some(dir) = &self.secrets_dir
            && !dir.is_dir()
        {
            anyhow::bail!(
                "METASYNC_SECRETS_DIR is not a directory: {}",
                dir.display()
            );
        }

        if !(1..=64).contains(&self.engine.workers) {
            anyhow::bail!(
                "METASYNC_WORKERS must be between 1 and 64. Got: {}",
                self.engine.workers
            );
        }

        if !(1..=3600).contains(&self.engine.cycle_timeout_secs) {
            anyhow::bail!(
                "METASYNC_CYCLE_TIMEOUT_SECS must be between 1 and 3600 seconds. Got: {}",
                self.engine.cycle_timeout_secs
            );
        }

        self.engine
            .validate()
            .context("Invalid engine configuration")?;

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "METASYNC_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }
}

/// Parse an optional numeric environment variable
fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} must be a number. Got '{}': {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return MetasyncExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return MetasyncExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return MetasyncExitCode::ConfigError.into();
    }

    info!("Starting metasyncd daemon");
    info!(
        config = %config.config_path.display(),
        status = %config.status_path.display(),
        workers = config.engine.workers,
        mode = if config.dry_run { "dry-run" } else { "live" },
        "Configuration loaded"
    );

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return MetasyncExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config).await {
            error!("Daemon error: {:#}", e);
            MetasyncExitCode::RuntimeError
        } else {
            MetasyncExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon until a shutdown signal
async fn run_daemon(config: Config) -> Result<()> {
    let store = Arc::new(
        FileConfigStore::open(&config.config_path, &config.status_path)
            .await
            .context("Failed to open config store")?,
    );

    let secrets: Arc<dyn SecretReader> = match &config.secrets_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "Reading credentials from mounted secrets");
            Arc::new(DirectorySecretReader::new(dir))
        }
        None => {
            warn!("METASYNC_SECRETS_DIR not set; configs with credentials will fail to resolve");
            Arc::new(MemorySecretReader::new())
        }
    };

    if config.dry_run {
        warn!("Running in DRY-RUN mode - targets will not be modified");
    }

    let registry = Arc::new(
        InstanceRegistry::new(Arc::new(DaemonFactory::new(config.dry_run)), secrets)
            .with_eviction_hook(Arc::new(|name: &str, old: u64, new: u64| {
                info!(name, old_generation = old, new_generation = new, "Rebuilding instance");
            })),
    );

    let config_store: Arc<dyn ConfigStore> = store.clone();
    let (engine, events) =
        SyncEngine::new(Arc::clone(&config_store), registry).with_events(EVENT_CHANNEL_CAPACITY);
    tokio::spawn(log_events(events));

    let controller = Arc::new(
        Controller::new(Arc::new(engine), config_store, config.engine.clone())
            .context("Failed to create controller")?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn({
        let controller = Arc::clone(&controller);
        async move { controller.run(shutdown_rx).await }
    });

    info!("Daemon initialized successfully");

    tokio::select! {
        signal = wait_for_shutdown(&store) => {
            let signal = signal?;
            info!("Received shutdown signal: {}", signal);
        }
        result = &mut handle => {
            // Controller only returns early on failure
            result.context("Controller task panicked")??;
            anyhow::bail!("Controller stopped unexpectedly");
        }
    }

    info!("Shutting down daemon");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
        Ok(joined) => {
            joined.context("Controller task panicked")??;
            info!("Controller stopped");
            Ok(())
        }
        Err(_) => Err(anyhow::anyhow!(
            "Shutdown timeout after {:?}",
            SHUTDOWN_TIMEOUT
        )),
    }
}

/// Log engine events as they arrive
async fn log_events(mut events: mpsc::Receiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::TargetApplied { spec, target, added, removed } => {
                info!(spec = %spec, target_name = %target, added, removed, "Target updated");
            }
            EngineEvent::CycleFinished { spec, phase, ready } => {
                info!(spec = %spec, ?phase, ready, "Cycle finished");
            }
            other => debug!(event = ?other, "Engine event"),
        }
    }
}

/// Wait for SIGTERM or SIGINT, reloading the config document on SIGHUP
#[cfg(unix)]
async fn wait_for_shutdown(store: &FileConfigStore) -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGHUP handler: {}", e))?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => return Ok("SIGTERM"),
            _ = sigint.recv() => return Ok("SIGINT"),
            _ = sighup.recv() => match store.reload().await {
                Ok(changes) => info!(changes, "Reloaded config document"),
                Err(e) => error!("Config reload failed: {}", e),
            },
        }
    }
}

/// Wait for CTRL-C
///
/// Fallback implementation for non-Unix platforms; the config document is
/// only read at startup and on lookups.
#[cfg(not(unix))]
async fn wait_for_shutdown(_store: &FileConfigStore) -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &std::path::Path) -> Config {
        let config_path = dir.join("config.json");
        std::fs::write(&config_path, "{}").unwrap();
        Config {
            config_path,
            status_path: dir.join("status.json"),
            secrets_dir: None,
            engine: EngineConfig::default(),
            dry_run: false,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(config(dir.path()).validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let mut cfg = config(dir.path());
        cfg.engine.workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = config(dir.path());
        cfg.log_level = "verbose".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = config(dir.path());
        cfg.status_path = dir.path().join("missing").join("status.json");
        assert!(cfg.validate().is_err());

        let mut cfg = config(dir.path());
        cfg.config_path = dir.path().join("absent.json");
        assert!(cfg.validate().is_err());

        let mut cfg = config(dir.path());
        cfg.secrets_dir = Some(dir.path().join("no-secrets"));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        unsafe { std::env::set_var("METASYNC_TEST_PARSE_VAR", "12x") };
        assert!(parse_var::<u64>("METASYNC_TEST_PARSE_VAR").is_err());
        unsafe { std::env::set_var("METASYNC_TEST_PARSE_VAR", " 12 ") };
        assert_eq!(parse_var::<u64>("METASYNC_TEST_PARSE_VAR").unwrap(), Some(12));
        assert_eq!(parse_var::<u64>("METASYNC_TEST_PARSE_VAR_UNSET").unwrap(), None);
    }
}

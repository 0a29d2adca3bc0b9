//! Runtime bootstrap: config, telemetry, event bus, engine and background loops.
//!
//! # Design
//! - `start` reads configuration from the environment and installs the global
//!   subscriber; `start_with` takes both as given so tests can build several runtimes.
//! - Background loops stop cooperatively on shutdown and are joined before returning.

use std::sync::Arc;

use salvor_config::{SalvorConfig, load_config, normalize_recovery_policy};
use salvor_events::EventBus;
use salvor_recovery::{RecoveryEngine, RecoveryEngineDeps};
use salvor_telemetry::{GlobalContextGuard, LogFormat, LoggingConfig, Metrics, record_app_mode};
use salvor_torrent_core::{EngineClient, RecoveryRefresh, TorrentInspector};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};

/// Collaborators supplied by the host application.
pub struct RuntimeDependencies {
    /// Engine client used by recovery flows.
    pub client: Arc<dyn EngineClient>,
    /// Source of torrent snapshots for background passes.
    pub inspector: Arc<dyn TorrentInspector>,
    /// Optional hook invoked after each resolution.
    pub refresh: Option<Arc<dyn RecoveryRefresh>>,
}

/// Running recovery engine with its background loops.
pub struct RecoveryRuntime {
    engine: RecoveryEngine,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RecoveryRuntime {
    /// Load configuration from the environment, install logging and start the engine.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when configuration cannot be loaded or logging cannot be installed.
    pub fn start(dependencies: RuntimeDependencies) -> AppResult<Self> {
        let config = load_config().map_err(|err| AppError::config("config.load", err))?;
        let logging = LoggingConfig {
            level: &config.logging.level,
            format: LogFormat::from_setting(config.logging.format.as_deref()),
            ..LoggingConfig::default()
        };
        salvor_telemetry::init_logging(&logging)
            .map_err(|err| AppError::telemetry("telemetry.init", err))?;
        let _context = GlobalContextGuard::new("bootstrap");
        info!("salvor recovery runtime bootstrap starting");
        let runtime = Self::start_with(&config, dependencies)?;
        record_app_mode("running");
        Ok(runtime)
    }

    /// Start the engine from an already loaded configuration.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when the metrics registry cannot be built.
    pub fn start_with(config: &SalvorConfig, dependencies: RuntimeDependencies) -> AppResult<Self> {
        let policy = normalize_recovery_policy(&config.recovery);
        for warning in &policy.warnings {
            warn!(warning = %warning, "recovery policy adjusted");
        }
        let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;

        let RuntimeDependencies {
            client,
            inspector,
            refresh,
        } = dependencies;
        let engine = RecoveryEngine::new(RecoveryEngineDeps {
            client,
            refresh,
            policy,
            events: EventBus::new(),
            metrics,
        });
        let shutdown = CancellationToken::new();
        let tasks = engine.spawn_background_loops(inspector, shutdown.clone());
        info!(
            background_interval_ms = config.recovery.background_interval_ms,
            backoff_cap_ms = config.recovery.backoff_cap_ms,
            "recovery engine running"
        );
        Ok(Self {
            engine,
            shutdown,
            tasks,
        })
    }

    /// Engine handle for UI callers.
    #[must_use]
    pub const fn engine(&self) -> &RecoveryEngine {
        &self.engine
    }

    /// Stop background loops and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "background task join failed");
            }
        }
        info!("salvor recovery runtime stopped");
    }
}

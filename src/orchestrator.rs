//! Composition root owning the engine, batch compiler and monitor.
//!
//! ```rust,ignore
//! let orchestrator = Orchestrator::new(OrchestratorConfig::from_env()?, Arc::new(FileCheckProcessor::new()));
//! orchestrator.start().await?;
//! let id = orchestrator.compiler().create_pdf_processing_batch(files, config, None, 0)?;
//! let snapshot = orchestrator.engine().wait_for(&id, timeout).await?;
//! orchestrator.stop().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::{info, warn};

use crate::batch::{BatchCompiler, ConfigMap, QuoteProcessor};
use crate::config::{env_bool, ConfigError};
use crate::engine::{Engine, EngineConfig, WorkflowSnapshot};
use crate::error::{EngineError, MonitorError, OrchestratorError};
use crate::monitor::{MonitorConfig, WorkflowMonitor};

/// Configuration of every component owned by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub engine: EngineConfig,
    pub monitor: MonitorConfig,
    /// Whether `start` also starts the monitor's poll loop.
    pub monitor_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            monitor: MonitorConfig::default(),
            monitor_enabled: true,
        }
    }
}

impl OrchestratorConfig {
    /// Creates configuration from environment variables.
    ///
    /// Reads the engine and monitor variables plus
    /// `QUOTEFLOW_MONITOR_ENABLED` (default: true).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            engine: EngineConfig::from_env()?,
            monitor: MonitorConfig::from_env()?,
            monitor_enabled: true,
        };
        if let Some(enabled) = env_bool("QUOTEFLOW_MONITOR_ENABLED")? {
            config.monitor_enabled = enabled;
        }
        Ok(config)
    }

    /// Applies monitor options found in a batch configuration map.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a monitor option is malformed.
    pub fn apply_options(mut self, options: &ConfigMap) -> Result<Self, ConfigError> {
        self.monitor = self.monitor.apply_options(options)?;
        Ok(self)
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorConfig) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_monitor_enabled(mut self, enabled: bool) -> Self {
        self.monitor_enabled = enabled;
        self
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any component config is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.monitor.validate()
    }
}

/// Owns one engine, one batch compiler and one monitor.
pub struct Orchestrator {
    config: OrchestratorConfig,
    engine: Arc<Engine>,
    compiler: BatchCompiler,
    monitor: WorkflowMonitor,
}

impl Orchestrator {
    /// Wires the components together. Nothing runs until [`start`](Self::start).
    pub fn new(config: OrchestratorConfig, processor: Arc<dyn QuoteProcessor>) -> Self {
        let engine = Arc::new(Engine::new(config.engine.clone()));
        let compiler = BatchCompiler::new(Arc::clone(&engine), processor);
        let monitor = WorkflowMonitor::new(Arc::clone(&engine), config.monitor.clone());
        Self {
            config,
            engine,
            compiler,
            monitor,
        }
    }

    /// Wires the components around an existing monitor, e.g. one built with
    /// a custom resource sampler on the same engine.
    pub fn with_monitor(
        config: OrchestratorConfig,
        engine: Arc<Engine>,
        processor: Arc<dyn QuoteProcessor>,
        monitor: WorkflowMonitor,
    ) -> Self {
        let compiler = BatchCompiler::new(Arc::clone(&engine), processor);
        Self {
            config,
            engine,
            compiler,
            monitor,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn compiler(&self) -> &BatchCompiler {
        &self.compiler
    }

    pub fn monitor(&self) -> &WorkflowMonitor {
        &self.monitor
    }

    /// Starts the engine and, if enabled, the monitor.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError` if either component is already running.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        self.engine.start().await?;
        if self.config.monitor_enabled {
            if let Err(e) = self.monitor.start_monitoring().await {
                // Leave nothing half-started.
                if let Err(stop_err) = self.engine.stop().await {
                    warn!(error = %stop_err, "Failed to stop engine after monitor start failure");
                }
                return Err(e.into());
            }
        }
        info!(
            workers = self.config.engine.worker_pool_size,
            monitor = self.config.monitor_enabled,
            "Orchestrator started"
        );
        Ok(())
    }

    /// Waits for every workflow in `ids` to finish, in order of `ids`.
    ///
    /// # Errors
    ///
    /// Returns the first `EngineError` encountered (unknown id or timeout).
    pub async fn wait_all(
        &self,
        ids: &[String],
        timeout: Duration,
    ) -> Result<Vec<WorkflowSnapshot>, EngineError> {
        try_join_all(ids.iter().map(|id| self.engine.wait_for(id, timeout))).await
    }

    /// Stops the monitor, then the engine.
    ///
    /// Stopping an orchestrator whose monitor is disabled is fine.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError` if the engine was not running or workers
    /// did not finish within the grace period.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        match self.monitor.stop_monitoring().await {
            Ok(()) | Err(MonitorError::NotRunning) => {}
            Err(e) => return Err(e.into()),
        }
        self.engine.stop().await?;

        // Catch workflows that finished since the last tick.
        self.monitor.poll_once();
        info!("Orchestrator stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("engine", &self.engine)
            .field("monitor", &self.monitor)
            .finish()
    }
}

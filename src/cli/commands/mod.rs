//! Command implementations for fieldsync.
//!
//! Every command returns the text to print on stdout.

mod cache;
mod sync;

use std::sync::Arc;

use tracing::info;

pub use cache::cache;
pub use sync::{cancel, cleanup, enqueue, list, probe, retry, run, show, status};

use crate::config::{Config, Paths};
use crate::error::FieldsyncError;
use crate::features::cache::FieldCache;
use crate::features::sync::{
    ConnectivityMonitor, EngineConfig, HealthProbe, HttpRemote, RemoteExecutor, SyncEngine,
};
use crate::storage::{Database, LocalStore};

/// Resolved paths, loaded configuration and the open database.
pub struct Context {
    pub paths: Paths,
    pub config: Config,
    db: Arc<Database>,
}

impl Context {
    /// Load the configuration and open the database under `paths`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the config file
    /// is invalid or the database cannot be opened.
    pub fn open(paths: Paths) -> Result<Self, FieldsyncError> {
        paths.ensure_dirs()?;
        let config = Config::load_from_path(&paths.config_file)?;
        let db = Arc::new(Database::open_at(&paths.database)?);

        Ok(Self { paths, config, db })
    }

    /// Build a context over an existing database.
    #[must_use]
    pub fn with_database(paths: Paths, config: Config, db: Arc<Database>) -> Self {
        Self { paths, config, db }
    }

    /// The offline cache.
    #[must_use]
    pub fn cache(&self) -> FieldCache {
        FieldCache::new(LocalStore::new(Arc::clone(&self.db)))
    }

    /// Build a sync engine delivering to the configured server.
    ///
    /// Commands run one engine per invocation, so processing on enqueue is
    /// left to `run`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn engine(&self, online: bool) -> Result<SyncEngine, FieldsyncError> {
        let remote = HttpRemote::new(&self.config.server)?;
        let executor = RemoteExecutor::new(remote, self.cache());

        Ok(
            SyncEngine::builder(Arc::clone(&self.db), Arc::new(executor))
                .connectivity(Arc::new(ConnectivityMonitor::new(online)))
                .settings(&self.config.sync)
                .config(EngineConfig {
                    process_on_enqueue: false,
                    ..EngineConfig::from_settings(&self.config.sync)
                })
                .build(),
        )
    }

    /// Probe the server and report whether it is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub async fn probe_online(&self) -> Result<bool, FieldsyncError> {
        let report = HealthProbe::new(&self.config.server)?.probe().await;
        info!(url = %report.url, quality = %report.quality, "Probed server");
        Ok(report.quality.is_online())
    }
}

//! # MedSync
//!
//! Offline-first, encrypted-at-rest synchronization engine for clinical
//! (FHIR-style) resources.

pub mod config;
pub mod db;
pub mod sync;

use config::{ConfigError, EngineConfig};
use db::{Database, DbError};
use std::sync::Arc;
use sync::{
    ApiError, CryptoError, CryptoService, FhirApiClient, NetworkMonitor, NetworkStatus,
    SchedulerError, SyncEngine, SyncEngineError, SyncScheduler,
};

/// Install the `env_logger` backend (`RUST_LOG`, default `info`)
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

// ============================================================================
// Bootstrap
// ============================================================================

/// A wired-up engine talking to a FHIR server over HTTP
pub struct MedSync {
    pub engine: Arc<SyncEngine>,
    pub client: Arc<FhirApiClient>,
    pub scheduler: SyncScheduler,
}

impl MedSync {
    /// Validate config, open the database, derive keys and recover interrupted work
    ///
    /// `network` is the connectivity reading at startup; later readings go
    /// through `engine.network()`.
    pub fn open(
        config: EngineConfig,
        secret: &str,
        account_id: &str,
        network: NetworkStatus,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        log::info!("Database path: {:?}", config.database_path);

        let db = Arc::new(Database::new(config.database_path.clone())?);

        let crypto = Arc::new(CryptoService::new(config.kdf_iterations));
        crypto.initialize(secret, account_id)?;

        let client = Arc::new(FhirApiClient::new(&config.server_url, config.request_timeout())?);
        let monitor = NetworkMonitor::new(&config.network, network);

        let engine = Arc::new(SyncEngine::new(config, db, crypto, client.clone(), monitor));
        let recovered = engine.recover()?;
        log::info!("Sync engine ready ({} resources awaiting push)", recovered);

        Ok(Self {
            engine,
            client,
            scheduler: SyncScheduler::new(),
        })
    }

    /// Start background draining and pulling (needs a Tokio runtime)
    pub fn start(&self) -> Result<(), SchedulerError> {
        self.scheduler.start(self.engine.clone())
    }

    /// Stop the scheduler and discard key material
    pub fn shutdown(&self) {
        if self.scheduler.is_running() {
            if let Err(e) = self.scheduler.stop() {
                log::warn!("Scheduler stop failed: {}", e);
            }
        }
        self.engine.shutdown();
    }
}

/// Startup failures
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database initialization failed: {0}")]
    Database(#[from] DbError),

    #[error("Crypto initialization failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("HTTP client setup failed: {0}")]
    Api(#[from] ApiError),

    #[error("Recovery failed: {0}")]
    Engine(#[from] SyncEngineError),
}

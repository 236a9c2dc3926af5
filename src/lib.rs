//! Fold Engine - resumable membership-proof folding
//!
//! A client-resident engine that incrementally builds one recursive
//! zero-knowledge proof per category, attesting to a set of membership
//! events without revealing which ones, and keeps partial progress durable
//! across reloads, tab closures and multi-tab races.
//!
//! ## Architecture
//!
//! - **ChunkStore**: resumable download of the large proving parameters
//! - **FoldRecordStore**: one durable record per category (proof, fold
//!   count, included members, obfuscation flag)
//! - **LeaseCoordinator**: time-boxed advisory lock so only one context
//!   folds at a time; expired leases are stolen, never fatal
//! - **FoldOrchestrator**: the state machine sequencing params, member
//!   selection, proving and persistence
//! - **FoldWorker**: background task driving the orchestrator over a typed
//!   command channel
//!
//! The proving math and the networked collaborators stay outside, behind
//! the `ProvingBackend` and `ChunkSource` traits and the `MemberPool` input.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/fold-engine/
//! ├── engine.sled/          # One database, three trees:
//! │   ├── param_chunks      #   BE-u32 index -> chunk payload
//! │   ├── folds             #   category -> FoldRecord (msgpack)
//! │   └── lease             #   single workspace lease (msgpack)
//! └── config.toml           # Configuration
//! ```

pub mod chunk_store;
pub mod config;
pub mod error;
pub mod lease;
pub mod orchestrator;
pub mod params;
pub mod progress;
pub mod prover;
pub mod record_store;
pub mod registry;
pub mod worker;

// Re-exports
pub use chunk_store::ChunkStore;
pub use config::Config;
pub use error::FoldError;
pub use lease::{LeaseCoordinator, LeaseToken};
pub use orchestrator::{FoldOrchestrator, RunReport};
pub use params::{ChunkSource, Params};
pub use progress::{FoldEvent, ProgressHub};
pub use prover::{effective_iterations, CompressedProof, Proof, ProvingBackend};
pub use record_store::{Category, FoldRecord, FoldRecordStore, FoldStatus};
pub use registry::{Attestation, Member, MemberPool};
pub use worker::{FoldHandle, FoldWorker};

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The assembled engine: one sled database and the stores over it.
pub struct FoldEngine {
    config: Config,
    db: sled::Db,
    chunks: ChunkStore,
    records: FoldRecordStore,
    lease: LeaseCoordinator,
    progress: ProgressHub,
}

impl FoldEngine {
    /// Open (or create) the engine database under the configured directory
    pub async fn open(config: Config) -> Result<Self, FoldError> {
        tokio::fs::create_dir_all(&config.storage_dir).await?;

        let db = sled::Config::new()
            .path(config.db_path())
            .cache_capacity(config.db_cache_bytes)
            .open()?;

        info!(path = %config.db_path().display(), "Opened fold engine database");
        Self::from_db(config, db)
    }

    /// Open a throwaway engine on a temporary database (for tests)
    pub fn open_temporary(config: Config) -> Result<Self, FoldError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(config, db)
    }

    fn from_db(config: Config, db: sled::Db) -> Result<Self, FoldError> {
        let chunks = ChunkStore::new(db.open_tree("param_chunks")?, config.chunk_count);
        let records = FoldRecordStore::new(db.open_tree("folds")?);
        let lease = LeaseCoordinator::new(
            db.open_tree("lease")?,
            Duration::from_millis(config.lease_duration_ms),
        );

        Ok(Self {
            config,
            db,
            chunks,
            records,
            lease,
            progress: ProgressHub::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    pub fn record_store(&self) -> &FoldRecordStore {
        &self.records
    }

    pub fn lease(&self) -> &LeaseCoordinator {
        &self.lease
    }

    pub fn progress(&self) -> &ProgressHub {
        &self.progress
    }

    /// Progress state for the foreground, from durable data alone
    pub fn status(&self, category: Category) -> Result<FoldStatus, FoldError> {
        self.records.status(category)
    }

    /// Build an orchestrator over this engine's stores
    pub fn orchestrator(
        &self,
        backend: Arc<dyn ProvingBackend>,
        source: Arc<dyn ChunkSource>,
    ) -> FoldOrchestrator {
        FoldOrchestrator::new(
            self.chunks.clone(),
            self.records.clone(),
            self.lease.clone(),
            backend,
            source,
            self.progress.clone(),
        )
    }

    /// Spawn the background folding worker for this engine
    pub fn spawn_worker(
        &self,
        backend: Arc<dyn ProvingBackend>,
        source: Arc<dyn ChunkSource>,
    ) -> FoldHandle {
        FoldWorker::spawn(self.orchestrator(backend, source), self.progress.clone())
    }

    /// Clear chunks, records and the lease. Explicit user action only.
    pub fn reset(&self) -> Result<(), FoldError> {
        self.chunks.reset()?;
        self.records.reset()?;
        self.lease.reset()?;
        self.db.flush()?;
        info!("Reset fold engine storage");
        Ok(())
    }
}

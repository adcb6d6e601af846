// Kernel - core infrastructure with all dependencies.
//
// The kernel holds the storage, transport, and embedding seams and is
// threaded explicitly through every component; there are no process-wide
// singletons, so tests instantiate independent kernels.

pub mod broker;
pub mod embedding;
pub mod handlers;
pub mod jobs;
pub mod vector;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;

use broker::Broker;
use embedding::{Embedder, HashEmbedder};
use jobs::{IngestService, JobStore, OperationCatalog, PostgresJobStore, StatusReader};
use vector::{PgVectorIndex, VectorIndex};

/// Kernel holds all server dependencies.
pub struct Kernel {
    pub config: Config,
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn Broker>,
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<dyn VectorIndex>,
}

impl Kernel {
    /// Creates a kernel from explicit dependencies.
    pub fn new(
        config: Config,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorIndex>,
    ) -> Self {
        Self {
            config,
            store,
            broker,
            embedder,
            vectors,
        }
    }

    /// Production wiring: Postgres-backed ledger and vector index, the
    /// configured broker, and the configured embedding adapter.
    pub fn postgres(config: Config, pool: PgPool, broker: Arc<dyn Broker>) -> Self {
        let embedder = Arc::new(HashEmbedder::new(
            config.embedding_model.clone(),
            config.embedding_model_ver.clone(),
            config.vector_size,
        ));
        Self {
            store: Arc::new(PostgresJobStore::new(pool.clone())),
            vectors: Arc::new(PgVectorIndex::new(pool)),
            broker,
            embedder,
            config,
        }
    }

    /// The ingest service over this kernel's store and operation catalog.
    pub fn ingest(&self) -> IngestService {
        IngestService::new(
            Arc::clone(&self.store),
            OperationCatalog::standard(),
            self.config.job_default_max_attempts,
        )
    }

    /// The status reader over this kernel's store.
    pub fn status_reader(&self) -> StatusReader {
        StatusReader::new(Arc::clone(&self.store), self.config.status_vocabulary_mode)
    }
}

//! memkeep-memory: Embedded vector store and user-partitioned memory engine.
//!
//! Provides:
//! - SQLite-backed vector storage with metadata filters and L2/cosine/ip distance
//! - Multiple embedding provider support (local fastembed, OpenAI, Ollama, Gemini, hash)
//! - Memory add, semantic search, newest-first listing, JSON export/import and stats

pub mod embeddings;
pub mod engine;
pub mod error;
pub mod record;
pub mod store;

pub use embeddings::{EmbeddingProvider, build_provider};
pub use engine::{DEFAULT_SEARCH_LIMIT, MemoryEngine};
pub use error::{EngineError, MemoryError, MemoryResult, Operation};
pub use record::{
    AddOutcome, ExportFile, ExportOutcome, ImportOutcome, MemoryMatch, MemoryMetadata, StatsReport,
};
pub use store::{DistanceMetric, MetadataFilter, SqliteVectorStore, VectorStore};

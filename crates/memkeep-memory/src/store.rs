//! SQLite-backed persistent vector store.
//!
//! A store holds named collections of documents. Every document carries an
//! id, its text, a JSON metadata object and a fixed-length embedding.
//! Nearest-neighbour queries are exact scans over the rows matching a
//! metadata filter.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub use memkeep_config::DistanceMetric;

use crate::error::{MemoryError, MemoryResult};

/// Metadata attached to a stored document.
pub type Metadata = serde_json::Map<String, Value>;

/// A document to insert.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub metadata: Metadata,
}

/// A document as returned by [`VectorStore::get`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
}

/// A document returned by [`VectorStore::query`] with its distance to the query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDocument {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
    pub distance: f32,
}

/// Conjunction of `metadata[key] == value` clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    clauses: Vec<(String, Value)>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality clause.
    pub fn with_eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((key.into(), value.into()));
        self
    }

    /// Render the filter as SQL appended after `collection = ?1`.
    fn to_sql(&self) -> MemoryResult<(String, Vec<SqlValue>)> {
        let mut sql = String::new();
        let mut params = Vec::new();
        for (key, value) in &self.clauses {
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(MemoryError::InvalidFilter(format!(
                    "metadata key {key:?} must be non-empty and contain only [A-Za-z0-9_]"
                )));
            }
            params.push(SqlValue::Text(format!("$.{key}")));
            let path_idx = params.len() + 1;
            let bound = match value {
                Value::Null => {
                    sql.push_str(&format!(" AND json_extract(metadata, ?{path_idx}) IS NULL"));
                    continue;
                }
                Value::String(s) => SqlValue::Text(s.clone()),
                Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
                Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                    (Some(i), _) => SqlValue::Integer(i),
                    (None, Some(f)) => SqlValue::Real(f),
                    (None, None) => {
                        return Err(MemoryError::InvalidFilter(format!(
                            "unsupported number {n} for key {key}"
                        )));
                    }
                },
                Value::Array(_) | Value::Object(_) => {
                    return Err(MemoryError::InvalidFilter(format!(
                        "filter on {key} must compare against a scalar"
                    )));
                }
            };
            params.push(bound);
            sql.push_str(&format!(
                " AND json_extract(metadata, ?{path_idx}) = ?{}",
                path_idx + 1
            ));
        }
        Ok((sql, params))
    }
}

/// Durable collection of embedded documents.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;
    /// Embedding model the stored vectors were produced with.
    fn embedding_model(&self) -> &str;
    /// Dimension every stored and queried vector must have.
    fn dimensions(&self) -> usize;
    /// Distance function used by [`query`](Self::query).
    fn metric(&self) -> DistanceMetric;
    /// Insert documents atomically. Durable once this returns.
    async fn insert(&self, documents: Vec<NewDocument>) -> MemoryResult<()>;
    /// Up to `k` documents matching `filter`, closest first.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> MemoryResult<Vec<ScoredDocument>>;
    /// All documents matching `filter`, in insertion order.
    async fn get(&self, filter: &MetadataFilter) -> MemoryResult<Vec<StoredDocument>>;
    /// Total documents in the collection, ignoring any partition.
    async fn count(&self) -> MemoryResult<usize>;
}

/// Vector store backed by a single SQLite database file.
pub struct SqliteVectorStore {
    conn: Arc<Mutex<Connection>>,
    collection: String,
    embedding_model: String,
    dimensions: usize,
    metric: DistanceMetric,
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS collections (
        name TEXT PRIMARY KEY,
        embedding_model TEXT,
        dimensions INTEGER NOT NULL,
        metric TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS documents (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        collection TEXT NOT NULL REFERENCES collections(name),
        id TEXT NOT NULL UNIQUE,
        document TEXT NOT NULL,
        metadata TEXT NOT NULL,
        embedding BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
";

impl SqliteVectorStore {
    /// Database file name inside the data directory.
    pub const DB_FILE: &'static str = "memkeep.sqlite3";

    /// Open or create the store under `data_dir`, creating the collection if absent.
    ///
    /// An existing collection must have been written by the same embedding
    /// model with the same dimensions.
    pub fn open(
        data_dir: &Path,
        collection: &str,
        embedding_model: &str,
        dimensions: usize,
        metric: DistanceMetric,
    ) -> MemoryResult<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            MemoryError::Config(format!(
                "cannot create store directory {}: {e}",
                data_dir.display()
            ))
        })?;
        let db_path = data_dir.join(Self::DB_FILE);
        let conn = Connection::open(&db_path).map_err(|e| {
            MemoryError::Config(format!("cannot open store {}: {e}", db_path.display()))
        })?;

        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        let store = Self::init(conn, collection, embedding_model, dimensions, metric)?;

        info!(
            path = %db_path.display(),
            collection = %store.collection,
            model = %store.embedding_model,
            dimensions = store.dimensions,
            metric = %store.metric,
            "Vector store opened"
        );
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory(
        collection: &str,
        embedding_model: &str,
        dimensions: usize,
        metric: DistanceMetric,
    ) -> MemoryResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Self::init(conn, collection, embedding_model, dimensions, metric)
    }

    fn init(
        conn: Connection,
        collection: &str,
        embedding_model: &str,
        dimensions: usize,
        metric: DistanceMetric,
    ) -> MemoryResult<Self> {
        if collection.is_empty() {
            return Err(MemoryError::Config("collection name must not be empty".into()));
        }
        if dimensions == 0 {
            return Err(MemoryError::Config("vector dimensions must be positive".into()));
        }

        conn.execute_batch(SCHEMA)?;
        Self::migrate(&conn)?;

        let existing = conn.query_row(
            "SELECT dimensions, metric, embedding_model FROM collections WHERE name = ?1",
            rusqlite::params![collection],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        );

        let metric = match existing {
            Ok((stored_dims, stored_metric, stored_model)) => {
                match stored_model {
                    Some(stored) if stored != embedding_model => {
                        return Err(MemoryError::Config(format!(
                            "collection {collection} holds vectors from embedding model \
                             {stored:?}, but the configured model is {embedding_model:?}; \
                             use the original model or a different collection"
                        )));
                    }
                    Some(_) => {}
                    None => {
                        warn!(
                            collection,
                            model = embedding_model,
                            "Collection has no recorded embedding model, adopting the configured one"
                        );
                        conn.execute(
                            "UPDATE collections SET embedding_model = ?1 WHERE name = ?2",
                            rusqlite::params![embedding_model, collection],
                        )?;
                    }
                }
                if stored_dims as usize != dimensions {
                    return Err(MemoryError::DimensionMismatch {
                        expected: stored_dims as usize,
                        actual: dimensions,
                    });
                }
                let stored: DistanceMetric = stored_metric.parse().map_err(|e: String| {
                    MemoryError::Config(format!("collection {collection}: {e}"))
                })?;
                if stored != metric {
                    warn!(
                        collection,
                        stored = %stored,
                        requested = %metric,
                        "Collection was created with a different metric, keeping the stored one"
                    );
                }
                stored
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                conn.execute(
                    "INSERT INTO collections (name, embedding_model, dimensions, metric, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        collection,
                        embedding_model,
                        dimensions as i64,
                        metric.as_str(),
                        chrono::Utc::now().to_rfc3339()
                    ],
                )?;
                info!(
                    collection,
                    model = embedding_model,
                    dimensions,
                    metric = %metric,
                    "Created collection"
                );
                metric
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            collection: collection.to_string(),
            embedding_model: embedding_model.to_string(),
            dimensions,
            metric,
        })
    }

    /// Add columns introduced after a database was first created.
    fn migrate(conn: &Connection) -> MemoryResult<()> {
        let mut stmt = conn.prepare("PRAGMA table_info(collections)")?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        if !columns.iter().any(|c| c == "embedding_model") {
            conn.execute_batch("ALTER TABLE collections ADD COLUMN embedding_model TEXT;")?;
            debug!("Added embedding_model column to collections");
        }
        Ok(())
    }

    fn check_vector(&self, vector: &[f32]) -> MemoryResult<()> {
        if vector.len() != self.dimensions {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn name(&self) -> &str {
        &self.collection
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    async fn insert(&self, documents: Vec<NewDocument>) -> MemoryResult<()> {
        for doc in &documents {
            self.check_vector(&doc.embedding)?;
        }

        let rows = documents
            .into_iter()
            .map(|doc| -> MemoryResult<_> {
                let metadata = serde_json::to_string(&Value::Object(doc.metadata))?;
                Ok((doc.id, doc.document, metadata, embedding_to_bytes(&doc.embedding)))
            })
            .collect::<MemoryResult<Vec<_>>>()?;

        let conn = self.conn.clone();
        let collection = self.collection.clone();
        tokio::task::spawn_blocking(move || -> MemoryResult<()> {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO documents (collection, id, document, metadata, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (id, document, metadata, embedding) in &rows {
                    stmt.execute(rusqlite::params![collection, id, document, metadata, embedding])?;
                }
            }
            tx.commit()?;
            debug!(collection = %collection, count = rows.len(), "Inserted documents");
            Ok(())
        })
        .await?
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> MemoryResult<Vec<ScoredDocument>> {
        self.check_vector(vector)?;
        let (clause, params) = filter.to_sql()?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let conn = self.conn.clone();
        let collection = self.collection.clone();
        let rows = tokio::task::spawn_blocking(move || -> MemoryResult<Vec<_>> {
            let conn = conn.blocking_lock();
            let sql = format!(
                "SELECT id, document, metadata, embedding FROM documents
                 WHERE collection = ?1{clause} ORDER BY seq"
            );
            let mut stmt = conn.prepare(&sql)?;
            let all_params = std::iter::once(SqlValue::Text(collection)).chain(params);
            let rows = stmt
                .query_map(rusqlite::params_from_iter(all_params), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Vec<u8>>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await??;

        let mut scored = Vec::with_capacity(rows.len());
        for (id, document, metadata, embedding) in rows {
            let dist = distance(self.metric, vector, &bytes_to_embedding(&embedding));
            scored.push(ScoredDocument {
                id,
                document,
                metadata: serde_json::from_str(&metadata)?,
                distance: dist,
            });
        }

        // Stable sort keeps insertion order for equal distances.
        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn get(&self, filter: &MetadataFilter) -> MemoryResult<Vec<StoredDocument>> {
        let (clause, params) = filter.to_sql()?;

        let conn = self.conn.clone();
        let collection = self.collection.clone();
        let rows = tokio::task::spawn_blocking(move || -> MemoryResult<Vec<_>> {
            let conn = conn.blocking_lock();
            let sql = format!(
                "SELECT id, document, metadata FROM documents
                 WHERE collection = ?1{clause} ORDER BY seq"
            );
            let mut stmt = conn.prepare(&sql)?;
            let all_params = std::iter::once(SqlValue::Text(collection)).chain(params);
            let rows = stmt
                .query_map(rusqlite::params_from_iter(all_params), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await??;

        rows.into_iter()
            .map(|(id, document, metadata)| -> MemoryResult<StoredDocument> {
                Ok(StoredDocument {
                    id,
                    document,
                    metadata: serde_json::from_str(&metadata)?,
                })
            })
            .collect()
    }

    async fn count(&self) -> MemoryResult<usize> {
        let conn = self.conn.clone();
        let collection = self.collection.clone();
        tokio::task::spawn_blocking(move || -> MemoryResult<usize> {
            let conn = conn.blocking_lock();
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                rusqlite::params![collection],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await?
    }
}

/// Distance between two vectors of equal length under `metric`.
pub fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        DistanceMetric::InnerProduct => 1.0 - a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>(),
        DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

//! User-partitioned memory operations over a vector store and an embedding provider.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use memkeep_config::MemoryConfig;

use crate::embeddings::{EmbeddingProvider, build_provider};
use crate::error::{EngineError, MemoryError, MemoryResult, Operation, OperationContext};
use crate::record::{
    AddOutcome, ExportFile, ExportOutcome, ImportFile, ImportOutcome, MemoryMatch, MemoryMetadata,
    StatsReport,
};
use crate::store::{MetadataFilter, NewDocument, SqliteVectorStore, StoredDocument, VectorStore};

/// Default number of search results.
pub const DEFAULT_SEARCH_LIMIT: usize = 3;

/// Default length of the content echoed back by [`MemoryEngine::add`].
pub const DEFAULT_PREVIEW_CHARS: usize = 100;

/// The memory engine.
///
/// Owns one embedding provider and one vector store for its whole lifetime.
/// Build it once at startup and share it behind an `Arc`; every operation is
/// scoped to a single `user_id`.
pub struct MemoryEngine {
    store: Arc<dyn VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    preview_chars: usize,
    export_dir: Option<PathBuf>,
}

impl MemoryEngine {
    /// Assemble an engine from its parts.
    ///
    /// Fails if the provider and store disagree on the embedding model or
    /// on vector dimensions.
    pub fn new(
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> MemoryResult<Self> {
        if provider.model() != store.embedding_model() {
            return Err(MemoryError::Config(format!(
                "store {} was built with embedding model {:?}, provider uses {:?}",
                store.name(),
                store.embedding_model(),
                provider.model()
            )));
        }
        if provider.dimensions() != store.dimensions() {
            return Err(MemoryError::DimensionMismatch {
                expected: store.dimensions(),
                actual: provider.dimensions(),
            });
        }
        Ok(Self {
            store,
            provider,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            export_dir: None,
        })
    }

    pub fn with_preview_chars(mut self, preview_chars: usize) -> Self {
        self.preview_chars = preview_chars;
        self
    }

    /// Directory for exports written without an explicit filename.
    pub fn with_export_dir(mut self, export_dir: impl Into<PathBuf>) -> Self {
        self.export_dir = Some(export_dir.into());
        self
    }

    /// Build the provider and open the on-disk store described by `config`.
    pub async fn open(config: &MemoryConfig) -> MemoryResult<Self> {
        let provider = build_provider(&config.embedding).await?;

        let data_dir = config.data_dir.clone();
        let collection = config.collection_name.clone();
        let model = provider.model().to_string();
        let dimensions = provider.dimensions();
        let metric = config.distance;
        let store = tokio::task::spawn_blocking(move || {
            SqliteVectorStore::open(&data_dir, &collection, &model, dimensions, metric)
        })
        .await??;

        let mut engine =
            Self::new(Arc::new(store), provider)?.with_preview_chars(config.preview_chars);
        if let Some(dir) = &config.export_dir {
            engine = engine.with_export_dir(dir);
        }
        info!(
            collection = engine.collection_name(),
            model = engine.embedding_model(),
            "Memory engine ready"
        );
        Ok(engine)
    }

    pub fn collection_name(&self) -> &str {
        self.store.name()
    }

    pub fn embedding_model(&self) -> &str {
        self.provider.model()
    }

    /// Store a new memory for `user_id`.
    ///
    /// Empty content is accepted and stored with `content_length = 0`.
    pub async fn add(&self, content: &str, user_id: &str) -> Result<AddOutcome, EngineError> {
        self.add_record(content, user_id).await.during(Operation::Add)
    }

    /// Up to `limit` memories of `user_id` closest to `query`, best first.
    pub async fn search(
        &self,
        query: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryMatch>, EngineError> {
        self.search_records(query, user_id, limit)
            .await
            .during(Operation::Search)
    }

    /// Every memory of `user_id`, newest first.
    pub async fn list_all(&self, user_id: &str) -> Result<Vec<MemoryMatch>, EngineError> {
        self.list_records(user_id).await.during(Operation::List)
    }

    /// Write all memories of `user_id` to a JSON file, overwriting it.
    ///
    /// Without `filename` the file is `memories_export_<YYYYMMDD_HHMMSS>.json`
    /// in the export directory, or the working directory when none is set.
    /// Two such exports within the same second write the same file.
    pub async fn export_to_file(
        &self,
        user_id: &str,
        filename: Option<&Path>,
    ) -> Result<ExportOutcome, EngineError> {
        self.export_records(user_id, filename)
            .await
            .during(Operation::Export)
    }

    /// Add every non-empty `memory` entry of an export file under `user_id`.
    ///
    /// Stops at the first failing entry; entries added before it are kept.
    pub async fn import_from_file(
        &self,
        filename: &Path,
        user_id: &str,
    ) -> Result<ImportOutcome, EngineError> {
        self.import_records(filename, user_id)
            .await
            .during(Operation::Import)
    }

    /// Collection-wide statistics (not partitioned by user).
    pub async fn stats(&self) -> StatsReport {
        match self.store.count().await {
            Ok(total_memories) => StatsReport::Collection {
                total_memories,
                collection_name: self.collection_name().to_string(),
                embedding_model: self.embedding_model().to_string(),
            },
            Err(e) => {
                warn!(error = %e, "Failed to read collection stats");
                StatsReport::Error {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Release the engine. Nothing is buffered, so this only logs.
    pub async fn shutdown(&self) {
        info!(collection = self.collection_name(), "Memory engine shut down");
    }

    async fn add_record(&self, content: &str, user_id: &str) -> MemoryResult<AddOutcome> {
        require_user(user_id)?;

        let id = Uuid::new_v4().to_string();
        let embedding = self.provider.embed(content).await?;
        let content_length = content.chars().count();
        let metadata = MemoryMetadata::new(user_id, now_timestamp(), content_length);

        self.store
            .insert(vec![NewDocument {
                id: id.clone(),
                embedding,
                document: content.to_string(),
                metadata: metadata.into_map()?,
            }])
            .await?;

        debug!(%id, user_id, content_length, "Saved memory");
        Ok(AddOutcome {
            message: format!(
                "Successfully saved memory: {}",
                preview(content, self.preview_chars)
            ),
            id,
        })
    }

    async fn search_records(
        &self,
        query: &str,
        user_id: &str,
        limit: usize,
    ) -> MemoryResult<Vec<MemoryMatch>> {
        require_user(user_id)?;
        if limit == 0 {
            return Err(MemoryError::InvalidInput("limit must be at least 1".into()));
        }

        let vector = self.provider.embed(query).await?;
        let hits = self
            .store
            .query(&vector, limit, &partition(user_id))
            .await?;

        debug!(user_id, limit, hits = hits.len(), "Searched memories");
        hits.into_iter()
            .map(|hit| -> MemoryResult<MemoryMatch> {
                Ok(MemoryMatch {
                    memory: hit.document,
                    id: hit.id,
                    metadata: MemoryMetadata::from_map(hit.metadata)?,
                    similarity_score: Some(1.0 - hit.distance),
                })
            })
            .collect()
    }

    async fn list_records(&self, user_id: &str) -> MemoryResult<Vec<MemoryMatch>> {
        require_user(user_id)?;

        let docs = self.store.get(&partition(user_id)).await?;
        let mut memories = docs
            .into_iter()
            .map(stored_to_match)
            .collect::<MemoryResult<Vec<_>>>()?;

        // Stable: equal timestamps keep store order.
        memories.sort_by(|a, b| b.metadata.timestamp_key().cmp(a.metadata.timestamp_key()));
        Ok(memories)
    }

    async fn export_records(
        &self,
        user_id: &str,
        filename: Option<&Path>,
    ) -> MemoryResult<ExportOutcome> {
        let memories = self.list_records(user_id).await?;
        let path = match filename {
            Some(path) => path.to_path_buf(),
            None => {
                let name = default_export_filename(&chrono::Local::now());
                match &self.export_dir {
                    Some(dir) => dir.join(name),
                    None => PathBuf::from(name),
                }
            }
        };

        let export = ExportFile {
            export_timestamp: now_timestamp(),
            user_id: user_id.to_string(),
            total_memories: memories.len(),
            memories,
        };
        let json = serde_json::to_string_pretty(&export)?;
        tokio::fs::write(&path, json).await?;

        info!(user_id, count = export.total_memories, path = %path.display(), "Exported memories");
        Ok(ExportOutcome {
            path,
            count: export.total_memories,
        })
    }

    async fn import_records(&self, path: &Path, user_id: &str) -> MemoryResult<ImportOutcome> {
        require_user(user_id)?;

        let raw = tokio::fs::read_to_string(path).await?;
        let file: ImportFile = serde_json::from_str(&raw)?;

        let mut count = 0;
        for entry in file.memories {
            let Some(content) = entry.memory.filter(|m| !m.is_empty()) else {
                continue;
            };
            if let Err(e) = self.add_record(&content, user_id).await {
                warn!(
                    path = %path.display(),
                    imported = count,
                    error = %e,
                    "Import aborted, earlier entries remain stored"
                );
                return Err(e);
            }
            count += 1;
        }

        info!(user_id, count, path = %path.display(), "Imported memories");
        Ok(ImportOutcome {
            path: path.to_path_buf(),
            count,
        })
    }
}

fn require_user(user_id: &str) -> MemoryResult<()> {
    if user_id.is_empty() {
        return Err(MemoryError::InvalidInput("user_id must not be empty".into()));
    }
    Ok(())
}

fn partition(user_id: &str) -> MetadataFilter {
    MetadataFilter::new().with_eq("user_id", user_id)
}

fn stored_to_match(doc: StoredDocument) -> MemoryResult<MemoryMatch> {
    Ok(MemoryMatch {
        memory: doc.document,
        id: doc.id,
        metadata: MemoryMetadata::from_map(doc.metadata)?,
        similarity_score: None,
    })
}

/// Current UTC time with fixed microsecond precision, so string order is time order.
fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// First `max_chars` characters of `content`, with `...` appended when cut.
fn preview(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}

/// `memories_export_<YYYYMMDD_HHMMSS>.json` for the given instant.
pub fn default_export_filename<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("memories_export_{}.json", now.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbedding;
    use crate::store::{Metadata, ScoredDocument};
    use async_trait::async_trait;
    use memkeep_config::DistanceMetric;
    use serde_json::json;

    fn engine_with_store() -> (MemoryEngine, Arc<SqliteVectorStore>) {
        let store = Arc::new(
            SqliteVectorStore::open_in_memory(
                "test",
                HashEmbedding::MODEL,
                HashEmbedding::DEFAULT_DIMENSIONS,
                DistanceMetric::L2,
            )
            .unwrap(),
        );
        let engine = MemoryEngine::new(store.clone(), Arc::new(HashEmbedding::default())).unwrap();
        (engine, store)
    }

    fn engine() -> MemoryEngine {
        engine_with_store().0
    }

    fn sorted_contents(memories: &[MemoryMatch]) -> Vec<String> {
        let mut v: Vec<String> = memories.iter().map(|m| m.memory.clone()).collect();
        v.sort();
        v
    }

    struct FailingProvider;

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        fn id(&self) -> &str {
            "failing"
        }
        fn model(&self) -> &str {
            HashEmbedding::MODEL
        }
        fn dimensions(&self) -> usize {
            HashEmbedding::DEFAULT_DIMENSIONS
        }
        async fn embed_batch(&self, _texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
            Err(MemoryError::Embedding("model unavailable".into()))
        }
    }

    /// Hash embeddings that refuse any text mentioning "poison".
    #[derive(Default)]
    struct PickyProvider(HashEmbedding);

    #[async_trait]
    impl EmbeddingProvider for PickyProvider {
        fn id(&self) -> &str {
            "picky"
        }
        fn model(&self) -> &str {
            HashEmbedding::MODEL
        }
        fn dimensions(&self) -> usize {
            self.0.dimensions()
        }
        async fn embed_batch(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(MemoryError::Embedding("refused".into()));
            }
            self.0.embed_batch(texts).await
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl VectorStore for BrokenStore {
        fn name(&self) -> &str {
            "broken"
        }
        fn embedding_model(&self) -> &str {
            HashEmbedding::MODEL
        }
        fn dimensions(&self) -> usize {
            HashEmbedding::DEFAULT_DIMENSIONS
        }
        fn metric(&self) -> DistanceMetric {
            DistanceMetric::L2
        }
        async fn insert(&self, _documents: Vec<NewDocument>) -> MemoryResult<()> {
            Err(MemoryError::Io(std::io::Error::other("disk full")))
        }
        async fn query(
            &self,
            _vector: &[f32],
            _k: usize,
            _filter: &MetadataFilter,
        ) -> MemoryResult<Vec<ScoredDocument>> {
            Err(MemoryError::Io(std::io::Error::other("disk full")))
        }
        async fn get(&self, _filter: &MetadataFilter) -> MemoryResult<Vec<StoredDocument>> {
            Err(MemoryError::Io(std::io::Error::other("disk full")))
        }
        async fn count(&self) -> MemoryResult<usize> {
            Err(MemoryError::Io(std::io::Error::other("disk full")))
        }
    }

    #[tokio::test]
    async fn test_search_finds_relevant_memory() {
        let engine = engine();
        engine.add("The sky is blue", "user").await.unwrap();
        engine.add("Paris is in France", "user").await.unwrap();

        let results = engine.search("color of sky", "user", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].memory, "The sky is blue");
        assert!(results[0].similarity_score.is_some());
    }

    #[tokio::test]
    async fn test_add_stamps_metadata() {
        let engine = engine();
        let outcome = engine.add("héllo wörld", "alice").await.unwrap();
        assert_eq!(outcome.message, "Successfully saved memory: héllo wörld");

        let all = engine.list_all("alice").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, outcome.id);
        assert_eq!(all[0].metadata.user_id, "alice");
        assert_eq!(all[0].metadata.content_length, 11);
        let ts = all[0].metadata.timestamp.as_deref().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
        assert!(ts.ends_with('Z'));
        assert!(all[0].similarity_score.is_none());
    }

    #[tokio::test]
    async fn test_add_long_content_preview_only_truncates_message() {
        let engine = engine();
        let content = "a".repeat(150);
        let outcome = engine.add(&content, "u").await.unwrap();
        assert_eq!(
            outcome.message,
            format!("Successfully saved memory: {}...", "a".repeat(100))
        );
        let stored = engine.list_all("u").await.unwrap();
        assert_eq!(stored[0].memory, content);
        assert_eq!(stored[0].metadata.content_length, 150);
    }

    #[tokio::test]
    async fn test_add_exactly_preview_length_is_not_truncated() {
        let engine = engine();
        let content = "b".repeat(100);
        let outcome = engine.add(&content, "u").await.unwrap();
        assert_eq!(outcome.message, format!("Successfully saved memory: {content}"));
    }

    #[tokio::test]
    async fn test_add_empty_content_is_stored() {
        let engine = engine();
        engine.add("", "u").await.unwrap();
        let all = engine.list_all("u").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].memory, "");
        assert_eq!(all[0].metadata.content_length, 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let engine = engine();
        let a = engine.add("same", "u1").await.unwrap();
        let b = engine.add("same", "u2").await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_partition_isolation() {
        let engine = engine();
        engine.add("alice likes tea", "alice").await.unwrap();
        engine.add("bob likes coffee", "bob").await.unwrap();

        let alice = engine.list_all("alice").await.unwrap();
        assert_eq!(sorted_contents(&alice), ["alice likes tea"]);

        let bob_search = engine.search("alice likes tea", "bob", 10).await.unwrap();
        assert_eq!(sorted_contents(&bob_search), ["bob likes coffee"]);

        assert!(engine.list_all("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_user_returns_empty_results() {
        let engine = engine();
        assert!(engine.search("anything", "nobody", 3).await.unwrap().is_empty());
        assert!(engine.list_all("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_ranking_is_non_increasing() {
        let engine = engine();
        for text in [
            "rust memory safety",
            "rust ownership and borrowing",
            "cooking pasta at home",
            "memory safety without garbage collection",
            "the weather is nice",
        ] {
            engine.add(text, "u").await.unwrap();
        }

        let results = engine.search("rust memory safety", "u", 5).await.unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].memory, "rust memory safety");
        assert!((results[0].similarity_score.unwrap() - 1.0).abs() < 1e-5);
        let scores: Vec<f32> = results.iter().map(|m| m.similarity_score.unwrap()).collect();
        assert!(scores.windows(2).all(|w| w[0] >= w[1]), "{scores:?}");
    }

    #[tokio::test]
    async fn test_similarity_is_not_clamped() {
        let engine = engine();
        engine.add("Paris is in France", "u").await.unwrap();
        let results = engine.search("color of sky", "u", 1).await.unwrap();
        // Unit vectors with no shared tokens sit at squared L2 distance 2.
        assert!(results[0].similarity_score.unwrap() < 0.0);
    }

    #[tokio::test]
    async fn test_search_limit_validation() {
        let engine = engine();
        let err = engine.search("q", "u", 0).await.unwrap_err();
        assert_eq!(err.operation, Operation::Search);
        assert!(matches!(err.source, MemoryError::InvalidInput(_)));

        let err = engine.search("q", "", 3).await.unwrap_err();
        assert!(matches!(err.source, MemoryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_list_all_newest_first_with_stable_ties() {
        let (engine, store) = engine_with_store();
        let provider = HashEmbedding::default();

        let mut docs = Vec::new();
        for (id, ts) in [
            ("old", Some("2026-01-01T00:00:00.000000Z")),
            ("tie-a", Some("2026-03-01T00:00:00.000000Z")),
            ("none", None),
            ("new", Some("2026-05-01T00:00:00.000000Z")),
            ("tie-b", Some("2026-03-01T00:00:00.000000Z")),
        ] {
            let mut metadata = Metadata::new();
            metadata.insert("user_id".into(), json!("u"));
            if let Some(ts) = ts {
                metadata.insert("timestamp".into(), json!(ts));
            }
            docs.push(NewDocument {
                id: id.to_string(),
                embedding: provider.embed(id).await.unwrap(),
                document: id.to_string(),
                metadata,
            });
        }
        store.insert(docs).await.unwrap();

        let ids: Vec<String> = engine
            .list_all("u")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, ["new", "tie-a", "tie-b", "old", "none"]);
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.json");

        let source = engine();
        for text in ["first note", "second note", "ünïcödé ✓", "second note"] {
            source.add(text, "alice").await.unwrap();
        }
        source.add("not exported", "bob").await.unwrap();

        let exported = source.export_to_file("alice", Some(&path)).await.unwrap();
        assert_eq!(exported.count, 4);
        assert_eq!(
            exported.to_string(),
            format!("Exported 4 memories to {}", path.display())
        );

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("ünïcödé ✓"), "non-ASCII must not be escaped");
        let file: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(file["user_id"], json!("alice"));
        assert_eq!(file["total_memories"], json!(4));
        assert_eq!(file["memories"][0]["metadata"]["user_id"], json!("alice"));
        assert!(file["memories"][0].get("similarity_score").is_none());
        assert!(file["export_timestamp"].is_string());

        let target = engine();
        let imported = target.import_from_file(&path, "carol").await.unwrap();
        assert_eq!(imported.count, 4);
        assert_eq!(
            imported.to_string(),
            format!("Imported 4 memories from {}", path.display())
        );

        let original = source.list_all("alice").await.unwrap();
        let restored = target.list_all("carol").await.unwrap();
        assert_eq!(sorted_contents(&original), sorted_contents(&restored));
        assert!(restored.iter().all(|m| m.metadata.user_id == "carol"));
        assert!(target.list_all("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_export_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let engine = engine();

        engine.add("one", "u").await.unwrap();
        engine.export_to_file("u", Some(&path)).await.unwrap();
        engine.add("two", "u").await.unwrap();
        let second = engine.export_to_file("u", Some(&path)).await.unwrap();
        assert_eq!(second.count, 2);

        let file: ExportFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(file.total_memories, 2);
        assert_eq!(file.memories.len(), 2);
    }

    #[tokio::test]
    async fn test_export_empty_user() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.json");
        let outcome = engine().export_to_file("nobody", Some(&path)).await.unwrap();
        assert_eq!(outcome.count, 0);
        let file: ExportFile =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(file.memories.is_empty());
    }

    #[test]
    fn test_default_export_filename() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 5, 7).unwrap();
        assert_eq!(
            default_export_filename(&at),
            "memories_export_20261018_090507.json"
        );
    }

    #[tokio::test]
    async fn test_import_skips_empty_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.json");
        std::fs::write(
            &path,
            r#"{"memories": [
                {"memory": "kept one"},
                {"memory": ""},
                {"id": "no-memory-field"},
                {"memory": "kept two", "metadata": {"user_id": "someone-else"}}
            ]}"#,
        )
        .unwrap();

        let engine = engine();
        let outcome = engine.import_from_file(&path, "u").await.unwrap();
        assert_eq!(outcome.count, 2);
        assert_eq!(
            sorted_contents(&engine.list_all("u").await.unwrap()),
            ["kept one", "kept two"]
        );
        assert!(engine.list_all("someone-else").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_missing_file_and_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();

        let err = engine
            .import_from_file(&dir.path().join("missing.json"), "u")
            .await
            .unwrap_err();
        assert_eq!(err.operation, Operation::Import);
        assert!(matches!(err.source, MemoryError::Io(_)));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        let err = engine.import_from_file(&bad, "u").await.unwrap_err();
        assert!(matches!(err.source, MemoryError::Json(_)));
        assert!(err.to_string().starts_with("Failed to import memories: "));
    }

    #[tokio::test]
    async fn test_import_rejects_malformed_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.json");
        // Second entry is not a string: parsing fails before anything is added.
        std::fs::write(&path, r#"{"memories": [{"memory": "a"}, {"memory": 5}]}"#).unwrap();
        let engine = engine();
        let err = engine.import_from_file(&path, "u").await.unwrap_err();
        assert!(matches!(err.source, MemoryError::Json(_)));
        assert!(engine.list_all("u").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_failure_keeps_earlier_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.json");
        std::fs::write(
            &path,
            r#"{"memories": [{"memory": "first"}, {"memory": "poison pill"}, {"memory": "third"}]}"#,
        )
        .unwrap();

        let store = Arc::new(
            SqliteVectorStore::open_in_memory(
                "test",
                HashEmbedding::MODEL,
                HashEmbedding::DEFAULT_DIMENSIONS,
                DistanceMetric::L2,
            )
            .unwrap(),
        );
        let engine = MemoryEngine::new(store, Arc::new(PickyProvider::default())).unwrap();

        let err = engine.import_from_file(&path, "u").await.unwrap_err();
        assert_eq!(err.operation, Operation::Import);
        assert!(matches!(err.source, MemoryError::Embedding(_)));
        assert_eq!(sorted_contents(&engine.list_all("u").await.unwrap()), ["first"]);
    }

    #[tokio::test]
    async fn test_add_failure_is_wrapped_and_nothing_stored() {
        let store = Arc::new(
            SqliteVectorStore::open_in_memory(
                "test",
                HashEmbedding::MODEL,
                HashEmbedding::DEFAULT_DIMENSIONS,
                DistanceMetric::L2,
            )
            .unwrap(),
        );
        let engine = MemoryEngine::new(store.clone(), Arc::new(FailingProvider)).unwrap();

        let err = engine.add("hello", "u").await.unwrap_err();
        assert_eq!(err.operation, Operation::Add);
        assert_eq!(
            err.to_string(),
            "Failed to add memory: embedding error: model unavailable"
        );
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_failures_are_wrapped() {
        let engine =
            MemoryEngine::new(Arc::new(BrokenStore), Arc::new(HashEmbedding::default())).unwrap();

        let err = engine.add("x", "u").await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to add memory: IO error: disk full"));
        let err = engine.search("x", "u", 3).await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to search memories: "));
        let err = engine.list_all("u").await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to get memories: "));
        let err = engine.export_to_file("u", None).await.unwrap_err();
        assert_eq!(err.operation, Operation::Export);
    }

    #[tokio::test]
    async fn test_stats_counts_all_users() {
        let engine = engine();
        engine.add("a", "alice").await.unwrap();
        engine.add("b", "bob").await.unwrap();
        assert_eq!(
            engine.stats().await,
            StatsReport::Collection {
                total_memories: 2,
                collection_name: "test".into(),
                embedding_model: HashEmbedding::MODEL.into(),
            }
        );
    }

    #[tokio::test]
    async fn test_stats_degrades_on_error() {
        let engine =
            MemoryEngine::new(Arc::new(BrokenStore), Arc::new(HashEmbedding::default())).unwrap();
        assert_eq!(
            engine.stats().await,
            StatsReport::Error {
                error: "IO error: disk full".into()
            }
        );
    }

    #[test]
    fn test_dimension_mismatch_at_construction() {
        let store = Arc::new(
            SqliteVectorStore::open_in_memory("test", HashEmbedding::MODEL, 8, DistanceMetric::L2)
                .unwrap(),
        );
        let err = MemoryEngine::new(store, Arc::new(HashEmbedding::new(16).unwrap()))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            MemoryError::DimensionMismatch {
                expected: 8,
                actual: 16
            }
        ));
    }

    #[test]
    fn test_model_mismatch_at_construction() {
        let store = Arc::new(
            SqliteVectorStore::open_in_memory(
                "test",
                "all-MiniLM-L6-v2",
                HashEmbedding::DEFAULT_DIMENSIONS,
                DistanceMetric::L2,
            )
            .unwrap(),
        );
        let err = MemoryEngine::new(store, Arc::new(HashEmbedding::default()))
            .err()
            .unwrap();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_export_default_filename_in_export_dir() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine().with_export_dir(dir.path());

        engine.add("one", "u").await.unwrap();
        let first = engine.export_to_file("u", None).await.unwrap();
        engine.add("two", "u").await.unwrap();
        let second = engine.export_to_file("u", None).await.unwrap();

        for outcome in [&first, &second] {
            assert_eq!(outcome.path.parent(), Some(dir.path()));
            let name = outcome.path.file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with("memories_export_"), "{name}");
            assert!(name.ends_with(".json"), "{name}");
            assert_eq!(name.len(), "memories_export_20261018_090507.json".len());
        }

        let mut files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        files.sort();
        // Same second: the second export overwrote the first. Otherwise both remain.
        if first.path == second.path {
            assert_eq!(files.len(), 1);
        } else {
            assert_eq!(files.len(), 2);
        }
        let latest: ExportFile =
            serde_json::from_str(&std::fs::read_to_string(&second.path).unwrap()).unwrap();
        assert_eq!(latest.total_memories, 2);
    }

    #[tokio::test]
    async fn test_open_from_config_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MemoryConfig {
            data_dir: dir.path().join("db"),
            ..Default::default()
        };
        config.embedding.provider = Some(memkeep_config::EmbeddingProviderKind::Hash);

        {
            let engine = MemoryEngine::open(&config).await.unwrap();
            engine.add("survives restart", "u").await.unwrap();
            engine.shutdown().await;
        }

        let engine = MemoryEngine::open(&config).await.unwrap();
        assert_eq!(engine.collection_name(), "mcp_memories");
        let all = engine.list_all("u").await.unwrap();
        assert_eq!(all[0].memory, "survives restart");

        config.embedding.dimensions = Some(16);
        let err = MemoryEngine::open(&config).await.err().unwrap();
        assert!(err.is_config());

        // Same dimensions, different model.
        config.embedding.provider = Some(memkeep_config::EmbeddingProviderKind::Ollama);
        config.embedding.dimensions = Some(HashEmbedding::DEFAULT_DIMENSIONS);
        let err = MemoryEngine::open(&config).await.err().unwrap();
        assert!(err.is_config());
        assert!(err.to_string().contains(HashEmbedding::MODEL), "{err}");
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("ééé", 2), "éé...");
        assert_eq!(preview("ab", 2), "ab");
        assert_eq!(preview("", 5), "");
    }
}

//! Tool adapter: runs one engine operation per tool and renders it as text.
//!
//! Failures never escape as protocol errors. Each tool reports them in its
//! text result behind a fixed prefix, so the calling agent can read them.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use memkeep_memory::{MemoryEngine, MemoryMatch};

/// Memory tools bound to one engine and one user.
#[derive(Clone)]
pub struct MemoryTools {
    engine: Arc<MemoryEngine>,
    user_id: String,
}

impl MemoryTools {
    pub fn new(engine: Arc<MemoryEngine>, user_id: impl Into<String>) -> Self {
        Self {
            engine,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub async fn save_memory(&self, text: &str) -> String {
        debug!(user_id = %self.user_id, "save_memory");
        match self.engine.add(text, &self.user_id).await {
            Ok(outcome) => outcome.to_string(),
            Err(e) => failure("Error saving memory", e),
        }
    }

    pub async fn get_all_memories(&self) -> String {
        debug!(user_id = %self.user_id, "get_all_memories");
        match self.engine.list_all(&self.user_id).await {
            Ok(memories) => render(&contents(&memories), "Error retrieving memories"),
            Err(e) => failure("Error retrieving memories", e),
        }
    }

    /// `limit` comes straight from the caller; anything below 1 is rejected
    /// by the engine and reported as text.
    pub async fn search_memories(&self, query: &str, limit: i64) -> String {
        debug!(user_id = %self.user_id, limit, "search_memories");
        let limit = usize::try_from(limit).unwrap_or(0);
        match self.engine.search(query, &self.user_id, limit).await {
            Ok(memories) => render(&contents(&memories), "Error searching memories"),
            Err(e) => failure("Error searching memories", e),
        }
    }

    pub async fn export_memories(&self, filename: Option<&str>) -> String {
        debug!(user_id = %self.user_id, ?filename, "export_memories");
        let path = filename.filter(|f| !f.is_empty()).map(Path::new);
        match self.engine.export_to_file(&self.user_id, path).await {
            Ok(outcome) => outcome.to_string(),
            Err(e) => failure("Error exporting memories", e),
        }
    }

    pub async fn import_memories(&self, filename: &str) -> String {
        debug!(user_id = %self.user_id, filename, "import_memories");
        match self
            .engine
            .import_from_file(Path::new(filename), &self.user_id)
            .await
        {
            Ok(outcome) => outcome.to_string(),
            Err(e) => failure("Error importing memories", e),
        }
    }

    pub async fn get_memory_stats(&self) -> String {
        debug!("get_memory_stats");
        render(&self.engine.stats().await, "Error getting memory stats")
    }
}

fn contents(memories: &[MemoryMatch]) -> Vec<&str> {
    memories.iter().map(|m| m.memory.as_str()).collect()
}

fn render<T: Serialize + ?Sized>(value: &T, prefix: &str) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(json) => json,
        Err(e) => failure(prefix, e),
    }
}

fn failure(prefix: &str, err: impl std::fmt::Display) -> String {
    warn!(error = %err, "{prefix}");
    format!("{prefix}: {err}")
}

//! Memory records, engine results and the export file format.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MemoryError, MemoryResult};
use crate::store::Metadata;

/// Metadata stamped on every memory at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetadata {
    /// Partition key.
    pub user_id: String,
    /// RFC 3339 creation time, fixed microsecond precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Length of the content in characters at creation.
    #[serde(default)]
    pub content_length: usize,
    /// Any further keys found on the stored document.
    #[serde(flatten)]
    pub extra: Metadata,
}

impl MemoryMetadata {
    pub fn new(user_id: impl Into<String>, timestamp: String, content_length: usize) -> Self {
        Self {
            user_id: user_id.into(),
            timestamp: Some(timestamp),
            content_length,
            extra: Metadata::new(),
        }
    }

    pub fn from_map(map: Metadata) -> MemoryResult<Self> {
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    pub fn into_map(self) -> MemoryResult<Metadata> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(MemoryError::InvalidInput(format!(
                "metadata must serialize to an object, got {other}"
            ))),
        }
    }

    /// Sort key for newest-first listing; missing timestamps sort lowest.
    pub fn timestamp_key(&self) -> &str {
        self.timestamp.as_deref().unwrap_or("")
    }
}

/// One memory as returned by search, listing and export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryMatch {
    /// The stored content.
    pub memory: String,
    pub id: String,
    pub metadata: MemoryMetadata,
    /// `1 - distance`; only set for search results. Not clamped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f32>,
}

/// Backup file written by export and read by import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportFile {
    pub export_timestamp: String,
    pub user_id: String,
    pub total_memories: usize,
    pub memories: Vec<MemoryMatch>,
}

/// Lenient view of an export file used by import.
///
/// Only the `memory` field of each entry matters; everything else is ignored.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ImportFile {
    #[serde(default)]
    pub memories: Vec<ImportEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ImportEntry {
    #[serde(default)]
    pub memory: Option<String>,
}

/// Result of a successful add.
#[derive(Debug, Clone, PartialEq)]
pub struct AddOutcome {
    pub id: String,
    /// Human-readable confirmation.
    pub message: String,
}

impl fmt::Display for AddOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Result of a successful export.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutcome {
    pub path: PathBuf,
    pub count: usize,
}

impl fmt::Display for ExportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exported {} memories to {}", self.count, self.path.display())
    }
}

/// Result of a successful import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportOutcome {
    pub path: PathBuf,
    pub count: usize,
}

impl fmt::Display for ImportOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Imported {} memories from {}", self.count, self.path.display())
    }
}

/// Collection statistics. Failures are reported in-band.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatsReport {
    Collection {
        total_memories: usize,
        collection_name: String,
        embedding_model: String,
    },
    Error {
        error: String,
    },
}

use chrono::{DateTime, Utc};
use grantops_types::SectionStatus;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Mutable head record of a section. Holds only the pointer into its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub status: SectionStatus,
    pub current_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable metadata written once per version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    pub number: u32,
    pub timestamp: DateTime<Utc>,
    pub producing_step: Option<String>,
    pub content_hash: String,
    pub parent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<u32>,
    pub word_count: usize,
}

/// A snapshot of a section's content together with its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub section: String,
    pub manifest: VersionManifest,
    pub content: String,
}

impl Version {
    pub fn number(&self) -> u32 {
        self.manifest.number
    }

    /// Human label in the `<section>-v<n>` form used for draft branches.
    pub fn label(&self) -> String {
        format!("{}-v{}", self.section, self.manifest.number)
    }
}

/// Read-only view of a section used by condition evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectionSnapshot {
    pub id: String,
    pub exists: bool,
    pub status: SectionStatus,
    pub current_version: u32,
    pub word_count: usize,
}

impl SectionSnapshot {
    /// The view of a section that has never been committed.
    pub fn missing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            exists: false,
            status: SectionStatus::Draft,
            current_version: 0,
            word_count: 0,
        }
    }
}

/// Hex SHA-256 fingerprint of a snapshot's content.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

pub fn word_count(content: &str) -> usize {
    content.split_whitespace().count()
}

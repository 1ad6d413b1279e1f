//! Resource identity and the project-persistence collaborator.
//!
//! A resource revision is one historical snapshot of a resource's content,
//! addressed by `(URI, revision id)`. Before migration, revision blobs are
//! keyed by `"{path}_rev_{revisionId}"`, which breaks as soon as a path
//! contains separators or is renamed. The migrated key is derived from the
//! resource URI instead and is stable across path spellings.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// URI of a stored resource (e.g., `file:./notes.txt`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceUri(String);

impl ResourceUri {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the storage key for one resource revision.
///
/// The key is a UUIDv5 of the resource URI (URL namespace) joined with the
/// revision id. It is deterministic: the same `(uri, revision_id)` pair
/// always yields the same key, which is what makes re-keying during
/// migration safe to re-run.
pub fn revision_key(uri: &ResourceUri, revision_id: &str) -> String {
    let ns = Uuid::new_v5(&Uuid::NAMESPACE_URL, uri.as_str().as_bytes());
    format!("{}_rev_{}", ns, revision_id)
}

/// Metadata stored alongside one resource revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    pub uri: ResourceUri,
    /// Revision id, typically the message id that produced the revision.
    pub revision_id: String,
    /// Resource kind (defaults to "file" for migrated legacy entries).
    #[serde(rename = "type")]
    pub resource_type: String,
    pub content_type: String,
    /// RFC 3339 timestamp of the revision.
    pub timestamp: String,
    /// Unknown legacy fields carried through unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Project-level persistence collaborator.
///
/// Exposes the two operations the migration engine needs from the wider
/// system: resolving a resource path to its current URI, and storing a
/// resource's content at project scope.
#[async_trait]
pub trait ProjectPersistence: Send + Sync {
    /// Resolves a resource path (as recorded in legacy metadata) to the
    /// resource's current URI.
    fn uri_for_resource(&self, path: &str) -> Result<ResourceUri>;

    /// Stores resource content at project scope.
    ///
    /// Used to promote the latest revision of each resource from interaction
    /// scope to project scope. Content is copied, never moved.
    async fn store_project_resource(
        &self,
        uri: &ResourceUri,
        content: Vec<u8>,
        metadata: ResourceMetadata,
    ) -> Result<()>;
}

/// Hands out the persistence collaborator for one project.
///
/// Mirrors how the wider system exposes its primary data-store connection:
/// persistence is scoped to a project, so batch drivers resolve it per
/// project rather than sharing one instance.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    async fn persistence_for(
        &self,
        project_id: &crate::project::ProjectId,
    ) -> Result<std::sync::Arc<dyn ProjectPersistence>>;
}

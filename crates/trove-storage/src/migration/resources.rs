//! Resource-revision migration: path-derived keys become URI-derived keys.
//!
//! Legacy revision blobs live under `file_revisions/` keyed
//! `"{path}_rev_{revisionId}"`. This migrator re-keys every blob to the
//! deterministic `revision_key(uri, revisionId)` under `resource_revisions/`,
//! writes a new per-interaction metadata index, and promotes the
//! chronologically-latest revision of each distinct URI to project-level
//! storage (copied, never moved).
//!
//! Idempotence is layered: the project-level `.resources-migrated` marker
//! short-circuits the whole step, and the presence of the new per-interaction
//! index short-circuits one interaction even when the project marker is
//! stale.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use trove_core::error::Result;
use trove_core::resource::{revision_key, ProjectPersistence, ResourceMetadata, ResourceUri};

use crate::fsio::{read_json_opt, relocate, write_json};
use crate::migration::enumerate_entity_dirs;
use crate::migration::result::{ChangeEntry, ResourcesMigratedMarker};
use crate::paths::{
    AdminLayout, LEGACY_RESOURCES_METADATA, LEGACY_REVISIONS_DIR, RESOURCES_METADATA,
    RESOURCE_REVISIONS_DIR,
};

const EPOCH: &str = "1970-01-01T00:00:00Z";

/// Latest known revision of one URI, tracked while scanning.
#[derive(Debug, Clone)]
struct LatestRevision {
    revision_id: String,
    timestamp: String,
    metadata: ResourceMetadata,
    entity_dir: PathBuf,
}

pub struct ResourceRevisionMigrator<'a> {
    layout: AdminLayout,
    persistence: &'a dyn ProjectPersistence,
}

impl<'a> ResourceRevisionMigrator<'a> {
    pub fn new(layout: AdminLayout, persistence: &'a dyn ProjectPersistence) -> Self {
        Self {
            layout,
            persistence,
        }
    }

    /// Migrates every interaction of the project and promotes latest
    /// revisions to project scope. No-op when the project marker exists.
    pub async fn migrate_project(&self) -> Result<Vec<ChangeEntry>> {
        let marker_path = self.layout.resources_migrated_marker();
        if fs::try_exists(&marker_path).await.unwrap_or(false) {
            tracing::debug!("Resource revisions already migrated, skipping");
            return Ok(Vec::new());
        }

        let mut changes = Vec::new();
        let mut relocated = 0usize;
        let entities = enumerate_entity_dirs(&self.layout).await?;

        for (entity_id, entity_dir) in &entities {
            match self.migrate_interaction(entity_dir).await {
                Ok(mut interaction_changes) => {
                    relocated += interaction_changes
                        .iter()
                        .filter(|c| c.kind == "relocated")
                        .count();
                    changes.append(&mut interaction_changes);
                }
                Err(e) => {
                    tracing::warn!(
                        "Resource migration failed for interaction '{}', continuing: {}",
                        entity_id,
                        e
                    );
                    changes.push(ChangeEntry::new(
                        "resource_migration_failed",
                        entity_id.clone(),
                        e.to_string(),
                    ));
                }
            }
        }

        // Re-scan the new indices to find the latest revision per URI, then
        // copy each into project-level storage.
        let latest = self.scan_latest_revisions(&entities).await?;
        for (uri, revision) in &latest {
            let blob = revision
                .entity_dir
                .join(RESOURCE_REVISIONS_DIR)
                .join(revision_key(
                    &ResourceUri::new(uri.clone()),
                    &revision.revision_id,
                ));
            let content = match fs::read(&blob).await {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!(
                        "Latest revision blob missing for '{}' ({}): {}",
                        uri,
                        blob.display(),
                        e
                    );
                    continue;
                }
            };
            self.persistence
                .store_project_resource(
                    &ResourceUri::new(uri.clone()),
                    content,
                    revision.metadata.clone(),
                )
                .await?;
            changes.push(ChangeEntry::new(
                "latest_promoted",
                uri.clone(),
                format!("revision {}", revision.revision_id),
            ));
        }

        write_json(&marker_path, &ResourcesMigratedMarker::completed(relocated)).await?;
        changes.push(ChangeEntry::new(
            "marker_written",
            marker_path.display().to_string(),
            format!("{} revisions relocated", relocated),
        ));
        Ok(changes)
    }

    /// Migrates one interaction's revision blobs and metadata index.
    ///
    /// Absence of the legacy index means nothing to migrate; presence of the
    /// new index means the interaction was already migrated.
    pub async fn migrate_interaction(&self, entity_dir: &Path) -> Result<Vec<ChangeEntry>> {
        let new_index_path = entity_dir.join(RESOURCES_METADATA);
        if fs::try_exists(&new_index_path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let legacy_index_path = entity_dir.join(LEGACY_RESOURCES_METADATA);
        let Some(legacy) = read_json_opt::<Map<String, Value>>(&legacy_index_path).await? else {
            return Ok(Vec::new());
        };

        let mut changes = Vec::new();
        let mut new_index: Map<String, Value> = Map::new();

        for (key, entry) in legacy {
            let Some((path, revision_id)) = key.rsplit_once("_rev_") else {
                tracing::warn!("Skipping malformed revision key '{}'", key);
                changes.push(ChangeEntry::new(
                    "skipped_entry",
                    key.clone(),
                    "key does not match {path}_rev_{revisionId}",
                ));
                continue;
            };

            let uri = match self.persistence.uri_for_resource(path) {
                Ok(uri) => uri,
                Err(e) => {
                    tracing::warn!("Could not resolve URI for '{}', skipping entry: {}", path, e);
                    changes.push(ChangeEntry::new("entry_failed", key.clone(), e.to_string()));
                    continue;
                }
            };
            let new_key = revision_key(&uri, revision_id);
            let metadata = build_revision_metadata(&uri, revision_id, path, entry);

            let src = entity_dir.join(LEGACY_REVISIONS_DIR).join(&key);
            let dst = entity_dir.join(RESOURCE_REVISIONS_DIR).join(&new_key);
            if fs::try_exists(&src).await.unwrap_or(false) {
                relocate(&src, &dst).await?;
                changes.push(ChangeEntry::new(
                    "relocated",
                    dst.display().to_string(),
                    format!("from {}", src.display()),
                ));
            } else {
                tracing::warn!("Revision blob missing for key '{}'", key);
                changes.push(ChangeEntry::new("missing_blob", key.clone(), "no content file"));
            }

            new_index.insert(new_key, serde_json::to_value(&metadata)?);
        }

        write_json(&new_index_path, &new_index).await?;
        changes.push(ChangeEntry::new(
            "index_written",
            new_index_path.display().to_string(),
            format!("{} entries", new_index.len()),
        ));
        Ok(changes)
    }

    /// Builds the per-URI latest-revision map from the new indices.
    async fn scan_latest_revisions(
        &self,
        entities: &[(String, PathBuf)],
    ) -> Result<BTreeMap<String, LatestRevision>> {
        let mut latest: BTreeMap<String, LatestRevision> = BTreeMap::new();
        for (_, entity_dir) in entities {
            let Some(index) =
                read_json_opt::<Map<String, Value>>(&entity_dir.join(RESOURCES_METADATA)).await?
            else {
                continue;
            };
            for entry in index.values() {
                let Ok(metadata) = serde_json::from_value::<ResourceMetadata>(entry.clone())
                else {
                    continue;
                };
                let uri = metadata.uri.as_str().to_string();
                let candidate = LatestRevision {
                    revision_id: metadata.revision_id.clone(),
                    timestamp: metadata.timestamp.clone(),
                    metadata,
                    entity_dir: entity_dir.clone(),
                };
                match latest.get(&uri) {
                    // RFC 3339 timestamps order lexicographically
                    Some(existing) if existing.timestamp >= candidate.timestamp => {}
                    _ => {
                        latest.insert(uri, candidate);
                    }
                }
            }
        }
        Ok(latest)
    }
}

fn build_revision_metadata(
    uri: &ResourceUri,
    revision_id: &str,
    path: &str,
    entry: Value,
) -> ResourceMetadata {
    let mut extra = match entry {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let timestamp = extra
        .remove("timestamp")
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| EPOCH.to_string());
    let resource_type = extra
        .remove("type")
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| "file".to_string());
    let content_type = extra
        .remove("contentType")
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| {
            mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });
    ResourceMetadata {
        uri: uri.clone(),
        revision_id: revision_id.to_string(),
        resource_type,
        content_type,
        timestamp,
        extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::testutil::StubPersistence;
    use serde_json::json;
    use tempfile::TempDir;

    async fn seed_interaction(
        layout: &AdminLayout,
        id: &str,
        entries: &[(&str, &str, &[u8])],
    ) -> PathBuf {
        let dir = layout.conversation_dir(id);
        let revisions = dir.join(LEGACY_REVISIONS_DIR);
        tokio::fs::create_dir_all(&revisions).await.unwrap();
        let mut index = Map::new();
        for (key, timestamp, content) in entries {
            tokio::fs::write(revisions.join(key), content).await.unwrap();
            index.insert(key.to_string(), json!({"timestamp": timestamp}));
        }
        write_json(&dir.join(LEGACY_RESOURCES_METADATA), &index)
            .await
            .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_migrate_interaction_rekeys_blobs() {
        let tmp = TempDir::new().unwrap();
        let layout = AdminLayout::new(tmp.path());
        let persistence = StubPersistence::default();
        let dir = seed_interaction(
            &layout,
            "conv-1",
            &[("notes.txt_rev_msg-1", "2024-01-01T00:00:00Z", b"hello")],
        )
        .await;

        let migrator = ResourceRevisionMigrator::new(layout.clone(), &persistence);
        let changes = migrator.migrate_interaction(&dir).await.unwrap();
        assert!(changes.iter().any(|c| c.kind == "relocated"));

        let uri = ResourceUri::new("file:./notes.txt");
        let new_key = revision_key(&uri, "msg-1");
        let blob = dir.join(RESOURCE_REVISIONS_DIR).join(&new_key);
        assert_eq!(tokio::fs::read(&blob).await.unwrap(), b"hello");
        assert!(!dir.join(LEGACY_REVISIONS_DIR).join("notes.txt_rev_msg-1").exists());

        let index: Map<String, Value> =
            crate::fsio::read_json(&dir.join(RESOURCES_METADATA)).await.unwrap();
        let entry = index.get(&new_key).unwrap();
        assert_eq!(entry["uri"], "file:./notes.txt");
        assert_eq!(entry["revisionId"], "msg-1");
        assert_eq!(entry["contentType"], "text/plain");
        assert_eq!(entry["type"], "file");
    }

    #[tokio::test]
    async fn test_migrate_interaction_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let layout = AdminLayout::new(tmp.path());
        let persistence = StubPersistence::default();
        let dir = seed_interaction(
            &layout,
            "conv-1",
            &[("notes.txt_rev_msg-1", "2024-01-01T00:00:00Z", b"hello")],
        )
        .await;

        let migrator = ResourceRevisionMigrator::new(layout.clone(), &persistence);
        migrator.migrate_interaction(&dir).await.unwrap();
        // New index present: second invocation is a no-op
        let changes = migrator.migrate_interaction(&dir).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_migrate_interaction_without_legacy_index() {
        let tmp = TempDir::new().unwrap();
        let layout = AdminLayout::new(tmp.path());
        let persistence = StubPersistence::default();
        let dir = layout.conversation_dir("conv-1");
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let migrator = ResourceRevisionMigrator::new(layout.clone(), &persistence);
        assert!(migrator.migrate_interaction(&dir).await.unwrap().is_empty());
        assert!(!dir.join(RESOURCES_METADATA).exists());
    }

    #[tokio::test]
    async fn test_migrate_project_promotes_latest_revision() {
        let tmp = TempDir::new().unwrap();
        let layout = AdminLayout::new(tmp.path());
        let persistence = StubPersistence::default();
        seed_interaction(
            &layout,
            "conv-1",
            &[
                ("notes.txt_rev_msg-1", "2024-01-01T00:00:00Z", b"old"),
                ("notes.txt_rev_msg-2", "2024-02-01T00:00:00Z", b"new"),
            ],
        )
        .await;

        let migrator = ResourceRevisionMigrator::new(layout.clone(), &persistence);
        let changes = migrator.migrate_project().await.unwrap();
        assert!(changes.iter().any(|c| c.kind == "marker_written"));

        // Latest revision copied (not moved) to project scope
        let stored = persistence.stored.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].0.as_str(), "file:./notes.txt");
        assert_eq!(stored[0].1, b"new");
        drop(stored);
        let uri = ResourceUri::new("file:./notes.txt");
        let blob = layout
            .conversation_dir("conv-1")
            .join(RESOURCE_REVISIONS_DIR)
            .join(revision_key(&uri, "msg-2"));
        assert!(blob.exists(), "promotion must not move the blob");

        // Marker makes the whole step idempotent
        let changes = migrator.migrate_project().await.unwrap();
        assert!(changes.is_empty());
        assert_eq!(persistence.stored.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_key_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let layout = AdminLayout::new(tmp.path());
        let persistence = StubPersistence::default();
        let dir = layout.conversation_dir("conv-1");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        write_json(
            &dir.join(LEGACY_RESOURCES_METADATA),
            &json!({"no-revision-suffix": {}}),
        )
        .await
        .unwrap();

        let migrator = ResourceRevisionMigrator::new(layout.clone(), &persistence);
        let changes = migrator.migrate_interaction(&dir).await.unwrap();
        assert!(changes.iter().any(|c| c.kind == "skipped_entry"));
    }
}

//! Local filesystem implementations of the project collaborators.
//!
//! A projects root holds a `projects.json` listing `{id, path}` entries.
//! Each project's admin data lives under `{path}/.trove`. Project-level
//! resources are stored under `{adminDir}/resources/{revision-key}` with a
//! sibling metadata index.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use trove_core::error::{Result, TroveError};
use trove_core::project::{AdminDirResolver, ProjectId, ProjectRegistry};
use trove_core::resource::{
    revision_key, PersistenceProvider, ProjectPersistence, ResourceMetadata, ResourceUri,
};

use crate::fsio::{read_json_opt, write_json};
use crate::paths::{AdminLayout, RESOURCES_METADATA};

pub const ADMIN_DIR_NAME: &str = ".trove";
pub const PROJECTS_INDEX: &str = "projects.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectEntry {
    id: String,
    path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectsIndex {
    #[serde(default)]
    projects: Vec<ProjectEntry>,
}

async fn read_projects(root: &Path) -> Result<Vec<ProjectEntry>> {
    let index = read_json_opt::<ProjectsIndex>(&root.join(PROJECTS_INDEX)).await?;
    Ok(index.map(|i| i.projects).unwrap_or_default())
}

/// Registry backed by `{root}/projects.json`. An absent index means no
/// projects are registered.
pub struct LocalProjectRegistry {
    root: PathBuf,
}

impl LocalProjectRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ProjectRegistry for LocalProjectRegistry {
    async fn list_projects(&self) -> Result<Vec<ProjectId>> {
        let projects = read_projects(&self.root).await?;
        Ok(projects.into_iter().map(|p| ProjectId::new(p.id)).collect())
    }
}

/// Resolves `{project path}/.trove` from the same `projects.json`.
pub struct LocalAdminDirResolver {
    root: PathBuf,
}

impl LocalAdminDirResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn lookup(&self, project_id: &ProjectId) -> Result<PathBuf> {
        let projects = read_projects(&self.root).await?;
        let entry = projects
            .into_iter()
            .find(|p| p.id == project_id.as_str())
            .ok_or_else(|| {
                TroveError::project_handling(
                    project_id.as_str(),
                    format!("not listed in {}", PROJECTS_INDEX),
                )
            })?;
        let path = if entry.path.is_absolute() {
            entry.path
        } else {
            self.root.join(entry.path)
        };
        Ok(path.join(ADMIN_DIR_NAME))
    }
}

#[async_trait]
impl AdminDirResolver for LocalAdminDirResolver {
    async fn admin_dir(&self, project_id: &ProjectId) -> Result<PathBuf> {
        self.lookup(project_id).await
    }
}

#[async_trait]
impl PersistenceProvider for LocalAdminDirResolver {
    async fn persistence_for(
        &self,
        project_id: &ProjectId,
    ) -> Result<Arc<dyn ProjectPersistence>> {
        let admin_dir = self.lookup(project_id).await?;
        Ok(Arc::new(LocalProjectPersistence::new(admin_dir)))
    }
}

/// Project persistence over one admin directory.
///
/// Resources are addressed by `file:./{path}` URIs; project-level copies
/// land under `resources/` keyed by the URI-derived revision key, indexed by
/// a `resources_metadata.json` next to the blobs.
pub struct LocalProjectPersistence {
    layout: AdminLayout,
}

impl LocalProjectPersistence {
    pub fn new(admin_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: AdminLayout::new(admin_dir),
        }
    }
}

#[async_trait]
impl ProjectPersistence for LocalProjectPersistence {
    fn uri_for_resource(&self, path: &str) -> Result<ResourceUri> {
        let normalized = path.trim().trim_start_matches("./");
        if normalized.is_empty() {
            return Err(TroveError::validation("path", "resource path is empty"));
        }
        if Path::new(normalized).is_absolute() || normalized.split('/').any(|c| c == "..") {
            return Err(TroveError::validation(
                "path",
                format!("resource path escapes the project: {}", path),
            ));
        }
        Ok(ResourceUri::new(format!("file:./{}", normalized)))
    }

    async fn store_project_resource(
        &self,
        uri: &ResourceUri,
        content: Vec<u8>,
        metadata: ResourceMetadata,
    ) -> Result<()> {
        let resources_dir = self.layout.project_resources_dir();
        fs::create_dir_all(&resources_dir)
            .await
            .map_err(|e| TroveError::io(format!("Failed to create {}: {}", resources_dir.display(), e)))?;

        let key = revision_key(uri, &metadata.revision_id);
        fs::write(resources_dir.join(&key), content)
            .await
            .map_err(|e| TroveError::io(format!("Failed to store resource '{}': {}", uri, e)))?;

        let index_path = resources_dir.join(RESOURCES_METADATA);
        let mut index = read_json_opt::<Map<String, Value>>(&index_path)
            .await?
            .unwrap_or_default();
        index.insert(key, serde_json::to_value(&metadata)?);
        write_json(&index_path, &index).await?;
        tracing::debug!("Stored project resource '{}'", uri);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn seed_index(root: &Path) {
        write_json(
            &root.join(PROJECTS_INDEX),
            &json!({"projects": [{"id": "proj-1", "path": "proj-1"}]}),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_registry_lists_projects() {
        let tmp = TempDir::new().unwrap();
        seed_index(tmp.path()).await;

        let registry = LocalProjectRegistry::new(tmp.path());
        let projects = registry.list_projects().await.unwrap();
        assert_eq!(projects, vec![ProjectId::from("proj-1")]);
    }

    #[tokio::test]
    async fn test_registry_without_index_is_empty() {
        let tmp = TempDir::new().unwrap();
        let registry = LocalProjectRegistry::new(tmp.path());
        assert!(registry.list_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolver_maps_relative_path_under_root() {
        let tmp = TempDir::new().unwrap();
        seed_index(tmp.path()).await;

        let resolver = LocalAdminDirResolver::new(tmp.path());
        let dir = resolver.admin_dir(&ProjectId::from("proj-1")).await.unwrap();
        assert_eq!(dir, tmp.path().join("proj-1").join(ADMIN_DIR_NAME));

        let err = resolver
            .admin_dir(&ProjectId::from("ghost"))
            .await
            .unwrap_err();
        assert!(err.is_project_handling());
    }

    #[tokio::test]
    async fn test_uri_for_resource_normalizes_and_validates() {
        let tmp = TempDir::new().unwrap();
        let persistence = LocalProjectPersistence::new(tmp.path());

        let uri = persistence.uri_for_resource("./notes.txt").unwrap();
        assert_eq!(uri.as_str(), "file:./notes.txt");
        assert!(persistence.uri_for_resource("").unwrap_err().is_validation());
        assert!(persistence
            .uri_for_resource("../outside.txt")
            .unwrap_err()
            .is_validation());
    }

    #[tokio::test]
    async fn test_store_project_resource_writes_blob_and_index() {
        let tmp = TempDir::new().unwrap();
        let persistence = LocalProjectPersistence::new(tmp.path());
        let uri = ResourceUri::new("file:./notes.txt");
        let metadata = ResourceMetadata {
            uri: uri.clone(),
            revision_id: "msg-1".to_string(),
            resource_type: "file".to_string(),
            content_type: "text/plain".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            extra: Default::default(),
        };

        persistence
            .store_project_resource(&uri, b"hello".to_vec(), metadata)
            .await
            .unwrap();

        let key = revision_key(&uri, "msg-1");
        let layout = AdminLayout::new(tmp.path());
        let blob = layout.project_resources_dir().join(&key);
        assert_eq!(tokio::fs::read(&blob).await.unwrap(), b"hello");

        let index: Map<String, Value> = crate::fsio::read_json(
            &layout.project_resources_dir().join(RESOURCES_METADATA),
        )
        .await
        .unwrap();
        assert_eq!(index[&key]["revisionId"], "msg-1");
    }
}

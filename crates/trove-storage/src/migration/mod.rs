//! Schema and layout migration for the trove store.
//!
//! Stored data carries an integer schema version (currently 4). On startup
//! the engine walks every known project and brings its persisted state to
//! the current version:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ProjectMigrator                        │
//! │  (one orchestration per project, marker-gated)            │
//! ├──────────────────────────────────────────────────────────┤
//! │  EntityVersionWalker   (v1 → v2 → v3 → v4 per entity)     │
//! │  StructuralMigrator    (conversations → collaborations)   │
//! │  ResourceRevisionMigrator (URI-derived revision keys)     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Failure isolation is the core guarantee: one entity failing never stops
//! its siblings, and one project failing never stops the batch. Everything
//! is sequential and single-threaded; the engine assumes it runs once at
//! service startup before request traffic is accepted.

mod orchestrator;
mod resources;
mod result;
mod steps;
mod structural;
mod walker;

pub use orchestrator::{BatchOutcome, ProjectMigrator};
pub use resources::ResourceRevisionMigrator;
pub use result::{
    ChangeEntry, EntityMigrationResult, MigrationResult, ResourcesMigratedMarker,
    StorageMigrationState, VersionSpan,
};
pub use steps::{EntityContext, ErrorPolicy, StepOutcome, UpgradeStep, V1ToV2, V2ToV3, V3ToV4};
pub use structural::StructuralMigrator;
pub use walker::EntityVersionWalker;

pub use crate::metadata::CURRENT_VERSION;

use std::path::PathBuf;
use tokio::fs;
use trove_core::error::Result;

use crate::paths::{AdminLayout, INTERACTIONS_DIR};

/// Enumerates every entity directory of a project, under both the legacy
/// and the current layout. Returns `(entity_id, directory)` pairs; the same
/// entity can appear twice when both layouts exist, which the per-step
/// version checks tolerate.
pub(crate) async fn enumerate_entity_dirs(layout: &AdminLayout) -> Result<Vec<(String, PathBuf)>> {
    let mut entities = Vec::new();

    // Legacy: conversations/{id}
    collect_subdirs(&layout.conversations_dir(), &mut entities).await?;

    // Current: collaborations/{id}/interactions/{id}
    let mut collaborations = Vec::new();
    collect_subdirs(&layout.collaborations_dir(), &mut collaborations).await?;
    for (_, collaboration_dir) in collaborations {
        collect_subdirs(&collaboration_dir.join(INTERACTIONS_DIR), &mut entities).await?;
    }

    Ok(entities)
}

async fn collect_subdirs(dir: &std::path::Path, out: &mut Vec<(String, PathBuf)>) -> Result<()> {
    if !fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(());
    }
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| trove_core::TroveError::io(format!("Failed to read {}: {}", dir.display(), e)))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| trove_core::TroveError::io(e.to_string()))?
    {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if is_dir {
            out.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use trove_core::error::Result;
    use trove_core::project::ProjectId;
    use trove_core::resource::{
        PersistenceProvider, ProjectPersistence, ResourceMetadata, ResourceUri,
    };

    /// Persistence stub: derives `file:./{path}` URIs and records every
    /// project-level store call.
    #[derive(Default)]
    pub(crate) struct StubPersistence {
        pub stored: Mutex<Vec<(ResourceUri, Vec<u8>, ResourceMetadata)>>,
    }

    #[async_trait]
    impl ProjectPersistence for StubPersistence {
        fn uri_for_resource(&self, path: &str) -> Result<ResourceUri> {
            Ok(ResourceUri::new(format!("file:./{}", path)))
        }

        async fn store_project_resource(
            &self,
            uri: &ResourceUri,
            content: Vec<u8>,
            metadata: ResourceMetadata,
        ) -> Result<()> {
            self.stored.lock().unwrap().push((uri.clone(), content, metadata));
            Ok(())
        }
    }

    /// Provider returning the same stub for every project.
    pub(crate) struct StubProvider(pub Arc<StubPersistence>);

    #[async_trait]
    impl PersistenceProvider for StubProvider {
        async fn persistence_for(
            &self,
            _project_id: &ProjectId,
        ) -> Result<Arc<dyn ProjectPersistence>> {
            Ok(self.0.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_enumerate_entity_dirs_covers_both_layouts() {
        let dir = TempDir::new().unwrap();
        let layout = AdminLayout::new(dir.path());
        tokio::fs::create_dir_all(layout.conversation_dir("conv-1"))
            .await
            .unwrap();
        tokio::fs::create_dir_all(layout.interaction_dir("collab-1", "int-1"))
            .await
            .unwrap();
        // Stray files are ignored
        tokio::fs::write(layout.conversations_dir().join("stray.txt"), b"x")
            .await
            .unwrap();

        let mut entities = enumerate_entity_dirs(&layout).await.unwrap();
        entities.sort();
        let ids: Vec<&str> = entities.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["conv-1", "int-1"]);
    }

    #[tokio::test]
    async fn test_enumerate_entity_dirs_empty_project() {
        let dir = TempDir::new().unwrap();
        let layout = AdminLayout::new(dir.path());
        assert!(enumerate_entity_dirs(&layout).await.unwrap().is_empty());
    }
}

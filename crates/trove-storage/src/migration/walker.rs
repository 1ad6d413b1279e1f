//! Entity version walker: drives one entity through the upgrade chain.
//!
//! Steps are registered in order and must form a continuous chain
//! (1→2, 2→3, 3→4). Given an entity at version N the walker folds the tail
//! of the chain starting at N; an entity at or past the current version is a
//! recognized no-op. Adding a future version is a one-line append to the
//! standard chain.

use std::sync::Arc;
use trove_core::error::Result;

use crate::fsio::{read_json_opt, write_json};
use crate::metadata::{InteractionMetadata, MetadataLoad, CURRENT_VERSION};
use crate::migration::result::{ChangeEntry, EntityMigrationResult, VersionSpan};
use crate::migration::steps::{EntityContext, UpgradeStep, V1ToV2, V2ToV3, V3ToV4};
use crate::paths::ENTITY_METADATA;

/// Ordered chain of single-step upgraders.
#[derive(Debug)]
pub struct EntityVersionWalker {
    steps: Vec<Arc<dyn UpgradeStep>>,
    current_version: u32,
}

impl EntityVersionWalker {
    pub fn new(current_version: u32) -> Self {
        Self {
            steps: Vec::new(),
            current_version,
        }
    }

    /// The standard chain reaching [`CURRENT_VERSION`].
    pub fn standard() -> Self {
        let mut walker = Self::new(CURRENT_VERSION);
        walker.register(Arc::new(V1ToV2));
        walker.register(Arc::new(V2ToV3));
        walker.register(Arc::new(V3ToV4));
        walker
    }

    /// Registers a step, validating chain continuity.
    ///
    /// # Panics
    ///
    /// Panics if the step does not connect to the existing chain or
    /// overshoots the walker's current version. A broken chain is a
    /// programming error, not a runtime condition.
    pub fn register(&mut self, step: Arc<dyn UpgradeStep>) {
        if let Some(last) = self.steps.last() {
            assert_eq!(
                last.to_version(),
                step.from_version(),
                "Upgrade chain broken: expected step from {} but got step from {} ('{}' -> '{}')",
                last.to_version(),
                step.from_version(),
                last.description(),
                step.description()
            );
        }
        assert!(
            step.to_version() <= self.current_version,
            "Step target version {} exceeds current version {}",
            step.to_version(),
            self.current_version
        );
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    fn find_start_index(&self, from_version: u32) -> Option<usize> {
        self.steps.iter().position(|s| s.from_version() == from_version)
    }

    async fn persist_metadata(
        &self,
        metadata_path: &std::path::Path,
        metadata: &InteractionMetadata,
    ) -> Result<()> {
        let value = metadata.to_value().map_err(trove_core::TroveError::from)?;
        write_json(metadata_path, &value).await
    }

    /// Migrates one entity directory to the current version.
    ///
    /// Missing, un-parsable, or unversioned metadata classifies the entity
    /// as legacy: skipped, not failed. Step failures are wrapped into
    /// `success = false` so the caller can continue with sibling entities.
    /// Metadata is written back after every successful step, which keeps a
    /// crashed run resumable.
    pub async fn migrate_entity(&self, ctx: &EntityContext<'_>) -> Result<EntityMigrationResult> {
        let metadata_path = ctx.entity_dir.join(ENTITY_METADATA);
        let Some(raw) = read_json_opt::<serde_json::Value>(&metadata_path)
            .await
            .unwrap_or(None)
        else {
            tracing::debug!(
                "Entity '{}' has no readable metadata, classifying as legacy",
                ctx.entity_id
            );
            return Ok(EntityMigrationResult::skipped(
                ctx.entity_id,
                "metadata absent or unreadable",
            ));
        };

        let mut metadata = match InteractionMetadata::from_value(raw) {
            MetadataLoad::Versioned(meta) => meta,
            MetadataLoad::Legacy { reason } => {
                tracing::debug!("Entity '{}' is legacy: {}", ctx.entity_id, reason);
                return Ok(EntityMigrationResult::skipped(ctx.entity_id, reason));
            }
        };

        let from_version = metadata.version();
        if from_version >= self.current_version {
            return Ok(EntityMigrationResult {
                entity_id: ctx.entity_id.to_string(),
                success: true,
                skipped: false,
                version: VersionSpan {
                    from: from_version,
                    to: from_version,
                },
                changes: Vec::new(),
                errors: Vec::new(),
            });
        }

        let Some(start) = self.find_start_index(from_version) else {
            return Ok(EntityMigrationResult::failed(
                ctx.entity_id,
                VersionSpan {
                    from: from_version,
                    to: self.current_version,
                },
                format!("no upgrade step starts from version {}", from_version),
            ));
        };

        tracing::info!(
            "Migrating entity '{}' from v{} to v{} ({} steps)",
            ctx.entity_id,
            from_version,
            self.current_version,
            self.steps.len() - start
        );

        let mut changes: Vec<ChangeEntry> = Vec::new();
        for step in &self.steps[start..] {
            tracing::debug!(
                "Entity '{}': step v{} -> v{} ({})",
                ctx.entity_id,
                step.from_version(),
                step.to_version(),
                step.description()
            );
            match step.apply(ctx, metadata).await {
                Ok(outcome) => {
                    metadata = outcome.metadata;
                    changes.extend(outcome.changes);
                    // A failed write-back stays contained in the result, same
                    // as a failed step, so sibling entities keep migrating.
                    if let Err(e) = self.persist_metadata(&metadata_path, &metadata).await {
                        tracing::warn!(
                            "Entity '{}': metadata write after step v{} -> v{} failed: {}",
                            ctx.entity_id,
                            step.from_version(),
                            step.to_version(),
                            e
                        );
                        return Ok(EntityMigrationResult {
                            entity_id: ctx.entity_id.to_string(),
                            success: false,
                            skipped: false,
                            version: VersionSpan {
                                from: from_version,
                                to: step.from_version(),
                            },
                            changes,
                            errors: vec![format!(
                                "metadata write after step v{} -> v{} failed: {}",
                                step.from_version(),
                                step.to_version(),
                                e
                            )],
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "Entity '{}' failed at step v{} -> v{}: {}",
                        ctx.entity_id,
                        step.from_version(),
                        step.to_version(),
                        e
                    );
                    return Ok(EntityMigrationResult {
                        entity_id: ctx.entity_id.to_string(),
                        success: false,
                        skipped: false,
                        version: VersionSpan {
                            from: from_version,
                            to: step.from_version(),
                        },
                        changes,
                        errors: vec![format!(
                            "step v{} -> v{} failed: {}",
                            step.from_version(),
                            step.to_version(),
                            e
                        )],
                    });
                }
            }
        }

        Ok(EntityMigrationResult {
            entity_id: ctx.entity_id.to_string(),
            success: true,
            skipped: false,
            version: VersionSpan {
                from: from_version,
                to: metadata.version(),
            },
            changes,
            errors: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::testutil::StubPersistence;
    use crate::paths::AdminLayout;
    use serde_json::json;
    use tempfile::TempDir;

    async fn write_entity(dir: &std::path::Path, metadata: serde_json::Value) {
        tokio::fs::create_dir_all(dir).await.unwrap();
        write_json(&dir.join(ENTITY_METADATA), &metadata).await.unwrap();
    }

    fn walker_ctx<'a>(
        entity_id: &'a str,
        entity_dir: &'a std::path::Path,
        layout: &'a AdminLayout,
        persistence: &'a StubPersistence,
    ) -> EntityContext<'a> {
        EntityContext {
            entity_id,
            entity_dir,
            layout,
            persistence,
        }
    }

    #[test]
    #[should_panic(expected = "Upgrade chain broken")]
    fn test_register_broken_chain_panics() {
        let mut walker = EntityVersionWalker::new(4);
        walker.register(Arc::new(V1ToV2));
        walker.register(Arc::new(V3ToV4));
    }

    #[test]
    fn test_standard_chain_is_continuous() {
        let walker = EntityVersionWalker::standard();
        assert_eq!(walker.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_metadata_is_skipped_not_failed() {
        let dir = TempDir::new().unwrap();
        let entity_dir = dir.path().join("conversations").join("conv-1");
        tokio::fs::create_dir_all(&entity_dir).await.unwrap();
        let layout = AdminLayout::new(dir.path());
        let persistence = StubPersistence::default();

        let walker = EntityVersionWalker::standard();
        let ctx = walker_ctx("conv-1", &entity_dir, &layout, &persistence);
        let result = walker.migrate_entity(&ctx).await.unwrap();
        assert!(result.success);
        assert!(result.skipped);
    }

    #[tokio::test]
    async fn test_unversioned_metadata_is_skipped() {
        let dir = TempDir::new().unwrap();
        let entity_dir = dir.path().join("conversations").join("conv-1");
        write_entity(&entity_dir, json!({"id": "conv-1"})).await;
        let layout = AdminLayout::new(dir.path());
        let persistence = StubPersistence::default();

        let walker = EntityVersionWalker::standard();
        let ctx = walker_ctx("conv-1", &entity_dir, &layout, &persistence);
        let result = walker.migrate_entity(&ctx).await.unwrap();
        assert!(result.skipped);
    }

    #[tokio::test]
    async fn test_monotonic_versioning_from_each_start() {
        for from in 1..=3u32 {
            let dir = TempDir::new().unwrap();
            let entity_dir = dir.path().join("conversations").join("conv-1");
            write_entity(&entity_dir, json!({"version": from, "id": "conv-1"})).await;
            let layout = AdminLayout::new(dir.path());
            let persistence = StubPersistence::default();

            let walker = EntityVersionWalker::standard();
            let ctx = walker_ctx("conv-1", &entity_dir, &layout, &persistence);
            let result = walker.migrate_entity(&ctx).await.unwrap();
            assert!(result.success, "migration from v{} failed: {:?}", from, result.errors);
            assert_eq!(result.version.from, from);
            assert_eq!(result.version.to, 4);

            // Exactly 4 - N version bumps, in increasing order
            let bumps: Vec<&str> = result
                .changes
                .iter()
                .filter(|c| c.kind == "version_bump")
                .map(|c| c.detail.as_str())
                .collect();
            assert_eq!(bumps.len(), (4 - from) as usize);
            let expected: Vec<String> =
                (from..4).map(|v| format!("{} -> {}", v, v + 1)).collect();
            assert_eq!(bumps, expected.iter().map(String::as_str).collect::<Vec<_>>());

            let value: serde_json::Value =
                crate::fsio::read_json(&entity_dir.join(ENTITY_METADATA)).await.unwrap();
            assert_eq!(value["version"], 4);
        }
    }

    #[tokio::test]
    async fn test_already_current_is_noop() {
        let dir = TempDir::new().unwrap();
        let entity_dir = dir.path().join("collaborations/c/interactions/c");
        write_entity(&entity_dir, json!({"version": 4, "id": "c"})).await;
        let layout = AdminLayout::new(dir.path());
        let persistence = StubPersistence::default();

        let walker = EntityVersionWalker::standard();
        let ctx = walker_ctx("c", &entity_dir, &layout, &persistence);
        let result = walker.migrate_entity(&ctx).await.unwrap();
        assert!(result.success);
        assert!(result.changes.is_empty());
        assert_eq!(result.version.from, 4);
        assert_eq!(result.version.to, 4);
    }

    #[tokio::test]
    async fn test_step_failure_is_wrapped_not_thrown() {
        let dir = TempDir::new().unwrap();
        let entity_dir = dir.path().join("conversations").join("conv-1");
        write_entity(&entity_dir, json!({"version": 2, "id": "conv-1"})).await;
        // Malformed usage log: v2 -> v3 must fail with a validation error
        tokio::fs::write(entity_dir.join("token_usage.jsonl"), "not json\n")
            .await
            .unwrap();
        let layout = AdminLayout::new(dir.path());
        let persistence = StubPersistence::default();

        let walker = EntityVersionWalker::standard();
        let ctx = walker_ctx("conv-1", &entity_dir, &layout, &persistence);
        let result = walker.migrate_entity(&ctx).await.unwrap();
        assert!(!result.success);
        assert!(!result.skipped);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("v2 -> v3"));
    }
}

//! Per-project migration orchestration and the batch driver.
//!
//! `migrate_project_storage` is the idempotent startup entry point for one
//! project: marker gate, entity version walk, structural restructure, marker
//! write. `migrate_all_projects` drives it over every registered project
//! with log-and-continue isolation.

use std::sync::Arc;
use trove_core::error::Result;
use trove_core::project::{AdminDirResolver, ProjectId, ProjectRegistry};
use trove_core::resource::PersistenceProvider;

use crate::fsio::{read_json_opt, write_json};
use crate::metadata::CURRENT_VERSION;
use crate::migration::enumerate_entity_dirs;
use crate::migration::result::{ChangeEntry, MigrationResult, StorageMigrationState};
use crate::migration::steps::EntityContext;
use crate::migration::structural::StructuralMigrator;
use crate::migration::walker::EntityVersionWalker;
use crate::paths::AdminLayout;

/// Summary of one `migrate_all_projects` run.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub total: usize,
    pub succeeded: Vec<ProjectId>,
    pub failed: Vec<(ProjectId, String)>,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ProjectMigrator {
    registry: Arc<dyn ProjectRegistry>,
    resolver: Arc<dyn AdminDirResolver>,
    provider: Arc<dyn PersistenceProvider>,
    walker: EntityVersionWalker,
}

impl ProjectMigrator {
    pub fn new(
        registry: Arc<dyn ProjectRegistry>,
        resolver: Arc<dyn AdminDirResolver>,
        provider: Arc<dyn PersistenceProvider>,
    ) -> Self {
        Self {
            registry,
            resolver,
            provider,
            walker: EntityVersionWalker::standard(),
        }
    }

    /// Migrates one project's stored state to the current schema version.
    ///
    /// Safe to call on every startup: once the marker records the current
    /// version this is a cheap no-op. An unresolvable admin directory is the
    /// one fatal path and propagates as a `ProjectHandling` error; entity
    /// and structural failures are collected into the result instead.
    ///
    /// # Errors
    ///
    /// Returns an error when the project's admin directory cannot be
    /// resolved or the final marker write fails.
    pub async fn migrate_project_storage(&self, project_id: &ProjectId) -> Result<MigrationResult> {
        let admin_dir = self.resolver.admin_dir(project_id).await?;
        let layout = AdminLayout::new(admin_dir);
        let persistence = self.provider.persistence_for(project_id).await?;

        let marker =
            read_json_opt::<StorageMigrationState>(&layout.storage_migration_marker()).await?;
        if let Some(state) = &marker {
            if state.version >= CURRENT_VERSION {
                tracing::debug!(
                    "Project '{}' already at storage version {}, skipping",
                    project_id,
                    state.version
                );
                return Ok(MigrationResult::new(state.version, state.version));
            }
        }

        let from_version = marker.map(|m| m.version).unwrap_or(1);
        tracing::info!(
            "Migrating project '{}' storage from v{} to v{}",
            project_id,
            from_version,
            CURRENT_VERSION
        );
        let mut result = MigrationResult::new(from_version, CURRENT_VERSION);
        let mut migrated_count = 0usize;

        for (entity_id, entity_dir) in enumerate_entity_dirs(&layout).await? {
            let ctx = EntityContext {
                entity_id: &entity_id,
                entity_dir: &entity_dir,
                layout: &layout,
                persistence: persistence.as_ref(),
            };
            let entity_result = self.walker.migrate_entity(&ctx).await?;
            if entity_result.success
                && !entity_result.skipped
                && entity_result.version.to > entity_result.version.from
            {
                migrated_count += 1;
            }
            result.changes.extend(entity_result.changes);
            for error in entity_result.errors {
                result.record_error(format!("entity '{}': {}", entity_id, error));
            }
        }

        let structural = StructuralMigrator::new(layout.clone()).migrate().await;
        result.changes.extend(structural.changes);
        for error in structural.errors {
            result.record_error(format!("structural: {}", error));
        }

        if result.success {
            let marker_path = layout.storage_migration_marker();
            write_json(
                &marker_path,
                &StorageMigrationState::completed(CURRENT_VERSION, migrated_count),
            )
            .await?;
            result.changes.push(ChangeEntry::new(
                "marker_written",
                marker_path.display().to_string(),
                format!("version {}, {} entities migrated", CURRENT_VERSION, migrated_count),
            ));
            tracing::info!(
                "Project '{}' storage migrated: {} entities, {} changes",
                project_id,
                migrated_count,
                result.changes.len()
            );
        } else {
            tracing::warn!(
                "Project '{}' storage migration finished with {} errors, marker not written",
                project_id,
                result.errors.len()
            );
        }
        Ok(result)
    }

    /// Migrates every registered project, continuing past failures so one
    /// broken project never blocks the rest.
    pub async fn migrate_all_projects(&self) -> Result<BatchOutcome> {
        let projects = self.registry.list_projects().await?;
        let mut outcome = BatchOutcome {
            total: projects.len(),
            ..Default::default()
        };

        for project_id in projects {
            match self.migrate_project_storage(&project_id).await {
                Ok(result) if result.success => outcome.succeeded.push(project_id),
                Ok(result) => {
                    tracing::warn!(
                        "Project '{}' migration completed with errors: {:?}",
                        project_id,
                        result.errors
                    );
                    outcome.failed.push((project_id, result.errors.join("; ")));
                }
                Err(e) => {
                    tracing::error!("Project '{}' migration failed: {}", project_id, e);
                    outcome.failed.push((project_id, e.to_string()));
                }
            }
        }

        tracing::info!(
            "Batch migration finished: {} projects, {} failed",
            outcome.total,
            outcome.failed.len()
        );
        Ok(outcome)
    }
}

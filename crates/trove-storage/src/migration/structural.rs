//! Structural migration: legacy `conversations/` trees become
//! `collaborations/{id}/interactions/{id}` trees.
//!
//! Each legacy conversation directory is triaged first: directories with no
//! real content go to `cleanup/`, directories with content but no root
//! `metadata.json` go to `corrupted/`. Everything else is moved under a
//! newly synthesized collaboration that reuses the conversation id, and its
//! log files are reshaped (`.log` renamed, `.jsonl` rewritten line by line
//! with the v4 field renames).
//!
//! This migrator never returns an error to the caller: failures populate the
//! result's `errors` and the full result is persisted to
//! `migration_results.json` for post-mortem inspection, so a structural
//! failure cannot undo version-walk work that already completed.

use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use trove_core::error::Result;

use crate::fsio::{read_json, read_json_opt, relocate, write_json};
use crate::metadata::{
    rename_legacy_record, CollaborationMetadata, CollaborationsIndex, InteractionSummary,
};
use crate::migration::result::{ChangeEntry, MigrationResult};
use crate::paths::{
    AdminLayout, COLLABORATION_JSONL, COLLABORATION_LOG, CONVERSATIONS_INDEX, CONVERSATION_JSONL,
    CONVERSATION_LOG, ENTITY_METADATA,
};

/// Schema version stamped on collaboration records created here.
const COLLABORATION_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Classification {
    /// No real content anywhere in the subtree.
    Empty,
    /// Files exist somewhere in the subtree but there is no root
    /// `metadata.json` to anchor a migration.
    Corrupted,
    Migratable,
}

pub struct StructuralMigrator {
    layout: AdminLayout,
}

impl StructuralMigrator {
    pub fn new(layout: AdminLayout) -> Self {
        Self { layout }
    }

    /// Runs the restructuring. Infallible by contract: errors are collected
    /// into the returned result, which is also persisted to disk whenever
    /// any work was attempted.
    pub async fn migrate(&self) -> MigrationResult {
        let mut result = MigrationResult::new(3, 4);
        let attempted = match self.run(&mut result).await {
            Ok(attempted) => attempted,
            Err(e) => {
                result.record_error(format!("structural migration aborted: {}", e));
                true
            }
        };
        if attempted {
            if let Err(e) = write_json(&self.layout.migration_results_file(), &result).await {
                tracing::error!("Could not persist structural migration results: {}", e);
            }
        }
        result
    }

    /// Returns whether any restructuring was attempted (false on the
    /// already-migrated and nothing-to-migrate no-op paths).
    async fn run(&self, result: &mut MigrationResult) -> Result<bool> {
        let conversations_dir = self.layout.conversations_dir();
        if !fs::try_exists(&conversations_dir).await.unwrap_or(false) {
            tracing::debug!("No legacy conversations directory, nothing to restructure");
            return Ok(false);
        }
        let index_exists = fs::try_exists(self.layout.collaborations_index())
            .await
            .unwrap_or(false);
        let dir_exists = fs::try_exists(self.layout.collaborations_dir())
            .await
            .unwrap_or(false);
        if index_exists && dir_exists {
            tracing::debug!("Collaborations layout already present, skipping restructure");
            return Ok(false);
        }

        tracing::info!(
            "Restructuring legacy conversations under {}",
            conversations_dir.display()
        );

        // A crashed earlier run may have moved conversations into the new
        // layout without reaching the index write; carry those records so
        // the rebuilt index does not drop them.
        let mut collaborations = self.existing_collaborations().await?;
        for (id, dir) in list_subdirs(&conversations_dir).await? {
            match classify(&dir).await {
                Ok(Classification::Empty) => {
                    if let Err(e) = self
                        .quarantine(&dir, self.layout.cleanup_dir(), "empty_conversation", &id, result)
                        .await
                    {
                        result.record_error(format!("quarantine of empty '{}' failed: {}", id, e));
                    }
                }
                Ok(Classification::Corrupted) => {
                    if let Err(e) = self
                        .quarantine(
                            &dir,
                            self.layout.corrupted_dir(),
                            "corrupted_conversation",
                            &id,
                            result,
                        )
                        .await
                    {
                        result.record_error(format!(
                            "quarantine of corrupted '{}' failed: {}",
                            id, e
                        ));
                    }
                }
                Ok(Classification::Migratable) => {
                    match self.migrate_conversation(&id, &dir, result).await {
                        Ok(collaboration) => {
                            collaborations.retain(|c| c.id != collaboration.id);
                            collaborations.push(collaboration);
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Structural migration of '{}' failed, continuing: {}",
                                id,
                                e
                            );
                            result.record_error(format!("conversation '{}': {}", id, e));
                        }
                    }
                }
                Err(e) => {
                    result.record_error(format!("could not classify '{}': {}", id, e));
                }
            }
        }

        let index_path = self.layout.collaborations_index();
        write_json(&index_path, &CollaborationsIndex::new(collaborations)).await?;
        result.changes.push(ChangeEntry::new(
            "index_written",
            index_path.display().to_string(),
            "collaborations index created",
        ));

        self.backup_legacy_tree(result).await?;
        Ok(true)
    }

    /// Collaboration records already on disk: an existing index (if any)
    /// plus any `collaborations/{id}/metadata.json` missing from it.
    async fn existing_collaborations(&self) -> Result<Vec<CollaborationMetadata>> {
        let mut found: Vec<CollaborationMetadata> =
            match read_json_opt::<CollaborationsIndex>(&self.layout.collaborations_index()).await {
                Ok(Some(index)) => index.collaborations,
                Ok(None) => Vec::new(),
                Err(e) => {
                    tracing::warn!("Could not read existing collaborations index: {}", e);
                    Vec::new()
                }
            };

        let dir = self.layout.collaborations_dir();
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(found);
        }
        for (id, collaboration_dir) in list_subdirs(&dir).await? {
            if found.iter().any(|c| c.id == id) {
                continue;
            }
            match read_json_opt::<CollaborationMetadata>(&collaboration_dir.join(ENTITY_METADATA))
                .await
            {
                Ok(Some(collaboration)) => found.push(collaboration),
                Ok(None) => {
                    tracing::warn!("Collaboration '{}' has no metadata record", id);
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable collaboration record '{}': {}", id, e);
                }
            }
        }
        Ok(found)
    }

    /// Moves one conversation into the collaboration layout and reshapes
    /// its logs. Returns the synthesized collaboration record.
    async fn migrate_conversation(
        &self,
        id: &str,
        dir: &Path,
        result: &mut MigrationResult,
    ) -> Result<CollaborationMetadata> {
        let metadata: Value = read_json(&dir.join(ENTITY_METADATA)).await?;
        let title = metadata
            .get("title")
            .and_then(|v| v.as_str())
            .map(String::from);
        let updated_at = metadata
            .get("updatedAt")
            .and_then(|v| v.as_str())
            .map(String::from);
        let total_token_usage = metadata
            .get("tokenUsageStatsForInteraction")
            .and_then(|block| block.get("tokenUsageInteraction"))
            .and_then(|totals| serde_json::from_value(totals.clone()).ok())
            .unwrap_or_default();

        let interaction_dir = self.layout.interaction_dir(id, id);
        if let Some(parent) = interaction_dir.parent() {
            fs::create_dir_all(parent).await?;
        }
        relocate(dir, &interaction_dir).await?;
        result.changes.push(ChangeEntry::new(
            "relocated",
            interaction_dir.display().to_string(),
            format!("from {}", dir.display()),
        ));

        let collaboration_dir = self.layout.collaboration_dir(id);
        self.reshape_logs(&interaction_dir, &collaboration_dir, result)
            .await?;

        let collaboration = CollaborationMetadata {
            version: COLLABORATION_VERSION,
            id: id.to_string(),
            title: title.clone(),
            interaction_ids: vec![id.to_string()],
            last_interaction: Some(InteractionSummary {
                id: id.to_string(),
                title,
                updated_at: updated_at.clone(),
            }),
            updated_at,
            total_token_usage,
            extra: Default::default(),
        };
        write_json(&collaboration_dir.join(ENTITY_METADATA), &collaboration).await?;
        result.changes.push(ChangeEntry::new(
            "collaboration_created",
            collaboration_dir.display().to_string(),
            format!("owns interaction '{}'", id),
        ));
        Ok(collaboration)
    }

    /// `.log` is renamed as-is; `.jsonl` is rewritten line by line with the
    /// legacy field renames, then the original is removed.
    async fn reshape_logs(
        &self,
        interaction_dir: &Path,
        collaboration_dir: &Path,
        result: &mut MigrationResult,
    ) -> Result<()> {
        let legacy_log = interaction_dir.join(CONVERSATION_LOG);
        if fs::try_exists(&legacy_log).await.unwrap_or(false) {
            let new_log = collaboration_dir.join(COLLABORATION_LOG);
            relocate(&legacy_log, &new_log).await?;
            result.changes.push(ChangeEntry::new(
                "log_renamed",
                new_log.display().to_string(),
                format!("from {}", CONVERSATION_LOG),
            ));
        }

        let legacy_jsonl = interaction_dir.join(CONVERSATION_JSONL);
        if fs::try_exists(&legacy_jsonl).await.unwrap_or(false) {
            let content = fs::read_to_string(&legacy_jsonl).await?;
            let mut lines = Vec::new();
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                match serde_json::from_str::<Value>(line) {
                    Ok(record) => {
                        lines.push(serde_json::to_string(&rename_legacy_record(record))?);
                    }
                    Err(e) => {
                        // Pass un-parsable lines through untouched
                        tracing::warn!("Keeping malformed jsonl line verbatim: {}", e);
                        lines.push(line.to_string());
                    }
                }
            }
            let new_jsonl = collaboration_dir.join(COLLABORATION_JSONL);
            let mut body = lines.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            fs::write(&new_jsonl, body).await?;
            fs::remove_file(&legacy_jsonl).await?;
            result.changes.push(ChangeEntry::new(
                "jsonl_rewritten",
                new_jsonl.display().to_string(),
                format!("{} records renamed", lines.len()),
            ));
        }
        Ok(())
    }

    async fn quarantine(
        &self,
        dir: &Path,
        area: PathBuf,
        prefix: &str,
        id: &str,
        result: &mut MigrationResult,
    ) -> Result<()> {
        let dst = area.join(format!("{}_{}", prefix, id));
        fs::create_dir_all(&area).await?;
        relocate(dir, &dst).await?;
        tracing::warn!("Quarantined conversation '{}' to {}", id, dst.display());
        result.changes.push(ChangeEntry::new(
            "quarantined",
            dst.display().to_string(),
            format!("from {}", dir.display()),
        ));
        Ok(())
    }

    /// Moves the emptied legacy tree and the old index into `cleanup/` as a
    /// safety backup. Move, never delete.
    async fn backup_legacy_tree(&self, result: &mut MigrationResult) -> Result<()> {
        let cleanup = self.layout.cleanup_dir();
        fs::create_dir_all(&cleanup).await?;

        let conversations_dir = self.layout.conversations_dir();
        if fs::try_exists(&conversations_dir).await.unwrap_or(false) {
            let dst = cleanup.join("conversations");
            relocate(&conversations_dir, &dst).await?;
            result.changes.push(ChangeEntry::new(
                "backup_moved",
                dst.display().to_string(),
                "legacy conversations tree",
            ));
        }
        let index = self.layout.conversations_index();
        if fs::try_exists(&index).await.unwrap_or(false) {
            let dst = cleanup.join(CONVERSATIONS_INDEX);
            relocate(&index, &dst).await?;
            result.changes.push(ChangeEntry::new(
                "backup_moved",
                dst.display().to_string(),
                "legacy conversations index",
            ));
        }
        Ok(())
    }
}

async fn list_subdirs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if is_dir {
            out.push((entry.file_name().to_string_lossy().into_owned(), entry.path()));
        }
    }
    out.sort();
    Ok(out)
}

/// Triage of one legacy conversation directory. A root `metadata.json` makes
/// it migratable; otherwise any file anywhere in the subtree means the data
/// is inconsistent (corrupted), and none at all means there is nothing worth
/// keeping (empty, e.g. only an abandoned revisions subdirectory).
async fn classify(dir: &Path) -> Result<Classification> {
    if fs::try_exists(dir.join(ENTITY_METADATA)).await.unwrap_or(false) {
        return Ok(Classification::Migratable);
    }
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else {
                return Ok(Classification::Corrupted);
            }
        }
    }
    Ok(Classification::Empty)
}

//! Transient audit records and persisted markers for migration runs.
//!
//! Results are not authoritative state; they exist for logging and for the
//! persisted results dump written by the structural migrator. Markers are
//! the authoritative "have we migrated" records.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// One mutating step applied during migration, for operator visibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    /// Kind of change, e.g. "version_bump", "field_renamed",
    /// "default_synthesized", "relocated", "quarantined".
    #[serde(rename = "type")]
    pub kind: String,
    /// What was changed (a field path or a file path).
    pub path: String,
    pub detail: String,
}

impl ChangeEntry {
    pub fn new(
        kind: impl Into<String>,
        path: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            path: path.into(),
            detail: detail.into(),
        }
    }
}

/// From/to versions of one migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionSpan {
    pub from: u32,
    pub to: u32,
}

/// Audit record for migrating one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMigrationResult {
    pub entity_id: String,
    pub success: bool,
    /// True when the entity was classified legacy and skipped.
    #[serde(default)]
    pub skipped: bool,
    pub version: VersionSpan,
    pub changes: Vec<ChangeEntry>,
    pub errors: Vec<String>,
}

impl EntityMigrationResult {
    pub fn skipped(entity_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            success: true,
            skipped: true,
            version: VersionSpan::default(),
            changes: vec![ChangeEntry::new("skipped", "metadata.json", reason)],
            errors: Vec::new(),
        }
    }

    pub fn failed(
        entity_id: impl Into<String>,
        version: VersionSpan,
        error: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            success: false,
            skipped: false,
            version,
            changes: Vec::new(),
            errors: vec![error.into()],
        }
    }
}

/// Audit record for one whole migration operation (a project's structural
/// migration, or a full project run).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    pub success: bool,
    pub version: VersionSpan,
    pub changes: Vec<ChangeEntry>,
    pub errors: Vec<String>,
}

impl MigrationResult {
    pub fn new(from: u32, to: u32) -> Self {
        Self {
            success: true,
            version: VersionSpan { from, to },
            changes: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.success = false;
        self.errors.push(error.into());
    }
}

// ============================================================================
// Markers
// ============================================================================

/// `.storage-migration-state`: gates re-migration of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMigrationState {
    pub version: u32,
    /// RFC 3339 timestamp of the last completed run.
    pub last_migrated: String,
    pub migrated_count: usize,
}

impl StorageMigrationState {
    pub fn completed(version: u32, migrated_count: usize) -> Self {
        Self {
            version,
            last_migrated: Utc::now().to_rfc3339(),
            migrated_count,
        }
    }
}

/// `.resources-migrated`: makes the resource-revision step idempotent per
/// project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesMigratedMarker {
    pub version: String,
    pub last_migrated: String,
    pub migrated_count: usize,
}

impl ResourcesMigratedMarker {
    pub const VERSION: &'static str = "2.0";

    pub fn completed(migrated_count: usize) -> Self {
        Self {
            version: Self::VERSION.to_string(),
            last_migrated: Utc::now().to_rfc3339(),
            migrated_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skipped_result_is_success() {
        let result = EntityMigrationResult::skipped("conv-1", "no metadata");
        assert!(result.success);
        assert!(result.skipped);
        assert_eq!(result.changes[0].kind, "skipped");
    }

    #[test]
    fn test_record_error_flips_success() {
        let mut result = MigrationResult::new(1, 4);
        assert!(result.success);
        result.record_error("boom");
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_marker_serialization_shape() {
        let marker = StorageMigrationState::completed(4, 7);
        let json = serde_json::to_value(&marker).unwrap();
        assert_eq!(json["version"], 4);
        assert_eq!(json["migratedCount"], 7);
        assert!(json.get("lastMigrated").is_some());

        let marker = ResourcesMigratedMarker::completed(3);
        let json = serde_json::to_value(&marker).unwrap();
        assert_eq!(json["version"], "2.0");
    }
}

//! Admin-directory layout for one project.
//!
//! The layout exists in two generations. Legacy (pre-migration):
//!
//! ```text
//! {adminDir}/
//! ├── conversations.json
//! └── conversations/{id}/
//!     ├── metadata.json
//!     ├── conversation.log
//!     ├── conversation.jsonl
//!     ├── token_usage.jsonl
//!     ├── token_usage_chat.jsonl
//!     ├── file_revisions/{path}_rev_{revId}
//!     └── files_metadata.json
//! ```
//!
//! Current (post-migration):
//!
//! ```text
//! {adminDir}/
//! ├── collaborations.json
//! ├── resources/{revisionKey}
//! └── collaborations/{id}/
//!     ├── metadata.json
//!     ├── collaboration.log
//!     ├── collaboration.jsonl
//!     └── interactions/{id}/
//!         ├── metadata.json
//!         ├── resource_revisions/{revisionKey}
//!         └── resources_metadata.json
//! ```
//!
//! Plus markers (`.storage-migration-state`, `.resources-migrated`),
//! quarantine areas (`cleanup/`, `corrupted/`) and the persisted structural
//! migration result (`migration_results.json`).

use std::path::{Path, PathBuf};

// Index files
pub const CONVERSATIONS_INDEX: &str = "conversations.json";
pub const COLLABORATIONS_INDEX: &str = "collaborations.json";

// Directory names
pub const CONVERSATIONS_DIR: &str = "conversations";
pub const COLLABORATIONS_DIR: &str = "collaborations";
pub const INTERACTIONS_DIR: &str = "interactions";
pub const LEGACY_REVISIONS_DIR: &str = "file_revisions";
pub const RESOURCE_REVISIONS_DIR: &str = "resource_revisions";
pub const PROJECT_RESOURCES_DIR: &str = "resources";
pub const CLEANUP_DIR: &str = "cleanup";
pub const CORRUPTED_DIR: &str = "corrupted";

// Per-entity files
pub const ENTITY_METADATA: &str = "metadata.json";
pub const LEGACY_RESOURCES_METADATA: &str = "files_metadata.json";
pub const RESOURCES_METADATA: &str = "resources_metadata.json";
pub const CONVERSATION_LOG: &str = "conversation.log";
pub const CONVERSATION_JSONL: &str = "conversation.jsonl";
pub const COLLABORATION_LOG: &str = "collaboration.log";
pub const COLLABORATION_JSONL: &str = "collaboration.jsonl";
pub const TOKEN_USAGE_CONVERSATION: &str = "token_usage.jsonl";
pub const TOKEN_USAGE_CHAT: &str = "token_usage_chat.jsonl";

// Markers and results
pub const STORAGE_MIGRATION_MARKER: &str = ".storage-migration-state";
pub const RESOURCES_MIGRATED_MARKER: &str = ".resources-migrated";
pub const MIGRATION_RESULTS_FILE: &str = "migration_results.json";

/// Path helpers rooted at one project's admin directory.
#[derive(Debug, Clone)]
pub struct AdminLayout {
    admin_dir: PathBuf,
}

impl AdminLayout {
    pub fn new(admin_dir: impl Into<PathBuf>) -> Self {
        Self {
            admin_dir: admin_dir.into(),
        }
    }

    pub fn admin_dir(&self) -> &Path {
        &self.admin_dir
    }

    pub fn conversations_index(&self) -> PathBuf {
        self.admin_dir.join(CONVERSATIONS_INDEX)
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.admin_dir.join(CONVERSATIONS_DIR)
    }

    pub fn conversation_dir(&self, id: &str) -> PathBuf {
        self.conversations_dir().join(id)
    }

    pub fn collaborations_index(&self) -> PathBuf {
        self.admin_dir.join(COLLABORATIONS_INDEX)
    }

    pub fn collaborations_dir(&self) -> PathBuf {
        self.admin_dir.join(COLLABORATIONS_DIR)
    }

    pub fn collaboration_dir(&self, id: &str) -> PathBuf {
        self.collaborations_dir().join(id)
    }

    pub fn interaction_dir(&self, collaboration_id: &str, interaction_id: &str) -> PathBuf {
        self.collaboration_dir(collaboration_id)
            .join(INTERACTIONS_DIR)
            .join(interaction_id)
    }

    pub fn project_resources_dir(&self) -> PathBuf {
        self.admin_dir.join(PROJECT_RESOURCES_DIR)
    }

    pub fn cleanup_dir(&self) -> PathBuf {
        self.admin_dir.join(CLEANUP_DIR)
    }

    pub fn corrupted_dir(&self) -> PathBuf {
        self.admin_dir.join(CORRUPTED_DIR)
    }

    pub fn storage_migration_marker(&self) -> PathBuf {
        self.admin_dir.join(STORAGE_MIGRATION_MARKER)
    }

    pub fn resources_migrated_marker(&self) -> PathBuf {
        self.admin_dir.join(RESOURCES_MIGRATED_MARKER)
    }

    pub fn migration_results_file(&self) -> PathBuf {
        self.admin_dir.join(MIGRATION_RESULTS_FILE)
    }
}

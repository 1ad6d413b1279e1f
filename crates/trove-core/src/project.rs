//! Project identity and the collaborator traits the migration engine consumes.
//!
//! A project is the top-level persisted unit. Each project owns an admin data
//! directory that holds the collaboration store, markers, and quarantine
//! areas. The engine never assumes how projects are enumerated or where their
//! admin directories live; both come from these traits.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identifier of a project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Enumerates the projects known to the installation.
///
/// # Implementation Notes
///
/// Implementations should return every project that may hold persisted state,
/// including projects that have never been migrated. Ordering is not
/// significant; the migration engine processes projects sequentially in the
/// order returned.
#[async_trait]
pub trait ProjectRegistry: Send + Sync {
    /// Lists all known project ids.
    async fn list_projects(&self) -> Result<Vec<ProjectId>>;
}

/// Resolves a project's admin data directory.
#[async_trait]
pub trait AdminDirResolver: Send + Sync {
    /// Returns the admin data directory for the given project.
    ///
    /// # Errors
    ///
    /// Returns `TroveError::ProjectHandling` if the directory cannot be
    /// resolved. This is fatal for the project but must not abort a batch.
    async fn admin_dir(&self, project_id: &ProjectId) -> Result<PathBuf>;
}

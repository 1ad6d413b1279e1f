//! Core domain types and collaborator traits for Trove.
//!
//! Trove persists agent-session state (projects, collaborations,
//! interactions, token-usage logs, resource revisions) as versioned on-disk
//! records. This crate holds the pieces shared across the workspace: the
//! error type, project identity, and the traits the storage layer consumes
//! from the wider system (project registry, admin-directory resolver,
//! project persistence).

pub mod error;
pub mod project;
pub mod resource;

pub use crate::error::{Result, TroveError};
pub use crate::project::{AdminDirResolver, ProjectId, ProjectRegistry};
pub use crate::resource::{
    revision_key, PersistenceProvider, ProjectPersistence, ResourceMetadata, ResourceUri,
};

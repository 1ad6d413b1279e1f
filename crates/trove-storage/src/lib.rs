//! File-based storage layer for Trove.
//!
//! Persists agent-session state under each project's admin directory and
//! owns the migration engine that brings stored data to the current schema
//! version on startup. The layout, the token-usage log, and the versioned
//! metadata shapes live here; the domain types and collaborator traits come
//! from `trove-core`.

pub mod fsio;
pub mod local;
pub mod metadata;
pub mod migration;
pub mod paths;
pub mod token_usage;

pub use crate::local::{LocalAdminDirResolver, LocalProjectPersistence, LocalProjectRegistry};
pub use crate::metadata::{
    CollaborationMetadata, CollaborationsIndex, ConversationsIndex, InteractionMetadata,
    InteractionSummary, CURRENT_VERSION,
};
pub use crate::migration::{
    BatchOutcome, MigrationResult, ProjectMigrator, ResourceRevisionMigrator, StructuralMigrator,
};
pub use crate::paths::AdminLayout;
pub use crate::token_usage::{TokenUsageAnalysis, TokenUsageLog, TokenUsageRecord, UsageKind};

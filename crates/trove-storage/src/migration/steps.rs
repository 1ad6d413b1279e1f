//! Single-step schema upgraders (v1→v2, v2→v3, v3→v4).
//!
//! Each step transforms one entity's metadata and, where relevant, its
//! usage logs. Every step re-checks `version >= target` at entry and
//! returns a no-op success when already satisfied: the same entity can be
//! reachable via both the legacy and the new directory layout in one run.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::path::Path;
use trove_core::error::{Result, TroveError};
use trove_core::resource::ProjectPersistence;

use crate::fsio::{read_json_opt, write_json};
use crate::metadata::{
    attach_usage_stats_v2_to_v3, upgrade_v1_to_v2, upgrade_v3_to_v4, ConversationsIndex,
    InteractionMetadata,
};
use crate::migration::resources::ResourceRevisionMigrator;
use crate::migration::result::ChangeEntry;
use crate::paths::AdminLayout;
use crate::token_usage::{TokenUsageLog, UsageKind};

/// Everything a step may touch for one entity.
pub struct EntityContext<'a> {
    pub entity_id: &'a str,
    pub entity_dir: &'a Path,
    pub layout: &'a AdminLayout,
    pub persistence: &'a dyn ProjectPersistence,
}

/// Result of applying one step.
#[derive(Debug)]
pub struct StepOutcome {
    pub metadata: InteractionMetadata,
    pub changes: Vec<ChangeEntry>,
}

impl StepOutcome {
    fn noop(metadata: InteractionMetadata) -> Self {
        Self {
            metadata,
            changes: Vec::new(),
        }
    }
}

/// One single-version upgrade in the chain.
#[async_trait]
pub trait UpgradeStep: Send + Sync + std::fmt::Debug {
    /// Version this step upgrades from.
    fn from_version(&self) -> u32;

    /// Version this step produces.
    fn to_version(&self) -> u32;

    /// Human-readable description, for logging.
    fn description(&self) -> &str;

    /// Applies the step. Must be a recognized no-op when the metadata is
    /// already at or past `to_version`.
    async fn apply(
        &self,
        ctx: &EntityContext<'_>,
        metadata: InteractionMetadata,
    ) -> Result<StepOutcome>;
}

// ============================================================================
// Side-effect stages
// ============================================================================

/// Error policy for one side-effect stage, declared by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Log the failure, record it as a change entry, keep going.
    Continue,
    /// Propagate the failure.
    Abort,
}

/// Runs one named side-effect stage under the given error policy.
///
/// Stage changes are appended to `changes`; under `Continue` a failure is
/// recorded as a `side_effect_failed` change instead of an error.
pub(crate) async fn run_stage<F>(
    name: &str,
    policy: ErrorPolicy,
    changes: &mut Vec<ChangeEntry>,
    stage: F,
) -> Result<()>
where
    F: Future<Output = Result<Vec<ChangeEntry>>>,
{
    match stage.await {
        Ok(mut stage_changes) => {
            changes.append(&mut stage_changes);
            Ok(())
        }
        Err(e) => match policy {
            ErrorPolicy::Continue => {
                tracing::warn!("Side-effect stage '{}' failed, continuing: {}", name, e);
                changes.push(ChangeEntry::new("side_effect_failed", name, e.to_string()));
                Ok(())
            }
            ErrorPolicy::Abort => Err(e),
        },
    }
}

// ============================================================================
// v1 -> v2
// ============================================================================

/// Version bump only; the v2 schema did not change the stored shape.
#[derive(Debug, Default)]
pub struct V1ToV2;

#[async_trait]
impl UpgradeStep for V1ToV2 {
    fn from_version(&self) -> u32 {
        1
    }

    fn to_version(&self) -> u32 {
        2
    }

    fn description(&self) -> &str {
        "version bump only"
    }

    async fn apply(
        &self,
        _ctx: &EntityContext<'_>,
        metadata: InteractionMetadata,
    ) -> Result<StepOutcome> {
        if metadata.version() >= self.to_version() {
            return Ok(StepOutcome::noop(metadata));
        }
        let v1 = match metadata {
            InteractionMetadata::V1(v1) => v1,
            other => {
                return Err(TroveError::migration(format!(
                    "v1->v2 step received unexpected shape at version {}",
                    other.version()
                )))
            }
        };
        Ok(StepOutcome {
            metadata: InteractionMetadata::V2(upgrade_v1_to_v2(v1)),
            changes: vec![ChangeEntry::new("version_bump", "version", "1 -> 2")],
        })
    }
}

// ============================================================================
// v2 -> v3
// ============================================================================

/// Backfills `totalAllTokens` and the split cache-savings fields on every
/// conversation usage record, stores the aggregate analysis on metadata,
/// and best-effort triggers index normalization and resource migration.
#[derive(Debug, Default)]
pub struct V2ToV3;

#[async_trait]
impl UpgradeStep for V2ToV3 {
    fn from_version(&self) -> u32 {
        2
    }

    fn to_version(&self) -> u32 {
        3
    }

    fn description(&self) -> &str {
        "backfill totalAllTokens, split cache savings, aggregate usage onto metadata"
    }

    async fn apply(
        &self,
        ctx: &EntityContext<'_>,
        metadata: InteractionMetadata,
    ) -> Result<StepOutcome> {
        if metadata.version() >= self.to_version() {
            return Ok(StepOutcome::noop(metadata));
        }
        let v2 = match metadata {
            InteractionMetadata::V2(v2) => v2,
            other => {
                return Err(TroveError::migration(format!(
                    "v2->v3 step received unexpected shape at version {}",
                    other.version()
                )))
            }
        };

        let mut changes = Vec::new();
        let log = TokenUsageLog::new(ctx.entity_dir);

        // (a) rewrite usage records that predate the v3 invariants
        let records = log.read_all(UsageKind::Conversation).await?;
        for record in &records {
            let needs_total = record
                .raw_usage
                .as_ref()
                .is_some_and(|raw| raw.total_all_tokens.is_none());
            let needs_savings = record
                .cache_impact
                .as_ref()
                .is_some_and(|cache| cache.savings.is_some() || cache.savings_total.is_none());
            if !needs_total && !needs_savings {
                continue;
            }

            let message_id = record.message_id.clone();
            log.update_record(UsageKind::Conversation, &message_id, |r| {
                if let Some(raw) = r.raw_usage.as_mut() {
                    if raw.total_all_tokens.is_none() {
                        raw.total_all_tokens = Some(raw.computed_total_all());
                    }
                }
                if let Some(cache) = r.cache_impact.as_mut() {
                    let total = cache
                        .savings
                        .take()
                        .or(cache.savings_total)
                        .unwrap_or(cache.potential_cost - cache.actual_cost);
                    cache.savings_total = Some(total);
                    cache.savings_percentage = Some(if cache.potential_cost > 0.0 {
                        total / cache.potential_cost * 100.0
                    } else {
                        0.0
                    });
                }
            })
            .await?;
            changes.push(ChangeEntry::new(
                "usage_record_rewritten",
                format!("token_usage.jsonl#{}", message_id),
                "backfilled totalAllTokens / split cache savings",
            ));
        }

        // (b) aggregate the whole log onto metadata
        let analysis = log.analyze_usage(UsageKind::Conversation).await?;
        let (v3, synthesized) = attach_usage_stats_v2_to_v3(v2, analysis.total_usage);
        changes.push(ChangeEntry::new(
            "usage_stats_attached",
            "tokenUsageStats.tokenUsageInteraction",
            format!("aggregated {} records", analysis.record_count),
        ));
        for path in synthesized {
            changes.push(ChangeEntry::new("default_synthesized", path, "zeroed"));
        }

        // (c) best-effort side effects; failures must not block the bump
        run_stage(
            "normalize_conversations_index",
            ErrorPolicy::Continue,
            &mut changes,
            normalize_conversations_index(ctx.layout),
        )
        .await?;
        // Project-level run; its own marker makes repeat triggers from
        // sibling entities cheap no-ops.
        run_stage(
            "migrate_resource_revisions",
            ErrorPolicy::Continue,
            &mut changes,
            ResourceRevisionMigrator::new(ctx.layout.clone(), ctx.persistence).migrate_project(),
        )
        .await?;

        // (d)
        changes.push(ChangeEntry::new("version_bump", "version", "2 -> 3"));
        Ok(StepOutcome {
            metadata: InteractionMetadata::V3(v3),
            changes,
        })
    }
}

// ============================================================================
// v3 -> v4
// ============================================================================

/// Pure metadata reshape: conversation-named blocks become interaction-named
/// blocks and the legacy token-usage shapes collapse into one canonical
/// block. No file moves.
#[derive(Debug, Default)]
pub struct V3ToV4;

#[async_trait]
impl UpgradeStep for V3ToV4 {
    fn from_version(&self) -> u32 {
        3
    }

    fn to_version(&self) -> u32 {
        4
    }

    fn description(&self) -> &str {
        "rename conversation-shaped fields, consolidate token-usage blocks"
    }

    async fn apply(
        &self,
        _ctx: &EntityContext<'_>,
        metadata: InteractionMetadata,
    ) -> Result<StepOutcome> {
        if metadata.version() >= self.to_version() {
            return Ok(StepOutcome::noop(metadata));
        }
        let v3 = match metadata {
            InteractionMetadata::V3(v3) => v3,
            other => {
                return Err(TroveError::migration(format!(
                    "v3->v4 step received unexpected shape at version {}",
                    other.version()
                )))
            }
        };

        let (v4, synthesized) = upgrade_v3_to_v4(v3);
        let mut changes = vec![ChangeEntry::new(
            "fields_renamed",
            "metadata.json",
            "conversationStats -> interactionStats, conversationMetrics -> interactionMetrics",
        )];
        for path in synthesized {
            changes.push(ChangeEntry::new("default_synthesized", path, "zeroed"));
        }
        changes.push(ChangeEntry::new("version_bump", "version", "3 -> 4"));
        Ok(StepOutcome {
            metadata: InteractionMetadata::V4(v4),
            changes,
        })
    }
}

// ============================================================================
// Project index normalization (triggered best-effort from v2 -> v3)
// ============================================================================

/// Fills structural gaps in `conversations.json` entries and rewrites the
/// index when anything changed. Absence of the index is not an error.
pub async fn normalize_conversations_index(layout: &AdminLayout) -> Result<Vec<ChangeEntry>> {
    let path = layout.conversations_index();
    let Some(mut index) = read_json_opt::<ConversationsIndex>(&path).await? else {
        return Ok(Vec::new());
    };

    let mut changes = Vec::new();
    if index.version.is_none() {
        index.version = Some("1.0".to_string());
        changes.push(ChangeEntry::new(
            "default_synthesized",
            "conversations.json#version",
            "1.0",
        ));
    }
    for entry in index.conversations.iter_mut() {
        let Some(obj) = entry.as_object_mut() else {
            continue;
        };
        let id = obj
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<unknown>")
            .to_string();
        if !obj.contains_key("title") {
            obj.insert("title".to_string(), Value::String("Untitled".to_string()));
            changes.push(ChangeEntry::new(
                "default_synthesized",
                format!("conversations.json#{}.title", id),
                "Untitled",
            ));
        }
        if !obj.contains_key("updatedAt") {
            obj.insert(
                "updatedAt".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
            changes.push(ChangeEntry::new(
                "default_synthesized",
                format!("conversations.json#{}.updatedAt", id),
                "now",
            ));
        }
    }

    if !changes.is_empty() {
        write_json(&path, &index).await?;
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{InteractionMetadataV1, InteractionMetadataV4, MetadataLoad};
    use crate::migration::testutil::StubPersistence;
    use crate::token_usage::{CacheImpact, RawUsage, TokenUsageRecord, UsageRole};
    use serde_json::json;
    use tempfile::TempDir;

    fn ctx<'a>(
        entity_id: &'a str,
        entity_dir: &'a Path,
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

    fn v1_meta(id: &str) -> InteractionMetadata {
        InteractionMetadata::V1(InteractionMetadataV1 {
            version: 1,
            id: id.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_step_noops_at_or_past_target() {
        let dir = TempDir::new().unwrap();
        let layout = AdminLayout::new(dir.path());
        let persistence = StubPersistence::default();
        let ctx = ctx("conv-1", dir.path(), &layout, &persistence);

        let v4 = InteractionMetadata::V4(InteractionMetadataV4 {
            version: 4,
            id: "conv-1".to_string(),
            ..Default::default()
        });
        let outcome = V1ToV2.apply(&ctx, v4.clone()).await.unwrap();
        assert!(outcome.changes.is_empty());
        assert_eq!(outcome.metadata, v4);
    }

    #[tokio::test]
    async fn test_v1_to_v2_bumps_version() {
        let dir = TempDir::new().unwrap();
        let layout = AdminLayout::new(dir.path());
        let persistence = StubPersistence::default();
        let ctx = ctx("conv-1", dir.path(), &layout, &persistence);

        let outcome = V1ToV2.apply(&ctx, v1_meta("conv-1")).await.unwrap();
        assert_eq!(outcome.metadata.version(), 2);
        assert_eq!(outcome.changes.len(), 1);
        assert_eq!(outcome.changes[0].kind, "version_bump");
    }

    #[tokio::test]
    async fn test_v2_to_v3_backfills_totals_and_savings() {
        let dir = TempDir::new().unwrap();
        let entity_dir = dir.path().join("conversations").join("conv-1");
        tokio::fs::create_dir_all(&entity_dir).await.unwrap();
        let layout = AdminLayout::new(dir.path());
        let persistence = StubPersistence::default();

        let log = TokenUsageLog::new(&entity_dir);
        log.write_usage(&TokenUsageRecord {
            message_id: "msg-1".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            role: UsageRole::Assistant,
            kind: UsageKind::Conversation,
            raw_usage: Some(RawUsage {
                total_tokens: 100,
                cache_creation_input_tokens: 20,
                cache_read_input_tokens: 10,
                thought_tokens: 5,
                ..Default::default()
            }),
            differential_usage: None,
            cache_impact: Some(CacheImpact {
                potential_cost: 4.0,
                actual_cost: 3.0,
                savings: Some(1.0),
                ..Default::default()
            }),
            extra: Default::default(),
        })
        .await
        .unwrap();

        let meta = match InteractionMetadata::from_value(json!({"version": 2, "id": "conv-1"})) {
            MetadataLoad::Versioned(m) => m,
            _ => panic!("expected versioned"),
        };
        let ctx = ctx("conv-1", &entity_dir, &layout, &persistence);
        let outcome = V2ToV3.apply(&ctx, meta).await.unwrap();
        assert_eq!(outcome.metadata.version(), 3);

        let records = log.read_all(UsageKind::Conversation).await.unwrap();
        let raw = records[0].raw_usage.as_ref().unwrap();
        assert_eq!(raw.total_all_tokens, Some(135));
        let cache = records[0].cache_impact.as_ref().unwrap();
        assert_eq!(cache.savings, None);
        assert_eq!(cache.savings_total, Some(1.0));
        assert!((cache.savings_percentage.unwrap() - 25.0).abs() < 1e-9);

        // Aggregate stored onto metadata
        let InteractionMetadata::V3(v3) = outcome.metadata else {
            panic!("expected v3");
        };
        let stats = v3.token_usage_stats.unwrap();
        assert_eq!(stats.token_usage_interaction.unwrap().total_all_tokens, 135);
    }

    #[tokio::test]
    async fn test_v2_to_v3_side_effect_failure_does_not_block_bump() {
        let dir = TempDir::new().unwrap();
        let entity_dir = dir.path().join("conversations").join("conv-1");
        tokio::fs::create_dir_all(&entity_dir).await.unwrap();
        // Unreadable index: a directory where a file is expected
        tokio::fs::create_dir_all(dir.path().join("conversations.json"))
            .await
            .unwrap();
        let layout = AdminLayout::new(dir.path());
        let persistence = StubPersistence::default();

        let meta = match InteractionMetadata::from_value(json!({"version": 2, "id": "conv-1"})) {
            MetadataLoad::Versioned(m) => m,
            _ => panic!("expected versioned"),
        };
        let ctx = ctx("conv-1", &entity_dir, &layout, &persistence);
        let outcome = V2ToV3.apply(&ctx, meta).await.unwrap();
        assert_eq!(outcome.metadata.version(), 3);
        assert!(outcome
            .changes
            .iter()
            .any(|c| c.kind == "side_effect_failed"));
    }

    #[tokio::test]
    async fn test_v3_to_v4_records_synthesized_defaults() {
        let dir = TempDir::new().unwrap();
        let layout = AdminLayout::new(dir.path());
        let persistence = StubPersistence::default();
        let ctx = ctx("conv-1", dir.path(), &layout, &persistence);

        let meta = match InteractionMetadata::from_value(json!({
            "version": 3,
            "id": "conv-1",
            "conversationStats": {"conversationTurnCount": 3}
        })) {
            MetadataLoad::Versioned(m) => m,
            _ => panic!("expected versioned"),
        };
        let outcome = V3ToV4.apply(&ctx, meta).await.unwrap();
        let InteractionMetadata::V4(v4) = &outcome.metadata else {
            panic!("expected v4");
        };
        assert_eq!(v4.interaction_stats.interaction_turn_count, 3);
        assert!(outcome
            .changes
            .iter()
            .any(|c| c.kind == "default_synthesized"));
        assert!(outcome.changes.iter().any(|c| c.kind == "version_bump"));
    }

    #[tokio::test]
    async fn test_normalize_conversations_index() {
        let dir = TempDir::new().unwrap();
        let layout = AdminLayout::new(dir.path());
        write_json(
            &layout.conversations_index(),
            &json!({"conversations": [{"id": "conv-1"}]}),
        )
        .await
        .unwrap();

        let changes = normalize_conversations_index(&layout).await.unwrap();
        assert!(!changes.is_empty());

        let index: ConversationsIndex = crate::fsio::read_json(&layout.conversations_index())
            .await
            .unwrap();
        assert_eq!(index.version.as_deref(), Some("1.0"));
        assert_eq!(index.conversations[0]["title"], "Untitled");

        // Second pass: nothing left to normalize
        let changes = normalize_conversations_index(&layout).await.unwrap();
        assert!(changes.is_empty());
    }
}

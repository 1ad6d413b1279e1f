//! Versioned interaction metadata and the collaboration aggregate.
//!
//! Interaction metadata carries an integer schema `version` (1..=4). Each
//! version is its own struct and the set of versions is a tagged enum, so
//! the mapping between adjacent versions is a total function instead of
//! runtime presence-testing on loosely shaped maps. Unknown legacy fields
//! are preserved through flattened extra maps.
//!
//! Version history:
//! - v1/v2: flat shape; stats and metrics under `conversationStats` /
//!   `conversationMetrics`, token usage (if any) in one of several legacy
//!   locations.
//! - v3: adds `tokenUsageStats` aggregated from the usage log.
//! - v4: `interactionStats` / `interactionMetrics` naming, canonical
//!   `tokenUsageStatsForInteraction` block.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::token_usage::TokenUsageTotals;

/// Latest interaction schema version.
pub const CURRENT_VERSION: u32 = 4;

fn empty_object() -> Value {
    Value::Object(Map::new())
}

// ============================================================================
// Nested blocks
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_turn_count: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionStats {
    #[serde(default)]
    pub interaction_turn_count: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_turn_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objectives: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_usage: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionMetrics {
    #[serde(default)]
    pub interaction_turn_count: i64,
    #[serde(default = "empty_object")]
    pub objectives: Value,
    #[serde(default = "empty_object")]
    pub resources: Value,
    #[serde(default = "empty_object")]
    pub tool_usage: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for InteractionMetrics {
    fn default() -> Self {
        Self {
            interaction_turn_count: 0,
            objectives: empty_object(),
            resources: empty_object(),
            tool_usage: empty_object(),
            extra: Map::new(),
        }
    }
}

/// Token-usage block introduced at v3.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage_interaction: Option<TokenUsageTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage_statement: Option<TokenUsageTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage_turn: Option<TokenUsageTotals>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Canonical v4 token-usage block. Missing pieces default to zeroed totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsageStatsForInteraction {
    pub token_usage_interaction: TokenUsageTotals,
    pub token_usage_statement: TokenUsageTotals,
    pub token_usage_turn: TokenUsageTotals,
}

// ============================================================================
// Versioned interaction metadata
// ============================================================================

macro_rules! flat_metadata_version {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            pub version: u32,
            pub id: String,
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub title: Option<String>,
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub updated_at: Option<String>,
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub conversation_stats: Option<ConversationStats>,
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub conversation_metrics: Option<ConversationMetrics>,
            /// Flat legacy token-usage location.
            #[serde(default, skip_serializing_if = "Option::is_none")]
            pub token_usage: Option<TokenUsageTotals>,
            #[serde(flatten)]
            pub extra: Map<String, Value>,
        }
    };
}

flat_metadata_version!(InteractionMetadataV1);
flat_metadata_version!(InteractionMetadataV2);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionMetadataV3 {
    pub version: u32,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_stats: Option<ConversationStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_metrics: Option<ConversationMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsageTotals>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage_stats: Option<TokenUsageStats>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionMetadataV4 {
    pub version: u32,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub interaction_stats: InteractionStats,
    #[serde(default)]
    pub interaction_metrics: InteractionMetrics,
    #[serde(default)]
    pub token_usage_stats_for_interaction: TokenUsageStatsForInteraction,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Interaction metadata at any supported schema version.
#[derive(Debug, Clone, PartialEq)]
pub enum InteractionMetadata {
    V1(InteractionMetadataV1),
    V2(InteractionMetadataV2),
    V3(InteractionMetadataV3),
    V4(InteractionMetadataV4),
}

/// Outcome of loading an entity's metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataLoad {
    Versioned(InteractionMetadata),
    /// Metadata absent, un-parsable, or missing a usable `version` field.
    /// Legacy entities are skipped, not failed.
    Legacy { reason: String },
}

impl InteractionMetadata {
    /// Classifies a raw JSON value into a versioned record or a legacy one.
    pub fn from_value(value: Value) -> MetadataLoad {
        let version = match value.get("version").and_then(Value::as_u64) {
            Some(v) => v,
            None => {
                return MetadataLoad::Legacy {
                    reason: "missing or non-integer 'version' field".to_string(),
                }
            }
        };

        let parsed = match version {
            1 => serde_json::from_value(value).map(InteractionMetadata::V1),
            2 => serde_json::from_value(value).map(InteractionMetadata::V2),
            3 => serde_json::from_value(value).map(InteractionMetadata::V3),
            // Anything at or past the current version is treated as current.
            _ => serde_json::from_value(value).map(InteractionMetadata::V4),
        };

        match parsed {
            Ok(meta) => MetadataLoad::Versioned(meta),
            Err(e) => MetadataLoad::Legacy {
                reason: format!("unparsable v{} metadata: {}", version, e),
            },
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            InteractionMetadata::V1(m) => m.version,
            InteractionMetadata::V2(m) => m.version,
            InteractionMetadata::V3(m) => m.version,
            InteractionMetadata::V4(m) => m.version,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            InteractionMetadata::V1(m) => &m.id,
            InteractionMetadata::V2(m) => &m.id,
            InteractionMetadata::V3(m) => &m.id,
            InteractionMetadata::V4(m) => &m.id,
        }
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            InteractionMetadata::V1(m) => serde_json::to_value(m),
            InteractionMetadata::V2(m) => serde_json::to_value(m),
            InteractionMetadata::V3(m) => serde_json::to_value(m),
            InteractionMetadata::V4(m) => serde_json::to_value(m),
        }
    }
}

// ============================================================================
// Pure mappings between adjacent versions
// ============================================================================

/// v1 → v2: version bump only.
pub fn upgrade_v1_to_v2(meta: InteractionMetadataV1) -> InteractionMetadataV2 {
    InteractionMetadataV2 {
        version: 2,
        id: meta.id,
        title: meta.title,
        updated_at: meta.updated_at,
        conversation_stats: meta.conversation_stats,
        conversation_metrics: meta.conversation_metrics,
        token_usage: meta.token_usage,
        extra: meta.extra,
    }
}

/// v2 → v3 metadata half: attaches the aggregated interaction totals under
/// `tokenUsageStats.tokenUsageInteraction`, keeping any pre-existing
/// statement/turn blocks found under a legacy `tokenUsageStats` extra and
/// zero-filling the rest. Returns the paths of synthesized defaults.
pub fn attach_usage_stats_v2_to_v3(
    meta: InteractionMetadataV2,
    interaction_totals: TokenUsageTotals,
) -> (InteractionMetadataV3, Vec<String>) {
    let mut extra = meta.extra;
    let mut synthesized = Vec::new();

    // Some v2 records already carry a tokenUsageStats block written by newer
    // code; keep its statement/turn halves.
    let existing: TokenUsageStats = extra
        .remove("tokenUsageStats")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    let statement = existing.token_usage_statement.unwrap_or_else(|| {
        synthesized.push("tokenUsageStats.tokenUsageStatement".to_string());
        TokenUsageTotals::default()
    });
    let turn = existing.token_usage_turn.unwrap_or_else(|| {
        synthesized.push("tokenUsageStats.tokenUsageTurn".to_string());
        TokenUsageTotals::default()
    });

    let stats = TokenUsageStats {
        token_usage_interaction: Some(interaction_totals),
        token_usage_statement: Some(statement),
        token_usage_turn: Some(turn),
        extra: existing.extra,
    };

    let upgraded = InteractionMetadataV3 {
        version: 3,
        id: meta.id,
        title: meta.title,
        updated_at: meta.updated_at,
        conversation_stats: meta.conversation_stats,
        conversation_metrics: meta.conversation_metrics,
        token_usage: meta.token_usage,
        token_usage_stats: Some(stats),
        extra,
    };
    (upgraded, synthesized)
}

/// v3 → v4: pure reshape, no file moves. Returns the paths of every
/// synthesized default so operators can spot incomplete legacy data.
pub fn upgrade_v3_to_v4(meta: InteractionMetadataV3) -> (InteractionMetadataV4, Vec<String>) {
    let mut synthesized = Vec::new();
    let mut extra = meta.extra;

    // conversationStats -> interactionStats
    let stats = meta.conversation_stats.unwrap_or_default();
    let interaction_stats = InteractionStats {
        interaction_turn_count: stats.conversation_turn_count.unwrap_or_else(|| {
            synthesized.push("interactionStats.interactionTurnCount".to_string());
            0
        }),
        extra: stats.extra,
    };

    // conversationMetrics -> interactionMetrics, with default empty containers
    let metrics = meta.conversation_metrics.unwrap_or_default();
    let interaction_metrics = InteractionMetrics {
        interaction_turn_count: metrics.conversation_turn_count.unwrap_or_else(|| {
            synthesized.push("interactionMetrics.interactionTurnCount".to_string());
            0
        }),
        objectives: metrics.objectives.unwrap_or_else(|| {
            synthesized.push("interactionMetrics.objectives".to_string());
            empty_object()
        }),
        resources: metrics.resources.unwrap_or_else(|| {
            synthesized.push("interactionMetrics.resources".to_string());
            empty_object()
        }),
        tool_usage: metrics.tool_usage.unwrap_or_else(|| {
            synthesized.push("interactionMetrics.toolUsage".to_string());
            empty_object()
        }),
        extra: metrics.extra,
    };

    // Three overlapping legacy token-usage locations, consolidated with a
    // fixed precedence: tokenUsageStats > flat tokenUsage > the pre-v1
    // tokenUsageConversation extra. First present wins per sub-block.
    let stats_block = meta.token_usage_stats.unwrap_or_default();
    let oldest: Option<TokenUsageTotals> = extra
        .remove("tokenUsageConversation")
        .and_then(|v| serde_json::from_value(v).ok());

    let interaction_totals = stats_block
        .token_usage_interaction
        .or(meta.token_usage)
        .or(oldest)
        .unwrap_or_else(|| {
            synthesized.push("tokenUsageStatsForInteraction.tokenUsageInteraction".to_string());
            TokenUsageTotals::default()
        });
    let statement_totals = stats_block.token_usage_statement.unwrap_or_else(|| {
        synthesized.push("tokenUsageStatsForInteraction.tokenUsageStatement".to_string());
        TokenUsageTotals::default()
    });
    let turn_totals = stats_block.token_usage_turn.unwrap_or_else(|| {
        synthesized.push("tokenUsageStatsForInteraction.tokenUsageTurn".to_string());
        TokenUsageTotals::default()
    });

    let upgraded = InteractionMetadataV4 {
        version: 4,
        id: meta.id,
        title: meta.title,
        updated_at: meta.updated_at,
        interaction_stats,
        interaction_metrics,
        token_usage_stats_for_interaction: TokenUsageStatsForInteraction {
            token_usage_interaction: interaction_totals,
            token_usage_statement: statement_totals,
            token_usage_turn: turn_totals,
        },
        extra,
    };
    (upgraded, synthesized)
}

/// Applies the v4 field-renaming rules to one loose JSON record.
///
/// Used for `.jsonl` log lines during structural migration: renames
/// `conversationStats` to `interactionStats` and `conversationMetrics` to
/// `interactionMetrics`, with the inner `conversationTurnCount` renamed to
/// `interactionTurnCount` in both. Renaming only; no defaults are added.
pub fn rename_legacy_record(mut value: Value) -> Value {
    let Some(obj) = value.as_object_mut() else {
        return value;
    };

    for (old, new) in [
        ("conversationStats", "interactionStats"),
        ("conversationMetrics", "interactionMetrics"),
    ] {
        if let Some(mut inner) = obj.remove(old) {
            if let Some(inner_obj) = inner.as_object_mut() {
                if let Some(count) = inner_obj.remove("conversationTurnCount") {
                    inner_obj.insert("interactionTurnCount".to_string(), count);
                }
            }
            obj.insert(new.to_string(), inner);
        }
    }
    value
}

// ============================================================================
// Collaboration aggregate
// ============================================================================

/// Denormalized summary of one interaction, embedded in its collaboration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// v4 aggregate owning one-or-more interactions.
///
/// Created exactly once per legacy conversation during structural migration,
/// reusing the conversation id as the collaboration id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationMetadata {
    pub version: u32,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub interaction_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction: Option<InteractionSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Roll-up of the owned interactions' token usage.
    #[serde(default)]
    pub total_token_usage: TokenUsageTotals,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Legacy project index (`conversations.json`). Loosely shaped on purpose.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsIndex {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub conversations: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Current project index (`collaborations.json`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollaborationsIndex {
    pub version: String,
    pub collaborations: Vec<CollaborationMetadata>,
}

impl CollaborationsIndex {
    pub const VERSION: &'static str = "1.0";

    pub fn new(collaborations: Vec<CollaborationMetadata>) -> Self {
        Self {
            version: Self::VERSION.to_string(),
            collaborations,
        }
    }
}

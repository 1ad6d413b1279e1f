//! Append-only token-usage logs for one entity.
//!
//! Each interaction directory holds up to two physical logs, one per usage
//! kind: `token_usage.jsonl` (conversation) and `token_usage_chat.jsonl`
//! (chat). Records are one JSON object per line.
//!
//! Validation is two-tiered: structural violations (missing required field,
//! unknown enum value, wrong type) are typed errors, while semantically
//! suspicious but structurally valid values (negative counts, cache math
//! that does not reconcile within tolerance) are logged and accepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use trove_core::error::{Result, TroveError};

use crate::paths::{TOKEN_USAGE_CHAT, TOKEN_USAGE_CONVERSATION};

/// Tolerance for reconciling `savingsTotal` against
/// `potentialCost - actualCost`.
pub const CACHE_RECONCILE_TOLERANCE: f64 = 0.0001;

/// Which physical log a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    Conversation,
    Chat,
}

impl UsageKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            UsageKind::Conversation => TOKEN_USAGE_CONVERSATION,
            UsageKind::Chat => TOKEN_USAGE_CHAT,
        }
    }
}

/// Role that produced a usage record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageRole {
    User,
    Assistant,
    Tool,
    System,
}

impl UsageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageRole::User => "user",
            UsageRole::Assistant => "assistant",
            UsageRole::Tool => "tool",
            UsageRole::System => "system",
        }
    }
}

/// Raw token counts reported by the model provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
    #[serde(default)]
    pub thought_tokens: i64,
    /// All-inclusive total. Absent in records written before schema v3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_all_tokens: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RawUsage {
    /// The all-inclusive total as defined at schema v3: the plain total plus
    /// cache-creation, cache-read, and thought tokens.
    pub fn computed_total_all(&self) -> i64 {
        self.total_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
            + self.thought_tokens
    }
}

/// Tokens attributable to this record alone (deltas against the prior turn).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifferentialUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Cost impact of prompt caching for one record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheImpact {
    #[serde(default)]
    pub potential_cost: f64,
    #[serde(default)]
    pub actual_cost: f64,
    /// Single savings scalar, replaced at schema v3 by `savingsTotal`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savings: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savings_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savings_percentage: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// One entry in a token-usage log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageRecord {
    pub message_id: String,
    pub timestamp: String,
    pub role: UsageRole,
    #[serde(rename = "type")]
    pub kind: UsageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_usage: Option<RawUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub differential_usage: Option<DifferentialUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_impact: Option<CacheImpact>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Accumulated raw-usage totals. Also the canonical token-usage block stored
/// on interaction metadata from schema v3 on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsageTotals {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub thought_tokens: i64,
    pub total_all_tokens: i64,
}

/// Accumulated differential-usage totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DifferentialTotals {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

/// Accumulated cache-impact totals.
///
/// `savings_percentage` is derived once from the accumulated totals, never
/// accumulated per record: a sum of percentages is not meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheImpactTotals {
    pub potential_cost: f64,
    pub actual_cost: f64,
    pub savings_total: f64,
    pub savings_percentage: f64,
}

/// Result of folding a whole usage log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsageAnalysis {
    pub total_usage: TokenUsageTotals,
    pub differential_usage: DifferentialTotals,
    pub cache_impact: CacheImpactTotals,
    /// All-inclusive token totals per role.
    pub by_role: BTreeMap<String, i64>,
    pub record_count: usize,
}

/// Append-only usage-log abstraction over the two physical logs of one
/// entity directory.
#[derive(Debug, Clone)]
pub struct TokenUsageLog {
    entity_dir: PathBuf,
}

impl TokenUsageLog {
    pub fn new(entity_dir: impl Into<PathBuf>) -> Self {
        Self {
            entity_dir: entity_dir.into(),
        }
    }

    pub fn path_for(&self, kind: UsageKind) -> PathBuf {
        self.entity_dir.join(kind.file_name())
    }

    /// Validates and appends one record to the log for its kind.
    ///
    /// # Errors
    ///
    /// Returns `TroveError::Validation` on structural violations (empty
    /// message id or timestamp, missing `rawUsage`). Value-level anomalies
    /// are logged and accepted.
    pub async fn write_usage(&self, record: &TokenUsageRecord) -> Result<()> {
        validate_record(record)?;
        warn_on_suspicious_values(record);

        let path = self.path_for(record.kind);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TroveError::io(e.to_string()))?;
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| TroveError::io(format!("Failed to open {}: {}", path.display(), e)))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| TroveError::io(e.to_string()))?;
        Ok(())
    }

    /// Reads every record of the given kind. An absent log yields an empty
    /// list; a malformed line is a structural validation error.
    pub async fn read_all(&self, kind: UsageKind) -> Result<Vec<TokenUsageRecord>> {
        let path = self.path_for(kind);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| TroveError::io(format!("Failed to read {}: {}", path.display(), e)))?;

        let mut records = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: TokenUsageRecord = serde_json::from_str(line).map_err(|e| {
                TroveError::validation(
                    format!("{}:{}", path.display(), idx + 1),
                    format!("malformed usage record: {}", e),
                )
            })?;
            records.push(record);
        }
        Ok(records)
    }

    /// Read-modify-write over the whole log, matched by message id.
    ///
    /// # Errors
    ///
    /// Returns `TroveError::NotFound` if no record has the given message id.
    pub async fn update_record<F>(&self, kind: UsageKind, message_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut TokenUsageRecord),
    {
        let mut records = self.read_all(kind).await?;
        let record = records
            .iter_mut()
            .find(|r| r.message_id == message_id)
            .ok_or_else(|| TroveError::not_found("TokenUsageRecord", message_id))?;
        f(record);
        self.rewrite(kind, &records).await
    }

    /// Replaces the whole log with the given records.
    pub async fn rewrite(&self, kind: UsageKind, records: &[TokenUsageRecord]) -> Result<()> {
        let path = self.path_for(kind);
        let mut content = String::new();
        for record in records {
            content.push_str(&serde_json::to_string(record)?);
            content.push('\n');
        }
        fs::write(&path, content)
            .await
            .map_err(|e| TroveError::io(format!("Failed to write {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Folds the log into running totals.
    ///
    /// Records missing a required substructure are skipped with a warning;
    /// the fold is never fatal for value-level problems.
    pub async fn analyze_usage(&self, kind: UsageKind) -> Result<TokenUsageAnalysis> {
        let records = self.read_all(kind).await?;
        let mut analysis = TokenUsageAnalysis::default();

        for record in &records {
            let Some(raw) = &record.raw_usage else {
                tracing::warn!(
                    "Skipping usage record '{}' during analysis: missing rawUsage",
                    record.message_id
                );
                continue;
            };

            analysis.total_usage.input_tokens += raw.input_tokens;
            analysis.total_usage.output_tokens += raw.output_tokens;
            analysis.total_usage.total_tokens += raw.total_tokens;
            analysis.total_usage.cache_creation_input_tokens += raw.cache_creation_input_tokens;
            analysis.total_usage.cache_read_input_tokens += raw.cache_read_input_tokens;
            analysis.total_usage.thought_tokens += raw.thought_tokens;
            let all = raw.total_all_tokens.unwrap_or_else(|| raw.computed_total_all());
            analysis.total_usage.total_all_tokens += all;

            if let Some(diff) = &record.differential_usage {
                analysis.differential_usage.input_tokens += diff.input_tokens;
                analysis.differential_usage.output_tokens += diff.output_tokens;
                analysis.differential_usage.total_tokens += diff.total_tokens;
            }

            if let Some(cache) = &record.cache_impact {
                analysis.cache_impact.potential_cost += cache.potential_cost;
                analysis.cache_impact.actual_cost += cache.actual_cost;
                analysis.cache_impact.savings_total += cache
                    .savings_total
                    .or(cache.savings)
                    .unwrap_or(cache.potential_cost - cache.actual_cost);
            }

            *analysis.by_role.entry(record.role.as_str().to_string()).or_insert(0) += all;
            analysis.record_count += 1;
        }

        // Derived once from the accumulated totals.
        analysis.cache_impact.savings_percentage = if analysis.cache_impact.potential_cost > 0.0 {
            analysis.cache_impact.savings_total / analysis.cache_impact.potential_cost * 100.0
        } else {
            0.0
        };

        Ok(analysis)
    }

    pub fn entity_dir(&self) -> &Path {
        &self.entity_dir
    }
}

fn validate_record(record: &TokenUsageRecord) -> Result<()> {
    if record.message_id.trim().is_empty() {
        return Err(TroveError::validation("messageId", "must not be empty"));
    }
    if record.timestamp.trim().is_empty() {
        return Err(TroveError::validation("timestamp", "must not be empty"));
    }
    if record.raw_usage.is_none() {
        return Err(TroveError::validation("rawUsage", "required substructure missing"));
    }
    Ok(())
}

fn warn_on_suspicious_values(record: &TokenUsageRecord) {
    if let Some(raw) = &record.raw_usage {
        let counts = [
            raw.input_tokens,
            raw.output_tokens,
            raw.total_tokens,
            raw.cache_creation_input_tokens,
            raw.cache_read_input_tokens,
            raw.thought_tokens,
        ];
        if counts.iter().any(|c| *c < 0) {
            tracing::warn!(
                "Usage record '{}' has negative token counts; accepting as-is",
                record.message_id
            );
        }
    }
    if let Some(cache) = &record.cache_impact {
        if let Some(savings_total) = cache.savings_total {
            let expected = cache.potential_cost - cache.actual_cost;
            if (savings_total - expected).abs() > CACHE_RECONCILE_TOLERANCE {
                tracing::warn!(
                    "Usage record '{}' cache math does not reconcile: savingsTotal {} vs potential-actual {}",
                    record.message_id,
                    savings_total,
                    expected
                );
            }
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a candidate was pulled out of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    ExplicitMarker,
    BareToken,
}

impl std::fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ExplicitMarker => "explicit_marker",
            Self::BareToken => "bare_token",
        })
    }
}

/// An unvalidated ticker-like substring. Lives for one detection pass only.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub symbol: String,
    pub method: ExtractionMethod,
    pub base_confidence: f64,
}

impl Candidate {
    pub fn is_explicit(&self) -> bool {
        self.method == ExtractionMethod::ExplicitMarker
    }
}

/// One inbound chat message. The exporter that produces these is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: String,
    pub text: String,
    pub author_id: String,
    pub author_name: String,
    pub timestamp: DateTime<Utc>,
}

/// A canonical symbol row. Created on first acceptance, never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Ticker {
    pub symbol: String,
    pub exchange: Option<String>,
    pub confirmed: bool,
    pub confidence: f64,
    pub last_reconciled_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FirstMention {
    pub message_id: String,
    pub author_name: String,
    pub mentioned_at: DateTime<Utc>,
}

/// Materialized per-ticker view, recomputed from mention rows.
#[derive(Debug, Clone, Serialize)]
pub struct TickerAggregate {
    pub ticker: String,
    pub mention_count: u64,
    pub unique_author_count: u64,
    pub first_mention: Option<FirstMention>,
    pub last_mention_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    PermanentBlock,
    RequiresExplicitMarker,
    RequiresPriceContext,
    MinimumConfidence,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermanentBlock => "permanent_block",
            Self::RequiresExplicitMarker => "requires_explicit_marker",
            Self::RequiresPriceContext => "requires_price_context",
            Self::MinimumConfidence => "minimum_confidence",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "permanent_block" => Some(Self::PermanentBlock),
            "requires_explicit_marker" => Some(Self::RequiresExplicitMarker),
            "requires_price_context" => Some(Self::RequiresPriceContext),
            "minimum_confidence" => Some(Self::MinimumConfidence),
            _ => None,
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contextual override rule for one ticker symbol.
#[derive(Debug, Clone, Serialize)]
pub struct TickerRule {
    pub ticker: String,
    pub kind: RuleKind,
    pub min_confidence: Option<f64>,
    pub required_phrases: Vec<String>,
    pub excluded_phrases: Vec<String>,
    pub domain: Option<String>,
    pub reason: String,
    /// Operator's free-text note, kept verbatim for audit.
    pub note: Option<String>,
}

/// Operator request to create or replace a rule. Structured predicate fields
/// take precedence; the free-text note is a parsing fallback only.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub ticker: String,
    #[serde(default)]
    pub kind: Option<RuleKind>,
    pub reason: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub required_phrases: Vec<String>,
    #[serde(default)]
    pub excluded_phrases: Vec<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

/// One entry of the pull-model snapshot sent to dashboards and on WS connect.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotEntry {
    pub ticker: Ticker,
    pub aggregate: TickerAggregate,
}

/// Events pushed to fan-out subscribers. Mention updates and price ticks are
/// independent streams sharing one bus; a reconciliation correction is a
/// mention update with `correction` set.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    TickerMentionUpdate {
        ticker: String,
        aggregate: TickerAggregate,
        confidence: f64,
        correction: bool,
    },
    PriceTick {
        symbol: String,
        price: f64,
        timestamp: i64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Storage failures are retryable: record() is idempotent on
    /// (ticker, message_id) so callers re-submit with the same key.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),
    #[error("external call timed out")]
    Timeout,
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

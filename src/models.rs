//! Core value types shared across the pipeline.
//!
//! Each stage receives a plain value (signal payload, enriched payload,
//! decision object) and returns another; cross-stage linkage lives in the
//! database keyed by event_id, never in an in-memory object graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Signal submission accepted at ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSubmission {
    pub event_type: String,
    pub symbol: String,
    pub signal_direction: String,
    pub entry_price: f64,
    pub size: f64,
    #[serde(default)]
    pub liquidation_price: Option<f64>,
    /// RFC 3339 timestamp the signal was produced at.
    pub ts_utc: String,
    pub source: String,
    #[serde(default)]
    pub feature_profile: Option<String>,
}

impl SignalSubmission {
    /// Field-level validation; all problems are collected, not short-circuited.
    pub fn validate(&self) -> Vec<Value> {
        let mut errors = Vec::new();
        if !matches!(self.event_type.as_str(), "OPEN_SIGNAL" | "CLOSE_SIGNAL") {
            errors.push(json!({
                "field": "event_type",
                "message": "must be OPEN_SIGNAL or CLOSE_SIGNAL",
            }));
        }
        if self.symbol.trim().is_empty() {
            errors.push(json!({ "field": "symbol", "message": "must not be empty" }));
        }
        if !matches!(
            self.signal_direction.to_ascii_lowercase().as_str(),
            "long" | "short"
        ) {
            errors.push(json!({
                "field": "signal_direction",
                "message": "must be long or short",
            }));
        }
        if !self.entry_price.is_finite() || self.entry_price < 0.0 {
            errors.push(json!({
                "field": "entry_price",
                "message": "must be a non-negative number",
            }));
        }
        if !self.size.is_finite() || self.size <= 0.0 {
            errors.push(json!({ "field": "size", "message": "must be a positive number" }));
        }
        if self.parsed_ts().is_none() {
            errors.push(json!({
                "field": "ts_utc",
                "message": "must be an RFC 3339 timestamp",
            }));
        }
        if self.source.trim().is_empty() {
            errors.push(json!({ "field": "source", "message": "must not be empty" }));
        }
        errors
    }

    pub fn parsed_ts(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.ts_utc)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Signal age at `now`, in seconds. Unparseable timestamps count as age 0
    /// (the schema validator has already rejected those at ingress).
    pub fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        self.parsed_ts()
            .map(|ts| (now - ts).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

/// Event lifecycle status. Transitions are monotonic; `rejected`, `published`,
/// `failed` and `dlq` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Queued,
    Enriched,
    EnrichmentPartial,
    Evaluated,
    Published,
    Failed,
    Rejected,
    Dlq,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Enriched => "enriched",
            Self::EnrichmentPartial => "enrichment_partial",
            Self::Evaluated => "evaluated",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Dlq => "dlq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "enriched" => Some(Self::Enriched),
            "enrichment_partial" => Some(Self::EnrichmentPartial),
            "evaluated" => Some(Self::Evaluated),
            "published" => Some(Self::Published),
            "failed" => Some(Self::Failed),
            "rejected" => Some(Self::Rejected),
            "dlq" => Some(Self::Dlq),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Published | Self::Failed | Self::Rejected | Self::Dlq
        )
    }
}

/// The five decisions an AI model may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    FollowEnter,
    Ignore,
    FollowExit,
    Hold,
    TightenStop,
}

impl DecisionKind {
    pub const ALL: [&'static str; 5] =
        ["FOLLOW_ENTER", "IGNORE", "FOLLOW_EXIT", "HOLD", "TIGHTEN_STOP"];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FOLLOW_ENTER" => Some(Self::FollowEnter),
            "IGNORE" => Some(Self::Ignore),
            "FOLLOW_EXIT" => Some(Self::FollowExit),
            "HOLD" => Some(Self::Hold),
            "TIGHTEN_STOP" => Some(Self::TightenStop),
            _ => None,
        }
    }

    pub fn is_valid(s: &str) -> bool {
        Self::parse(s).is_some()
    }
}

/// Pipeline stage, the unit of retry, DLQ classification and timeline
/// accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStage {
    Enqueue,
    Enrich,
    Evaluate,
    Publish,
}

impl DlqStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Enrich => "enrich",
            Self::Evaluate => "evaluate",
            Self::Publish => "publish",
        }
    }

    /// Canonical parse, accepting the legacy aliases still present in older
    /// rows and older callers.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enqueue" => Some(Self::Enqueue),
            "enrich" | "enrichment" => Some(Self::Enrich),
            "evaluate" | "evaluation" => Some(Self::Evaluate),
            "publish" => Some(Self::Publish),
            _ => None,
        }
    }
}

/// Decision message broadcast to WebSocket subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionBroadcast {
    pub event_id: String,
    pub symbol: String,
    pub event_type: String,
    pub model: String,
    pub decision: Value,
    pub published_at: DateTime<Utc>,
}

impl DecisionBroadcast {
    pub fn to_message(&self) -> String {
        json!({
            "type": "decision",
            "event_id": self.event_id,
            "symbol": self.symbol,
            "event_type": self.event_type,
            "model": self.model,
            "decision": self.decision,
            "published_at": self.published_at.to_rfc3339(),
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_signal() -> SignalSubmission {
        SignalSubmission {
            event_type: "OPEN_SIGNAL".into(),
            symbol: "BTC".into(),
            signal_direction: "long".into(),
            entry_price: 42000.5,
            size: 0.1,
            liquidation_price: Some(38000.0),
            ts_utc: Utc::now().to_rfc3339(),
            source: "s1".into(),
            feature_profile: None,
        }
    }

    #[test]
    fn valid_signal_passes_validation() {
        assert!(sample_signal().validate().is_empty());
    }

    #[test]
    fn validation_collects_all_errors() {
        let mut s = sample_signal();
        s.event_type = "NOPE".into();
        s.symbol = "".into();
        s.size = 0.0;
        let errors = s.validate();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn status_roundtrip_and_terminals() {
        for status in [
            EventStatus::Queued,
            EventStatus::Enriched,
            EventStatus::EnrichmentPartial,
            EventStatus::Evaluated,
            EventStatus::Published,
            EventStatus::Failed,
            EventStatus::Rejected,
            EventStatus::Dlq,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert!(EventStatus::Published.is_terminal());
        assert!(EventStatus::Rejected.is_terminal());
        assert!(!EventStatus::Enriched.is_terminal());
    }

    #[test]
    fn stage_accepts_legacy_aliases() {
        assert_eq!(DlqStage::parse("enrichment"), Some(DlqStage::Enrich));
        assert_eq!(DlqStage::parse("evaluation"), Some(DlqStage::Evaluate));
        assert_eq!(DlqStage::parse("publish"), Some(DlqStage::Publish));
        assert_eq!(DlqStage::parse("bogus"), None);
    }

    #[test]
    fn decision_kind_valid_set() {
        for d in DecisionKind::ALL {
            assert!(DecisionKind::is_valid(d));
        }
        assert!(!DecisionKind::is_valid("BUY"));
    }
}

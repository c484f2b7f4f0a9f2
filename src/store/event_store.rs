//! Database-backed event store.
//!
//! Holds the canonical record of every event, its enrichment, its timeline
//! transitions, every model decision, DLQ rows, and operator-owned config
//! (LLM credentials + versioned prompts).
//!
//! Key choices:
//! - WAL mode for concurrent reads during writes
//! - One connection behind a parking_lot mutex; statements are short
//! - Every status advance commits together with its timeline append
//! - JSON columns store payloads verbatim for audit

use crate::models::{DlqStage, EventStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

/// Length cap applied to error messages in DLQ list summaries. Detail views
/// return the full text.
pub const DLQ_SUMMARY_ERROR_LEN: usize = 200;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    idempotency_key TEXT UNIQUE,
    event_type TEXT NOT NULL,
    symbol TEXT NOT NULL,
    signal_direction TEXT NOT NULL,
    entry_price NUMERIC(20,8) NOT NULL,
    size NUMERIC(20,8) NOT NULL,
    liquidation_price NUMERIC(20,8),
    ts_utc TEXT NOT NULL,
    source TEXT NOT NULL,
    feature_profile TEXT,
    status TEXT NOT NULL DEFAULT 'queued',
    received_at TEXT NOT NULL,
    enriched_at TEXT,
    evaluated_at TEXT,
    published_at TEXT,
    raw_payload TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);
CREATE INDEX IF NOT EXISTS idx_events_source ON events(source);
CREATE INDEX IF NOT EXISTS idx_events_received ON events(received_at DESC);
CREATE INDEX IF NOT EXISTS idx_events_symbol_received ON events(symbol, received_at DESC);

CREATE TABLE IF NOT EXISTS enriched_events (
    event_id TEXT PRIMARY KEY REFERENCES events(event_id),
    feature_profile TEXT NOT NULL,
    provider TEXT NOT NULL,
    market_data TEXT,
    ta_data TEXT,
    derivs_data TEXT,
    constraints_json TEXT NOT NULL,
    data_timestamps TEXT NOT NULL,
    quality_flags TEXT NOT NULL,
    enriched_payload TEXT NOT NULL,
    enriched_at TEXT NOT NULL,
    enrichment_duration_ms INTEGER NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS model_decisions (
    id TEXT PRIMARY KEY,
    event_id TEXT NOT NULL,
    model_name TEXT NOT NULL,
    model_version TEXT,
    prompt_version TEXT,
    prompt_hash TEXT,
    decision TEXT NOT NULL,
    confidence REAL NOT NULL,
    entry_plan TEXT,
    risk_plan TEXT,
    size_pct REAL,
    reasons TEXT NOT NULL,
    decision_payload TEXT NOT NULL,
    latency_ms INTEGER NOT NULL,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    error_code TEXT,
    error_message TEXT,
    raw_response TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_decisions_event_model ON model_decisions(event_id, model_name);
CREATE INDEX IF NOT EXISTS idx_decisions_model_status ON model_decisions(model_name, status);

CREATE TABLE IF NOT EXISTS processing_timeline (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    status TEXT NOT NULL,
    details TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_timeline_event ON processing_timeline(event_id, id);

CREATE TABLE IF NOT EXISTS dlq_entries (
    id TEXT PRIMARY KEY,
    event_id TEXT,
    stage TEXT NOT NULL,
    reason_code TEXT NOT NULL,
    error_message TEXT NOT NULL,
    payload TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_retry_at TEXT,
    resolved_at TEXT,
    resolution_note TEXT,
    created_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_dlq_stage_reason ON dlq_entries(stage, reason_code);
CREATE INDEX IF NOT EXISTS idx_dlq_event ON dlq_entries(event_id);
CREATE INDEX IF NOT EXISTS idx_dlq_unresolved ON dlq_entries(created_at DESC)
    WHERE resolved_at IS NULL;

CREATE TABLE IF NOT EXISTS llm_configs (
    model_name TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 1,
    provider TEXT NOT NULL,
    api_key TEXT NOT NULL,
    model_id TEXT NOT NULL,
    timeout_ms INTEGER NOT NULL DEFAULT 30000,
    max_tokens INTEGER NOT NULL DEFAULT 1000,
    validation_status TEXT,
    last_validated_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS prompts (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    prompt_type TEXT NOT NULL,
    model_name TEXT,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    description TEXT,
    created_at TEXT NOT NULL,
    UNIQUE(name, version)
);
"#;

/// New event accepted at ingress.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_id: String,
    pub idempotency_key: Option<String>,
    pub event_type: String,
    pub symbol: String,
    pub signal_direction: String,
    pub entry_price: f64,
    pub size: f64,
    pub liquidation_price: Option<f64>,
    pub ts_utc: String,
    pub source: String,
    pub feature_profile: Option<String>,
    pub received_at: DateTime<Utc>,
    pub raw_payload: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRow {
    pub event_id: String,
    pub idempotency_key: Option<String>,
    pub event_type: String,
    pub symbol: String,
    pub signal_direction: String,
    pub entry_price: f64,
    pub size: f64,
    pub liquidation_price: Option<f64>,
    pub ts_utc: String,
    pub source: String,
    pub feature_profile: Option<String>,
    pub status: EventStatus,
    pub received_at: String,
    pub enriched_at: Option<String>,
    pub evaluated_at: Option<String>,
    pub published_at: Option<String>,
    pub raw_payload: Value,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub status: Option<String>,
    pub symbol: Option<String>,
    pub source: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct NewEnrichment {
    pub event_id: String,
    pub feature_profile: String,
    pub provider: String,
    pub market_data: Option<Value>,
    pub ta_data: Option<Value>,
    pub derivs_data: Option<Value>,
    pub constraints: Value,
    pub data_timestamps: Value,
    pub quality_flags: Value,
    pub enriched_payload: Value,
    pub enriched_at: DateTime<Utc>,
    pub enrichment_duration_ms: i64,
}

#[derive(Debug, Clone)]
pub struct NewDecision {
    pub event_id: String,
    pub model_name: String,
    pub model_version: Option<String>,
    pub prompt_version: Option<String>,
    pub prompt_hash: Option<String>,
    pub decision: String,
    pub confidence: f64,
    pub entry_plan: Option<Value>,
    pub risk_plan: Option<Value>,
    pub size_pct: Option<f64>,
    pub reasons: Value,
    pub decision_payload: Value,
    pub latency_ms: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub status: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub raw_response: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRow {
    pub id: String,
    pub event_id: String,
    pub model_name: String,
    pub model_version: Option<String>,
    pub prompt_version: Option<String>,
    pub prompt_hash: Option<String>,
    pub decision: String,
    pub confidence: f64,
    pub entry_plan: Option<Value>,
    pub risk_plan: Option<Value>,
    pub size_pct: Option<f64>,
    pub reasons: Value,
    pub decision_payload: Value,
    pub latency_ms: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub status: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub raw_response: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineRow {
    pub status: String,
    pub details: Option<Value>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewDlqEntry {
    pub event_id: Option<String>,
    pub stage: DlqStage,
    pub reason_code: String,
    pub error_message: String,
    pub payload: Value,
    pub retry_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqRow {
    pub id: String,
    pub event_id: Option<String>,
    pub stage: String,
    pub reason_code: String,
    pub error_message: String,
    pub payload: Value,
    pub retry_count: i64,
    pub last_retry_at: Option<String>,
    pub resolved_at: Option<String>,
    pub resolution_note: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub stage: Option<DlqStage>,
    pub reason_code: Option<String>,
    pub event_id: Option<String>,
    pub resolved: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfigRow {
    pub model_name: String,
    pub enabled: bool,
    pub provider: String,
    pub api_key: String,
    pub model_id: String,
    pub timeout_ms: i64,
    pub max_tokens: i64,
    pub validation_status: Option<String>,
    pub last_validated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromptRow {
    pub id: String,
    pub name: String,
    pub version: String,
    pub prompt_type: String,
    pub model_name: Option<String>,
    pub content: String,
    pub content_hash: String,
    pub is_active: bool,
    pub description: Option<String>,
    pub created_at: String,
}

/// Per-stage timing computed from the timeline.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub status: String,
    pub at: String,
    pub since_previous_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventStatusView {
    pub event_id: String,
    pub status: EventStatus,
    pub current_stage: Option<String>,
    pub timeline: Vec<StageTiming>,
    pub total_ms: Option<i64>,
}

pub struct EventStore {
    conn: Mutex<Connection>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn json_col(v: Option<String>) -> Option<Value> {
    v.and_then(|s| serde_json::from_str(&s).ok())
}

impl EventStore {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open event store at {path}"))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to apply event store schema")?;
        debug!(path, "Event store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    // ---------------------------------------------------------------- events

    /// Insert the ingress row together with its RECEIVED timeline entry.
    pub fn insert_event(&self, event: &NewEvent) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO events (event_id, idempotency_key, event_type, symbol,
                signal_direction, entry_price, size, liquidation_price, ts_utc,
                source, feature_profile, status, received_at, raw_payload)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,'queued',?12,?13)",
            params![
                event.event_id,
                event.idempotency_key,
                event.event_type,
                event.symbol,
                event.signal_direction,
                event.entry_price,
                event.size,
                event.liquidation_price,
                event.ts_utc,
                event.source,
                event.feature_profile,
                event.received_at.to_rfc3339(),
                event.raw_payload.to_string(),
            ],
        )?;
        tx.execute(
            "INSERT INTO processing_timeline (event_id, status, details, created_at)
             VALUES (?1,'RECEIVED',?2,?3)",
            params![
                event.event_id,
                serde_json::json!({ "source": event.source }).to_string(),
                now_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn append_timeline(&self, event_id: &str, status: &str, details: Option<Value>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO processing_timeline (event_id, status, details, created_at)
             VALUES (?1,?2,?3,?4)",
            params![
                event_id,
                status,
                details.map(|d| d.to_string()),
                now_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
        Ok(EventRow {
            event_id: row.get(0)?,
            idempotency_key: row.get(1)?,
            event_type: row.get(2)?,
            symbol: row.get(3)?,
            signal_direction: row.get(4)?,
            entry_price: row.get(5)?,
            size: row.get(6)?,
            liquidation_price: row.get(7)?,
            ts_utc: row.get(8)?,
            source: row.get(9)?,
            feature_profile: row.get(10)?,
            status: EventStatus::parse(&row.get::<_, String>(11)?).unwrap_or(EventStatus::Queued),
            received_at: row.get(12)?,
            enriched_at: row.get(13)?,
            evaluated_at: row.get(14)?,
            published_at: row.get(15)?,
            raw_payload: json_col(row.get(16)?).unwrap_or(Value::Null),
        })
    }

    const EVENT_COLS: &'static str = "event_id, idempotency_key, event_type, symbol, \
        signal_direction, entry_price, size, liquidation_price, ts_utc, source, \
        feature_profile, status, received_at, enriched_at, evaluated_at, published_at, \
        raw_payload";

    pub fn get_event(&self, event_id: &str) -> Result<Option<EventRow>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM events WHERE event_id = ?1", Self::EVENT_COLS);
        let row = conn
            .query_row(&sql, params![event_id], Self::row_to_event)
            .optional()?;
        Ok(row)
    }

    pub fn find_by_idempotency_key(&self, key: &str) -> Result<Option<EventRow>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM events WHERE idempotency_key = ?1",
            Self::EVENT_COLS
        );
        let row = conn
            .query_row(&sql, params![key], Self::row_to_event)
            .optional()?;
        Ok(row)
    }

    pub fn list_events(&self, filter: &EventFilter) -> Result<(Vec<EventRow>, usize)> {
        let conn = self.conn.lock();
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(status) = &filter.status {
            clauses.push(format!("status = ?{}", args.len() + 1));
            args.push(Box::new(status.clone()));
        }
        if let Some(symbol) = &filter.symbol {
            clauses.push(format!("symbol = ?{}", args.len() + 1));
            args.push(Box::new(symbol.clone()));
        }
        if let Some(source) = &filter.source {
            clauses.push(format!("source = ?{}", args.len() + 1));
            args.push(Box::new(source.clone()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM events{where_sql}");
        let total: usize = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |r| r.get::<_, i64>(0),
        )? as usize;

        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let sql = format!(
            "SELECT {} FROM events{where_sql} ORDER BY received_at DESC LIMIT {limit} OFFSET {}",
            Self::EVENT_COLS,
            filter.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                Self::row_to_event,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((rows, total))
    }

    /// Monotonic status guard: terminal rows never move again.
    fn update_status_tx(
        tx: &rusqlite::Transaction<'_>,
        event_id: &str,
        status: EventStatus,
        stamp_col: Option<&str>,
        at: &str,
    ) -> Result<bool> {
        let changed = match stamp_col {
            Some(col) => tx.execute(
                &format!(
                    "UPDATE events SET status = ?1, {col} = ?2
                     WHERE event_id = ?3
                       AND status NOT IN ('published','failed','rejected','dlq')"
                ),
                params![status.as_str(), at, event_id],
            )?,
            None => tx.execute(
                "UPDATE events SET status = ?1
                 WHERE event_id = ?2
                   AND status NOT IN ('published','failed','rejected','dlq')",
                params![status.as_str(), event_id],
            )?,
        };
        Ok(changed > 0)
    }

    /// Persist an enrichment row, advance status and append the ENRICHED
    /// timeline entry atomically.
    pub fn insert_enrichment(
        &self,
        enrichment: &NewEnrichment,
        status: EventStatus,
        timeline_details: Value,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO enriched_events (event_id, feature_profile, provider,
                market_data, ta_data, derivs_data, constraints_json, data_timestamps,
                quality_flags, enriched_payload, enriched_at, enrichment_duration_ms)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                enrichment.event_id,
                enrichment.feature_profile,
                enrichment.provider,
                enrichment.market_data.as_ref().map(|v| v.to_string()),
                enrichment.ta_data.as_ref().map(|v| v.to_string()),
                enrichment.derivs_data.as_ref().map(|v| v.to_string()),
                enrichment.constraints.to_string(),
                enrichment.data_timestamps.to_string(),
                enrichment.quality_flags.to_string(),
                enrichment.enriched_payload.to_string(),
                enrichment.enriched_at.to_rfc3339(),
                enrichment.enrichment_duration_ms,
            ],
        )?;
        Self::update_status_tx(
            &tx,
            &enrichment.event_id,
            status,
            Some("enriched_at"),
            &enrichment.enriched_at.to_rfc3339(),
        )?;
        tx.execute(
            "INSERT INTO processing_timeline (event_id, status, details, created_at)
             VALUES (?1,'ENRICHED',?2,?3)",
            params![
                enrichment.event_id,
                timeline_details.to_string(),
                now_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_enrichment(&self, event_id: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT feature_profile, provider, market_data, ta_data, derivs_data,
                        constraints_json, data_timestamps, quality_flags, enriched_payload,
                        enriched_at, enrichment_duration_ms
                 FROM enriched_events WHERE event_id = ?1",
                params![event_id],
                |row| {
                    Ok(serde_json::json!({
                        "event_id": event_id,
                        "feature_profile": row.get::<_, String>(0)?,
                        "provider": row.get::<_, String>(1)?,
                        "market_data": json_col(row.get(2)?),
                        "ta_data": json_col(row.get(3)?),
                        "derivs_data": json_col(row.get(4)?),
                        "constraints": json_col(row.get(5)?),
                        "data_timestamps": json_col(row.get(6)?),
                        "quality_flags": json_col(row.get(7)?),
                        "enriched_payload": json_col(row.get(8)?),
                        "enriched_at": row.get::<_, String>(9)?,
                        "enrichment_duration_ms": row.get::<_, i64>(10)?,
                    }))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Advance to a terminal or intermediate status with a timeline entry.
    pub fn transition(
        &self,
        event_id: &str,
        status: EventStatus,
        timeline_status: &str,
        details: Option<Value>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let at = now_rfc3339();
        let stamp_col = match status {
            EventStatus::Enriched | EventStatus::EnrichmentPartial | EventStatus::Rejected => {
                Some("enriched_at")
            }
            EventStatus::Evaluated => Some("evaluated_at"),
            EventStatus::Published => Some("published_at"),
            _ => None,
        };
        let changed = Self::update_status_tx(&tx, event_id, status, stamp_col, &at)?;
        if changed {
            tx.execute(
                "INSERT INTO processing_timeline (event_id, status, details, created_at)
                 VALUES (?1,?2,?3,?4)",
                params![
                    event_id,
                    timeline_status,
                    details.map(|d| d.to_string()),
                    at
                ],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Unconditional status write used only by stage-aware DLQ replay, which
    /// deliberately resurrects events out of the `dlq` terminal.
    pub fn set_status_unchecked(
        &self,
        event_id: &str,
        status: EventStatus,
        timeline_status: &str,
        details: Option<Value>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let at = now_rfc3339();
        match status {
            EventStatus::Published => tx.execute(
                "UPDATE events SET status = ?1, published_at = ?2 WHERE event_id = ?3",
                params![status.as_str(), at, event_id],
            )?,
            _ => tx.execute(
                "UPDATE events SET status = ?1 WHERE event_id = ?2",
                params![status.as_str(), event_id],
            )?,
        };
        tx.execute(
            "INSERT INTO processing_timeline (event_id, status, details, created_at)
             VALUES (?1,?2,?3,?4)",
            params![
                event_id,
                timeline_status,
                details.map(|d| d.to_string()),
                at
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_timeline(&self, event_id: &str) -> Result<Vec<TimelineRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT status, details, created_at FROM processing_timeline
             WHERE event_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                Ok(TimelineRow {
                    status: row.get(0)?,
                    details: json_col(row.get(1)?),
                    created_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Current stage + per-stage durations from the timeline.
    pub fn event_status_view(&self, event_id: &str) -> Result<Option<EventStatusView>> {
        let Some(event) = self.get_event(event_id)? else {
            return Ok(None);
        };
        let timeline = self.get_timeline(event_id)?;
        let mut stages = Vec::with_capacity(timeline.len());
        let mut previous: Option<DateTime<Utc>> = None;
        let mut first: Option<DateTime<Utc>> = None;
        let mut last: Option<DateTime<Utc>> = None;
        for entry in &timeline {
            let at = DateTime::parse_from_rfc3339(&entry.created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .ok();
            let since_previous_ms = match (previous, at) {
                (Some(prev), Some(cur)) => Some((cur - prev).num_milliseconds()),
                _ => None,
            };
            if first.is_none() {
                first = at;
            }
            last = at.or(last);
            previous = at.or(previous);
            stages.push(StageTiming {
                status: entry.status.clone(),
                at: entry.created_at.clone(),
                since_previous_ms,
            });
        }
        let total_ms = match (first, last) {
            (Some(f), Some(l)) => Some((l - f).num_milliseconds()),
            _ => None,
        };
        let current_stage = stages.last().map(|s| s.status.clone());
        Ok(Some(EventStatusView {
            event_id: event.event_id,
            status: event.status,
            current_stage,
            timeline: stages,
            total_ms,
        }))
    }

    // ------------------------------------------------------------- decisions

    pub fn insert_decision(&self, decision: &NewDecision) -> Result<String> {
        let conn = self.conn.lock();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO model_decisions (id, event_id, model_name, model_version,
                prompt_version, prompt_hash, decision, confidence, entry_plan, risk_plan,
                size_pct, reasons, decision_payload, latency_ms, tokens_in, tokens_out,
                status, error_code, error_message, raw_response, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)",
            params![
                id,
                decision.event_id,
                decision.model_name,
                decision.model_version,
                decision.prompt_version,
                decision.prompt_hash,
                decision.decision,
                decision.confidence,
                decision.entry_plan.as_ref().map(|v| v.to_string()),
                decision.risk_plan.as_ref().map(|v| v.to_string()),
                decision.size_pct,
                decision.reasons.to_string(),
                decision.decision_payload.to_string(),
                decision.latency_ms,
                decision.tokens_in,
                decision.tokens_out,
                decision.status,
                decision.error_code,
                decision.error_message,
                decision.raw_response,
                now_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    fn row_to_decision(row: &rusqlite::Row<'_>) -> rusqlite::Result<DecisionRow> {
        Ok(DecisionRow {
            id: row.get(0)?,
            event_id: row.get(1)?,
            model_name: row.get(2)?,
            model_version: row.get(3)?,
            prompt_version: row.get(4)?,
            prompt_hash: row.get(5)?,
            decision: row.get(6)?,
            confidence: row.get(7)?,
            entry_plan: json_col(row.get(8)?),
            risk_plan: json_col(row.get(9)?),
            size_pct: row.get(10)?,
            reasons: json_col(row.get(11)?).unwrap_or(Value::Null),
            decision_payload: json_col(row.get(12)?).unwrap_or(Value::Null),
            latency_ms: row.get(13)?,
            tokens_in: row.get(14)?,
            tokens_out: row.get(15)?,
            status: row.get(16)?,
            error_code: row.get(17)?,
            error_message: row.get(18)?,
            raw_response: row.get(19)?,
            created_at: row.get(20)?,
        })
    }

    const DECISION_COLS: &'static str = "id, event_id, model_name, model_version, \
        prompt_version, prompt_hash, decision, confidence, entry_plan, risk_plan, size_pct, \
        reasons, decision_payload, latency_ms, tokens_in, tokens_out, status, error_code, \
        error_message, raw_response, created_at";

    pub fn decisions_for_event(&self, event_id: &str) -> Result<Vec<DecisionRow>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM model_decisions WHERE event_id = ?1 ORDER BY created_at ASC",
            Self::DECISION_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![event_id], Self::row_to_decision)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_decisions(
        &self,
        event_id: Option<&str>,
        model: Option<&str>,
        symbol: Option<&str>,
        status: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DecisionRow>> {
        let conn = self.conn.lock();
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(event_id) = event_id {
            clauses.push(format!("d.event_id = ?{}", args.len() + 1));
            args.push(Box::new(event_id.to_string()));
        }
        if let Some(model) = model {
            clauses.push(format!("d.model_name = ?{}", args.len() + 1));
            args.push(Box::new(model.to_string()));
        }
        if let Some(symbol) = symbol {
            clauses.push(format!(
                "d.event_id IN (SELECT event_id FROM events WHERE symbol = ?{})",
                args.len() + 1
            ));
            args.push(Box::new(symbol.to_string()));
        }
        if let Some(status) = status {
            clauses.push(format!("d.status = ?{}", args.len() + 1));
            args.push(Box::new(status.to_string()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let limit = if limit == 0 { 50 } else { limit };
        let sql = format!(
            "SELECT {} FROM model_decisions d{where_sql} ORDER BY d.created_at DESC LIMIT {limit} OFFSET {offset}",
            Self::DECISION_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                Self::row_to_decision,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------- dlq

    pub fn insert_dlq(&self, entry: &NewDlqEntry) -> Result<String> {
        let conn = self.conn.lock();
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO dlq_entries (id, event_id, stage, reason_code, error_message,
                payload, retry_count, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                id,
                entry.event_id,
                entry.stage.as_str(),
                entry.reason_code,
                entry.error_message,
                entry.payload.to_string(),
                entry.retry_count,
                now_rfc3339(),
            ],
        )?;
        Ok(id)
    }

    fn row_to_dlq(row: &rusqlite::Row<'_>) -> rusqlite::Result<DlqRow> {
        Ok(DlqRow {
            id: row.get(0)?,
            event_id: row.get(1)?,
            stage: row.get(2)?,
            reason_code: row.get(3)?,
            error_message: row.get(4)?,
            payload: json_col(row.get(5)?).unwrap_or(Value::Null),
            retry_count: row.get(6)?,
            last_retry_at: row.get(7)?,
            resolved_at: row.get(8)?,
            resolution_note: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    const DLQ_COLS: &'static str = "id, event_id, stage, reason_code, error_message, \
        payload, retry_count, last_retry_at, resolved_at, resolution_note, created_at";

    pub fn get_dlq(&self, id: &str) -> Result<Option<DlqRow>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM dlq_entries WHERE id = ?1", Self::DLQ_COLS);
        let row = conn
            .query_row(&sql, params![id], Self::row_to_dlq)
            .optional()?;
        Ok(row)
    }

    pub fn list_dlq(&self, filter: &DlqFilter) -> Result<(Vec<DlqRow>, usize)> {
        let conn = self.conn.lock();
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(stage) = filter.stage {
            clauses.push(format!("stage = ?{}", args.len() + 1));
            args.push(Box::new(stage.as_str().to_string()));
        }
        if let Some(reason) = &filter.reason_code {
            clauses.push(format!("reason_code = ?{}", args.len() + 1));
            args.push(Box::new(reason.clone()));
        }
        if let Some(event_id) = &filter.event_id {
            clauses.push(format!("event_id = ?{}", args.len() + 1));
            args.push(Box::new(event_id.clone()));
        }
        match filter.resolved {
            Some(true) => clauses.push("resolved_at IS NOT NULL".to_string()),
            Some(false) => clauses.push("resolved_at IS NULL".to_string()),
            None => {}
        }
        if let Some(since) = filter.since {
            clauses.push(format!("created_at >= ?{}", args.len() + 1));
            args.push(Box::new(since.to_rfc3339()));
        }
        if let Some(until) = filter.until {
            clauses.push(format!("created_at <= ?{}", args.len() + 1));
            args.push(Box::new(until.to_rfc3339()));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM dlq_entries{where_sql}");
        let total: usize = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |r| r.get::<_, i64>(0),
        )? as usize;

        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let sql = format!(
            "SELECT {} FROM dlq_entries{where_sql} ORDER BY created_at DESC LIMIT {limit} OFFSET {}",
            Self::DLQ_COLS,
            filter.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                Self::row_to_dlq,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((rows, total))
    }

    pub fn dlq_mark_retry(&self, id: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE dlq_entries SET retry_count = retry_count + 1, last_retry_at = ?1
             WHERE id = ?2",
            params![now_rfc3339(), id],
        )?;
        let count = conn.query_row(
            "SELECT retry_count FROM dlq_entries WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    pub fn dlq_resolve(&self, id: &str, note: &str) -> Result<String> {
        let conn = self.conn.lock();
        let at = now_rfc3339();
        conn.execute(
            "UPDATE dlq_entries SET resolved_at = ?1, resolution_note = ?2 WHERE id = ?3",
            params![at, note, id],
        )?;
        Ok(at)
    }

    // ----------------------------------------------------------- llm configs

    pub fn upsert_llm_config(&self, cfg: &LlmConfigRow) -> Result<()> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO llm_configs (model_name, enabled, provider, api_key, model_id,
                timeout_ms, max_tokens, validation_status, last_validated_at, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?10)
             ON CONFLICT(model_name) DO UPDATE SET
                enabled = excluded.enabled,
                provider = excluded.provider,
                api_key = excluded.api_key,
                model_id = excluded.model_id,
                timeout_ms = excluded.timeout_ms,
                max_tokens = excluded.max_tokens,
                validation_status = excluded.validation_status,
                last_validated_at = excluded.last_validated_at,
                updated_at = excluded.updated_at",
            params![
                cfg.model_name,
                cfg.enabled as i64,
                cfg.provider,
                cfg.api_key,
                cfg.model_id,
                cfg.timeout_ms,
                cfg.max_tokens,
                cfg.validation_status,
                cfg.last_validated_at,
                now,
            ],
        )?;
        Ok(())
    }

    fn row_to_llm_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<LlmConfigRow> {
        Ok(LlmConfigRow {
            model_name: row.get(0)?,
            enabled: row.get::<_, i64>(1)? != 0,
            provider: row.get(2)?,
            api_key: row.get(3)?,
            model_id: row.get(4)?,
            timeout_ms: row.get(5)?,
            max_tokens: row.get(6)?,
            validation_status: row.get(7)?,
            last_validated_at: row.get(8)?,
        })
    }

    const LLM_COLS: &'static str = "model_name, enabled, provider, api_key, model_id, \
        timeout_ms, max_tokens, validation_status, last_validated_at";

    pub fn get_llm_config(&self, model_name: &str) -> Result<Option<LlmConfigRow>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM llm_configs WHERE model_name = ?1",
            Self::LLM_COLS
        );
        let row = conn
            .query_row(&sql, params![model_name], Self::row_to_llm_config)
            .optional()?;
        Ok(row)
    }

    pub fn list_llm_configs(&self) -> Result<Vec<LlmConfigRow>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM llm_configs ORDER BY model_name ASC",
            Self::LLM_COLS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::row_to_llm_config)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn set_llm_enabled(&self, model_name: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE llm_configs SET enabled = ?1, updated_at = ?2 WHERE model_name = ?3",
            params![enabled as i64, now_rfc3339(), model_name],
        )?;
        Ok(changed > 0)
    }

    pub fn set_llm_validation(
        &self,
        model_name: &str,
        validation_status: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let now = now_rfc3339();
        let changed = conn.execute(
            "UPDATE llm_configs SET validation_status = ?1, last_validated_at = ?2,
                updated_at = ?2 WHERE model_name = ?3",
            params![validation_status, now, model_name],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_llm_config(&self, model_name: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM llm_configs WHERE model_name = ?1",
            params![model_name],
        )?;
        Ok(changed > 0)
    }

    // --------------------------------------------------------------- prompts

    pub fn upsert_prompt(
        &self,
        name: &str,
        version: &str,
        prompt_type: &str,
        model_name: Option<&str>,
        content: &str,
        content_hash: &str,
        description: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO prompts (id, name, version, prompt_type, model_name, content,
                content_hash, is_active, description, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,1,?8,?9)
             ON CONFLICT(name, version) DO UPDATE SET
                prompt_type = excluded.prompt_type,
                model_name = excluded.model_name,
                content = excluded.content,
                content_hash = excluded.content_hash,
                description = excluded.description",
            params![
                Uuid::new_v4().to_string(),
                name,
                version,
                prompt_type,
                model_name,
                content,
                content_hash,
                description,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn row_to_prompt(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptRow> {
        Ok(PromptRow {
            id: row.get(0)?,
            name: row.get(1)?,
            version: row.get(2)?,
            prompt_type: row.get(3)?,
            model_name: row.get(4)?,
            content: row.get(5)?,
            content_hash: row.get(6)?,
            is_active: row.get::<_, i64>(7)? != 0,
            description: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    const PROMPT_COLS: &'static str =
        "id, name, version, prompt_type, model_name, content, content_hash, is_active, \
        description, created_at";

    pub fn get_prompt(&self, name: &str, version: &str) -> Result<Option<PromptRow>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM prompts WHERE name = ?1 AND version = ?2",
            Self::PROMPT_COLS
        );
        let row = conn
            .query_row(&sql, params![name, version], Self::row_to_prompt)
            .optional()?;
        Ok(row)
    }

    pub fn list_prompts(&self, active_only: bool) -> Result<Vec<PromptRow>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM prompts{} ORDER BY name ASC, version ASC",
            Self::PROMPT_COLS,
            if active_only { " WHERE is_active = 1" } else { "" }
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Self::row_to_prompt)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_prompts(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM prompts", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    pub fn set_prompt_active(&self, name: &str, version: &str, active: bool) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE prompts SET is_active = ?1 WHERE name = ?2 AND version = ?3",
            params![active as i64, name, version],
        )?;
        Ok(changed > 0)
    }

    pub fn delete_prompt(&self, name: &str, version: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM prompts WHERE name = ?1 AND version = ?2",
            params![name, version],
        )?;
        Ok(changed > 0)
    }
}

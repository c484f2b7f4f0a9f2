//! Relational event store.

mod event_store;

pub use event_store::{
    DecisionRow, DlqFilter, DlqRow, EventFilter, EventRow, EventStatusView, EventStore,
    LlmConfigRow, NewDecision, NewDlqEntry, NewEnrichment, NewEvent, PromptRow, StageTiming,
    TimelineRow, DLQ_SUMMARY_ERROR_LEN,
};

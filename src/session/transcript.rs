use super::types::FinalizeReason;
use crate::backend::CodeRunResult;
use crate::events::ConversationTurn;
use crate::proctoring::{SoftCounters, SoftEventRecord, ViolationRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeSubmission {
    pub language: String,
    pub source: String,
    pub submitted_at: DateTime<Utc>,
    pub result: Option<CodeRunResult>,
    pub error: Option<String>,
}

/// Payload posted once to the finalize endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTranscript {
    pub session_id: String,
    pub candidate_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub reason: FinalizeReason,
    pub turns: Vec<ConversationTurn>,
    pub violations: Vec<ViolationRecord>,
    pub soft_events: Vec<SoftEventRecord>,
    pub soft_counters: SoftCounters,
    pub code_submissions: Vec<CodeSubmission>,
}

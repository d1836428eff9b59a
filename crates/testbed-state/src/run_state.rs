//! ---
//! tb_section: "05-checkpoint-persistence"
//! tb_subsection: "module"
//! tb_type: "source"
//! tb_scope: "runtime"
//! tb_description: "Stage records and the per-run checkpoint model."
//! tb_version: "v0.1.0"
//! tb_owner: "tbd"
//! ---

//! The checkpoint model written after every stage outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// The stage has not produced an outcome yet.
    Pending,
    /// The stage ran to completion.
    Succeeded,
    /// The stage ran and reported an error.
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StageStatus::Pending => "pending",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
        };
        // pad keeps width flags working in tabular status output
        f.pad(label)
    }
}

/// Persisted outcome of one named stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name, unique within a run.
    pub name: String,
    /// Last recorded outcome.
    pub status: StageStatus,
    /// Stage output captured on success, if the stage produced any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Human readable failure detail captured on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the outcome was recorded.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    /// Record a successful stage outcome, timestamped now.
    pub fn succeeded(name: impl Into<String>, result: Option<Value>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Succeeded,
            result,
            error: None,
            completed_at: Some(Utc::now()),
        }
    }

    /// Record a failed stage outcome, timestamped now.
    pub fn failed(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StageStatus::Failed,
            result: None,
            error: Some(detail.into()),
            completed_at: Some(Utc::now()),
        }
    }
}

/// Checkpointed state of a whole run.
///
/// Stage records appear in the order their outcomes were first
/// recorded, which for an uninterrupted run matches execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Identifier of the run this state belongs to.
    pub run_id: String,
    /// Outcomes recorded so far.
    #[serde(default)]
    pub stages: Vec<StageRecord>,
}

impl RunState {
    /// Fresh state with no recorded outcomes.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stages: Vec::new(),
        }
    }

    /// Look up the record for a stage, if one was ever written.
    pub fn record(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.name == name)
    }

    /// Status of a stage, [`StageStatus::Pending`] when unrecorded.
    pub fn status_of(&self, name: &str) -> StageStatus {
        self.record(name)
            .map(|record| record.status)
            .unwrap_or(StageStatus::Pending)
    }

    /// Whether a stage already succeeded in an earlier attempt.
    pub fn is_succeeded(&self, name: &str) -> bool {
        self.status_of(name) == StageStatus::Succeeded
    }

    /// Insert a record, replacing any earlier outcome for the same
    /// stage in place so record order stays stable across retries.
    pub fn upsert(&mut self, record: StageRecord) {
        match self.stages.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record,
            None => self.stages.push(record),
        }
    }

    /// Names of all recorded stages, in record order.
    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|record| record.name.as_str())
    }
}

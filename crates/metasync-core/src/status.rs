//! Status and condition model
//!
//! Produced fresh by every cycle and handed to the config store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one source or target within a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemOutcome {
    /// Not processed in this cycle
    Pending,
    Success,
    Error,
}

/// Per-source or per-target status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStatus {
    pub name: String,
    pub last_attempt: DateTime<Utc>,
    pub outcome: ItemOutcome,
    /// Ranges fetched (sources, after filtering) or applied (targets)
    pub range_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Machine-readable failure reason, set with `error_message`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl ItemStatus {
    pub fn success(name: impl Into<String>, range_count: usize) -> Self {
        Self {
            name: name.into(),
            last_attempt: Utc::now(),
            outcome: ItemOutcome::Success,
            range_count,
            error_message: None,
            error_reason: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: &crate::Error) -> Self {
        Self {
            name: name.into(),
            last_attempt: Utc::now(),
            outcome: ItemOutcome::Error,
            range_count: 0,
            error_message: Some(error.to_string()),
            error_reason: Some(error.reason().to_string()),
        }
    }

    pub fn pending(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            last_attempt: Utc::now(),
            outcome: ItemOutcome::Pending,
            range_count: 0,
            error_message: Some(message.into()),
            error_reason: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ItemOutcome::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionState {
    True,
    False,
    Unknown,
}

/// Aggregate readiness of a sync spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyCondition {
    pub state: ConditionState,
    pub reason: String,
    pub message: String,
    pub observed_at: DateTime<Utc>,
    /// Generation of the sync spec this condition describes
    #[serde(default)]
    pub observed_generation: u64,
}

/// How far a cycle got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CyclePhase {
    /// Every state ran; individual items may still have failed
    Completed,
    /// The cycle stopped before applying every target
    Aborted,
}

/// Outcome of one reconciliation cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStatus {
    pub last_attempt: DateTime<Utc>,
    /// Last cycle that completed, carried forward from earlier statuses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    pub phase: CyclePhase,
    /// Size of the merged desired set
    #[serde(default)]
    pub desired_count: usize,
    pub source_statuses: Vec<ItemStatus>,
    pub target_statuses: Vec<ItemStatus>,
    pub ready_condition: ReadyCondition,
}

impl AggregateStatus {
    pub fn is_ready(&self) -> bool {
        self.ready_condition.state == ConditionState::True
    }

    pub fn source(&self, name: &str) -> Option<&ItemStatus> {
        self.source_statuses.iter().find(|s| s.name == name)
    }

    pub fn target(&self, name: &str) -> Option<&ItemStatus> {
        self.target_statuses.iter().find(|s| s.name == name)
    }
}

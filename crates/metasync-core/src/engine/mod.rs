//! Reconciliation engine
//!
//! The SyncEngine runs one reconciliation cycle for one sync spec:
//! - Resolving source references and fetching their ranges
//! - Filtering each source's ranges by the reference's labels
//! - Merging everything into one desired set
//! - Applying the desired set to every referenced target
//! - Producing the aggregate status
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ FetchSources│ ──▶ │MergeSources │ ──▶ │ApplyTargets │ ──▶ │  Finalize   │
//! └─────────────┘     └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                        │
//!        ▼                                        ▼
//! ┌──────────────────┐                   ┌──────────────────┐
//! │ InstanceRegistry │                   │ InstanceRegistry │
//! │  (RangeSource)   │                   │  (RangeTarget)   │
//! └──────────────────┘                   └──────────────────┘
//! ```
//!
//! ## Failure Policy
//!
//! - `continue`: a failing item is recorded and the cycle proceeds
//! - `fail`: the first failing item aborts the cycle; the rest stay pending
//!
//! Exception to `continue`: when every source failed, the cycle stops
//! before ApplyTargets instead of applying the (empty) merged set. Targets
//! stay pending with their last applied ranges and the phase is `Aborted`.
//!
//! The engine never returns an error. Every failure ends up on an item
//! status and the cycle always yields an [`AggregateStatus`].

pub mod controller;

pub use controller::Controller;

use crate::config::{FailureMode, SourceReference, SyncSpec, TargetReference};
use crate::context::SyncContext;
use crate::error::{Error, Result};
use crate::range::AddressRangeSet;
use crate::registry::InstanceRegistry;
use crate::status::{AggregateStatus, ConditionState, CyclePhase, ItemOutcome, ItemStatus, ReadyCondition};
use crate::traits::{ApplyOutcome, ConfigStore};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reason on the ready condition when every item succeeded
pub const REASON_SYNC_SUCCESSFUL: &str = "SyncSuccessful";

/// Message on items the cycle never reached
const SKIPPED_ABORTED: &str = "skipped: cycle aborted";
const SKIPPED_NO_SOURCES: &str = "skipped: no source produced ranges";

/// Events emitted by the SyncEngine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    CycleStarted {
        spec: String,
    },

    SourceFetched {
        spec: String,
        source: String,
        count: usize,
    },

    SourceFailed {
        spec: String,
        source: String,
        error: String,
    },

    /// Target written
    TargetApplied {
        spec: String,
        target: String,
        added: usize,
        removed: usize,
    },

    /// Target already held the desired set
    TargetUnchanged {
        spec: String,
        target: String,
    },

    TargetFailed {
        spec: String,
        target: String,
        error: String,
    },

    CycleFinished {
        spec: String,
        phase: CyclePhase,
        ready: bool,
    },
}

/// Runs reconciliation cycles
///
/// Holds no per-spec state; concurrent cycles for different specs share one
/// engine. Source and target instances come from the shared
/// [`InstanceRegistry`].
pub struct SyncEngine {
    store: Arc<dyn ConfigStore>,
    registry: Arc<InstanceRegistry>,
    event_tx: Option<mpsc::Sender<EngineEvent>>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn ConfigStore>, registry: Arc<InstanceRegistry>) -> Self {
        Self {
            store,
            registry,
            event_tx: None,
        }
    }

    /// Emit engine events on a bounded channel
    ///
    /// When the channel is full, events are dropped with a warning.
    pub fn with_events(mut self, capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        self.event_tx = Some(tx);
        (self, rx)
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Run one cycle for `spec`
    pub async fn reconcile(&self, ctx: &SyncContext, spec: &SyncSpec) -> AggregateStatus {
        let started = Utc::now();
        self.emit_event(EngineEvent::CycleStarted {
            spec: spec.name.clone(),
        });

        let previous_success = match self.store.read_status(&spec.name).await {
            Ok(previous) => previous.and_then(|s| s.last_success),
            Err(e) => {
                warn!(spec = %spec.name, "Failed to read previous status: {}", e);
                None
            }
        };

        let status = if let Err(e) = spec.validate() {
            warn!(spec = %spec.name, "Invalid sync spec: {}", e);
            self.invalid_spec_status(spec, &e, previous_success)
        } else {
            self.run_cycle(ctx, spec, previous_success).await
        };

        self.emit_event(EngineEvent::CycleFinished {
            spec: spec.name.clone(),
            phase: status.phase,
            ready: status.is_ready(),
        });
        debug!(
            spec = %spec.name,
            elapsed_ms = (Utc::now() - started).num_milliseconds(),
            "Cycle finished"
        );
        status
    }

    async fn run_cycle(
        &self,
        ctx: &SyncContext,
        spec: &SyncSpec,
        previous_success: Option<chrono::DateTime<Utc>>,
    ) -> AggregateStatus {
        let mut aborted = false;
        let stop_on_error = spec.failure_mode == FailureMode::Fail;

        // FetchSources
        let mut source_statuses = Vec::with_capacity(spec.sources.len());
        let mut fetched = Vec::with_capacity(spec.sources.len());
        for reference in &spec.sources {
            if aborted {
                source_statuses.push(ItemStatus::pending(&reference.name, SKIPPED_ABORTED));
                continue;
            }
            match self.fetch_source(ctx, reference).await {
                Ok(ranges) => {
                    debug!(spec = %spec.name, source = %reference.name, count = ranges.count(), "Fetched source");
                    self.emit_event(EngineEvent::SourceFetched {
                        spec: spec.name.clone(),
                        source: reference.name.clone(),
                        count: ranges.count(),
                    });
                    source_statuses.push(ItemStatus::success(&reference.name, ranges.count()));
                    fetched.push(ranges);
                }
                Err(e) => {
                    warn!(spec = %spec.name, source = %reference.name, "Source failed: {}", e);
                    self.emit_event(EngineEvent::SourceFailed {
                        spec: spec.name.clone(),
                        source: reference.name.clone(),
                        error: e.to_string(),
                    });
                    source_statuses.push(ItemStatus::failed(&reference.name, &e));
                    aborted = stop_on_error;
                }
            }
        }

        // MergeSources
        let any_source_succeeded = !fetched.is_empty();
        let mut desired = AddressRangeSet::new();
        for ranges in fetched {
            desired.merge(ranges);
        }
        let desired_count = desired.unique_cidrs().len();

        // ApplyTargets
        let mut target_statuses = Vec::with_capacity(spec.targets.len());
        if !aborted && !any_source_succeeded {
            warn!(spec = %spec.name, "No source produced ranges, leaving targets untouched");
            aborted = true;
            for reference in &spec.targets {
                target_statuses.push(ItemStatus::pending(&reference.name, SKIPPED_NO_SOURCES));
            }
        }
        for reference in spec.targets.iter().skip(target_statuses.len()) {
            if aborted {
                target_statuses.push(ItemStatus::pending(&reference.name, SKIPPED_ABORTED));
                continue;
            }
            match self.apply_target(ctx, reference, &desired).await {
                Ok(outcome) => {
                    match outcome {
                        ApplyOutcome::Unchanged => {
                            debug!(spec = %spec.name, target = %reference.name, "Target unchanged");
                            self.emit_event(EngineEvent::TargetUnchanged {
                                spec: spec.name.clone(),
                                target: reference.name.clone(),
                            });
                        }
                        ApplyOutcome::Applied { added, removed } => {
                            info!(
                                spec = %spec.name,
                                target = %reference.name,
                                added,
                                removed,
                                count = desired_count,
                                "Applied ranges to target"
                            );
                            self.emit_event(EngineEvent::TargetApplied {
                                spec: spec.name.clone(),
                                target: reference.name.clone(),
                                added,
                                removed,
                            });
                        }
                    }
                    target_statuses.push(ItemStatus::success(&reference.name, desired_count));
                }
                Err(e) => {
                    warn!(spec = %spec.name, target = %reference.name, "Target failed: {}", e);
                    self.emit_event(EngineEvent::TargetFailed {
                        spec: spec.name.clone(),
                        target: reference.name.clone(),
                        error: e.to_string(),
                    });
                    target_statuses.push(ItemStatus::failed(&reference.name, &e));
                    aborted = stop_on_error;
                }
            }
        }

        // Finalize
        let now = Utc::now();
        let phase = if aborted {
            CyclePhase::Aborted
        } else {
            CyclePhase::Completed
        };
        let ready_condition = ready_condition(spec, &source_statuses, &target_statuses, desired_count);

        AggregateStatus {
            last_attempt: now,
            last_success: match phase {
                CyclePhase::Completed => Some(now),
                CyclePhase::Aborted => previous_success,
            },
            phase,
            desired_count,
            source_statuses,
            target_statuses,
            ready_condition,
        }
    }

    /// Resolve, obtain and fetch one source, then apply the reference's label filter
    async fn fetch_source(&self, ctx: &SyncContext, reference: &SourceReference) -> Result<AddressRangeSet> {
        let config = self
            .store
            .source_config(&reference.name)
            .await
            .map_err(|e| resolution_error("source", &reference.name, e))?;
        config.validate()?;

        let source = self.registry.source(ctx, &config).await?;
        let ranges = source.fetch(ctx).await?;
        Ok(ranges.filter(&reference.include_labels, &reference.exclude_labels))
    }

    /// Resolve, obtain and apply one target
    async fn apply_target(
        &self,
        ctx: &SyncContext,
        reference: &TargetReference,
        desired: &AddressRangeSet,
    ) -> Result<ApplyOutcome> {
        let config = self
            .store
            .target_config(&reference.name)
            .await
            .map_err(|e| resolution_error("target", &reference.name, e))?;
        config.validate()?;

        let target = self.registry.target(ctx, &config).await?;
        target.apply(ctx, desired).await
    }

    fn invalid_spec_status(
        &self,
        spec: &SyncSpec,
        error: &Error,
        previous_success: Option<chrono::DateTime<Utc>>,
    ) -> AggregateStatus {
        let now = Utc::now();
        AggregateStatus {
            last_attempt: now,
            last_success: previous_success,
            phase: CyclePhase::Aborted,
            desired_count: 0,
            source_statuses: spec
                .sources
                .iter()
                .map(|s| ItemStatus::pending(&s.name, SKIPPED_ABORTED))
                .collect(),
            target_statuses: spec
                .targets
                .iter()
                .map(|t| ItemStatus::pending(&t.name, SKIPPED_ABORTED))
                .collect(),
            ready_condition: ReadyCondition {
                state: ConditionState::False,
                reason: format!("Spec{}", error.reason()),
                message: error.to_string(),
                observed_at: now,
                observed_generation: spec.generation,
            },
        }
    }

    fn emit_event(&self, event: EngineEvent) {
        if let Some(tx) = &self.event_tx {
            if tx.try_send(event).is_err() {
                warn!("Event channel full, dropping engine event");
            }
        }
    }
}

/// Store lookups that fail become configuration-resolution errors
fn resolution_error(kind: &str, name: &str, error: Error) -> Error {
    match error {
        Error::Cancelled | Error::DeadlineExceeded => error,
        other => Error::config_resolution(format!("{kind} '{name}': {other}")),
    }
}

fn ready_condition(
    spec: &SyncSpec,
    sources: &[ItemStatus],
    targets: &[ItemStatus],
    desired_count: usize,
) -> ReadyCondition {
    let all_succeeded = sources.iter().chain(targets).all(ItemStatus::is_success);
    let observed_at = Utc::now();

    if all_succeeded && !sources.is_empty() && !targets.is_empty() {
        return ReadyCondition {
            state: ConditionState::True,
            reason: REASON_SYNC_SUCCESSFUL.to_string(),
            message: format!(
                "Synced {} ranges from {} sources to {} targets",
                desired_count,
                sources.len(),
                targets.len()
            ),
            observed_at,
            observed_generation: spec.generation,
        };
    }

    let first_failure = sources
        .iter()
        .map(|s| ("Source", "source", s))
        .chain(targets.iter().map(|t| ("Target", "target", t)))
        .find(|(_, _, item)| item.outcome == ItemOutcome::Error);

    let (reason, message) = match first_failure {
        Some((prefix, kind, item)) => (
            format!(
                "{}{}",
                prefix,
                item.error_reason.as_deref().unwrap_or("Error")
            ),
            format!(
                "{} '{}': {}",
                kind,
                item.name,
                item.error_message.as_deref().unwrap_or("unknown error")
            ),
        ),
        None => (
            "Incomplete".to_string(),
            "Not every source and target was processed".to_string(),
        ),
    };

    ReadyCondition {
        state: ConditionState::False,
        reason,
        message,
        observed_at,
        observed_generation: spec.generation,
    }
}

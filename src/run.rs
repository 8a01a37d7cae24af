use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReportingError, Result};
use crate::files::{ExternalFileRef, FileRegistry, UploadId};
use crate::schema::ReportKind;
use crate::validator::{ValidatedReport, ValidationFailure};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(format!("run_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fiscal context handed to the agent alongside the spreadsheets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    /// First month of the fiscal year, 1 = January.
    pub fiscal_start_month: Option<u32>,
    /// ISO 4217 code, e.g. "NZD".
    pub currency: Option<String>,
    /// Accounting package the exports came from.
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub id: RunId,
    pub file_refs: Vec<ExternalFileRef>,
    pub report_kinds: BTreeSet<ReportKind>,
    #[serde(default)]
    pub context: RunContext,
    /// Literal spreadsheet rows shown to the agent as format examples.
    #[serde(default)]
    pub example_rows: Vec<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl RunRequest {
    #[must_use]
    pub fn new(
        file_refs: Vec<ExternalFileRef>,
        report_kinds: impl IntoIterator<Item = ReportKind>,
    ) -> Self {
        Self {
            id: RunId::generate(),
            file_refs,
            report_kinds: report_kinds.into_iter().collect(),
            context: RunContext::default(),
            example_rows: Vec::new(),
            instructions: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Builds a request from registered uploads, resolving each to its
    /// remote handle.
    pub fn from_uploads(
        registry: &FileRegistry,
        uploads: &[UploadId],
        report_kinds: impl IntoIterator<Item = ReportKind>,
    ) -> Result<Self> {
        let file_refs = registry.resolve(uploads)?;
        Ok(Self::new(file_refs, report_kinds))
    }

    pub fn with_context(mut self, context: RunContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_fiscal_start_month(mut self, month: u32) -> Self {
        self.context.fiscal_start_month = Some(month);
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.context.currency = Some(currency.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.context.provider = Some(provider.into());
        self
    }

    pub fn with_example_rows<I, S>(mut self, rows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.example_rows = rows.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Submitted,
    Polling,
    Succeeded,
    ValidationFailed,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Submitted => "submitted",
            RunStatus::Polling => "polling",
            RunStatus::Succeeded => "succeeded",
            RunStatus::ValidationFailed => "validation_failed",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::ValidationFailed | RunStatus::Failed | RunStatus::TimedOut
        )
    }

    /// Statuses with a live remote run that a driver should keep watching.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RunStatus::Submitted | RunStatus::Polling)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Configuration,
    Transport,
    RateLimited,
    Agent,
    Cancelled,
}

/// Identifies a run on the remote agent service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRunHandle {
    pub thread_id: String,
    pub run_id: String,
}

/// The only way a `RunRecord` changes.
#[derive(Debug, Clone, PartialEq)]
pub enum RunTransition {
    Submitted { remote: RemoteRunHandle },
    Polled,
    Throttled,
    TransportHiccup,
    Succeeded { raw: String, report: ValidatedReport },
    ValidationFailed { raw: String, failure: ValidationFailure },
    Failed { cause: FailureCause, detail: String },
    TimedOut { detail: String },
}

impl RunTransition {
    pub fn name(&self) -> &'static str {
        match self {
            RunTransition::Submitted { .. } => "Submitted",
            RunTransition::Polled => "Polled",
            RunTransition::Throttled => "Throttled",
            RunTransition::TransportHiccup => "TransportHiccup",
            RunTransition::Succeeded { .. } => "Succeeded",
            RunTransition::ValidationFailed { .. } => "ValidationFailed",
            RunTransition::Failed { .. } => "Failed",
            RunTransition::TimedOut { .. } => "TimedOut",
        }
    }

    fn allowed_from(&self, status: RunStatus) -> bool {
        use RunStatus::*;
        match self {
            RunTransition::Submitted { .. } => status == Pending,
            RunTransition::Polled
            | RunTransition::Succeeded { .. }
            | RunTransition::ValidationFailed { .. } => status.is_in_flight(),
            RunTransition::Throttled
            | RunTransition::TransportHiccup
            | RunTransition::Failed { .. }
            | RunTransition::TimedOut { .. } => !status.is_terminal(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub request: RunRequest,
    pub status: RunStatus,
    pub remote: Option<RemoteRunHandle>,
    /// Verbatim agent output; present once the remote run completed.
    pub raw_result: Option<String>,
    pub validated_result: Option<ValidatedReport>,
    pub validation_failure: Option<ValidationFailure>,
    pub failure_cause: Option<FailureCause>,
    pub error_detail: Option<String>,
    /// Status observations made against the remote run.
    pub attempts: u32,
    pub throttled: u32,
    pub transport_errors: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn new(request: RunRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: request.id.clone(),
            request,
            status: RunStatus::Pending,
            remote: None,
            raw_result: None,
            validated_result: None,
            validation_failure: None,
            failure_cause: None,
            error_detail: None,
            attempts: 0,
            throttled: 0,
            transport_errors: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Converts a finished record into its report, or into the error that
    /// describes why there is none.
    pub fn outcome(&self) -> Result<&ValidatedReport> {
        match (self.status, &self.validated_result) {
            (RunStatus::Succeeded, Some(report)) => Ok(report),
            (RunStatus::ValidationFailed, _) => Err(ReportingError::Validation(
                self.validation_failure
                    .clone()
                    .unwrap_or_else(|| ValidationFailure::single("", "valid output", "nothing recorded")),
            )),
            (RunStatus::Failed, _) => {
                let detail = self.error_detail.clone().unwrap_or_default();
                Err(match self.failure_cause {
                    Some(FailureCause::Configuration) => ReportingError::Configuration(detail),
                    Some(FailureCause::Transport) => ReportingError::Transport(detail),
                    Some(FailureCause::RateLimited) => ReportingError::RateLimited {
                        attempts: self.throttled,
                    },
                    Some(FailureCause::Cancelled) => ReportingError::Cancelled(self.id.to_string()),
                    Some(FailureCause::Agent) | None => ReportingError::Agent(detail),
                })
            }
            (RunStatus::TimedOut, _) => Err(ReportingError::TimedOut {
                elapsed: self
                    .completed_at
                    .map(|done| (done - self.started_at).to_std().unwrap_or(Duration::ZERO))
                    .unwrap_or(Duration::ZERO),
            }),
            (status, _) => Err(ReportingError::NotFinished {
                run_id: self.id.to_string(),
                status,
            }),
        }
    }

    /// Applies a transition, or fails with `InvalidTransition` and leaves the
    /// record untouched.
    pub fn apply(&mut self, transition: RunTransition, now: DateTime<Utc>) -> Result<()> {
        if !transition.allowed_from(self.status) {
            return Err(ReportingError::InvalidTransition {
                run_id: self.id.to_string(),
                from: self.status,
                attempted: transition.name().to_string(),
            });
        }

        match transition {
            RunTransition::Submitted { remote } => {
                self.remote = Some(remote);
                self.status = RunStatus::Submitted;
            }
            RunTransition::Polled => {
                self.attempts += 1;
                self.status = RunStatus::Polling;
            }
            RunTransition::Throttled => self.throttled += 1,
            RunTransition::TransportHiccup => self.transport_errors += 1,
            RunTransition::Succeeded { raw, report } => {
                self.raw_result = Some(raw);
                self.validated_result = Some(report);
                self.status = RunStatus::Succeeded;
            }
            RunTransition::ValidationFailed { raw, failure } => {
                self.error_detail = Some(failure.to_string());
                self.raw_result = Some(raw);
                self.validation_failure = Some(failure);
                self.status = RunStatus::ValidationFailed;
            }
            RunTransition::Failed { cause, detail } => {
                self.failure_cause = Some(cause);
                self.error_detail = Some(detail);
                self.status = RunStatus::Failed;
            }
            RunTransition::TimedOut { detail } => {
                self.error_detail = Some(detail);
                self.status = RunStatus::TimedOut;
            }
        }

        self.updated_at = now;
        if self.status.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RunRecord {
        let request = RunRequest::new(vec![ExternalFileRef::new("file-1")], [ReportKind::CashFlow]);
        RunRecord::new(request, Utc::now())
    }

    fn remote() -> RemoteRunHandle {
        RemoteRunHandle {
            thread_id: "thread_1".to_string(),
            run_id: "run_remote_1".to_string(),
        }
    }

    fn report() -> ValidatedReport {
        ValidatedReport {
            reports: Vec::new(),
            warnings: Vec::new(),
        }
    }

    #[test]
    fn test_status_labels_match_serialized_form() {
        for status in [
            RunStatus::Pending,
            RunStatus::Submitted,
            RunStatus::Polling,
            RunStatus::Succeeded,
            RunStatus::ValidationFailed,
            RunStatus::Failed,
            RunStatus::TimedOut,
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), status.as_str());
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut record = record();
        let now = Utc::now();

        record.apply(RunTransition::Submitted { remote: remote() }, now).unwrap();
        assert_eq!(record.status, RunStatus::Submitted);

        record.apply(RunTransition::Polled, now).unwrap();
        record.apply(RunTransition::Polled, now).unwrap();
        assert_eq!(record.status, RunStatus::Polling);
        assert_eq!(record.attempts, 2);
        assert!(record.raw_result.is_none());

        record
            .apply(
                RunTransition::Succeeded {
                    raw: "{}".to_string(),
                    report: report(),
                },
                now,
            )
            .unwrap();
        assert_eq!(record.status, RunStatus::Succeeded);
        assert!(record.raw_result.is_some());
        assert!(record.validated_result.is_some());
        assert_eq!(record.completed_at, Some(now));
    }

    #[test]
    fn test_terminal_records_reject_every_transition() {
        let mut record = record();
        let now = Utc::now();
        record.apply(RunTransition::Submitted { remote: remote() }, now).unwrap();
        record
            .apply(
                RunTransition::TimedOut {
                    detail: "poll timeout".to_string(),
                },
                now,
            )
            .unwrap();
        let frozen = record.clone();

        let attempts = vec![
            RunTransition::Polled,
            RunTransition::Throttled,
            RunTransition::TransportHiccup,
            RunTransition::Failed {
                cause: FailureCause::Cancelled,
                detail: "late cancel".to_string(),
            },
            RunTransition::Succeeded {
                raw: "{}".to_string(),
                report: report(),
            },
        ];
        for transition in attempts {
            let err = record.apply(transition, Utc::now()).unwrap_err();
            assert!(matches!(err, ReportingError::InvalidTransition { from: RunStatus::TimedOut, .. }));
            assert_eq!(record, frozen);
        }
    }

    #[test]
    fn test_cannot_complete_before_submission() {
        let mut record = record();
        let err = record
            .apply(
                RunTransition::Succeeded {
                    raw: "{}".to_string(),
                    report: report(),
                },
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, ReportingError::InvalidTransition { from: RunStatus::Pending, .. }));
        assert_eq!(record.status, RunStatus::Pending);
    }

    #[test]
    fn test_pending_run_can_fail() {
        let mut record = record();
        record
            .apply(
                RunTransition::Failed {
                    cause: FailureCause::Transport,
                    detail: "connection refused".to_string(),
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.failure_cause, Some(FailureCause::Transport));
        assert!(record.raw_result.is_none());
    }

    #[test]
    fn test_outcome_distinguishes_failures() {
        let mut record = record();
        assert!(matches!(
            record.outcome().unwrap_err(),
            ReportingError::NotFinished { status: RunStatus::Pending, .. }
        ));

        record
            .apply(
                RunTransition::Failed {
                    cause: FailureCause::Cancelled,
                    detail: "cancelled by owner".to_string(),
                },
                Utc::now(),
            )
            .unwrap();
        assert!(matches!(record.outcome().unwrap_err(), ReportingError::Cancelled(_)));
    }

    #[test]
    fn test_pending_run_can_time_out() {
        let mut record = record();
        record
            .apply(
                RunTransition::TimedOut {
                    detail: "never submitted".to_string(),
                },
                Utc::now(),
            )
            .unwrap();
        assert!(matches!(record.outcome().unwrap_err(), ReportingError::TimedOut { .. }));
    }

    #[test]
    fn test_request_builder_collects_context() {
        let request = RunRequest::new(vec![ExternalFileRef::new("file-1")], ReportKind::ALL)
            .with_fiscal_start_month(4)
            .with_currency("NZD")
            .with_provider("Xero")
            .with_example_rows(["Rent,(1.200,00)"])
            .with_metadata("client", "acme");

        assert_eq!(request.report_kinds.len(), 3);
        assert_eq!(request.context.fiscal_start_month, Some(4));
        assert_eq!(request.context.currency.as_deref(), Some("NZD"));
        assert_eq!(request.example_rows.len(), 1);
        assert_eq!(request.metadata.get("client").map(String::as_str), Some("acme"));
    }
}

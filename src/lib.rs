//! # Ledger Agent Runs
//!
//! Turns uploaded accounting spreadsheets into validated financial reports
//! (income statement, cash flow, expense breakdown) by delegating the
//! reading to a remote LLM agent and trusting none of what comes back.
//!
//! ## Core Concepts
//!
//! - **Run**: one request for a set of report kinds over a set of uploaded files,
//!   tracked from submission to exactly one terminal state
//! - **Schema Registry**: the single definition of each report's shape, shared by
//!   the prompt and the validator
//! - **Validator**: re-checks every agent answer against the schemas; nothing
//!   unvalidated reaches callers
//! - **Store**: run records and upload history in SQLite, so polling and the
//!   upload audit trail survive restarts
//!
//! ## Example
//!
//! ```rust,ignore
//! use ledger_agent_runs::*;
//! use std::sync::Arc;
//!
//! let config = OrchestratorConfig::from_env()?;
//! let client = OpenAiAgentClient::from_config(&config)?;
//! let store = SqliteStore::open("runs.db").await?;
//! let orchestrator = Orchestrator::new(config, Arc::new(client), Arc::new(store));
//!
//! let request = RunRequest::new(
//!     vec![ExternalFileRef::new("file-abc123")],
//!     [ReportKind::IncomeStatement, ReportKind::CashFlow],
//! )
//! .with_currency("NZD")
//! .with_fiscal_start_month(4);
//!
//! let report = run_reports(&orchestrator, request).await?;
//! println!("{:?}", report.income_statement());
//! ```

pub mod config;
pub mod error;
pub mod files;
pub mod llm;
pub mod orchestrator;
pub mod run;
pub mod schema;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod utils;
pub mod validator;

pub use config::{OrchestratorConfig, DEFAULT_BASE_URL};
pub use error::{RemoteError, ReportingError, Result};
pub use files::{ExternalFileRef, FileRegistry, UploadId, UploadedFile};
pub use llm::*;
pub use orchestrator::{HealthStatus, Orchestrator};
pub use run::{FailureCause, RemoteRunHandle, RunContext, RunId, RunRecord, RunRequest, RunStatus, RunTransition};
pub use schema::*;
pub use store::{MemoryRunStore, RunStore, SqliteStore, UploadStore};
pub use utils::{BackoffPolicy, Clock, SystemClock};
pub use validator::{
    OutputValidator, ValidatedReport, ValidationFailure, ValidationIssue, ValidationWarning,
};

use log::{debug, info};

/// Submits a run, drives it to completion and returns its validated report.
/// Any other outcome comes back as the matching `ReportingError`.
pub async fn run_reports(orchestrator: &Orchestrator, request: RunRequest) -> Result<ValidatedReport> {
    info!(
        "Running {} report(s) over {} file(s)",
        request.report_kinds.len(),
        request.file_refs.len()
    );

    let record = orchestrator.execute(request).await?;
    debug!(
        "Run {} finished as {:?} after {} poll(s)",
        record.id, record.status, record.attempts
    );

    let report = record.outcome()?.clone();
    for warning in &report.warnings {
        debug!("Report warning at {}: {}", warning.path, warning.message);
    }
    Ok(report)
}

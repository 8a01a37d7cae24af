use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteError;
use crate::files::ExternalFileRef;
use crate::llm::prompts::Prompt;
use crate::run::RemoteRunHandle;

/// Everything the remote service needs to start one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSubmission {
    pub prompt: Prompt,
    pub file_refs: Vec<ExternalFileRef>,
    /// Structured-output constraint, already in the remote's wire shape.
    pub response_format: Value,
    pub metadata: BTreeMap<String, String>,
}

/// What the remote service reports about a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRunStatus {
    Queued,
    InProgress,
    RequiresAction,
    /// Finished; `payload` is the agent's final message, verbatim.
    Completed { payload: String },
    Failed { message: String },
    Cancelled,
    Expired,
    Unknown(String),
}

impl RemoteRunStatus {
    /// Still worth polling.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            RemoteRunStatus::Queued
                | RemoteRunStatus::InProgress
                | RemoteRunStatus::RequiresAction
                | RemoteRunStatus::Unknown(_)
        )
    }
}

/// The orchestrator's only view of the remote agent service.
#[async_trait]
pub trait AgentService: Send + Sync {
    async fn create_run(&self, submission: &RunSubmission) -> Result<RemoteRunHandle, RemoteError>;

    async fn run_status(&self, handle: &RemoteRunHandle) -> Result<RemoteRunStatus, RemoteError>;

    async fn cancel_run(&self, handle: &RemoteRunHandle) -> Result<(), RemoteError>;
}

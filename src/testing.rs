//! In-process doubles for driving the orchestrator without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RemoteError;
use crate::llm::service::{AgentService, RemoteRunStatus, RunSubmission};
use crate::run::RemoteRunHandle;
use crate::utils::Clock;

/// Virtual clock: `sleep` advances time instantly and yields to the
/// scheduler, so long polling schedules run in microseconds.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    slept: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            slept: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let step = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500));
        if let Ok(mut now) = self.now.lock() {
            *now = now.checked_add_signed(step).unwrap_or(*now);
        }
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// One scripted answer to a status request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Status(RemoteRunStatus),
    Error(RemoteError),
    /// Never answers.
    Hang,
}

impl ScriptStep {
    pub fn queued() -> Self {
        ScriptStep::Status(RemoteRunStatus::Queued)
    }

    pub fn in_progress() -> Self {
        ScriptStep::Status(RemoteRunStatus::InProgress)
    }

    pub fn completed(payload: impl Into<String>) -> Self {
        ScriptStep::Status(RemoteRunStatus::Completed {
            payload: payload.into(),
        })
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ScriptStep::Status(RemoteRunStatus::Failed {
            message: message.into(),
        })
    }

    pub fn rate_limited() -> Self {
        ScriptStep::Error(RemoteError::RateLimited { retry_after: None })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    Create,
    Status(String),
    Cancel(String),
}

#[derive(Debug)]
enum CreateStep {
    Fail(RemoteError),
    Hang,
}

#[derive(Debug, Default)]
struct ScriptState {
    create_steps: VecDeque<CreateStep>,
    scripts: VecDeque<Vec<ScriptStep>>,
    runs: HashMap<String, VecDeque<ScriptStep>>,
    last: HashMap<String, ScriptStep>,
    submissions: Vec<RunSubmission>,
    calls: Vec<ServiceCall>,
    created: u32,
}

/// `AgentService` that replays scripted status sequences. Each created run
/// takes the next queued script; once a script is exhausted its last step
/// repeats.
#[derive(Debug, Default)]
pub struct ScriptedAgentService {
    state: Mutex<ScriptState>,
}

impl ScriptedAgentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the status script for the next run created.
    pub fn push_run(&self, steps: impl IntoIterator<Item = ScriptStep>) -> &Self {
        if let Ok(mut state) = self.state.lock() {
            state.scripts.push_back(steps.into_iter().collect());
        }
        self
    }

    /// Scripts a remote run created elsewhere, e.g. before a restart.
    pub fn script_existing(&self, remote_run_id: &str, steps: impl IntoIterator<Item = ScriptStep>) -> &Self {
        if let Ok(mut state) = self.state.lock() {
            state
                .runs
                .insert(remote_run_id.to_string(), steps.into_iter().collect());
        }
        self
    }

    /// Makes the next `create_run` call fail with `error`.
    pub fn fail_next_create(&self, error: RemoteError) -> &Self {
        if let Ok(mut state) = self.state.lock() {
            state.create_steps.push_back(CreateStep::Fail(error));
        }
        self
    }

    /// Makes the next `create_run` call never answer.
    pub fn hang_next_create(&self) -> &Self {
        if let Ok(mut state) = self.state.lock() {
            state.create_steps.push_back(CreateStep::Hang);
        }
        self
    }

    pub fn calls(&self) -> Vec<ServiceCall> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn submissions(&self) -> Vec<RunSubmission> {
        self.state.lock().map(|s| s.submissions.clone()).unwrap_or_default()
    }

    pub fn status_calls(&self, remote_run_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ServiceCall::Status(id) if id == remote_run_id))
            .count()
    }

    pub fn create_calls(&self) -> usize {
        self.calls().iter().filter(|call| **call == ServiceCall::Create).count()
    }
}

#[async_trait]
impl AgentService for ScriptedAgentService {
    async fn create_run(&self, submission: &RunSubmission) -> Result<RemoteRunHandle, RemoteError> {
        let hang = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| RemoteError::Transport("script state poisoned".to_string()))?;
            state.calls.push(ServiceCall::Create);
            match state.create_steps.pop_front() {
                Some(CreateStep::Fail(error)) => return Err(error),
                Some(CreateStep::Hang) => true,
                None => false,
            }
        };
        if hang {
            return std::future::pending().await;
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| RemoteError::Transport("script state poisoned".to_string()))?;

        state.created += 1;
        let handle = RemoteRunHandle {
            thread_id: format!("thread_{}", state.created),
            run_id: format!("remote_run_{}", state.created),
        };
        let script = state.scripts.pop_front().unwrap_or_default();
        state.runs.insert(handle.run_id.clone(), script.into());
        state.submissions.push(submission.clone());
        Ok(handle)
    }

    async fn run_status(&self, handle: &RemoteRunHandle) -> Result<RemoteRunStatus, RemoteError> {
        let step = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| RemoteError::Transport("script state poisoned".to_string()))?;
            state.calls.push(ServiceCall::Status(handle.run_id.clone()));
            let next = state.runs.get_mut(&handle.run_id).and_then(VecDeque::pop_front);
            match next {
                Some(step) => {
                    state.last.insert(handle.run_id.clone(), step.clone());
                    step
                }
                None => state
                    .last
                    .get(&handle.run_id)
                    .cloned()
                    .unwrap_or(ScriptStep::Status(RemoteRunStatus::InProgress)),
            }
        };

        match step {
            ScriptStep::Status(status) => Ok(status),
            ScriptStep::Error(error) => Err(error),
            ScriptStep::Hang => std::future::pending().await,
        }
    }

    async fn cancel_run(&self, handle: &RemoteRunHandle) -> Result<(), RemoteError> {
        if let Ok(mut state) = self.state.lock() {
            state.calls.push(ServiceCall::Cancel(handle.run_id.clone()));
        }
        Ok(())
    }
}

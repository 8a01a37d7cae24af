use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::error::{RemoteError, ReportingError, Result};
use crate::llm::prompts::{build_prompt, PromptConfig};
use crate::llm::service::{AgentService, RemoteRunStatus, RunSubmission};
use crate::run::{FailureCause, RemoteRunHandle, RunId, RunRecord, RunRequest, RunStatus, RunTransition};
use crate::store::RunStore;
use crate::utils::{Clock, SystemClock};
use crate::validator::{OutputValidator, ValidatedReport};

/// Floor for the pause between two status requests of one run.
pub const MIN_POLL_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub credentials_configured: bool,
    pub in_flight_runs: usize,
    pub active_drivers: usize,
}

enum Recovery {
    Retry { record: RunRecord, delay: Duration },
    Settled(RunRecord),
}

/// Drives report runs from submission to a terminal state.
///
/// Every change to a run goes through the store as a `RunTransition`, so a
/// run settles exactly once no matter how many pollers, drivers or cancels
/// race on it. Each run has at most one remote status request outstanding.
pub struct Orchestrator {
    config: OrchestratorConfig,
    service: Arc<dyn AgentService>,
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    validator: OutputValidator,
    drivers: Mutex<HashMap<RunId, CancellationToken>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: OrchestratorConfig, service: Arc<dyn AgentService>, store: Arc<dyn RunStore>) -> Self {
        Self {
            config,
            service,
            store,
            clock: Arc::new(SystemClock),
            validator: OutputValidator::default(),
            drivers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_validator(mut self, validator: OutputValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Creates the run record and starts the remote run. Transport failures
    /// and rate limiting are retried within the configured bounds; anything
    /// else settles the run as `Failed`. Starting counts against the poll
    /// timeout and can be cancelled like a driver.
    pub async fn submit(&self, request: RunRequest) -> Result<RunRecord> {
        self.config.ensure_credentials()?;

        let prompt = build_prompt(&PromptConfig::from(&request), &request.file_refs)?;
        let response_format = self.validator.registry().response_format(&request.report_kinds)?;
        let mut metadata = request.metadata.clone();
        metadata.insert("run_id".to_string(), request.id.to_string());
        let submission = RunSubmission {
            prompt,
            file_refs: request.file_refs.clone(),
            response_format,
            metadata,
        };

        let kinds: Vec<&str> = request.report_kinds.iter().map(|k| k.key()).collect();
        let record = self.store.create(RunRecord::new(request, self.clock.now())).await?;
        info!(
            "Submitting run {} with {} file(s) for [{}]",
            record.id,
            submission.file_refs.len(),
            kinds.join(", ")
        );

        let id = record.id.clone();
        let token = self.claim(&id)?;
        let started = self.start_remote(&submission, record, &token).await;
        self.release(&id);
        started
    }

    /// Makes at most one remote status request and applies what it reveals.
    /// Terminal runs come back unchanged without a remote call.
    pub async fn poll(&self, id: &RunId) -> Result<RunRecord> {
        self.config.ensure_credentials()?;
        self.claim(id)?;
        let polled = self.poll_once(id).await;
        self.release(id);
        polled.map(|(record, _)| record)
    }

    /// Polls until the run settles, the poll timeout elapses or the run is
    /// cancelled.
    pub async fn drive(&self, id: &RunId) -> Result<RunRecord> {
        self.config.ensure_credentials()?;
        let token = self.claim(id)?;
        let outcome = self.drive_until_settled(id, &token).await;
        self.release(id);
        outcome
    }

    /// `submit` followed by `drive`.
    pub async fn execute(&self, request: RunRequest) -> Result<RunRecord> {
        let record = self.submit(request).await?;
        if record.is_terminal() {
            return Ok(record);
        }
        self.drive(&record.id).await
    }

    /// Drives a run on its own task.
    pub fn spawn(self: &Arc<Self>, id: RunId) -> JoinHandle<Result<RunRecord>> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move { orchestrator.drive(&id).await })
    }

    /// Drives several runs concurrently; results keep the order of `ids`.
    pub async fn drive_all(&self, ids: &[RunId]) -> Vec<Result<RunRecord>> {
        join_all(ids.iter().map(|id| self.drive(id))).await
    }

    /// Settles a live run as `Failed(Cancelled)` and stops whatever is
    /// submitting or driving it. The remote run is cancelled on a best-effort
    /// basis. Finished runs are returned unchanged.
    pub async fn cancel(&self, id: &RunId) -> Result<RunRecord> {
        let current = self.store.get(id).await?;
        if current.is_terminal() {
            return Ok(current);
        }

        let record = self
            .transition(
                id,
                RunTransition::Failed {
                    cause: FailureCause::Cancelled,
                    detail: "cancelled by owner".to_string(),
                },
            )
            .await?;

        let token = self.drivers.lock().map_err(ReportingError::poisoned)?.get(id).cloned();
        if let Some(token) = token {
            token.cancel();
        }

        if record.failure_cause == Some(FailureCause::Cancelled) {
            info!("Run {} cancelled", id);
            if let (Some(remote), true) = (&record.remote, self.config.has_credentials()) {
                self.cancel_remote(remote).await;
            }
        }
        Ok(record)
    }

    /// Re-runs validation against the stored raw result. Never touches the
    /// remote service or the stored record.
    pub async fn revalidate(&self, id: &RunId) -> Result<ValidatedReport> {
        let record = self.store.get(id).await?;
        let raw = record
            .raw_result
            .as_deref()
            .ok_or_else(|| ReportingError::NoResult(id.to_string()))?;
        Ok(self.validator.validate(raw, &record.request.report_kinds)?)
    }

    /// The validated report of a succeeded run, or the error describing how
    /// the run ended.
    pub async fn report(&self, id: &RunId) -> Result<ValidatedReport> {
        self.store.get(id).await?.outcome().cloned()
    }

    /// Run after a restart, before any new work: runs interrupted before
    /// submission are failed, and the ids of runs with a live remote run are
    /// returned for re-driving.
    pub async fn recover(&self) -> Result<Vec<RunId>> {
        for record in self.store.list_by_status(RunStatus::Pending).await? {
            warn!("Run {} was interrupted before submission", record.id);
            self.transition(
                &record.id,
                RunTransition::Failed {
                    cause: FailureCause::Transport,
                    detail: "interrupted before submission".to_string(),
                },
            )
            .await?;
        }

        let mut ids = Vec::new();
        for status in [RunStatus::Submitted, RunStatus::Polling] {
            ids.extend(self.store.list_by_status(status).await?.into_iter().map(|r| r.id));
        }
        info!("Recovered {} in-flight run(s)", ids.len());
        Ok(ids)
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        let in_flight_runs = self.store.list_by_status(RunStatus::Submitted).await?.len()
            + self.store.list_by_status(RunStatus::Polling).await?.len();
        let active_drivers = self.drivers.lock().map_err(ReportingError::poisoned)?.len();
        Ok(HealthStatus {
            credentials_configured: self.config.has_credentials(),
            in_flight_runs,
            active_drivers,
        })
    }

    async fn start_remote(
        &self,
        submission: &RunSubmission,
        mut record: RunRecord,
        token: &CancellationToken,
    ) -> Result<RunRecord> {
        loop {
            let elapsed = record.elapsed(self.clock.now());
            if elapsed >= self.config.poll_timeout {
                return self.time_out(&record, elapsed).await;
            }
            let remaining = self.config.poll_timeout - elapsed;

            let created = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Submission of run {} stopped by cancellation", record.id);
                    return self.store.get(&record.id).await;
                }
                created = self.service.create_run(submission) => created,
                _ = self.clock.sleep(remaining) => {
                    return self.time_out(&record, self.config.poll_timeout).await;
                }
            };

            let err = match created {
                Ok(remote) => {
                    let handle = remote.clone();
                    let updated = self.transition(&record.id, RunTransition::Submitted { remote }).await?;
                    if updated.status == RunStatus::Submitted {
                        info!("Run {} started remote run {}", updated.id, handle.run_id);
                    } else {
                        warn!(
                            "Run {} settled as {:?} while submitting; cancelling remote run {}",
                            updated.id, updated.status, handle.run_id
                        );
                        self.cancel_remote(&handle).await;
                    }
                    return Ok(updated);
                }
                Err(err) => err,
            };

            warn!("Submitting run {} failed: {}", record.id, err);
            let (updated, delay) = match self.recover_from(&record, err).await? {
                Recovery::Retry { record, delay } => (record, delay),
                Recovery::Settled(settled) => return Ok(settled),
            };
            let remaining = self
                .config
                .poll_timeout
                .saturating_sub(updated.elapsed(self.clock.now()));

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Submission of run {} stopped by cancellation", updated.id);
                    return self.store.get(&updated.id).await;
                }
                _ = self.clock.sleep(delay.min(remaining)) => {}
            }
            record = self.store.get(&updated.id).await?;
            if record.is_terminal() {
                return Ok(record);
            }
        }
    }

    async fn drive_until_settled(&self, id: &RunId, token: &CancellationToken) -> Result<RunRecord> {
        let mut polls = 0u32;
        loop {
            let polled = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                polled = self.poll_once(id) => Some(polled?),
            };
            let Some((record, retry_delay)) = polled else {
                debug!("Driver for run {} stopped by cancellation", id);
                return self.store.get(id).await;
            };
            if record.is_terminal() {
                return Ok(record);
            }

            polls += 1;
            let remaining = self
                .config
                .poll_timeout
                .saturating_sub(record.elapsed(self.clock.now()));
            let delay = retry_delay
                .unwrap_or_else(|| self.config.poll_backoff.delay_for_attempt(polls))
                .max(MIN_POLL_DELAY)
                .min(remaining);

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Driver for run {} stopped by cancellation", id);
                    return self.store.get(id).await;
                }
                _ = self.clock.sleep(delay) => {}
            }
        }
    }

    /// Returns the record after one observation, plus the delay the caller
    /// must wait before the next one when the remote asked for a back-off.
    async fn poll_once(&self, id: &RunId) -> Result<(RunRecord, Option<Duration>)> {
        let record = self.store.get(id).await?;
        if record.is_terminal() {
            return Ok((record, None));
        }

        let elapsed = record.elapsed(self.clock.now());
        if elapsed >= self.config.poll_timeout {
            return Ok((self.time_out(&record, elapsed).await?, None));
        }
        let Some(remote) = record.remote.clone() else {
            debug!("Run {} has no remote run yet", id);
            return Ok((record, None));
        };

        let remaining = self.config.poll_timeout - elapsed;
        let observed = tokio::select! {
            biased;
            status = self.service.run_status(&remote) => Some(status),
            _ = self.clock.sleep(remaining) => None,
        };

        match observed {
            None => Ok((self.time_out(&record, self.config.poll_timeout).await?, None)),
            Some(Ok(status)) => Ok((self.observe(&record, status).await?, None)),
            Some(Err(err)) => match self.recover_from(&record, err).await? {
                Recovery::Retry { record, delay } => Ok((record, Some(delay))),
                Recovery::Settled(record) => Ok((record, None)),
            },
        }
    }

    async fn observe(&self, record: &RunRecord, status: RemoteRunStatus) -> Result<RunRecord> {
        let id = &record.id;
        let transition = match status {
            RemoteRunStatus::Completed { payload } => {
                match self.validator.validate(&payload, &record.request.report_kinds) {
                    Ok(report) => {
                        info!(
                            "Run {} succeeded after {} poll(s) with {} warning(s)",
                            id,
                            record.attempts + 1,
                            report.warnings.len()
                        );
                        for warning in &report.warnings {
                            debug!("Run {} warning at {}: {}", id, warning.path, warning.message);
                        }
                        RunTransition::Succeeded { raw: payload, report }
                    }
                    Err(failure) => {
                        warn!("Run {} returned output that failed validation: {}", id, failure);
                        RunTransition::ValidationFailed { raw: payload, failure }
                    }
                }
            }
            RemoteRunStatus::Failed { message } => {
                error!("Run {} failed remotely: {}", id, message);
                RunTransition::Failed {
                    cause: FailureCause::Agent,
                    detail: message,
                }
            }
            RemoteRunStatus::Expired => {
                error!("Run {} expired remotely", id);
                RunTransition::Failed {
                    cause: FailureCause::Agent,
                    detail: "remote run expired".to_string(),
                }
            }
            RemoteRunStatus::Cancelled => RunTransition::Failed {
                cause: FailureCause::Cancelled,
                detail: "remote run was cancelled".to_string(),
            },
            RemoteRunStatus::Unknown(status) => {
                warn!("Run {} reported unrecognised status {:?}; still waiting", id, status);
                RunTransition::Polled
            }
            pending => {
                debug!("Run {} is {:?}", id, pending);
                RunTransition::Polled
            }
        };
        self.transition(id, transition).await
    }

    async fn recover_from(&self, record: &RunRecord, err: RemoteError) -> Result<Recovery> {
        let id = &record.id;
        match err {
            RemoteError::RateLimited { retry_after } => {
                if record.throttled >= self.config.max_rate_limit_retries {
                    error!("Run {} still rate limited after {} retries", id, record.throttled);
                    return self
                        .settle(
                            id,
                            FailureCause::RateLimited,
                            format!("rate limited {} times", record.throttled + 1),
                        )
                        .await;
                }
                let updated = self.transition(id, RunTransition::Throttled).await?;
                if updated.is_terminal() {
                    return Ok(Recovery::Settled(updated));
                }
                let delay = self.throttle_delay(updated.throttled, retry_after);
                debug!("Run {} throttled ({}), backing off {:?}", id, updated.throttled, delay);
                Ok(Recovery::Retry { record: updated, delay })
            }
            RemoteError::Transport(message) => {
                if record.transport_errors >= self.config.max_transport_retries {
                    error!("Run {} giving up after {} transport errors", id, record.transport_errors + 1);
                    return self.settle(id, FailureCause::Transport, message).await;
                }
                let updated = self.transition(id, RunTransition::TransportHiccup).await?;
                if updated.is_terminal() {
                    return Ok(Recovery::Settled(updated));
                }
                let delay = self.config.poll_backoff.delay_for_attempt(updated.transport_errors);
                Ok(Recovery::Retry { record: updated, delay })
            }
            RemoteError::Unauthorized(message) => {
                error!("Run {} was refused by the remote service: {}", id, message);
                self.settle(id, FailureCause::Configuration, format!("unauthorized: {}", message))
                    .await
            }
            RemoteError::Rejected { status, message } => {
                error!("Run {} request rejected with status {}", id, status);
                self.settle(
                    id,
                    FailureCause::Configuration,
                    format!("rejected with status {}: {}", status, message),
                )
                .await
            }
        }
    }

    async fn settle(&self, id: &RunId, cause: FailureCause, detail: String) -> Result<Recovery> {
        let record = self.transition(id, RunTransition::Failed { cause, detail }).await?;
        Ok(Recovery::Settled(record))
    }

    async fn time_out(&self, record: &RunRecord, elapsed: Duration) -> Result<RunRecord> {
        warn!("Run {} timed out after {:?}", record.id, elapsed);
        self.transition(
            &record.id,
            RunTransition::TimedOut {
                detail: format!("no terminal status within {:?}", self.config.poll_timeout),
            },
        )
        .await
    }

    /// Doubles with every consecutive throttle and never undercuts the
    /// remote's own `Retry-After`.
    fn throttle_delay(&self, throttled: u32, retry_after: Option<Duration>) -> Duration {
        let escalated = self
            .config
            .poll_backoff
            .initial
            .max(MIN_POLL_DELAY)
            .saturating_mul(1u32 << throttled.min(10));
        escalated.max(retry_after.unwrap_or_default())
    }

    /// Applies a transition. When the run already settled through another
    /// path, the settled record is returned instead of an error.
    async fn transition(&self, id: &RunId, transition: RunTransition) -> Result<RunRecord> {
        match self.store.update(id, transition, self.clock.now()).await {
            Err(err @ ReportingError::InvalidTransition { .. }) => {
                let current = self.store.get(id).await?;
                if current.is_terminal() {
                    debug!("Run {} already settled as {:?}", id, current.status);
                    Ok(current)
                } else {
                    Err(err)
                }
            }
            other => other,
        }
    }

    fn claim(&self, id: &RunId) -> Result<CancellationToken> {
        let mut drivers = self.drivers.lock().map_err(ReportingError::poisoned)?;
        if drivers.contains_key(id) {
            return Err(ReportingError::DriverActive(id.to_string()));
        }
        let token = CancellationToken::new();
        drivers.insert(id.clone(), token.clone());
        Ok(token)
    }

    fn release(&self, id: &RunId) {
        if let Ok(mut drivers) = self.drivers.lock() {
            drivers.remove(id);
        }
    }

    async fn cancel_remote(&self, remote: &RemoteRunHandle) {
        if let Err(err) = self.service.cancel_run(remote).await {
            warn!("Could not cancel remote run {}: {}", remote.run_id, err);
        }
    }
}

use std::env;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::{ReportingError, Result};
use crate::utils::BackoffPolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Everything the orchestrator needs to talk to the remote agent service.
/// Passed in at construction; nothing is read from the environment later.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub assistant_id: Option<String>,
    pub poll_backoff: BackoffPolicy,
    /// Upper bound on the whole submit-to-terminal lifecycle of one run.
    pub poll_timeout: Duration,
    pub max_rate_limit_retries: u32,
    pub max_transport_retries: u32,
    pub request_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            assistant_id: None,
            poll_backoff: BackoffPolicy::default(),
            poll_timeout: Duration::from_secs(300),
            max_rate_limit_retries: 5,
            max_transport_retries: 3,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl OrchestratorConfig {
    pub fn new(api_key: impl Into<String>, assistant_id: impl Into<String>) -> Self {
        Self {
            api_key: Some(secret_value(api_key.into())),
            assistant_id: Some(assistant_id.into()),
            ..Self::default()
        }
    }

    /// Reads `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `OPENAI_ASSISTANT_ID`,
    /// `AGENT_POLL_TIMEOUT_SECS`, `AGENT_POLL_INTERVAL_MS`,
    /// `AGENT_MAX_RATE_LIMIT_RETRIES` and `AGENT_MAX_TRANSPORT_RETRIES`.
    /// Missing credentials are not an error here; `ensure_credentials` is.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(read_env)
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        config.api_key = lookup("OPENAI_API_KEY").map(secret_value);
        config.assistant_id = lookup("OPENAI_ASSISTANT_ID");
        if let Some(base_url) = lookup("OPENAI_BASE_URL") {
            config = config.with_base_url(base_url)?;
        }
        if let Some(value) = lookup("AGENT_POLL_TIMEOUT_SECS") {
            config.poll_timeout = Duration::from_secs(parse_u64("AGENT_POLL_TIMEOUT_SECS", &value)?);
        }
        if let Some(value) = lookup("AGENT_POLL_INTERVAL_MS") {
            config.poll_backoff.initial =
                Duration::from_millis(parse_u64("AGENT_POLL_INTERVAL_MS", &value)?);
            config.poll_backoff.max = config.poll_backoff.max.max(config.poll_backoff.initial);
        }
        if let Some(value) = lookup("AGENT_MAX_RATE_LIMIT_RETRIES") {
            config.max_rate_limit_retries = parse_u32("AGENT_MAX_RATE_LIMIT_RETRIES", &value)?;
        }
        if let Some(value) = lookup("AGENT_MAX_TRANSPORT_RETRIES") {
            config.max_transport_retries = parse_u32("AGENT_MAX_TRANSPORT_RETRIES", &value)?;
        }

        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ReportingError::InvalidConfiguration(format!(
                "base URL must start with http:// or https://, got {:?}",
                base_url
            )));
        }
        self.base_url = base_url.trim_end_matches('/').to_string();
        Ok(self)
    }

    pub fn with_poll_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.poll_backoff = backoff;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_max_rate_limit_retries(mut self, retries: u32) -> Self {
        self.max_rate_limit_retries = retries;
        self
    }

    pub fn with_max_transport_retries(mut self, retries: u32) -> Self {
        self.max_transport_retries = retries;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key
            .as_ref()
            .is_some_and(|key| !key.expose_secret().trim().is_empty())
            && self
                .assistant_id
                .as_deref()
                .is_some_and(|id| !id.trim().is_empty())
    }

    /// Fails with `Configuration` when the remote service cannot possibly
    /// accept a call.
    pub fn ensure_credentials(&self) -> Result<()> {
        let key_missing = self
            .api_key
            .as_ref()
            .map_or(true, |key| key.expose_secret().trim().is_empty());
        if key_missing {
            return Err(ReportingError::Configuration(
                "OPENAI_API_KEY is not configured".to_string(),
            ));
        }
        if self.assistant_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            return Err(ReportingError::Configuration(
                "OPENAI_ASSISTANT_ID is not configured".to_string(),
            ));
        }
        Ok(())
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value.trim().parse::<u32>().map_err(|_| {
        ReportingError::InvalidConfiguration(format!("{} must be a non-negative integer, got {:?}", key, value))
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|_| {
        ReportingError::InvalidConfiguration(format!("{} must be a non-negative integer, got {:?}", key, value))
    })
}

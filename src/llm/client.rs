use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use crate::config::OrchestratorConfig;
use crate::error::{RemoteError, ReportingError, Result};
use crate::llm::service::{AgentService, RemoteRunStatus, RunSubmission};
use crate::run::RemoteRunHandle;
use crate::utils::truncate;

const MAX_ERROR_BODY_CHARS: usize = 500;

/// `AgentService` backed by the OpenAI Assistants v2 API: one thread per run,
/// the spreadsheets attached to its first message by file id.
#[derive(Clone)]
pub struct OpenAiAgentClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
    assistant_id: String,
}

impl OpenAiAgentClient {
    pub fn from_config(config: &OrchestratorConfig) -> Result<Self> {
        config.ensure_credentials()?;
        let (Some(api_key), Some(assistant_id)) = (config.api_key.clone(), config.assistant_id.clone())
        else {
            return Err(ReportingError::Configuration(
                "OpenAI credentials are not configured".to_string(),
            ));
        };

        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key,
            assistant_id,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(self.api_key.expose_secret())
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send_json(&self, builder: RequestBuilder) -> std::result::Result<Value, RemoteError> {
        let res = builder
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = res.status();

        if !status.is_success() {
            let retry_after = parse_retry_after(res.headers());
            let body = res.text().await.unwrap_or_default();
            return Err(classify_failure(status, retry_after, &body));
        }

        res.json::<Value>()
            .await
            .map_err(|e| RemoteError::Transport(format!("unreadable response body: {}", e)))
    }

    async fn latest_message(&self, handle: &RemoteRunHandle) -> std::result::Result<Option<String>, RemoteError> {
        let builder = self
            .request(Method::GET, &format!("/threads/{}/messages", handle.thread_id))
            .query(&[
                ("run_id", handle.run_id.as_str()),
                ("order", "desc"),
                ("limit", "1"),
            ]);
        let body = self.send_json(builder).await?;
        Ok(extract_message_text(&body))
    }
}

#[async_trait]
impl AgentService for OpenAiAgentClient {
    async fn create_run(&self, submission: &RunSubmission) -> std::result::Result<RemoteRunHandle, RemoteError> {
        let thread = self
            .send_json(self.request(Method::POST, "/threads").json(&thread_body(submission)))
            .await?;
        let thread_id = string_field(&thread, "id")
            .ok_or_else(|| RemoteError::Transport("thread response did not include an id".to_string()))?;
        debug!("Created thread {} with {} attachment(s)", thread_id, submission.file_refs.len());

        let run = self
            .send_json(
                self.request(Method::POST, &format!("/threads/{}/runs", thread_id))
                    .json(&run_body(&self.assistant_id, submission)),
            )
            .await?;
        let run_id = string_field(&run, "id")
            .ok_or_else(|| RemoteError::Transport("run response did not include an id".to_string()))?;

        Ok(RemoteRunHandle { thread_id, run_id })
    }

    async fn run_status(&self, handle: &RemoteRunHandle) -> std::result::Result<RemoteRunStatus, RemoteError> {
        let run = self
            .send_json(self.request(
                Method::GET,
                &format!("/threads/{}/runs/{}", handle.thread_id, handle.run_id),
            ))
            .await?;

        match interpret_run(&run) {
            RemoteRunStatus::Completed { .. } => match self.latest_message(handle).await? {
                Some(payload) => Ok(RemoteRunStatus::Completed { payload }),
                None => {
                    warn!("Run {} completed without an assistant message", handle.run_id);
                    Ok(RemoteRunStatus::Failed {
                        message: "run completed without an assistant message".to_string(),
                    })
                }
            },
            other => Ok(other),
        }
    }

    async fn cancel_run(&self, handle: &RemoteRunHandle) -> std::result::Result<(), RemoteError> {
        self.send_json(self.request(
            Method::POST,
            &format!("/threads/{}/runs/{}/cancel", handle.thread_id, handle.run_id),
        ))
        .await?;
        Ok(())
    }
}

fn thread_body(submission: &RunSubmission) -> Value {
    let attachments: Vec<Value> = submission
        .file_refs
        .iter()
        .map(|file_ref| json!({ "file_id": file_ref.as_str() }))
        .collect();

    json!({
        "messages": [{
            "role": "user",
            "content": submission.prompt.user_message,
            "attachments": attachments,
        }]
    })
}

fn run_body(assistant_id: &str, submission: &RunSubmission) -> Value {
    let mut body = json!({
        "assistant_id": assistant_id,
        "instructions": submission.prompt.system_message,
        "response_format": submission.response_format,
    });
    if !submission.metadata.is_empty() {
        body["metadata"] = json!(submission.metadata);
    }
    body
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Maps a run object to a status. A completed run carries an empty payload;
/// the caller fetches the message separately.
fn interpret_run(run: &Value) -> RemoteRunStatus {
    let status = run.get("status").and_then(Value::as_str).unwrap_or_default();
    match status {
        "queued" => RemoteRunStatus::Queued,
        "in_progress" | "cancelling" => RemoteRunStatus::InProgress,
        "requires_action" => RemoteRunStatus::RequiresAction,
        "completed" => RemoteRunStatus::Completed {
            payload: String::new(),
        },
        "failed" => {
            let message = run
                .get("last_error")
                .and_then(|e| string_field(e, "message").or_else(|| string_field(e, "code")))
                .unwrap_or_else(|| "run failed without an error message".to_string());
            RemoteRunStatus::Failed { message }
        }
        "incomplete" => {
            let reason = run
                .get("incomplete_details")
                .and_then(|d| string_field(d, "reason"))
                .unwrap_or_else(|| "unknown reason".to_string());
            RemoteRunStatus::Failed {
                message: format!("run incomplete: {}", reason),
            }
        }
        "cancelled" => RemoteRunStatus::Cancelled,
        "expired" => RemoteRunStatus::Expired,
        other => RemoteRunStatus::Unknown(other.to_string()),
    }
}

fn extract_message_text(messages: &Value) -> Option<String> {
    let message = messages.get("data")?.as_array()?.first()?;
    if message.get("role").and_then(Value::as_str) != Some("assistant") {
        return None;
    }
    let text: String = message
        .get("content")?
        .as_array()?
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|part| part.pointer("/text/value").and_then(Value::as_str))
        .collect();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // Negative, non-finite and out-of-range values are ignored.
    let secs = value.parse::<f64>().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

fn classify_failure(status: StatusCode, retry_after: Option<Duration>, body: &str) -> RemoteError {
    let message = truncate(body.trim(), MAX_ERROR_BODY_CHARS);
    match status {
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(message),
        StatusCode::REQUEST_TIMEOUT => RemoteError::Transport(format!("request timeout: {}", message)),
        s if s.is_server_error() => RemoteError::Transport(format!("status {}: {}", s.as_u16(), message)),
        s => RemoteError::Rejected {
            status: s.as_u16(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::ExternalFileRef;
    use crate::llm::prompts::Prompt;
    use reqwest::header::HeaderValue;
    use std::collections::BTreeMap;

    fn submission() -> RunSubmission {
        RunSubmission {
            prompt: Prompt {
                system_message: "system".to_string(),
                user_message: "user".to_string(),
            },
            file_refs: vec![ExternalFileRef::new("file-a"), ExternalFileRef::new("file-b")],
            response_format: json!({ "type": "json_schema" }),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_thread_body_attaches_files_by_id() {
        let body = thread_body(&submission());
        assert_eq!(body["messages"][0]["content"], "user");
        assert_eq!(body["messages"][0]["attachments"][1]["file_id"], "file-b");
    }

    #[test]
    fn test_run_body_carries_instructions_and_format() {
        let mut sub = submission();
        let body = run_body("asst_1", &sub);
        assert_eq!(body["assistant_id"], "asst_1");
        assert_eq!(body["instructions"], "system");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert!(body.get("metadata").is_none());

        sub.metadata.insert("run_id".to_string(), "run_1".to_string());
        assert_eq!(run_body("asst_1", &sub)["metadata"]["run_id"], "run_1");
    }

    #[test]
    fn test_interpret_run_statuses() {
        assert_eq!(interpret_run(&json!({"status": "queued"})), RemoteRunStatus::Queued);
        assert_eq!(interpret_run(&json!({"status": "cancelling"})), RemoteRunStatus::InProgress);
        assert_eq!(
            interpret_run(&json!({"status": "failed", "last_error": {"code": "server_error", "message": "boom"}})),
            RemoteRunStatus::Failed {
                message: "boom".to_string()
            }
        );
        assert_eq!(
            interpret_run(&json!({"status": "incomplete", "incomplete_details": {"reason": "max_completion_tokens"}})),
            RemoteRunStatus::Failed {
                message: "run incomplete: max_completion_tokens".to_string()
            }
        );
        assert_eq!(
            interpret_run(&json!({"status": "paused"})),
            RemoteRunStatus::Unknown("paused".to_string())
        );
    }

    #[test]
    fn test_extract_message_text_joins_text_parts() {
        let body = json!({
            "data": [{
                "role": "assistant",
                "content": [
                    {"type": "text", "text": {"value": "{\"cash_flow\":", "annotations": []}},
                    {"type": "image_file", "image_file": {"file_id": "file-img"}},
                    {"type": "text", "text": {"value": "{}}", "annotations": []}}
                ]
            }]
        });
        assert_eq!(extract_message_text(&body).as_deref(), Some("{\"cash_flow\":{}}"));
        assert_eq!(extract_message_text(&json!({"data": []})), None);
        assert_eq!(
            extract_message_text(&json!({"data": [{"role": "user", "content": []}]})),
            None
        );
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(
            classify_failure(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), ""),
            RemoteError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(matches!(
            classify_failure(StatusCode::UNAUTHORIZED, None, "bad key"),
            RemoteError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_failure(StatusCode::BAD_GATEWAY, None, "upstream"),
            RemoteError::Transport(_)
        ));

        let long_body = "x".repeat(2_000);
        match classify_failure(StatusCode::BAD_REQUEST, None, &long_body) {
            RemoteError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message.chars().count(), MAX_ERROR_BODY_CHARS + 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(1500)));

        for unusable in ["1e20", "-3", "NaN", "inf", "soon"] {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(unusable));
            assert_eq!(parse_retry_after(&headers), None, "{}", unusable);
        }
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let err = OpenAiAgentClient::from_config(&OrchestratorConfig::default()).err().unwrap();
        assert!(matches!(err, ReportingError::Configuration(_)));
        assert!(OpenAiAgentClient::from_config(&OrchestratorConfig::new("sk-test", "asst_1")).is_ok());
    }
}

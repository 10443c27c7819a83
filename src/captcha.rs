//! Captcha transcription service client
//!
//! The solver is an external paid service: we hand it the audio challenge
//! URL and poll for the transcription. Calls are never retried; a failed
//! solve surfaces immediately rather than burning credit.

use crate::error::{ErrorKind, GatewayError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// How long we wait for the service to produce a transcription.
const SOLVE_DEADLINE: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(3);

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Transcribe the audio asset at `audio_url`, billed against `api_key`.
    async fn transcribe(&self, audio_url: &str, api_key: &str) -> Result<String, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    status: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the transcription service: submit a task, poll until it
/// resolves or the deadline passes.
pub struct HttpCaptchaSolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCaptchaSolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn solve_failed(message: impl Into<String>) -> GatewayError {
        GatewayError::new(ErrorKind::CaptchaFailed, message)
    }
}

#[async_trait]
impl CaptchaSolver for HttpCaptchaSolver {
    async fn transcribe(&self, audio_url: &str, api_key: &str) -> Result<String, GatewayError> {
        let submit_url = format!("{}/tasks", self.base_url.trim_end_matches('/'));
        let submitted: SubmitResponse = self
            .client
            .post(&submit_url)
            .json(&serde_json::json!({
                "api_key": api_key,
                "type": "audio_transcription",
                "audio_url": audio_url,
            }))
            .send()
            .await
            .map_err(|e| Self::solve_failed(format!("solver unreachable: {e}")))?
            .error_for_status()
            .map_err(|e| Self::solve_failed(format!("solver rejected task: {e}")))?
            .json()
            .await
            .map_err(|e| Self::solve_failed(format!("bad solver response: {e}")))?;

        tracing::debug!(task_id = %submitted.task_id, "captcha task submitted");

        let poll_url = format!(
            "{}/tasks/{}",
            self.base_url.trim_end_matches('/'),
            submitted.task_id
        );
        let deadline = tokio::time::Instant::now() + SOLVE_DEADLINE;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(Self::solve_failed("transcription deadline exceeded"));
            }

            let poll: PollResponse = self
                .client
                .get(&poll_url)
                .send()
                .await
                .map_err(|e| Self::solve_failed(format!("solver unreachable: {e}")))?
                .json()
                .await
                .map_err(|e| Self::solve_failed(format!("bad solver response: {e}")))?;

            match poll.status.as_str() {
                "ready" => {
                    return poll
                        .text
                        .filter(|t| !t.is_empty())
                        .ok_or_else(|| Self::solve_failed("solver returned empty transcription"));
                }
                "failed" => {
                    return Err(Self::solve_failed(
                        poll.error.unwrap_or_else(|| "solver reported failure".to_string()),
                    ));
                }
                _ => continue,
            }
        }
    }
}

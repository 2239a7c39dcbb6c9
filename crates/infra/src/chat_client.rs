use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;

use temanjalan_domain::DomainResult;
use temanjalan_domain::error::DomainError;
use temanjalan_domain::ports::BoxFuture;
use temanjalan_domain::ports::conversations::{ConversationClient, ConversationCreate};

use crate::config::AppConfig;

const PLATFORM_TOKEN_HEADER: &str = "X-Platform-Token";
const UNIQUENESS_KEY_HEADER: &str = "X-Uniqueness-Key";

#[derive(Debug, thiserror::Error)]
pub enum ChatClientError {
    #[error("chat client configuration error: {0}")]
    Configuration(String),
    #[error("chat bad request: {0}")]
    BadRequest(String),
    #[error("chat unauthorized: {0}")]
    Unauthorized(String),
    #[error("chat upstream error: {0}")]
    Upstream(String),
    #[error("chat transport error: {0}")]
    Transport(String),
    #[error("chat response decode error: {0}")]
    InvalidResponse(String),
}

/// HTTP client for the external conversation service. Creation carries the
/// uniqueness key, so retries and concurrent callers collapse onto one
/// conversation on the service side; that is what makes blind retry safe
/// here.
#[derive(Debug, Clone)]
pub struct ChatApiClient {
    http: reqwest::Client,
    base_url: String,
    platform_token: Option<String>,
    retry_max_attempts: u32,
    retry_backoff_base: Duration,
    retry_backoff_max: Duration,
}

#[derive(Debug, Deserialize)]
struct CreateConversationResponse {
    conversation_id: String,
}

impl ChatApiClient {
    pub fn from_config(config: &AppConfig) -> Self {
        let timeout = Duration::from_millis(config.chat_api_timeout_ms.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let token = config.chat_api_token.trim().to_string();
        Self {
            http,
            base_url: config.chat_api_base_url.trim_end_matches('/').to_string(),
            platform_token: if token.is_empty() { None } else { Some(token) },
            retry_max_attempts: config.chat_api_retry_max_attempts.max(1),
            retry_backoff_base: Duration::from_millis(config.chat_api_retry_backoff_base_ms),
            retry_backoff_max: Duration::from_millis(config.chat_api_retry_backoff_max_ms.max(1)),
        }
    }

    async fn create(&self, input: &ConversationCreate) -> Result<String, ChatClientError> {
        if self.base_url.is_empty() {
            return Err(ChatClientError::Configuration(
                "chat_api_base_url is not set".to_string(),
            ));
        }

        let url = format!("{}/conversations", self.base_url);
        let body = json!({
            "members": input.members,
            "name": input.name,
            "attributes": input.attributes,
            "uniqueness_key": input.uniqueness_key,
        });

        let mut last_error = ChatClientError::Transport("no attempt made".to_string());
        for attempt in 1..=self.retry_max_attempts {
            let mut request = self
                .http
                .post(&url)
                .header(UNIQUENESS_KEY_HEADER, &input.uniqueness_key)
                .json(&body);
            if let Some(token) = &self.platform_token {
                request = request.header(PLATFORM_TOKEN_HEADER, token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let decoded: CreateConversationResponse =
                            response.json().await.map_err(|err| {
                                ChatClientError::InvalidResponse(err.to_string())
                            })?;
                        return Ok(decoded.conversation_id);
                    }

                    let detail = response.text().await.unwrap_or_default();
                    match status {
                        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                            return Err(ChatClientError::BadRequest(detail));
                        }
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            return Err(ChatClientError::Unauthorized(detail));
                        }
                        status if status.is_server_error() => {
                            last_error = ChatClientError::Upstream(format!("{status}: {detail}"));
                        }
                        status => {
                            return Err(ChatClientError::Upstream(format!("{status}: {detail}")));
                        }
                    }
                }
                Err(err) => {
                    last_error = ChatClientError::Transport(err.to_string());
                }
            }

            if attempt < self.retry_max_attempts {
                sleep(self.backoff(attempt)).await;
            }
        }

        Err(last_error)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let pow = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.retry_backoff_base.saturating_mul(pow);
        delay.min(self.retry_backoff_max)
    }
}

impl ConversationClient for ChatApiClient {
    fn create_conversation(
        &self,
        input: &ConversationCreate,
    ) -> BoxFuture<'_, DomainResult<String>> {
        let input = input.clone();
        Box::pin(async move {
            self.create(&input)
                .await
                .map_err(|err| DomainError::Store(err.to_string()))
        })
    }
}

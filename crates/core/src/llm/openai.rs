//! OpenAI-compatible chat-completions client.
//!
//! Works against the OpenAI API, Azure OpenAI deployments, and local
//! OpenAI-compatible servers. Structured calls use the `json_schema`
//! response format and return the parsed JSON value.

use super::{LlmClient, LlmError, Message};
use crate::config::LlmConfig;
use reqwest::{Client, StatusCode};
use serde_json::json;

#[derive(Clone)]
pub struct OpenAiCompatibleClient {
    config: LlmConfig,
    client: Client,
}

impl std::fmt::Debug for OpenAiCompatibleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatibleClient")
            .field("model", &self.config.model)
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl OpenAiCompatibleClient {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::InvalidConfig {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { config, client })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.config.api_key)
    }

    async fn post_chat(&self, body: serde_json::Value) -> Result<serde_json::Value, LlmError> {
        let url = format!("{}/chat/completions", self.base_url());

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        seconds: self.config.timeout_secs,
                    }
                } else {
                    LlmError::Network { source: e }
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(LlmError::Auth {
                message: "invalid API key".to_string(),
            });
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited { retry_after });
        } else if status == StatusCode::BAD_REQUEST {
            let error: serde_json::Value = response.json().await.unwrap_or_else(|_| json!({}));
            let message = error["error"]["message"]
                .as_str()
                .unwrap_or("invalid request")
                .to_string();
            return Err(LlmError::InvalidRequest { message });
        } else if !status.is_success() {
            return Err(LlmError::Api {
                message: format!("API returned status {}", status),
                status_code: Some(status.as_u16()),
            });
        }

        response.json().await.map_err(|e| LlmError::InvalidResponse {
            message: format!("failed to parse response body: {}", e),
        })
    }

    fn extract_content(response: &serde_json::Value) -> Result<String, LlmError> {
        response["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::InvalidResponse {
                message: "response contained no message content".to_string(),
            })
    }

    fn message_bodies(messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect()
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(
        &self,
        messages: &[Message],
        temperature: Option<f32>,
    ) -> Result<String, LlmError> {
        let body = json!({
            "model": self.config.model,
            "messages": Self::message_bodies(messages),
            "temperature": temperature.unwrap_or(self.config.temperature),
            "max_tokens": self.config.max_tokens,
            "stream": false,
        });

        let response = self.post_chat(body).await?;
        Self::extract_content(&response)
    }

    async fn complete_structured(
        &self,
        schema: &serde_json::Value,
        messages: &[Message],
    ) -> Result<serde_json::Value, LlmError> {
        let body = json!({
            "model": self.config.model,
            "messages": Self::message_bodies(messages),
            "temperature": 0.0,
            "max_tokens": self.config.max_tokens,
            "stream": false,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "structured_output",
                    "strict": true,
                    "schema": schema,
                },
            },
        });

        let response = self.post_chat(body).await?;
        let content = Self::extract_content(&response)?;

        serde_json::from_str(&content).map_err(|e| LlmError::InvalidResponse {
            message: format!("structured output was not valid JSON: {}", e),
        })
    }
}

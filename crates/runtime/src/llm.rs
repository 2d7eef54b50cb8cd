//! Retrying decorator around any `LlmClient`.
//!
//! Every call runs under the retry coordinator with the session
//! checkpointer, so recoverable faults never escape this layer except as
//! `RetryExhausted` and in-flight attempts are visible in the persisted
//! session.

use crate::retry::{Checkpointer, RetryCoordinator, RetryError};
use nlq_core::{LlmClient, LlmError, Message};
use std::sync::Arc;

pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    coordinator: RetryCoordinator,
    checkpointer: Arc<dyn Checkpointer>,
}

impl RetryingLlmClient {
    pub fn new(
        inner: Arc<dyn LlmClient>,
        coordinator: RetryCoordinator,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> Self {
        Self {
            inner,
            coordinator,
            checkpointer,
        }
    }

    fn flatten(error: RetryError<LlmError>) -> LlmError {
        match error {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { attempts, last } => LlmError::RetryExhausted {
                attempts,
                message: last.to_string(),
            },
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        temperature: Option<f32>,
    ) -> Result<String, LlmError> {
        self.coordinator
            .execute("llm_complete", self.checkpointer.as_ref(), || {
                self.inner.complete(messages, temperature)
            })
            .await
            .map_err(Self::flatten)
    }

    async fn complete_structured(
        &self,
        schema: &serde_json::Value,
        messages: &[Message],
    ) -> Result<serde_json::Value, LlmError> {
        self.coordinator
            .execute("llm_complete_structured", self.checkpointer.as_ref(), || {
                self.inner.complete_structured(schema, messages)
            })
            .await
            .map_err(Self::flatten)
    }
}

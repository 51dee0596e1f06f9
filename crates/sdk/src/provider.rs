// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! LLM provider collaborator.
//!
//! The tracing engine does not talk to any model API. It only needs the
//! shape of a completion to fill in a model-call span: output text, model
//! name, and token usage. Concrete providers implement [`LlmProvider`].

use crate::span::Span;
use crate::trace::Trace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sprintlens_core::{SpanType, TokenUsage};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Token counts reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl From<Usage> for TokenUsage {
    fn from(usage: Usage) -> Self {
        TokenUsage {
            prompt_tokens: Some(usage.prompt_tokens),
            completion_tokens: Some(usage.completion_tokens),
            total_tokens: Some(usage.total_tokens),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider request failed: {0}")]
    Request(String),

    #[error("Rate limited by provider")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Something that turns a conversation into a completion.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name recorded on spans (`"azure-openai"`, `"anthropic"`, ...).
    fn provider_name(&self) -> String;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, ProviderError>;
}

impl Span {
    /// Record a completion on a model-call span.
    pub fn record_completion(&self, completion: &Completion, provider: Option<&str>) {
        self.set_output(&completion.content);
        self.set_model_info(completion.model.clone(), provider, None);
        self.set_token_usage(completion.usage.into());
        if let Some(reason) = &completion.finish_reason {
            self.add_tag("finish_reason", reason);
        }
    }
}

/// Run one provider call inside an `llm` span of `trace`.
///
/// The span nests under the current span, records the messages as input,
/// and either the completion or the provider error.
pub async fn traced_completion(
    trace: &Trace,
    name: &str,
    provider: &dyn LlmProvider,
    messages: &[ChatMessage],
) -> Result<Completion, ProviderError> {
    let provider_name = provider.provider_name();
    let span = trace
        .span(name)
        .span_type(SpanType::Llm)
        .input(messages)
        .tag("provider", &provider_name)
        .build();

    span.try_in_scope_async(async {
        let completion = provider.complete(messages).await?;
        span.record_completion(&completion, Some(&provider_name));
        Ok::<_, ProviderError>(completion)
    })
    .await
}

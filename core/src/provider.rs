use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::chat::{Message, ToolCall};

/// Why an outbound LLM call failed, so the caller can pick the right recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// No answer within the bounded wait, or a 408.
    Timeout,
    /// 429 — check `retry_after_secs`.
    RateLimited,
    /// The provider answered, but the payload (usually tool calls) is malformed.
    InvalidResponse,
    /// Connection refused, DNS failure, reset, etc.
    Network,
    /// Anything else, including 5xx.
    Unknown,
    /// Rejected locally by the circuit breaker; no network attempt was made.
    CircuitOpen,
}

impl ProviderErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::InvalidResponse => "invalid_response",
            Self::Network => "network",
            Self::Unknown => "unknown",
            Self::CircuitOpen => "circuit_open",
        }
    }

    /// Failures that feed the breaker's consecutive-failure streak.
    pub fn counts_toward_breaker(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Network | Self::Unknown
        )
    }

    /// Worth retrying the same request.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Network)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("provider error ({kind}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Seconds to wait before retrying (from a 429 body).
    pub retry_after_secs: Option<u64>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn timeout(waited: std::time::Duration) -> Self {
        Self::new(
            ProviderErrorKind::Timeout,
            format!("no response within {}ms", waited.as_millis()),
        )
    }

    pub fn circuit_open(retry_after_secs: u64) -> Self {
        Self {
            retry_after_secs: Some(retry_after_secs),
            ..Self::new(ProviderErrorKind::CircuitOpen, "circuit breaker is open")
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidResponse, message)
    }

    /// Classify an HTTP error status and body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let kind = match status {
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimited,
            _ => ProviderErrorKind::Unknown,
        };
        let retry_after_secs = if kind == ProviderErrorKind::RateLimited {
            extract_retry_after(body)
        } else {
            None
        };
        Self {
            kind,
            status: Some(status),
            message: truncate_body(body),
            retry_after_secs,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Text safe to show an end user.
    pub fn user_message(&self) -> &'static str {
        match self.kind {
            ProviderErrorKind::RateLimited | ProviderErrorKind::CircuitOpen => {
                "The assistant is busy right now. Please try again in a moment."
            }
            _ => "The assistant could not answer this time. Please try again.",
        }
    }
}

/// Handles `{"error": {"retry_after": 5}}` and `{"retry_after": 5}`, integer or float.
fn extract_retry_after(body: &str) -> Option<u64> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    let raw = v
        .get("error")
        .and_then(|e| e.get("retry_after"))
        .or_else(|| v.get("retry_after"))?;
    raw.as_u64().or_else(|| raw.as_f64().map(|f| f.ceil() as u64))
}

fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 300;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Conversation history, including synthetic tool responses
    pub messages: Vec<Message>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl CompletionResponse {
    /// Reject tool-call payloads the rest of the system could not store or answer.
    pub fn validate(&self) -> Result<(), ProviderError> {
        let mut seen = HashSet::new();
        for call in &self.tool_calls {
            if call.tool_call_id.trim().is_empty() {
                return Err(ProviderError::invalid_response("tool call without id"));
            }
            if call.name.trim().is_empty() {
                return Err(ProviderError::invalid_response("tool call without function name"));
            }
            if !call.arguments.is_object() {
                return Err(ProviderError::invalid_response(
                    "tool call arguments are not a JSON object",
                ));
            }
            if !seen.insert(call.tool_call_id.as_str()) {
                return Err(ProviderError::invalid_response("duplicate tool call id in response"));
            }
        }
        Ok(())
    }
}

/// An LLM backend. Implementations do a single attempt; retries, timeouts and
/// breaking live in [`crate::resilience::ResilientProvider`].
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Cheap liveness probe. Defaults to a one-token completion.
    async fn probe(&self) -> Result<(), ProviderError> {
        let request = CompletionRequest {
            messages: vec![Message::user(uuid::Uuid::nil(), "ping")],
            max_tokens: Some(1),
        };
        self.complete(&request).await.map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Provider that replays a fixed script of results, then a default reply.
    #[derive(Default)]
    pub struct ScriptedProvider {
        pub script: Mutex<VecDeque<Result<CompletionResponse, ProviderError>>>,
        pub calls: AtomicUsize,
        pub probes: AtomicUsize,
        pub delay: Option<std::time::Duration>,
        pub probe_result: Option<ProviderErrorKind>,
        pub requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        pub fn new(script: Vec<Result<CompletionResponse, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Self::default()
            }
        }

        pub fn reply(content: &str) -> Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                content: content.to_string(),
                tool_calls: Vec::new(),
            })
        }

        pub fn fail(kind: ProviderErrorKind) -> Result<CompletionResponse, ProviderError> {
            Err(ProviderError::new(kind, "scripted failure"))
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .expect("requests lock")
                .push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let next = self.script.lock().expect("script lock").pop_front();
            next.unwrap_or_else(|| Self::reply("ok"))
        }

        async fn probe(&self) -> Result<(), ProviderError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            match self.probe_result {
                Some(kind) => Err(ProviderError::new(kind, "scripted probe failure")),
                None => Ok(()),
            }
        }
    }
}

//! OpenAI-compatible chat completions client.

use std::time::Duration;

use async_trait::async_trait;
use chatguard_core::chat::{Message, MessageRole, ToolCall};
use chatguard_core::provider::{
    CompletionRequest, CompletionResponse, LlmProvider, ProviderError, ProviderErrorKind,
};
use reqwest::Client;
use serde_json::{Value, json};
use url::Url;

pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

/// HTTPS everywhere; plain HTTP only for a local model server.
pub fn validate_base_url(base_url: &str) -> Result<(), String> {
    let parsed =
        Url::parse(base_url).map_err(|e| format!("Invalid base_url '{base_url}': {e}"))?;

    match parsed.scheme() {
        "https" => Ok(()),
        "http" => {
            let host = parsed.host_str().unwrap_or("");
            let is_localhost = matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1");
            if is_localhost {
                tracing::warn!(
                    base_url,
                    "using unencrypted HTTP for a local LLM server; the API key is sent in cleartext"
                );
                Ok(())
            } else {
                Err(format!(
                    "HTTP is not allowed for remote URLs (base_url: '{base_url}'). Use HTTPS; \
                     HTTP is only permitted for localhost."
                ))
            }
        }
        scheme => Err(format!(
            "Unsupported URL scheme '{scheme}' in base_url '{base_url}'. Only http and https are allowed."
        )),
    }
}

impl OpenAiCompatibleProvider {
    /// `request_timeout` is a transport backstop; the resilient wrapper
    /// enforces the per-call deadline.
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        request_timeout: Duration,
    ) -> Result<Self, String> {
        validate_base_url(base_url)?;

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| format!("Failed to build HTTP client: {e}"))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(wire_message).collect();
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

fn wire_message(message: &Message) -> Value {
    match message.role {
        MessageRole::User => json!({ "role": "user", "content": message.content }),
        MessageRole::Assistant => {
            let mut value = json!({ "role": "assistant", "content": message.content });
            if !message.tool_calls.is_empty() {
                let calls: Vec<Value> = message
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.tool_call_id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                value["tool_calls"] = Value::Array(calls);
            }
            value
        }
        MessageRole::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.as_deref().unwrap_or_default(),
            "content": message.content,
        }),
    }
}

fn network_error(err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::new(ProviderErrorKind::Timeout, err.to_string())
    } else {
        ProviderError::new(ProviderErrorKind::Network, err.to_string())
    }
}

/// Parse `choices[0].message` from a completions body. Tool-call arguments
/// arrive as a JSON-encoded string; anything that is not an object is left
/// for [`CompletionResponse::validate`] to reject.
pub fn parse_completion(text: &str) -> Result<CompletionResponse, ProviderError> {
    let data: Value = serde_json::from_str(text)
        .map_err(|e| ProviderError::invalid_response(format!("response is not JSON: {e}")))?;
    let message = data["choices"]
        .get(0)
        .map(|choice| &choice["message"])
        .ok_or_else(|| ProviderError::invalid_response("no choices in response"))?;

    let content = message["content"].as_str().unwrap_or_default().to_string();

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|tc| {
                    let raw_args = tc["function"]["arguments"].as_str().unwrap_or("{}");
                    let arguments = serde_json::from_str(raw_args)
                        .unwrap_or_else(|_| Value::String(raw_args.to_string()));
                    ToolCall::new(
                        tc["id"].as_str().unwrap_or_default(),
                        tc["function"]["name"].as_str().unwrap_or_default(),
                    )
                    .with_arguments(arguments)
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(CompletionResponse {
        content,
        tool_calls,
    })
}

fn retry_after_header(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.base_url
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.request_body(request);
        tracing::debug!(model = %self.model, url = %url, messages = request.messages.len(), "calling LLM API");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| network_error(&e))?;

        let status = resp.status();
        let header_retry_after = retry_after_header(&resp);
        let text = resp.text().await.map_err(|e| network_error(&e))?;

        if !status.is_success() {
            tracing::warn!(status = %status, "provider API error");
            let mut err = ProviderError::from_status(status.as_u16(), &text);
            if err.kind == ProviderErrorKind::RateLimited && err.retry_after_secs.is_none() {
                err.retry_after_secs = header_retry_after;
            }
            return Err(err);
        }

        parse_completion(&text)
    }

    async fn probe(&self) -> Result<(), ProviderError> {
        let url = format!("{}/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| network_error(&e))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = resp.text().await.unwrap_or_default();
            Err(ProviderError::from_status(status.as_u16(), &text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn https_and_local_http_are_accepted() {
        assert!(validate_base_url("https://api.openai.com/v1").is_ok());
        assert!(validate_base_url("http://localhost:8080").is_ok());
        assert!(validate_base_url("http://127.0.0.1:1234").is_ok());
        assert!(validate_base_url("http://[::1]:8080").is_ok());
    }

    #[test]
    fn remote_http_and_other_schemes_are_rejected() {
        let err = validate_base_url("http://api.example.com").expect_err("remote http");
        assert!(err.contains("HTTP is not allowed"), "got: {err}");
        let err = validate_base_url("ftp://example.com").expect_err("ftp");
        assert!(err.contains("Unsupported URL scheme"), "got: {err}");
        let err = validate_base_url("not a url").expect_err("garbage");
        assert!(err.contains("Invalid base_url"), "got: {err}");
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let provider = OpenAiCompatibleProvider::new(
            "https://api.openai.com/v1/",
            "test-key",
            "gpt-4o-mini",
            Duration::from_secs(5),
        )
        .expect("provider should build");
        assert_eq!(provider.name(), "https://api.openai.com/v1");
    }

    #[test]
    fn history_is_sent_in_wire_format() {
        let provider = OpenAiCompatibleProvider::new(
            "https://api.openai.com/v1",
            "k",
            "m",
            Duration::from_secs(5),
        )
        .expect("provider should build");
        let chat_id = Uuid::now_v7();
        let request = CompletionRequest {
            messages: vec![
                Message::user(chat_id, "book a flight"),
                Message::assistant(
                    chat_id,
                    "",
                    vec![ToolCall::new("c1", "search").with_arguments(json!({"to": "OSL"}))],
                ),
                Message::synthetic_tool_response(chat_id, "c1", chrono::Utc::now()),
            ],
            max_tokens: Some(64),
        };

        let body = provider.request_body(&request);
        assert_eq!(body["model"], "m");
        assert_eq!(body["max_tokens"], 64);
        let messages = body["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["tool_calls"][0]["id"], "c1");
        assert_eq!(
            messages[1]["tool_calls"][0]["function"]["arguments"],
            r#"{"to":"OSL"}"#
        );
        assert_eq!(messages[2]["role"], "tool");
        assert_eq!(messages[2]["tool_call_id"], "c1");
        assert_eq!(messages[2]["content"], "cancelled");
    }

    #[test]
    fn completion_with_tool_calls_is_parsed() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":null,
            "tool_calls":[{"id":"call_1","type":"function",
            "function":{"name":"search","arguments":"{\"q\":\"x\"}"}}]}}]}"#;
        let response = parse_completion(body).expect("should parse");
        assert_eq!(response.content, "");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].tool_call_id, "call_1");
        assert_eq!(response.tool_calls[0].arguments, json!({"q": "x"}));
        assert!(response.validate().is_ok());
    }

    #[test]
    fn malformed_tool_arguments_fail_validation() {
        let body = r#"{"choices":[{"message":{"content":"",
            "tool_calls":[{"id":"call_1","function":{"name":"search","arguments":"{not json"}}]}}]}"#;
        let response = parse_completion(body).expect("body itself is valid JSON");
        let err = response.validate().expect_err("arguments are not an object");
        assert_eq!(err.kind, ProviderErrorKind::InvalidResponse);
    }

    #[test]
    fn missing_choices_is_an_invalid_response() {
        let err = parse_completion(r#"{"choices":[]}"#).expect_err("no choices");
        assert_eq!(err.kind, ProviderErrorKind::InvalidResponse);
        let err = parse_completion("<html>").expect_err("not json");
        assert_eq!(err.kind, ProviderErrorKind::InvalidResponse);
    }
}

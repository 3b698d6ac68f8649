use clap::Subcommand;
use serde_json::json;
use uuid::Uuid;

use crate::util::{Caller, api_request, require_operator_token};

const MODERATION_ACTIONS: [&str; 4] = ["logged", "warned", "blocked", "archived"];

#[derive(Subcommand)]
pub enum ChatCommands {
    /// Start a new chat
    Create {
        #[arg(long)]
        title: Option<String>,
    },
    /// Show a chat with its messages
    Show {
        chat_id: Uuid,
    },
    /// Send a user message and print the outcome (reply, refused, retry_later, moved, archived)
    Turn {
        chat_id: Uuid,
        /// Message text
        #[arg(long)]
        content: String,
        /// Upstream moderation verdict for this message (violation type)
        #[arg(long, requires = "moderation_action")]
        moderation_type: Option<String>,
        /// Upstream moderation action
        #[arg(long, value_parser = MODERATION_ACTIONS, requires = "moderation_type")]
        moderation_action: Option<String>,
    },
    /// Append the result of a tool call the assistant requested
    ToolResponse {
        chat_id: Uuid,
        /// Call `id` as shown in the turn reply
        #[arg(long, required_unless_present = "tool_call_id", conflicts_with = "tool_call_id")]
        call_id: Option<Uuid>,
        /// Provider correlation id of the call
        #[arg(long)]
        tool_call_id: Option<String>,
        #[arg(long)]
        content: String,
    },
    /// Validate the chat and heal it if needed
    Integrity {
        chat_id: Uuid,
    },
    /// Force a repair regardless of state (operator)
    Repair {
        chat_id: Uuid,
    },
}

pub fn turn_body(content: &str, moderation: Option<(&str, &str)>) -> serde_json::Value {
    let mut body = json!({ "content": content });
    if let Some((violation_type, action)) = moderation {
        body["moderation"] = json!({ "violation_type": violation_type, "action": action });
    }
    body
}

pub fn tool_response_body(
    call_id: Option<Uuid>,
    tool_call_id: Option<&str>,
    content: &str,
) -> serde_json::Value {
    let mut body = json!({ "content": content });
    if let Some(call_id) = call_id {
        body["call_id"] = json!(call_id);
    }
    if let Some(tool_call_id) = tool_call_id {
        body["tool_call_id"] = json!(tool_call_id);
    }
    body
}

pub async fn run(
    api_url: &str,
    caller: impl FnOnce() -> Caller,
    token: Option<&str>,
    include: bool,
    command: ChatCommands,
) -> i32 {
    let (method, path, body) = match command {
        ChatCommands::Create { title } => (
            reqwest::Method::POST,
            "/v1/chats".to_string(),
            Some(json!({ "title": title })),
        ),
        ChatCommands::Show { chat_id } => {
            (reqwest::Method::GET, format!("/v1/chats/{chat_id}"), None)
        }
        ChatCommands::Turn {
            chat_id,
            content,
            moderation_type,
            moderation_action,
        } => {
            let moderation = moderation_type.as_deref().zip(moderation_action.as_deref());
            (
                reqwest::Method::POST,
                format!("/v1/chats/{chat_id}/turns"),
                Some(turn_body(&content, moderation)),
            )
        }
        ChatCommands::ToolResponse {
            chat_id,
            call_id,
            tool_call_id,
            content,
        } => (
            reqwest::Method::POST,
            format!("/v1/chats/{chat_id}/tool-responses"),
            Some(tool_response_body(call_id, tool_call_id.as_deref(), &content)),
        ),
        ChatCommands::Integrity { chat_id } => (
            reqwest::Method::POST,
            format!("/v1/chats/{chat_id}/integrity"),
            None,
        ),
        ChatCommands::Repair { chat_id } => {
            let token = require_operator_token(token);
            return api_request(
                api_url,
                reqwest::Method::POST,
                &format!("/v1/chats/{chat_id}/repair"),
                Some(token),
                None,
                &[],
                &[],
                include,
            )
            .await;
        }
    };

    let headers = caller().headers();
    api_request(api_url, method, &path, None, body, &[], &headers, include).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_body_omits_moderation_when_absent() {
        let body = turn_body("hello", None);
        assert_eq!(body, json!({ "content": "hello" }));
    }

    #[test]
    fn turn_body_carries_verdict() {
        let body = turn_body("hello", Some(("spam", "blocked")));
        assert_eq!(body["moderation"]["action"], "blocked");
        assert_eq!(body["moderation"]["violation_type"], "spam");
    }

    #[test]
    fn tool_response_body_prefers_the_call_id() {
        let call_id = Uuid::from_u128(9);
        let body = tool_response_body(Some(call_id), None, "sunny");
        assert_eq!(body, json!({ "call_id": call_id, "content": "sunny" }));
    }
}

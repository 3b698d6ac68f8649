//! Structural integrity checks over the message / tool-call graph of a chat.
//!
//! A chat is stable when:
//! - every tool message carries a non-empty `tool_call_id`,
//! - that id answers a tool call issued earlier in the chat,
//! - every tool call is answered before the turn that issued it closes,
//! - no tool call is answered twice and no `tool_call_id` is issued twice.
//!
//! Calls still pending in the last, open turn are not violations.

use std::collections::HashMap;

use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::chat::{Chat, Message, MessageRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    MissingToolCallId,
    UnknownToolCall,
    UnansweredToolCall,
    DuplicateToolResponse,
    DuplicateToolCall,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingToolCallId => "missing_tool_call_id",
            Self::UnknownToolCall => "unknown_tool_call",
            Self::UnansweredToolCall => "unanswered_tool_call",
            Self::DuplicateToolResponse => "duplicate_tool_response",
            Self::DuplicateToolCall => "duplicate_tool_call",
        }
    }

    /// Kinds that Trim or Synthesize can fix without forking.
    pub fn is_repairable_in_place(self) -> bool {
        matches!(
            self,
            Self::MissingToolCallId | Self::UnknownToolCall | Self::UnansweredToolCall
        )
    }
}

/// A single broken invariant, with the ids needed to repair it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Tool message without a correlation id.
    MissingToolCallId { message_id: Uuid },
    /// Tool message answering a call that was never issued before it.
    UnknownToolCall {
        message_id: Uuid,
        tool_call_id: String,
    },
    /// Call left without a response when its turn closed. `message_id` is the
    /// issuing assistant message.
    UnansweredToolCall {
        message_id: Uuid,
        tool_call_id: String,
    },
    /// Second response to an already answered call.
    DuplicateToolResponse {
        message_id: Uuid,
        first_response_id: Uuid,
        tool_call_id: String,
    },
    /// `tool_call_id` issued by more than one tool call in the chat.
    DuplicateToolCall {
        message_id: Uuid,
        tool_call_id: String,
    },
}

impl Violation {
    pub fn kind(&self) -> ViolationKind {
        match self {
            Self::MissingToolCallId { .. } => ViolationKind::MissingToolCallId,
            Self::UnknownToolCall { .. } => ViolationKind::UnknownToolCall,
            Self::UnansweredToolCall { .. } => ViolationKind::UnansweredToolCall,
            Self::DuplicateToolResponse { .. } => ViolationKind::DuplicateToolResponse,
            Self::DuplicateToolCall { .. } => ViolationKind::DuplicateToolCall,
        }
    }

    pub fn message_id(&self) -> Uuid {
        match self {
            Self::MissingToolCallId { message_id }
            | Self::UnknownToolCall { message_id, .. }
            | Self::UnansweredToolCall { message_id, .. }
            | Self::DuplicateToolResponse { message_id, .. }
            | Self::DuplicateToolCall { message_id, .. } => *message_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Stable,
    Invalid { violations: Vec<Violation> },
}

impl Verdict {
    pub fn is_stable(&self) -> bool {
        matches!(self, Verdict::Stable)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Verdict::Stable => &[],
            Verdict::Invalid { violations } => violations,
        }
    }

    pub fn into_violations(self) -> Vec<Violation> {
        match self {
            Verdict::Stable => Vec::new(),
            Verdict::Invalid { violations } => violations,
        }
    }
}

#[derive(Debug)]
struct IssuedCall {
    message_id: Uuid,
    turn: usize,
    answered_by: Option<Uuid>,
}

/// Incremental single-pass scan. Feed messages in chat order with [`push`].
///
/// [`push`]: IntegrityScan::push
#[derive(Debug, Default)]
pub struct IntegrityScan<'a> {
    issued: HashMap<&'a str, IssuedCall>,
    open_turn: Vec<&'a str>,
    turn: usize,
    pending: usize,
    violations: Vec<Violation>,
    scanned: usize,
    quiescent_len: usize,
}

impl<'a> IntegrityScan<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: &'a Message) {
        match message.role {
            MessageRole::User => self.close_turn(),
            MessageRole::Assistant => {
                for call in &message.tool_calls {
                    let key = call.tool_call_id.as_str();
                    if self.issued.contains_key(key) {
                        self.violations.push(Violation::DuplicateToolCall {
                            message_id: message.id,
                            tool_call_id: call.tool_call_id.clone(),
                        });
                        continue;
                    }
                    self.issued.insert(
                        key,
                        IssuedCall {
                            message_id: message.id,
                            turn: self.turn,
                            answered_by: None,
                        },
                    );
                    self.open_turn.push(key);
                    self.pending += 1;
                }
            }
            MessageRole::Tool => self.record_response(message),
        }

        self.scanned += 1;
        if self.violations.is_empty() && self.pending == 0 {
            self.quiescent_len = self.scanned;
        }
    }

    fn record_response(&mut self, message: &'a Message) {
        let Some(tool_call_id) = message
            .tool_call_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        else {
            self.violations.push(Violation::MissingToolCallId {
                message_id: message.id,
            });
            return;
        };

        match self.issued.get_mut(tool_call_id) {
            None => self.violations.push(Violation::UnknownToolCall {
                message_id: message.id,
                tool_call_id: tool_call_id.to_string(),
            }),
            Some(call) => match call.answered_by {
                Some(first_response_id) => {
                    self.violations.push(Violation::DuplicateToolResponse {
                        message_id: message.id,
                        first_response_id,
                        tool_call_id: tool_call_id.to_string(),
                    })
                }
                None => {
                    call.answered_by = Some(message.id);
                    if call.turn == self.turn {
                        self.pending -= 1;
                    }
                }
            },
        }
    }

    fn close_turn(&mut self) {
        for key in self.open_turn.drain(..) {
            if let Some(call) = self.issued.get(key)
                && call.answered_by.is_none()
            {
                self.violations.push(Violation::UnansweredToolCall {
                    message_id: call.message_id,
                    tool_call_id: key.to_string(),
                });
            }
        }
        self.turn += 1;
        self.pending = 0;
    }

    /// Length of the longest prefix seen so far with no violation and no
    /// pending tool call.
    pub fn quiescent_len(&self) -> usize {
        self.quiescent_len
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn finish(self) -> Verdict {
        if self.violations.is_empty() {
            Verdict::Stable
        } else {
            Verdict::Invalid {
                violations: self.violations,
            }
        }
    }
}

/// Validate a whole chat. Pure and idempotent.
pub fn validate(chat: &Chat) -> Verdict {
    validate_messages(&chat.messages)
}

pub fn validate_messages(messages: &[Message]) -> Verdict {
    let mut scan = IntegrityScan::new();
    for message in messages {
        scan.push(message);
    }
    scan.finish()
}

/// Length of the longest prefix that is stable and has no pending tool calls.
pub fn stable_prefix_len(messages: &[Message]) -> usize {
    let mut scan = IntegrityScan::new();
    for message in messages {
        scan.push(message);
        if !scan.violations().is_empty() {
            break;
        }
    }
    scan.quiescent_len()
}

/// Tool messages that can never be matched to a call.
pub fn orphaned_tool_messages(messages: &[Message]) -> usize {
    validate_messages(messages)
        .violations()
        .iter()
        .filter(|v| {
            matches!(
                v.kind(),
                ViolationKind::MissingToolCallId | ViolationKind::UnknownToolCall
            )
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ToolCall;

    fn chat_id() -> Uuid {
        Uuid::now_v7()
    }

    #[test]
    fn pending_call_in_open_turn_is_stable() {
        let id = chat_id();
        let messages = vec![
            Message::user(id, "book a flight"),
            Message::assistant(id, "", vec![ToolCall::new("c1", "book_flight")]),
        ];
        assert_eq!(validate_messages(&messages), Verdict::Stable);
    }

    #[test]
    fn closing_turn_with_pending_call_is_unanswered() {
        let id = chat_id();
        let assistant = Message::assistant(id, "", vec![ToolCall::new("c1", "book_flight")]);
        let assistant_id = assistant.id;
        let messages = vec![
            Message::user(id, "book a flight"),
            assistant,
            Message::user(id, "never mind"),
        ];
        assert_eq!(
            validate_messages(&messages),
            Verdict::Invalid {
                violations: vec![Violation::UnansweredToolCall {
                    message_id: assistant_id,
                    tool_call_id: "c1".to_string(),
                }]
            }
        );
    }

    #[test]
    fn responses_within_a_turn_are_order_independent() {
        let id = chat_id();
        let messages = vec![
            Message::user(id, "compare prices"),
            Message::assistant(
                id,
                "",
                vec![ToolCall::new("a", "price"), ToolCall::new("b", "price")],
            ),
            Message::tool(id, "b", "12"),
            Message::tool(id, "a", "10"),
            Message::assistant(id, "a is cheaper", vec![]),
            Message::user(id, "thanks"),
        ];
        assert!(validate_messages(&messages).is_stable());
    }

    #[test]
    fn detects_missing_and_unknown_tool_call_ids() {
        let id = chat_id();
        let mut blank = Message::tool(id, "", "x");
        blank.tool_call_id = None;
        let unknown = Message::tool(id, "ghost", "y");
        let messages = vec![Message::user(id, "hi"), blank.clone(), unknown.clone()];

        let violations = validate_messages(&messages).into_violations();
        assert_eq!(violations.len(), 2);
        assert_eq!(
            violations[0],
            Violation::MissingToolCallId {
                message_id: blank.id
            }
        );
        assert_eq!(violations[1].kind(), ViolationKind::UnknownToolCall);
        assert_eq!(violations[1].message_id(), unknown.id);
        assert_eq!(orphaned_tool_messages(&messages), 2);
    }

    #[test]
    fn response_before_call_is_unknown() {
        let id = chat_id();
        let messages = vec![
            Message::user(id, "hi"),
            Message::tool(id, "c1", "early"),
            Message::assistant(id, "", vec![ToolCall::new("c1", "lookup")]),
        ];
        let violations = validate_messages(&messages).into_violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind(), ViolationKind::UnknownToolCall);
    }

    #[test]
    fn detects_duplicate_responses_and_calls() {
        let id = chat_id();
        let first = Message::tool(id, "c1", "one");
        let second = Message::tool(id, "c1", "two");
        let messages = vec![
            Message::user(id, "go"),
            Message::assistant(id, "", vec![ToolCall::new("c1", "run")]),
            first.clone(),
            second.clone(),
            Message::assistant(id, "", vec![ToolCall::new("c1", "run")]),
        ];
        let violations = validate_messages(&messages).into_violations();
        assert_eq!(
            violations[0],
            Violation::DuplicateToolResponse {
                message_id: second.id,
                first_response_id: first.id,
                tool_call_id: "c1".to_string(),
            }
        );
        assert_eq!(violations[1].kind(), ViolationKind::DuplicateToolCall);
        assert!(!ViolationKind::DuplicateToolResponse.is_repairable_in_place());
    }

    #[test]
    fn validate_is_idempotent() {
        let id = chat_id();
        let messages = vec![
            Message::user(id, "a"),
            Message::assistant(id, "", vec![ToolCall::new("c1", "f")]),
            Message::user(id, "b"),
            Message::tool(id, "zz", "?"),
        ];
        let before = messages.clone();
        let first = validate_messages(&messages);
        let second = validate_messages(&messages);
        assert_eq!(first, second);
        assert_eq!(messages, before);
    }

    #[test]
    fn stable_prefix_stops_before_pending_calls_and_violations() {
        let id = chat_id();
        let messages = vec![
            Message::user(id, "one"),
            Message::assistant(id, "done", vec![]),
            Message::user(id, "two"),
            Message::assistant(id, "", vec![ToolCall::new("c1", "f")]),
            Message::user(id, "three"),
        ];
        assert_eq!(stable_prefix_len(&messages), 3);
        assert_eq!(stable_prefix_len(&messages[..2]), 2);
        assert_eq!(stable_prefix_len(&[]), 0);
    }
}

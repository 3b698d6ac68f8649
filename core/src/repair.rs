//! Ordered chain of pure in-place repair strategies.
//!
//! Each strategy looks at the current messages and the outstanding violations
//! and either returns a rewritten message list or declines. The chain
//! re-validates after every rewrite and stops as soon as the chat is stable.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::chat::{Message, MessageRole};
use crate::validator::{Verdict, Violation, validate_messages};

/// Something the healer did to a chat. Exposes message ids only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    TrimmedToolResponse { message_id: Uuid },
    SynthesizedToolResponse {
        message_id: Uuid,
        assistant_message_id: Uuid,
    },
    Forked { recovery_chat_id: Uuid },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    Healed {
        messages: Vec<Message>,
        actions: Vec<RepairAction>,
    },
    Unchanged,
}

pub trait RepairStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, chat_id: Uuid, messages: &[Message], violations: &[Violation]) -> StrategyOutcome;
}

/// Drops tool messages that can never be matched to a call (no id, or an id
/// that was never issued before them).
#[derive(Debug, Default, Clone, Copy)]
pub struct TrimUnmatchedResponses;

impl RepairStrategy for TrimUnmatchedResponses {
    fn name(&self) -> &'static str {
        "trim"
    }

    fn apply(&self, _chat_id: Uuid, messages: &[Message], violations: &[Violation]) -> StrategyOutcome {
        let doomed: HashSet<Uuid> = violations
            .iter()
            .filter_map(|v| match v {
                Violation::MissingToolCallId { message_id }
                | Violation::UnknownToolCall { message_id, .. } => Some(*message_id),
                _ => None,
            })
            .collect();
        if doomed.is_empty() {
            return StrategyOutcome::Unchanged;
        }

        let mut actions = Vec::with_capacity(doomed.len());
        let kept = messages
            .iter()
            .filter(|m| {
                let drop = m.role == MessageRole::Tool && doomed.contains(&m.id);
                if drop {
                    actions.push(RepairAction::TrimmedToolResponse { message_id: m.id });
                }
                !drop
            })
            .cloned()
            .collect();

        if actions.is_empty() {
            return StrategyOutcome::Unchanged;
        }
        StrategyOutcome::Healed {
            messages: kept,
            actions,
        }
    }
}

/// Inserts one sentinel tool response per call left unanswered when its turn
/// closed, right before the user message that closed the turn.
#[derive(Debug, Default, Clone, Copy)]
pub struct SynthesizeMissingResponses;

impl RepairStrategy for SynthesizeMissingResponses {
    fn name(&self) -> &'static str {
        "synthesize"
    }

    fn apply(&self, chat_id: Uuid, messages: &[Message], violations: &[Violation]) -> StrategyOutcome {
        let position: HashMap<Uuid, usize> = messages
            .iter()
            .enumerate()
            .map(|(idx, m)| (m.id, idx))
            .collect();

        // closing user message index -> calls to answer there, in issue order
        let mut inserts: HashMap<usize, Vec<(Uuid, &str)>> = HashMap::new();
        for violation in violations {
            let Violation::UnansweredToolCall {
                message_id,
                tool_call_id,
            } = violation
            else {
                continue;
            };
            let Some(&issued_at) = position.get(message_id) else {
                continue;
            };
            let closing = messages[issued_at + 1..]
                .iter()
                .position(|m| m.role == MessageRole::User)
                .map(|offset| issued_at + 1 + offset)
                .unwrap_or(messages.len());
            inserts
                .entry(closing)
                .or_default()
                .push((*message_id, tool_call_id.as_str()));
        }
        if inserts.is_empty() {
            return StrategyOutcome::Unchanged;
        }

        let mut actions = Vec::new();
        let mut healed = Vec::with_capacity(messages.len() + violations.len());
        for idx in 0..=messages.len() {
            if let Some(calls) = inserts.remove(&idx) {
                let at = messages
                    .get(idx.saturating_sub(1))
                    .map(|m| m.created_at)
                    .unwrap_or_else(chrono::Utc::now);
                for (assistant_message_id, tool_call_id) in calls {
                    let sentinel = Message::synthetic_tool_response(chat_id, tool_call_id, at);
                    actions.push(RepairAction::SynthesizedToolResponse {
                        message_id: sentinel.id,
                        assistant_message_id,
                    });
                    healed.push(sentinel);
                }
            }
            if let Some(message) = messages.get(idx) {
                healed.push(message.clone());
            }
        }

        StrategyOutcome::Healed {
            messages: healed,
            actions,
        }
    }
}

/// Result of running the chain to completion.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub messages: Vec<Message>,
    pub actions: Vec<RepairAction>,
    pub verdict: Verdict,
}

impl ChainResult {
    pub fn is_stable(&self) -> bool {
        self.verdict.is_stable()
    }
}

pub struct RepairChain {
    strategies: Vec<Box<dyn RepairStrategy>>,
}

impl Default for RepairChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(TrimUnmatchedResponses),
            Box::new(SynthesizeMissingResponses),
        ])
    }
}

impl RepairChain {
    pub fn new(strategies: Vec<Box<dyn RepairStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn run(&self, chat_id: Uuid, messages: &[Message], violations: Vec<Violation>) -> ChainResult {
        let mut current = messages.to_vec();
        let mut actions = Vec::new();
        let mut verdict = if violations.is_empty() {
            Verdict::Stable
        } else {
            Verdict::Invalid { violations }
        };

        for strategy in &self.strategies {
            if verdict.is_stable() {
                break;
            }
            match strategy.apply(chat_id, &current, verdict.violations()) {
                StrategyOutcome::Healed {
                    messages,
                    actions: applied,
                } => {
                    tracing::debug!(
                        chat_id = %chat_id,
                        strategy = strategy.name(),
                        actions = applied.len(),
                        "repair strategy applied"
                    );
                    current = messages;
                    actions.extend(applied);
                    verdict = validate_messages(&current);
                }
                StrategyOutcome::Unchanged => {}
            }
        }

        ChainResult {
            messages: current,
            actions,
            verdict,
        }
    }
}

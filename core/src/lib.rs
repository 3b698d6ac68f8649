//! Conversation integrity and resilient recovery for LLM-backed chats.

pub mod auth;
pub mod breaker;
pub mod chat;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod healer;
pub mod memory;
pub mod moderation;
pub mod provider;
pub mod recovery;
pub mod repair;
pub mod resilience;
pub mod stats;
pub mod store;
pub mod sweep;
pub mod turn;
pub mod validator;

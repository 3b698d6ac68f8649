pub mod admin;
pub mod chats;
pub mod health;
pub mod moderation;
pub mod provider;

//! Shared types, error definitions, and trait seams used across all wegate
//! crates.

pub mod backend;
pub mod conversation;
pub mod error;

pub use {
    backend::{AiBackend, ChatReply},
    conversation::{ConversationKey, ConversationStore, MemoryConversationStore},
    error::{Error, Result},
};

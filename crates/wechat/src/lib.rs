//! WeChat Official Account channel: message normalization, per-kind
//! handling, and the retry/timeout coordination between the platform's
//! 5-second webhook deadline and an arbitrarily slow AI backend.
//!
//! The platform redelivers a message up to three times when a webhook call
//! fails or times out. [`Coordinator::handle_delivery`] correlates those
//! redeliveries, runs one backend computation per message, and decides each
//! attempt's synchronous reply; when the synchronous channel runs out it
//! falls back to the customer-service message API or an interactive
//! keep-waiting exchange.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod custom_message;
pub mod error;
pub mod format;
pub mod handlers;
pub mod message;
pub mod parse;
pub mod tracker;

pub use {
    backend::HttpBackend,
    config::AccountConfig,
    coordinator::{CLEAR_HISTORY_COMMAND, CONTINUE_TOKEN, Coordinator, SyncReply},
    custom_message::CustomMessageSender,
    error::{Error, Result},
    format::text_reply_xml,
    message::{MessageKind, WechatMessage},
    parse::parse_message,
    tracker::{MessageTracker, Status},
};

//! Per-kind handling strategies.
//!
//! `plan` is a pure lookup from message kind to what should happen; the
//! async `dispatch` executes the plan exactly once, from the coordinator's
//! spawned computation.

use {
    serde_json::{Value, json},
    tracing::{info, warn},
};

use wegate_common::{AiBackend, ConversationStore};

use crate::{
    config::AccountConfig,
    error::{Error, Result},
    message::{MessageKind, WechatMessage},
};

const UNSUPPORTED_REPLY: &str = "currently only text messages are supported";
const WELCOME_REPLY: &str = "欢迎关注！直接发送消息即可开始对话。";
const VOICE_NOT_RECOGNIZED_REPLY: &str =
    "您发送了一条语音消息，但我无法识别其中的内容。请尝试发送文字消息。";
const VOICE_REPLY_PREFIX: &str = "您的语音内容：\n";
const NO_REPLY_FALLBACK: &str = "AI did not give a reply";

/// What a message kind wants done.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchPlan {
    /// Send a query to the backend AI.
    Backend {
        query: String,
        inputs: Value,
        /// Prepended to the backend's answer in the reply.
        reply_prefix: Option<String>,
    },
    /// Reply without involving the backend.
    Canned(String),
    /// Clear the conversation context, then confirm.
    ClearContext,
}

/// Map a message to its handling strategy. Pure; adding a kind means adding
/// a match arm.
#[must_use]
pub fn plan(message: &WechatMessage) -> DispatchPlan {
    match &message.kind {
        MessageKind::Text { content } => DispatchPlan::Backend {
            query: content.clone(),
            inputs: base_inputs(message),
            reply_prefix: None,
        },
        MessageKind::Image { pic_url, .. } => {
            let mut inputs = base_inputs(message);
            inputs["picUrl"] = json!(pic_url);
            DispatchPlan::Backend {
                query: format!("[image] URL: {pic_url}"),
                inputs,
                reply_prefix: None,
            }
        },
        MessageKind::Voice {
            recognition: Some(recognition),
            ..
        } => DispatchPlan::Backend {
            query: recognition.clone(),
            inputs: base_inputs(message),
            reply_prefix: Some(VOICE_REPLY_PREFIX.into()),
        },
        MessageKind::Voice {
            recognition: None, ..
        } => DispatchPlan::Canned(VOICE_NOT_RECOGNIZED_REPLY.into()),
        MessageKind::Link {
            title,
            description,
            url,
        } => {
            let mut inputs = base_inputs(message);
            inputs["url"] = json!(url);
            inputs["title"] = json!(title);
            inputs["description"] = json!(description);
            DispatchPlan::Backend {
                query: format!(
                    "[link] title: {title}\ndescription: {}\nURL: {url}",
                    description.as_deref().unwrap_or("no description"),
                ),
                inputs,
                reply_prefix: None,
            }
        },
        MessageKind::Event {
            event, event_key, ..
        } => plan_event(event, event_key.as_deref()),
        MessageKind::Unsupported { raw_kind } => {
            warn!(kind = %raw_kind, "unsupported message type");
            DispatchPlan::Canned(UNSUPPORTED_REPLY.into())
        },
    }
}

/// Events are answered locally; none of them warrants a backend call.
fn plan_event(event: &str, event_key: Option<&str>) -> DispatchPlan {
    match event {
        "subscribe" => DispatchPlan::Canned(WELCOME_REPLY.into()),
        "unsubscribe" | "VIEW" => DispatchPlan::Canned(String::new()),
        "CLICK" => match event_key {
            Some("CLEAR_CONTEXT") => DispatchPlan::ClearContext,
            key => DispatchPlan::Canned(format!(
                "you clicked the custom menu: {}",
                key.unwrap_or_default()
            )),
        },
        other => {
            warn!(event = other, "unknown event type, ignoring");
            DispatchPlan::Canned(String::new())
        },
    }
}

/// Execute the message's plan and produce the reply text.
///
/// Backend errors propagate so the coordinator can record the entry as
/// failed; canned plans cannot fail.
pub async fn dispatch(
    message: &WechatMessage,
    backend: &dyn AiBackend,
    store: &dyn ConversationStore,
    config: &AccountConfig,
) -> Result<String> {
    let key = message.conversation_key(&config.app_id);
    match plan(message) {
        DispatchPlan::Canned(reply) => Ok(reply),
        DispatchPlan::ClearContext => {
            let cleared = store.clear(&key);
            info!(user = %key.sender, cleared, "menu-triggered context clear");
            Ok(if cleared {
                "conversation context has been cleared, you can start a new conversation."
            } else {
                "failed to clear conversation context, please try again later."
            }
            .into())
        },
        DispatchPlan::Backend {
            query,
            inputs,
            reply_prefix,
        } => {
            let conversation_id = store.get(&key);
            info!(
                kind = message.kind_name(),
                has_conversation = conversation_id.is_some(),
                "invoking backend"
            );
            let reply = backend
                .chat(&query, conversation_id.as_deref(), inputs)
                .await
                .map_err(Error::backend)?;

            if let Some(new_id) = &reply.conversation_id
                && conversation_id.as_deref() != Some(new_id.as_str())
            {
                store.set(&key, new_id.clone());
            }

            let answer = if reply.answer.is_empty() {
                NO_REPLY_FALLBACK.to_string()
            } else {
                reply.answer
            };
            Ok(match reply_prefix {
                Some(prefix) => format!("{prefix}{answer}"),
                None => answer,
            })
        },
    }
}

fn base_inputs(message: &WechatMessage) -> Value {
    json!({
        "msgId": message.msg_id,
        "msgType": message.kind_name(),
        "fromUser": message.sender,
        "createTime": message.created_at,
    })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        std::sync::atomic::{AtomicUsize, Ordering},
        wegate_common::{ChatReply, ConversationKey, MemoryConversationStore},
    };

    struct RecordingBackend {
        calls: AtomicUsize,
        reply: ChatReply,
    }

    impl RecordingBackend {
        fn new(answer: &str, conversation_id: Option<&str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reply: ChatReply {
                    answer: answer.into(),
                    conversation_id: conversation_id.map(str::to_string),
                },
            }
        }
    }

    #[async_trait]
    impl AiBackend for RecordingBackend {
        async fn chat(
            &self,
            _query: &str,
            _conversation_id: Option<&str>,
            _inputs: Value,
        ) -> wegate_common::Result<ChatReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }
    }

    fn message(kind: MessageKind) -> WechatMessage {
        WechatMessage {
            msg_id: Some("1".into()),
            sender: "oUser".into(),
            recipient: "gh".into(),
            created_at: "1700000000".into(),
            kind,
        }
    }

    fn config() -> AccountConfig {
        AccountConfig {
            app_id: "wx_app".into(),
            ..Default::default()
        }
    }

    #[test]
    fn text_plans_a_backend_call() {
        let msg = message(MessageKind::Text {
            content: "hi".into(),
        });
        match plan(&msg) {
            DispatchPlan::Backend { query, inputs, .. } => {
                assert_eq!(query, "hi");
                assert_eq!(inputs["fromUser"], "oUser");
                assert_eq!(inputs["msgType"], "text");
            },
            other => panic!("unexpected plan: {other:?}"),
        }
    }

    #[test]
    fn voice_without_recognition_is_canned() {
        let msg = message(MessageKind::Voice {
            media_id: "m".into(),
            format: Some("amr".into()),
            recognition: None,
        });
        assert_eq!(
            plan(&msg),
            DispatchPlan::Canned(VOICE_NOT_RECOGNIZED_REPLY.into())
        );
    }

    #[test]
    fn events_never_plan_backend_calls() {
        for (event, key) in [
            ("subscribe", None),
            ("unsubscribe", None),
            ("CLICK", Some("CLEAR_CONTEXT")),
            ("CLICK", Some("MENU_A")),
            ("VIEW", Some("https://example.com")),
            ("SCAN", None),
        ] {
            let msg = message(MessageKind::Event {
                event: event.into(),
                event_key: key.map(str::to_string),
                ticket: None,
            });
            assert!(
                !matches!(plan(&msg), DispatchPlan::Backend { .. }),
                "event {event} must not reach the backend"
            );
        }
    }

    #[tokio::test]
    async fn dispatch_persists_new_conversation_id() {
        let backend = RecordingBackend::new("ok", Some("conv-7"));
        let store = MemoryConversationStore::new();
        let cfg = config();
        let msg = message(MessageKind::Text {
            content: "hi".into(),
        });

        let reply = dispatch(&msg, &backend, &store, &cfg).await.unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(
            store.get(&ConversationKey::new("oUser", "wx_app")),
            Some("conv-7".into())
        );
    }

    #[tokio::test]
    async fn voice_reply_carries_prefix() {
        let backend = RecordingBackend::new("answer", None);
        let store = MemoryConversationStore::new();
        let msg = message(MessageKind::Voice {
            media_id: "m".into(),
            format: None,
            recognition: Some("天气如何".into()),
        });
        let reply = dispatch(&msg, &backend, &store, &config()).await.unwrap();
        assert_eq!(reply, format!("{VOICE_REPLY_PREFIX}answer"));
    }

    #[tokio::test]
    async fn clear_context_click_skips_backend() {
        let backend = RecordingBackend::new("ok", None);
        let store = MemoryConversationStore::new();
        let cfg = config();
        let key = ConversationKey::new("oUser", "wx_app");
        store.set(&key, "conv-1".into());

        let msg = message(MessageKind::Event {
            event: "CLICK".into(),
            event_key: Some("CLEAR_CONTEXT".into()),
            ticket: None,
        });
        let reply = dispatch(&msg, &backend, &store, &cfg).await.unwrap();
        assert!(reply.contains("cleared"));
        assert_eq!(store.get(&key), None);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_backend_answer_gets_fallback() {
        let backend = RecordingBackend::new("", None);
        let store = MemoryConversationStore::new();
        let msg = message(MessageKind::Text {
            content: "hi".into(),
        });
        let reply = dispatch(&msg, &backend, &store, &config()).await.unwrap();
        assert_eq!(reply, NO_REPLY_FALLBACK);
    }
}

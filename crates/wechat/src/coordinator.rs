//! Retry/timeout coordination between webhook deliveries and the backend.
//!
//! Every delivery attempt funnels through [`Coordinator::handle_delivery`],
//! which correlates redeliveries of the same message id, launches at most
//! one backend computation per id, and decides the synchronous reply for
//! the attempt at hand. When the third and final attempt still has no
//! result, the answer either moves to the out-of-band customer-service
//! channel or the conversation enters an interactive keep-waiting exchange.

use std::{sync::Arc, time::Duration};

use tracing::{debug, error, info, warn};

use wegate_common::{AiBackend, ConversationKey, ConversationStore};

use crate::{
    config::AccountConfig,
    custom_message::CustomMessageSender,
    handlers,
    message::WechatMessage,
    tracker::{MessageTracker, TrackerEntry},
};

/// Reserved text command that clears the stored conversation handle.
pub const CLEAR_HISTORY_COMMAND: &str = "/clear";
/// Reserved reply that extends interactive waiting.
pub const CONTINUE_TOKEN: &str = "1";

/// The platform delivers a failing message this many times in total.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;
/// Extra slack the out-of-band waiter grants beyond the computation cap.
const OUT_OF_BAND_GRACE: Duration = Duration::from_secs(30);

const EMPTY_RESULT_FALLBACK: &str = "抱歉，处理结果为空";
const GIVE_UP_MESSAGE: &str = "处理时间较长，请稍后重新询问";
const LIFETIME_EXCEEDED_MESSAGE: &str = "processing timed out, please try again";

/// Synchronous decision for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncReply {
    /// The final answer. Deliver as the 200 body; the message is done.
    Final(String),
    /// Not the answer, but keeps the user informed. 200 body.
    Interim(String),
    /// Ask the platform to redeliver by failing this request.
    RetryRequested,
    /// Another path already delivered the answer; answer an empty 200.
    AlreadyDelivered,
}

pub struct Coordinator {
    tracker: Arc<MessageTracker>,
    backend: Arc<dyn AiBackend>,
    store: Arc<dyn ConversationStore>,
    sender: Option<Arc<CustomMessageSender>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(
        tracker: Arc<MessageTracker>,
        backend: Arc<dyn AiBackend>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            tracker,
            backend,
            store,
            sender: None,
        }
    }

    /// Attach the out-of-band sender used when custom messages are enabled.
    #[must_use]
    pub fn with_custom_message_sender(mut self, sender: Arc<CustomMessageSender>) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Decide the synchronous reply for one delivery attempt.
    pub async fn handle_delivery(
        &self,
        message: &WechatMessage,
        config: &AccountConfig,
    ) -> SyncReply {
        let key = message.conversation_key(&config.app_id);

        // The clear command never reaches dispatch.
        if message.text_content() == Some(CLEAR_HISTORY_COMMAND) {
            return SyncReply::Final(self.clear_history(&key));
        }

        // A continuation token re-enters the wait for the conversation's
        // original computation instead of starting anything new.
        if !config.enable_custom_message
            && message.text_content() == Some(CONTINUE_TOKEN)
            && self.tracker.waiting(&key).is_some()
        {
            return self.handle_continue(message, &key, config).await;
        }

        let Some(tracking_id) = message.tracking_id() else {
            return self.handle_untracked(message, config).await;
        };

        let (entry, attempt) = self.tracker.track(&tracking_id);
        if attempt == 0 {
            self.spawn_computation(Arc::clone(&entry), message.clone(), config.clone());
        }

        if entry.wait_completed(config.wait_budget(attempt)).await {
            return self.deliver_final(&entry);
        }

        debug!(%tracking_id, attempt, "computation still pending after wait budget");
        if attempt + 1 < MAX_DELIVERY_ATTEMPTS {
            return SyncReply::RetryRequested;
        }

        // Last allowed attempt: the synchronous channel is exhausted.
        if config.enable_custom_message {
            if let Some(sender) = &self.sender {
                info!(%tracking_id, "synchronous channel exhausted, arming out-of-band delivery");
                self.spawn_out_of_band(
                    Arc::clone(sender),
                    entry,
                    message.sender.clone(),
                    tracking_id,
                    config.computation_lifetime() + OUT_OF_BAND_GRACE,
                );
                return SyncReply::Interim(config.timeout_message.clone());
            }
            warn!("custom messages enabled but no sender configured; falling back to waiting");
        }

        info!(%tracking_id, "synchronous channel exhausted, offering interactive waiting");
        self.tracker.set_waiting(key, entry, config.max_continue_count);
        SyncReply::Interim(config.continue_waiting_message.clone())
    }

    /// Handle a continuation-token delivery. The token message is itself
    /// redelivered by the platform on failure, so it rides the same
    /// fail/fail/decide ladder as a regular message; only its final attempt
    /// consumes a keep-waiting chance.
    async fn handle_continue(
        &self,
        message: &WechatMessage,
        key: &ConversationKey,
        config: &AccountConfig,
    ) -> SyncReply {
        let Some(waiting) = self.tracker.waiting(key) else {
            return SyncReply::RetryRequested;
        };
        let attempt = match message.tracking_id() {
            Some(id) => self.tracker.track(&id).1,
            None => 0,
        };

        let reply = self
            .continue_decision(&waiting.entry, key, attempt, config)
            .await;
        if reply != SyncReply::RetryRequested
            && let Some(id) = message.tracking_id()
        {
            // The token message's own tracker entry has served its purpose.
            self.tracker.evict(&id);
        }
        reply
    }

    async fn continue_decision(
        &self,
        entry: &Arc<TrackerEntry>,
        key: &ConversationKey,
        attempt: u32,
        config: &AccountConfig,
    ) -> SyncReply {
        if entry.wait_completed(config.wait_budget(attempt)).await {
            info!("computation finished during interactive waiting");
            self.tracker.clear_waiting(key);
            return self.deliver_final(entry);
        }

        if attempt + 1 < MAX_DELIVERY_ATTEMPTS {
            return SyncReply::RetryRequested;
        }

        // Final attempt of this token message: spend one waiting chance.
        let Some(count) = self.tracker.bump_continue(key) else {
            warn!("interactive waiting state lost mid-continue");
            return SyncReply::Interim(GIVE_UP_MESSAGE.into());
        };
        let max = self
            .tracker
            .waiting(key)
            .map_or(count, |w| w.max_continue_count);
        if count >= max {
            info!(continue_count = count, "interactive waiting exhausted, abandoning message");
            self.tracker.clear_waiting(key);
            entry.mark_abandoned();
            return SyncReply::Interim(GIVE_UP_MESSAGE.into());
        }

        let remaining = max - count;
        SyncReply::Interim(format!(
            "{} (剩余{remaining}次机会)",
            config.continue_waiting_message
        ))
    }

    /// Messages without any usable id cannot correlate retries; run a
    /// one-shot computation with the full first-attempt budget.
    async fn handle_untracked(
        &self,
        message: &WechatMessage,
        config: &AccountConfig,
    ) -> SyncReply {
        warn!(kind = message.kind_name(), "message carries no tracking id");
        let entry = TrackerEntry::detached();
        self.spawn_computation(Arc::clone(&entry), message.clone(), config.clone());
        if entry.wait_completed(config.wait_budget(0)).await {
            return self.deliver_final(&entry);
        }
        SyncReply::RetryRequested
    }

    /// Claim and return the final result. Exactly one delivery path ever
    /// gets a `Final` out of an entry.
    fn deliver_final(&self, entry: &TrackerEntry) -> SyncReply {
        if !entry.claim_final_send() {
            return SyncReply::AlreadyDelivered;
        }
        let text = entry
            .result()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| EMPTY_RESULT_FALLBACK.into());
        SyncReply::Final(text)
    }

    /// Launch the single background computation for a message.
    fn spawn_computation(
        &self,
        entry: Arc<TrackerEntry>,
        message: WechatMessage,
        config: AccountConfig,
    ) {
        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let outcome = tokio::time::timeout(
                config.computation_lifetime(),
                handlers::dispatch(&message, backend.as_ref(), store.as_ref(), &config),
            )
            .await;
            match outcome {
                Ok(Ok(reply)) => entry.complete(reply, false),
                Ok(Err(e)) => {
                    error!(error = %e, "backend computation failed");
                    entry.complete(format!("processing failed: {e}"), true);
                },
                Err(_) => {
                    warn!(elapsed = ?started.elapsed(), "computation exceeded lifetime cap, aborting");
                    entry.complete(LIFETIME_EXCEEDED_MESSAGE.into(), true);
                },
            }
            debug!(elapsed = ?started.elapsed(), "message computation finished");
        });
    }

    /// Once the computation finishes, push its result through the
    /// customer-service channel — unless a synchronous attempt already
    /// delivered it.
    fn spawn_out_of_band(
        &self,
        sender: Arc<CustomMessageSender>,
        entry: Arc<TrackerEntry>,
        open_id: String,
        tracking_id: String,
        wait: Duration,
    ) {
        tokio::spawn(async move {
            if !entry.wait_completed(wait).await {
                warn!(%tracking_id, "gave up waiting for a result to push out-of-band");
                return;
            }
            if !entry.claim_final_send() {
                debug!(%tracking_id, "result already delivered synchronously, skipping push");
                return;
            }
            let text = entry
                .result()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| EMPTY_RESULT_FALLBACK.into());
            match sender.send_text(&open_id, &text).await {
                Ok(()) => {
                    entry.mark_delivered_out_of_band();
                    info!(%tracking_id, "final answer delivered out-of-band");
                },
                // The user already has the interim message; nothing to reopen.
                Err(e) => warn!(%tracking_id, error = %e, "out-of-band delivery failed"),
            }
        });
    }

    fn clear_history(&self, key: &ConversationKey) -> String {
        let cleared = self.store.clear(key);
        info!(user = %key.sender, cleared, "conversation clear command");
        if cleared {
            "history chat records have been cleared"
        } else {
            "failed to clear history records, please try again later"
        }
        .into()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::message::MessageKind,
        async_trait::async_trait,
        serde_json::Value,
        std::sync::atomic::{AtomicUsize, Ordering},
        wegate_common::{ChatReply, MemoryConversationStore},
    };

    struct SlowBackend {
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AiBackend for SlowBackend {
        async fn chat(
            &self,
            _query: &str,
            _conversation_id: Option<&str>,
            _inputs: Value,
        ) -> wegate_common::Result<ChatReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(ChatReply {
                answer: "the answer".into(),
                conversation_id: Some("conv-1".into()),
            })
        }
    }

    struct Fixture {
        coordinator: Coordinator,
        store: Arc<MemoryConversationStore>,
        calls: Arc<AtomicUsize>,
        config: AccountConfig,
    }

    fn fixture(backend_delay: Duration) -> Fixture {
        let calls = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(SlowBackend {
            delay: backend_delay,
            calls: Arc::clone(&calls),
        });
        let store = Arc::new(MemoryConversationStore::new());
        let coordinator = Coordinator::new(
            Arc::new(MessageTracker::new()),
            backend,
            Arc::clone(&store) as Arc<dyn ConversationStore>,
        );
        let config = AccountConfig {
            app_id: "wx_app".into(),
            handler_deadline_ms: 60,
            retry_wait_timeout_ratio: 0.5,
            ..Default::default()
        };
        Fixture {
            coordinator,
            store,
            calls,
            config,
        }
    }

    fn text_message(id: &str, content: &str) -> WechatMessage {
        WechatMessage {
            msg_id: Some(id.into()),
            sender: "oUser".into(),
            recipient: "gh".into(),
            created_at: "1700000000".into(),
            kind: MessageKind::Text {
                content: content.into(),
            },
        }
    }

    #[tokio::test]
    async fn fast_backend_answers_on_first_delivery() {
        let f = fixture(Duration::from_millis(5));
        let msg = text_message("m1", "hello");
        let reply = f.coordinator.handle_delivery(&msg, &f.config).await;
        assert_eq!(reply, SyncReply::Final("the answer".into()));
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        // Conversation handle was persisted by the computation.
        let key = msg.conversation_key("wx_app");
        assert_eq!(f.store.get(&key), Some("conv-1".into()));
    }

    #[tokio::test]
    async fn concurrent_deliveries_launch_one_computation() {
        let f = fixture(Duration::from_millis(20));
        let coordinator = Arc::new(f.coordinator);
        let config = f.config.clone();

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                let config = config.clone();
                tokio::spawn(async move {
                    coordinator
                        .handle_delivery(&text_message("m1", "hello"), &config)
                        .await
                })
            })
            .collect();
        let mut finals = 0;
        for task in tasks {
            if matches!(task.await.unwrap(), SyncReply::Final(_)) {
                finals += 1;
            }
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
        // Exactly one attempt claimed the final answer.
        assert_eq!(finals, 1);
    }

    #[tokio::test]
    async fn slow_backend_walks_the_retry_ladder() {
        let f = fixture(Duration::from_secs(10));
        let msg = text_message("m2", "hello");
        for _ in 0..2 {
            let reply = f.coordinator.handle_delivery(&msg, &f.config).await;
            assert_eq!(reply, SyncReply::RetryRequested);
        }
        let reply = f.coordinator.handle_delivery(&msg, &f.config).await;
        assert_eq!(
            reply,
            SyncReply::Interim(f.config.continue_waiting_message.clone())
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn out_of_band_mode_pushes_result_exactly_once() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("GET", mockito::Matcher::Regex("^/cgi-bin/token".into()))
            .with_body(r#"{"access_token": "tok", "expires_in": 7200}"#)
            .create_async()
            .await;
        let send = server
            .mock(
                "POST",
                mockito::Matcher::Regex("^/cgi-bin/message/custom/send".into()),
            )
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "touser": "oUser",
                "text": { "content": "the answer" },
            })))
            .with_body(r#"{"errcode": 0}"#)
            .expect(1)
            .create_async()
            .await;

        let f = fixture(Duration::from_millis(250));
        let sender = Arc::new(CustomMessageSender::new(
            "app1",
            secrecy::Secret::new("s".into()),
            Some(&server.url()),
        ));
        let coordinator = f.coordinator.with_custom_message_sender(sender);
        let mut config = f.config.clone();
        config.enable_custom_message = true;

        let msg = text_message("m3", "hello");
        assert_eq!(
            coordinator.handle_delivery(&msg, &config).await,
            SyncReply::RetryRequested
        );
        assert_eq!(
            coordinator.handle_delivery(&msg, &config).await,
            SyncReply::RetryRequested
        );
        assert_eq!(
            coordinator.handle_delivery(&msg, &config).await,
            SyncReply::Interim(config.timeout_message.clone())
        );

        // Let the computation finish and the push go out.
        tokio::time::sleep(Duration::from_millis(400)).await;
        send.assert_async().await;
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn interactive_waiting_extends_and_then_gives_up() {
        let f = fixture(Duration::from_secs(10));
        let msg = text_message("m4", "hello");

        // Exhaust the original message's synchronous attempts.
        for _ in 0..2 {
            assert_eq!(
                f.coordinator.handle_delivery(&msg, &f.config).await,
                SyncReply::RetryRequested
            );
        }
        assert_eq!(
            f.coordinator.handle_delivery(&msg, &f.config).await,
            SyncReply::Interim(f.config.continue_waiting_message.clone())
        );

        // First continuation token: two redeliveries fail, the third spends
        // one chance and still offers more waiting.
        let token1 = text_message("c1", CONTINUE_TOKEN);
        for _ in 0..2 {
            assert_eq!(
                f.coordinator.handle_delivery(&token1, &f.config).await,
                SyncReply::RetryRequested
            );
        }
        let reply = f.coordinator.handle_delivery(&token1, &f.config).await;
        match reply {
            SyncReply::Interim(text) => {
                assert!(text.starts_with(&f.config.continue_waiting_message));
                assert!(text.contains("剩余1次"));
            },
            other => panic!("unexpected reply: {other:?}"),
        }

        // Second token exhausts the allowance.
        let token2 = text_message("c2", CONTINUE_TOKEN);
        for _ in 0..2 {
            assert_eq!(
                f.coordinator.handle_delivery(&token2, &f.config).await,
                SyncReply::RetryRequested
            );
        }
        assert_eq!(
            f.coordinator.handle_delivery(&token2, &f.config).await,
            SyncReply::Interim(GIVE_UP_MESSAGE.into())
        );

        // Waiting is over; the backend ran exactly once throughout.
        let key = msg.conversation_key("wx_app");
        assert!(f.coordinator.tracker.waiting(&key).is_none());
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn continuation_wait_can_catch_the_result() {
        let f = fixture(Duration::from_millis(150));
        let mut config = f.config.clone();
        config.handler_deadline_ms = 40;

        let msg = text_message("m5", "hello");
        for _ in 0..2 {
            assert_eq!(
                f.coordinator.handle_delivery(&msg, &config).await,
                SyncReply::RetryRequested
            );
        }
        assert!(matches!(
            f.coordinator.handle_delivery(&msg, &config).await,
            SyncReply::Interim(_)
        ));

        // By now the computation is close to done; the token's first wait
        // (full budget) catches it.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let token = text_message("c1", CONTINUE_TOKEN);
        let reply = f.coordinator.handle_delivery(&token, &config).await;
        assert_eq!(reply, SyncReply::Final("the answer".into()));

        let key = msg.conversation_key("wx_app");
        assert!(f.coordinator.tracker.waiting(&key).is_none());
    }

    #[tokio::test]
    async fn clear_command_never_reaches_the_backend() {
        let f = fixture(Duration::from_millis(5));
        let key = text_message("x", "x").conversation_key("wx_app");
        f.store.set(&key, "conv-9".into());

        let reply = f
            .coordinator
            .handle_delivery(&text_message("m6", CLEAR_HISTORY_COMMAND), &f.config)
            .await;
        assert_eq!(
            reply,
            SyncReply::Final("history chat records have been cleared".into())
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.store.get(&key), None);
    }

    #[tokio::test]
    async fn lifetime_cap_turns_runaway_call_into_failure_text() {
        let f = fixture(Duration::from_secs(60));
        let mut config = f.config.clone();
        config.computation_lifetime_ms = 20;

        let msg = text_message("m7", "hello");
        let reply = f.coordinator.handle_delivery(&msg, &config).await;
        assert_eq!(reply, SyncReply::Final(LIFETIME_EXCEEDED_MESSAGE.into()));
    }

    #[tokio::test]
    async fn completed_message_is_delivered_at_most_once() {
        let f = fixture(Duration::from_millis(5));
        let msg = text_message("m8", "hello");
        assert!(matches!(
            f.coordinator.handle_delivery(&msg, &f.config).await,
            SyncReply::Final(_)
        ));
        // A duplicate delivery of the already-answered id gets nothing.
        assert_eq!(
            f.coordinator.handle_delivery(&msg, &f.config).await,
            SyncReply::AlreadyDelivered
        );
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn continue_token_without_waiting_state_is_a_normal_message() {
        let f = fixture(Duration::from_millis(5));
        let reply = f
            .coordinator
            .handle_delivery(&text_message("m9", CONTINUE_TOKEN), &f.config)
            .await;
        // No conversation is waiting, so "1" just goes to the backend.
        assert_eq!(reply, SyncReply::Final("the answer".into()));
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);
    }
}

use dashmap::DashMap;

/// Identifies the backend conversation for one (user, account) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub sender: String,
    pub app_id: String,
}

impl ConversationKey {
    pub fn new(sender: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            app_id: app_id.into(),
        }
    }

    /// Stable storage key for the conversation handle.
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("wechat_conv_{}_{}", self.sender, self.app_id)
    }
}

/// Storage for backend conversation handles, keyed per user per account.
pub trait ConversationStore: Send + Sync {
    fn get(&self, key: &ConversationKey) -> Option<String>;

    fn set(&self, key: &ConversationKey, conversation_id: String);

    /// Returns true when the stored handle is gone afterwards.
    fn clear(&self, key: &ConversationKey) -> bool;
}

/// Process-local store; handles live as long as the process.
#[derive(Default)]
pub struct MemoryConversationStore {
    entries: DashMap<String, String>,
}

impl MemoryConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for MemoryConversationStore {
    fn get(&self, key: &ConversationKey) -> Option<String> {
        self.entries.get(&key.storage_key()).map(|v| v.value().clone())
    }

    fn set(&self, key: &ConversationKey, conversation_id: String) {
        self.entries.insert(key.storage_key(), conversation_id);
    }

    fn clear(&self, key: &ConversationKey) -> bool {
        self.entries.remove(&key.storage_key());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_includes_sender_and_app() {
        let key = ConversationKey::new("oUser123", "wx_app");
        assert_eq!(key.storage_key(), "wechat_conv_oUser123_wx_app");
    }

    #[test]
    fn set_get_clear_roundtrip() {
        let store = MemoryConversationStore::new();
        let key = ConversationKey::new("u", "a");
        assert_eq!(store.get(&key), None);

        store.set(&key, "conv-1".into());
        assert_eq!(store.get(&key), Some("conv-1".into()));

        assert!(store.clear(&key));
        assert_eq!(store.get(&key), None);
    }

    #[test]
    fn keys_do_not_collide_across_apps() {
        let store = MemoryConversationStore::new();
        store.set(&ConversationKey::new("u", "app1"), "c1".into());
        store.set(&ConversationKey::new("u", "app2"), "c2".into());
        assert_eq!(store.get(&ConversationKey::new("u", "app1")), Some("c1".into()));
        assert_eq!(store.get(&ConversationKey::new("u", "app2")), Some("c2".into()));
    }
}

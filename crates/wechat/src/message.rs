use wegate_common::ConversationKey;

/// Kind-specific payload of a normalized platform message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text {
        content: String,
    },
    Image {
        pic_url: String,
        media_id: String,
    },
    Voice {
        media_id: String,
        format: Option<String>,
        /// Platform-side speech recognition result, when the account has
        /// the feature enabled.
        recognition: Option<String>,
    },
    Link {
        title: String,
        description: Option<String>,
        url: String,
    },
    Event {
        event: String,
        event_key: Option<String>,
        ticket: Option<String>,
    },
    /// Anything we do not handle; the raw kind is kept for logging.
    Unsupported {
        raw_kind: String,
    },
}

impl MessageKind {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Voice { .. } => "voice",
            Self::Link { .. } => "link",
            Self::Event { .. } => "event",
            Self::Unsupported { raw_kind } => raw_kind,
        }
    }
}

/// One normalized inbound message. Immutable; redeliveries of the same
/// logical message parse to an identical value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WechatMessage {
    /// Platform-assigned message id. Event messages carry none.
    pub msg_id: Option<String>,
    /// Sender's OpenID.
    pub sender: String,
    /// Receiving account id (the Official Account's original id).
    pub recipient: String,
    /// CreateTime as delivered, seconds since the epoch.
    pub created_at: String,
    pub kind: MessageKind,
}

impl WechatMessage {
    /// Identifier under which redeliveries of this message correlate.
    ///
    /// Event messages have no MsgId; they are identified by sender, event
    /// and creation time instead. Returns `None` when nothing usable is
    /// present, in which case retries cannot be correlated.
    #[must_use]
    pub fn tracking_id(&self) -> Option<String> {
        if let MessageKind::Event { event, .. } = &self.kind {
            return Some(format!("{}_{}_{}", self.sender, event, self.created_at));
        }
        self.msg_id.clone()
    }

    #[must_use]
    pub fn conversation_key(&self, app_id: &str) -> ConversationKey {
        ConversationKey::new(self.sender.clone(), app_id)
    }

    /// Content of a text message, `None` for every other kind.
    #[must_use]
    pub fn text_content(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Text { content } => Some(content),
            _ => None,
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &str {
        self.kind.name()
    }
}

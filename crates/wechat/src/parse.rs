//! Inbound envelope parsing.

use std::collections::HashMap;

use {quick_xml::events::Event, tracing::warn};

use crate::{
    error::{Error, Result},
    message::{MessageKind, WechatMessage},
};

/// Parse a plaintext platform envelope into a typed message.
///
/// Unknown kinds normalize to [`MessageKind::Unsupported`] rather than
/// failing; only a missing common field is an error.
pub fn parse_message(xml: &str) -> Result<WechatMessage> {
    let fields = flat_fields(xml)?;
    let get = |name: &str| fields.get(name).cloned();
    let require = |name: &str| {
        fields
            .get(name)
            .cloned()
            .ok_or_else(|| Error::parse(format!("missing {name} element")))
    };

    let msg_type = require("MsgType")?;
    let sender = require("FromUserName")?;
    let recipient = require("ToUserName")?;
    let created_at = require("CreateTime")?;
    let msg_id = get("MsgId");

    let kind = match msg_type.as_str() {
        "text" => MessageKind::Text {
            content: require("Content")?,
        },
        "image" => MessageKind::Image {
            pic_url: require("PicUrl")?,
            media_id: require("MediaId")?,
        },
        "voice" => MessageKind::Voice {
            media_id: require("MediaId")?,
            format: get("Format"),
            recognition: get("Recognition"),
        },
        "link" => MessageKind::Link {
            title: require("Title")?,
            description: get("Description"),
            url: require("Url")?,
        },
        "event" => MessageKind::Event {
            event: require("Event")?,
            event_key: get("EventKey"),
            ticket: get("Ticket"),
        },
        other => {
            warn!(kind = other, "unknown message type, treating as unsupported");
            MessageKind::Unsupported {
                raw_kind: other.to_string(),
            }
        },
    };

    Ok(WechatMessage {
        msg_id,
        sender,
        recipient,
        created_at,
        kind,
    })
}

/// Collect the text of every leaf element. Platform envelopes are flat, so
/// element names never repeat meaningfully.
fn flat_fields(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut fields = HashMap::new();
    let mut current: Option<String> = None;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name != "xml" {
                    current = Some(name);
                }
            },
            Ok(Event::Text(t)) => {
                if let Some(name) = &current {
                    let text = t.unescape().map_err(Error::parse)?;
                    fields
                        .entry(name.clone())
                        .or_insert_with(String::new)
                        .push_str(&text);
                }
            },
            Ok(Event::CData(t)) => {
                if let Some(name) = &current {
                    fields
                        .entry(name.clone())
                        .or_insert_with(String::new)
                        .push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            },
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::parse(e)),
            _ => {},
        }
    }
    Ok(fields)
}

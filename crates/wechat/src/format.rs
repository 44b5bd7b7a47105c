//! Outbound reply rendering.

use crate::message::WechatMessage;

/// Render a text reply in the platform's fixed template: recipient and
/// sender swapped relative to the inbound message, fresh timestamp.
#[must_use]
pub fn text_reply_xml(message: &WechatMessage, content: &str) -> String {
    let timestamp = unix_now();
    format!(
        "<xml>\n\
         <ToUserName><![CDATA[{to}]]></ToUserName>\n\
         <FromUserName><![CDATA[{from}]]></FromUserName>\n\
         <CreateTime>{timestamp}</CreateTime>\n\
         <MsgType><![CDATA[text]]></MsgType>\n\
         <Content><![CDATA[{content}]]></Content>\n\
         </xml>",
        to = message.sender,
        from = message.recipient,
        content = cdata_escape(content),
    )
}

/// `]]>` inside a CDATA section must be split across two sections.
fn cdata_escape(text: &str) -> String {
    text.replace("]]>", "]]]]><![CDATA[>")
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

//! Plain/encrypted transport mode selection.

use {serde::Deserialize, tracing::warn};

use crate::{EnvelopeCodec, Error, Result};

/// Query parameters that accompany a message delivery.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvelopeParams {
    #[serde(default)]
    pub msg_signature: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub encrypt_type: Option<String>,
}

impl EnvelopeParams {
    fn is_aes(&self) -> bool {
        self.encrypt_type.as_deref() == Some("aes")
    }

    fn signature(&self) -> Option<&str> {
        self.msg_signature.as_deref().filter(|s| !s.is_empty())
    }
}

/// Transport codec for one account: pass-through when no encoding key is
/// configured, envelope crypto otherwise.
///
/// Accounts in the platform's compatibility mode may still deliver plain
/// bodies alongside encrypted ones; those pass through unchanged.
pub enum TransportCodec {
    Plain,
    Encrypted(EnvelopeCodec),
}

impl TransportCodec {
    pub fn new(token: &str, encoding_aes_key: Option<&str>, app_id: &str) -> Result<Self> {
        match encoding_aes_key.filter(|k| !k.is_empty()) {
            None => Ok(Self::Plain),
            Some(key) => {
                if token.is_empty() || app_id.is_empty() {
                    return Err(Error::invalid_key(
                        "encrypted transport requires both token and app id",
                    ));
                }
                Ok(Self::Encrypted(EnvelopeCodec::new(token, key, app_id)?))
            },
        }
    }

    /// Decrypt an inbound body. Fails only on a genuinely forged or
    /// corrupt encrypted envelope; compatibility plaintext passes through.
    pub fn decrypt_inbound(&self, body: &str, params: &EnvelopeParams) -> Result<String> {
        let Self::Encrypted(codec) = self else {
            return Ok(body.to_string());
        };

        // No encryption marker and no signature: compatibility plaintext.
        if !params.is_aes() && params.signature().is_none() {
            return Ok(body.to_string());
        }

        let (Some(signature), Some(timestamp), Some(nonce)) = (
            params.signature(),
            params.timestamp.as_deref(),
            params.nonce.as_deref(),
        ) else {
            warn!("encrypted delivery missing signature parameters, passing body through");
            return Ok(body.to_string());
        };

        codec.decrypt(body, signature, timestamp, nonce)
    }

    /// Encrypt an outbound reply when the inbound request asked for it.
    pub fn encrypt_outbound(&self, reply: &str, params: &EnvelopeParams) -> Result<String> {
        let Self::Encrypted(codec) = self else {
            return Ok(reply.to_string());
        };

        if !params.is_aes() {
            return Ok(reply.to_string());
        }

        let (Some(timestamp), Some(nonce)) =
            (params.timestamp.as_deref(), params.nonce.as_deref())
        else {
            warn!("encrypted reply missing timestamp/nonce, sending plaintext");
            return Ok(reply.to_string());
        };

        codec.encrypt(reply, timestamp, nonce)
    }
}

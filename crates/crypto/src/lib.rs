//! Envelope cryptography for the WeChat Official Account transport.
//!
//! Messages travel as flat XML envelopes, optionally AES-CBC encrypted and
//! SHA-1 signed. [`EnvelopeCodec`] implements the raw cipher and signature
//! scheme; [`TransportCodec`] layers the plain/encrypted mode selection and
//! the platform's compatibility pass-through rules on top.

pub mod adapter;
pub mod codec;

pub use {
    adapter::{EnvelopeParams, TransportCodec},
    codec::{EnvelopeCodec, verify_url_signature},
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Supplied signature does not match the computed one. Fatal per
    /// request; no plaintext is ever produced.
    #[error("signature verification failed")]
    VerificationFailed,

    /// Envelope is malformed, forged, or addressed to another account.
    #[error("envelope decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    #[error("envelope encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// The configured encoding key cannot be used.
    #[error("invalid encoding key: {reason}")]
    InvalidKey { reason: String },
}

impl Error {
    #[must_use]
    pub fn decryption(reason: impl std::fmt::Display) -> Self {
        Self::DecryptionFailed {
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn encryption(reason: impl std::fmt::Display) -> Self {
        Self::EncryptionFailed {
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn invalid_key(reason: impl std::fmt::Display) -> Self {
        Self::InvalidKey {
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

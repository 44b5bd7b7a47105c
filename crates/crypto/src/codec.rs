//! AES-CBC envelope cipher and SHA-1 signature scheme.

use std::fmt::Write as _;

use {
    aes::{
        Aes256,
        cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding},
    },
    base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
    quick_xml::events::Event,
    rand::{Rng as _, distr::Alphanumeric},
    sha1::{Digest, Sha1},
    subtle::ConstantTimeEq as _,
};

use crate::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// The platform pads to 32-byte blocks, not the cipher's 16.
const PAD_BLOCK: usize = 32;
const PREFIX_LEN: usize = 16;

/// Codec for one account's encrypted envelopes.
///
/// The encoding key is the account's 43-character EncodingAESKey; it must
/// base64-decode (with one pad character restored) to exactly 32 bytes.
pub struct EnvelopeCodec {
    token: String,
    app_id: String,
    key: [u8; 32],
}

impl EnvelopeCodec {
    pub fn new(
        token: impl Into<String>,
        encoding_aes_key: &str,
        app_id: impl Into<String>,
    ) -> Result<Self> {
        let decoded = BASE64
            .decode(format!("{encoding_aes_key}="))
            .map_err(Error::invalid_key)?;
        let key: [u8; 32] = decoded
            .try_into()
            .map_err(|_| Error::invalid_key("decoded length must be 32 bytes"))?;
        Ok(Self {
            token: token.into(),
            app_id: app_id.into(),
            key,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Signature over the lexically sorted parts, SHA-1 hex.
    fn sign(&self, timestamp: &str, nonce: &str, ciphertext: &str) -> String {
        let mut parts = [self.token.as_str(), timestamp, nonce, ciphertext];
        parts.sort_unstable();
        let mut sha = Sha1::new();
        for part in parts {
            sha.update(part.as_bytes());
        }
        hex(&sha.finalize())
    }

    /// Plain-mode URL verification: signature over the sorted
    /// `{token, timestamp, nonce}` triple.
    #[must_use]
    pub fn verify_url(&self, signature: &str, timestamp: &str, nonce: &str) -> bool {
        verify_url_signature(&self.token, signature, timestamp, nonce)
    }

    /// Encrypt a reply and wrap it in the signed envelope.
    pub fn encrypt(&self, plaintext: &str, timestamp: &str, nonce: &str) -> Result<String> {
        let ciphertext = self.encrypt_raw(plaintext)?;
        let signature = self.sign(timestamp, nonce, &ciphertext);
        Ok(format!(
            "<xml>\n\
             <Encrypt><![CDATA[{ciphertext}]]></Encrypt>\n\
             <MsgSignature><![CDATA[{signature}]]></MsgSignature>\n\
             <TimeStamp>{timestamp}</TimeStamp>\n\
             <Nonce><![CDATA[{nonce}]]></Nonce>\n\
             </xml>"
        ))
    }

    /// Verify and decrypt an inbound envelope body.
    pub fn decrypt(
        &self,
        envelope: &str,
        signature: &str,
        timestamp: &str,
        nonce: &str,
    ) -> Result<String> {
        let ciphertext = encrypted_payload(envelope)?;
        self.decrypt_ciphertext(&ciphertext, signature, timestamp, nonce)
    }

    /// Verification-handshake variant: the ciphertext arrives bare in the
    /// `echostr` query parameter instead of inside an XML body.
    pub fn decrypt_echostr(
        &self,
        echostr: &str,
        signature: &str,
        timestamp: &str,
        nonce: &str,
    ) -> Result<String> {
        self.decrypt_ciphertext(echostr, signature, timestamp, nonce)
    }

    fn decrypt_ciphertext(
        &self,
        ciphertext: &str,
        signature: &str,
        timestamp: &str,
        nonce: &str,
    ) -> Result<String> {
        let computed = self.sign(timestamp, nonce, ciphertext);
        if !bool::from(computed.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(Error::VerificationFailed);
        }
        self.decrypt_raw(ciphertext)
    }

    fn encrypt_raw(&self, plaintext: &str) -> Result<String> {
        let text = plaintext.as_bytes();
        let mut plain =
            Vec::with_capacity(PREFIX_LEN + 4 + text.len() + self.app_id.len() + PAD_BLOCK);
        plain.extend(rand::rng().sample_iter(Alphanumeric).take(PREFIX_LEN));
        plain.extend_from_slice(&(text.len() as u32).to_be_bytes());
        plain.extend_from_slice(text);
        plain.extend_from_slice(self.app_id.as_bytes());
        pad(&mut plain);

        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.key[..16])
            .map_err(Error::encryption)?;
        let encrypted = cipher.encrypt_padded_vec_mut::<NoPadding>(&plain);
        Ok(BASE64.encode(encrypted))
    }

    fn decrypt_raw(&self, ciphertext: &str) -> Result<String> {
        let encrypted = BASE64.decode(ciphertext).map_err(Error::decryption)?;
        if encrypted.is_empty() || encrypted.len() % 16 != 0 {
            return Err(Error::decryption("ciphertext length is not a block multiple"));
        }

        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.key[..16])
            .map_err(Error::decryption)?;
        let mut plain = cipher
            .decrypt_padded_vec_mut::<NoPadding>(&encrypted)
            .map_err(Error::decryption)?;
        unpad(&mut plain);

        // random prefix ‖ u32-BE length ‖ message ‖ app id
        if plain.len() < PREFIX_LEN + 4 {
            return Err(Error::decryption("plaintext too short"));
        }
        let body = &plain[PREFIX_LEN..];
        let len_bytes: [u8; 4] = body[..4]
            .try_into()
            .map_err(|_| Error::decryption("truncated length header"))?;
        let msg_len = u32::from_be_bytes(len_bytes) as usize;
        if body.len() < 4 + msg_len {
            return Err(Error::decryption("length header exceeds payload"));
        }

        let message = std::str::from_utf8(&body[4..4 + msg_len])
            .map_err(|_| Error::decryption("message is not valid utf-8"))?;
        let from_app = std::str::from_utf8(&body[4 + msg_len..])
            .map_err(|_| Error::decryption("trailing app id is not valid utf-8"))?;
        if from_app != self.app_id {
            return Err(Error::decryption("app id mismatch"));
        }
        Ok(message.to_string())
    }
}

/// Verify a webhook URL signature: SHA-1 over the lexically sorted
/// `{token, timestamp, nonce}` triple, compared in constant time.
#[must_use]
pub fn verify_url_signature(token: &str, signature: &str, timestamp: &str, nonce: &str) -> bool {
    let mut parts = [token, timestamp, nonce];
    parts.sort_unstable();
    let mut sha = Sha1::new();
    for part in parts {
        sha.update(part.as_bytes());
    }
    let computed = hex(&sha.finalize());
    bool::from(computed.as_bytes().ct_eq(signature.as_bytes()))
}

fn hex(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

fn pad(buf: &mut Vec<u8>) {
    let mut amount = PAD_BLOCK - buf.len() % PAD_BLOCK;
    if amount == 0 {
        amount = PAD_BLOCK;
    }
    buf.extend(std::iter::repeat_n(amount as u8, amount));
}

/// Pad bytes outside 1..=32 are treated as no padding, as the platform's
/// reference implementation does.
fn unpad(buf: &mut Vec<u8>) {
    let Some(&last) = buf.last() else { return };
    let pad = usize::from(last);
    if (1..=PAD_BLOCK).contains(&pad) && pad <= buf.len() {
        buf.truncate(buf.len() - pad);
    }
}

/// Pull the `<Encrypt>` payload out of an envelope body.
fn encrypted_payload(body: &str) -> Result<String> {
    let mut reader = quick_xml::Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut inside = false;
    let mut value = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"Encrypt" => inside = true,
            Ok(Event::End(e)) if e.local_name().as_ref() == b"Encrypt" => break,
            Ok(Event::Text(t)) if inside => {
                value.push_str(&t.unescape().map_err(Error::decryption)?);
            },
            Ok(Event::CData(t)) if inside => {
                value.push_str(&String::from_utf8_lossy(&t.into_inner()));
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::decryption(e)),
            _ => {},
        }
    }

    if value.is_empty() {
        Err(Error::decryption("missing Encrypt element"))
    } else {
        Ok(value)
    }
}

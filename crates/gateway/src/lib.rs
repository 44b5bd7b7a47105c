//! Inbound webhook routes.
//!
//! Thin I/O layer: verification handshake on GET, message deliveries on
//! POST. Everything interesting happens in the codec and the coordinator;
//! this crate only maps their outcomes onto HTTP statuses. The platform
//! must never see an accidental 5xx — only the coordinator's deliberate
//! retry signal uses one.

use std::sync::Arc;

use {
    axum::{
        Router,
        extract::{Query, State},
        http::{StatusCode, header},
        response::{IntoResponse, Response},
        routing::get,
    },
    secrecy::ExposeSecret,
    serde::Deserialize,
    tracing::{error, warn},
};

use {
    wegate_crypto::{EnvelopeParams, TransportCodec, verify_url_signature},
    wegate_wechat::{AccountConfig, Coordinator, SyncReply, parse_message, text_reply_xml},
};

/// Shared state for the webhook routes.
#[derive(Clone)]
pub struct AppState {
    pub config: AccountConfig,
    pub codec: Arc<TransportCodec>,
    pub coordinator: Arc<Coordinator>,
}

/// Build the webhook router (shared between production startup and tests).
pub fn build_webhook_app(state: AppState) -> Router {
    Router::new()
        .route("/wechat", get(verify_handler).post(message_handler))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct VerifyQuery {
    #[serde(default)]
    signature: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    nonce: String,
    #[serde(default)]
    echostr: String,
    #[serde(default)]
    msg_signature: Option<String>,
}

/// Platform server verification: echo `echostr` back iff the signature
/// checks out.
async fn verify_handler(State(state): State<AppState>, Query(query): Query<VerifyQuery>) -> Response {
    let token = state.config.token.expose_secret();
    if token.is_empty() {
        error!("webhook token not configured");
        return (StatusCode::INTERNAL_SERVER_ERROR, "token not configured").into_response();
    }

    // Encrypted-mode handshake carries the echostr as ciphertext.
    if let TransportCodec::Encrypted(codec) = state.codec.as_ref()
        && let Some(msg_signature) = query.msg_signature.as_deref()
    {
        return match codec.decrypt_echostr(
            &query.echostr,
            msg_signature,
            &query.timestamp,
            &query.nonce,
        ) {
            Ok(echostr) => (StatusCode::OK, echostr).into_response(),
            Err(e) => {
                warn!(error = %e, "encrypted verification failed");
                (StatusCode::FORBIDDEN, "verification failed").into_response()
            },
        };
    }

    if verify_url_signature(token, &query.signature, &query.timestamp, &query.nonce) {
        (StatusCode::OK, query.echostr).into_response()
    } else {
        warn!("webhook verification failed");
        (StatusCode::FORBIDDEN, "verification failed").into_response()
    }
}

/// One delivery attempt of one message.
async fn message_handler(
    State(state): State<AppState>,
    Query(params): Query<EnvelopeParams>,
    body: String,
) -> Response {
    let plaintext = match state.codec.decrypt_inbound(&body, &params) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            warn!(error = %e, "rejecting undecryptable delivery");
            return (StatusCode::BAD_REQUEST, "decryption failed").into_response();
        },
    };

    // Past decryption, a fault must not surface as an error status: the
    // platform would retry a request that will never succeed.
    let message = match parse_message(&plaintext) {
        Ok(message) => message,
        Err(e) => {
            error!(error = %e, "unparseable delivery");
            return empty_ok();
        },
    };

    let reply = state
        .coordinator
        .handle_delivery(&message, &state.config)
        .await;
    match reply {
        // The deliberate retry signal; the only 5xx this service produces.
        SyncReply::RetryRequested => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        SyncReply::AlreadyDelivered => empty_ok(),
        SyncReply::Final(text) | SyncReply::Interim(text) => {
            let xml = text_reply_xml(&message, &text);
            match state.codec.encrypt_outbound(&xml, &params) {
                Ok(body) => xml_response(body),
                Err(e) => {
                    error!(error = %e, "failed to encrypt reply");
                    empty_ok()
                },
            }
        },
    }
}

fn xml_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/xml")],
        body,
    )
        .into_response()
}

fn empty_ok() -> Response {
    xml_response(String::new())
}

//! Out-of-band delivery through the customer-service message API.
//!
//! Used once the synchronous webhook channel is exhausted; failures here
//! are logged by the caller and never reopen that channel.

use std::time::{Duration, Instant};

use {
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    serde_json::json,
    tracing::debug,
};

use crate::error::{Error, Result};

const DEFAULT_API_HOST: &str = "api.weixin.qq.com";
/// Refresh the cached token this long before it actually expires.
const REFRESH_SKEW: Duration = Duration::from_secs(300);
const DEFAULT_TOKEN_TTL_SECS: u64 = 7_200;
/// Platform errcodes meaning the presented access token is no longer valid.
const INVALID_TOKEN_CODES: [i64; 2] = [40001, 42001];
/// Platform errcodes for API rate limiting.
const RATE_LIMIT_CODES: [i64; 2] = [45009, 45047];

struct CachedAccessToken {
    token: Secret<String>,
    expires_at: Instant,
}

impl CachedAccessToken {
    fn is_valid(&self) -> bool {
        self.expires_at > Instant::now() + REFRESH_SKEW
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    errmsg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    errcode: i64,
    errmsg: Option<String>,
}

/// Sender for text customer-service messages, with a cached access token.
pub struct CustomMessageSender {
    base_url: String,
    app_id: String,
    app_secret: Secret<String>,
    http: reqwest::Client,
    token_cache: tokio::sync::Mutex<Option<CachedAccessToken>>,
}

impl CustomMessageSender {
    /// `api_host` overrides the production host; a value carrying a scheme
    /// is used verbatim (proxy deployments).
    #[must_use]
    pub fn new(
        app_id: impl Into<String>,
        app_secret: Secret<String>,
        api_host: Option<&str>,
    ) -> Self {
        let host = api_host.unwrap_or(DEFAULT_API_HOST);
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{host}")
        };
        Self {
            base_url,
            app_id: app_id.into(),
            app_secret,
            http: reqwest::Client::new(),
            token_cache: tokio::sync::Mutex::new(None),
        }
    }

    /// Push one text message to a user. Retries once with a fresh token
    /// when the platform reports the cached one invalid.
    pub async fn send_text(&self, open_id: &str, content: &str) -> Result<()> {
        match self.try_send(open_id, content).await {
            Err(Error::PushAuthFailed { message }) => {
                debug!(reason = %message, "access token rejected, refreshing and retrying once");
                self.invalidate_token().await;
                self.try_send(open_id, content).await
            },
            other => other,
        }
    }

    async fn try_send(&self, open_id: &str, content: &str) -> Result<()> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/cgi-bin/message/custom/send?access_token={}",
            self.base_url,
            token.expose_secret()
        );
        let payload = json!({
            "touser": open_id,
            "msgtype": "text",
            "text": { "content": content },
        });

        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|source| Error::PushUnreachable { source })?;
        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| Error::push(format!("unreadable send response: {e}")))?;

        match body.errcode {
            0 => Ok(()),
            code if INVALID_TOKEN_CODES.contains(&code) => {
                Err(Error::push_auth(body.errmsg.unwrap_or_default()))
            },
            code if RATE_LIMIT_CODES.contains(&code) => Err(Error::PushRateLimited),
            code => Err(Error::push(format!(
                "send failed ({code}): {}",
                body.errmsg.unwrap_or_else(|| "unknown error".into())
            ))),
        }
    }

    async fn access_token(&self) -> Result<Secret<String>> {
        {
            let guard = self.token_cache.lock().await;
            if let Some(cached) = guard.as_ref()
                && cached.is_valid()
            {
                return Ok(cached.token.clone());
            }
        }

        let url = format!(
            "{}/cgi-bin/token?grant_type=client_credential&appid={}&secret={}",
            self.base_url,
            self.app_id,
            self.app_secret.expose_secret()
        );
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| Error::PushUnreachable { source })?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::push(format!("unreadable token response: {e}")))?;

        let Some(token) = body.access_token else {
            return Err(Error::push_auth(format!(
                "token request failed: {}",
                body.errmsg.unwrap_or_else(|| "unknown error".into())
            )));
        };

        let ttl = body.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        let cached = CachedAccessToken {
            token: Secret::new(token),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        };
        let secret = cached.token.clone();
        *self.token_cache.lock().await = Some(cached);
        Ok(secret)
    }

    async fn invalidate_token(&self) {
        *self.token_cache.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender(base_url: &str) -> CustomMessageSender {
        CustomMessageSender::new("app1", Secret::new("s3cret".into()), Some(base_url))
    }

    #[tokio::test]
    async fn token_is_fetched_once_and_cached() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("GET", mockito::Matcher::Regex("^/cgi-bin/token".into()))
            .with_body(r#"{"access_token": "tok-1", "expires_in": 7200}"#)
            .expect(1)
            .create_async()
            .await;
        let send_mock = server
            .mock(
                "POST",
                mockito::Matcher::Regex("^/cgi-bin/message/custom/send".into()),
            )
            .with_body(r#"{"errcode": 0, "errmsg": "ok"}"#)
            .expect(2)
            .create_async()
            .await;

        let sender = sender(&server.url());
        sender.send_text("oUser", "first").await.unwrap();
        sender.send_text("oUser", "second").await.unwrap();

        token_mock.assert_async().await;
        send_mock.assert_async().await;
    }

    #[tokio::test]
    async fn invalid_token_triggers_one_refresh_and_retry() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("GET", mockito::Matcher::Regex("^/cgi-bin/token".into()))
            .with_body(r#"{"access_token": "tok", "expires_in": 7200}"#)
            .expect(2)
            .create_async()
            .await;
        let rejected = server
            .mock(
                "POST",
                mockito::Matcher::Regex("^/cgi-bin/message/custom/send".into()),
            )
            .with_body(r#"{"errcode": 40001, "errmsg": "invalid credential"}"#)
            .expect(2)
            .create_async()
            .await;

        let sender = sender(&server.url());
        // Both the first send and the retry are rejected; the point is that
        // a fresh token was requested in between.
        let result = sender.send_text("oUser", "hello").await;
        assert!(matches!(result, Err(Error::PushAuthFailed { .. })));

        token_mock.assert_async().await;
        rejected.assert_async().await;
    }

    #[tokio::test]
    async fn token_issuance_failure_is_auth_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Regex("^/cgi-bin/token".into()))
            .with_body(r#"{"errcode": 40013, "errmsg": "invalid appid"}"#)
            .create_async()
            .await;

        let sender = sender(&server.url());
        let err = sender.send_text("oUser", "hello").await;
        assert!(matches!(err, Err(Error::PushAuthFailed { .. })));
    }

    #[tokio::test]
    async fn rate_limit_code_maps_to_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("GET", mockito::Matcher::Regex("^/cgi-bin/token".into()))
            .with_body(r#"{"access_token": "tok", "expires_in": 7200}"#)
            .create_async()
            .await;
        let _send = server
            .mock(
                "POST",
                mockito::Matcher::Regex("^/cgi-bin/message/custom/send".into()),
            )
            .with_body(r#"{"errcode": 45047, "errmsg": "out of response count limit"}"#)
            .create_async()
            .await;

        let sender = sender(&server.url());
        let err = sender.send_text("oUser", "hello").await;
        assert!(matches!(err, Err(Error::PushRateLimited)));
    }
}

use std::time::Duration;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// The platform's synchronous webhook deadline.
const DEFAULT_HANDLER_DEADLINE_MS: u64 = 5_000;
/// Hard cap on one backend computation, independent of retry bookkeeping.
const DEFAULT_COMPUTATION_LIFETIME_MS: u64 = 300_000;
const DEFAULT_RETRY_WAIT_TIMEOUT_RATIO: f64 = 0.7;
const DEFAULT_MAX_CONTINUE_COUNT: u32 = 2;
const DEFAULT_TIMEOUT_MESSAGE: &str = "内容生成耗时较长，请稍等...";
const DEFAULT_CONTINUE_MESSAGE: &str = "生成答复中，继续等待请回复1";
const DEFAULT_API_HOST: &str = "api.weixin.qq.com";

/// Configuration for a single Official Account.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Token shared with the platform, used for webhook signatures.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,

    /// 43-character EncodingAESKey. Absent or empty means plain transport.
    #[serde(serialize_with = "serialize_opt_secret")]
    pub encoding_aes_key: Option<Secret<String>>,

    /// AppID of the Official Account.
    pub app_id: String,

    /// AppSecret, required for the customer-service message API.
    #[serde(serialize_with = "serialize_opt_secret")]
    pub app_secret: Option<Secret<String>>,

    /// Override for `api.weixin.qq.com` (proxy deployments).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_proxy_host: Option<String>,

    /// Push the final answer through the customer-service message API once
    /// the synchronous channel is exhausted. Off means interactive waiting.
    pub enable_custom_message: bool,

    /// Interim reply sent on the last delivery attempt in push mode.
    pub timeout_message: String,

    /// Interim reply offering the keep-waiting exchange.
    pub continue_waiting_message: String,

    /// How many keep-waiting replies a user may spend per message.
    pub max_continue_count: u32,

    /// Fraction of the deadline granted to retry attempts; clamped to
    /// [0.1, 1.0] when read.
    pub retry_wait_timeout_ratio: f64,

    /// Synchronous wait budget per delivery attempt. The platform allows
    /// roughly five seconds; lower it only in tests.
    pub handler_deadline_ms: u64,

    /// Lifetime cap for one backend computation.
    pub computation_lifetime_ms: u64,
}

impl AccountConfig {
    /// Ratio with the configured value clamped into its valid range.
    #[must_use]
    pub fn effective_ratio(&self) -> f64 {
        self.retry_wait_timeout_ratio.clamp(0.1, 1.0)
    }

    #[must_use]
    pub fn handler_deadline(&self) -> Duration {
        Duration::from_millis(self.handler_deadline_ms)
    }

    /// Wait budget for a delivery attempt: the full deadline on the first
    /// delivery, a ratio-scaled slice on redeliveries.
    #[must_use]
    pub fn wait_budget(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            self.handler_deadline()
        } else {
            self.handler_deadline().mul_f64(self.effective_ratio())
        }
    }

    #[must_use]
    pub fn computation_lifetime(&self) -> Duration {
        Duration::from_millis(self.computation_lifetime_ms)
    }

    #[must_use]
    pub fn api_host(&self) -> &str {
        self.api_proxy_host.as_deref().unwrap_or(DEFAULT_API_HOST)
    }

    #[must_use]
    pub fn encoding_aes_key(&self) -> Option<&str> {
        self.encoding_aes_key
            .as_ref()
            .map(ExposeSecret::expose_secret)
            .map(String::as_str)
            .filter(|k| !k.is_empty())
    }
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("token", &"[REDACTED]")
            .field("app_id", &self.app_id)
            .field("enable_custom_message", &self.enable_custom_message)
            .field("max_continue_count", &self.max_continue_count)
            .field("retry_wait_timeout_ratio", &self.retry_wait_timeout_ratio)
            .finish_non_exhaustive()
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            token: Secret::new(String::new()),
            encoding_aes_key: None,
            app_id: String::new(),
            app_secret: None,
            api_proxy_host: None,
            enable_custom_message: false,
            timeout_message: DEFAULT_TIMEOUT_MESSAGE.into(),
            continue_waiting_message: DEFAULT_CONTINUE_MESSAGE.into(),
            max_continue_count: DEFAULT_MAX_CONTINUE_COUNT,
            retry_wait_timeout_ratio: DEFAULT_RETRY_WAIT_TIMEOUT_RATIO,
            handler_deadline_ms: DEFAULT_HANDLER_DEADLINE_MS,
            computation_lifetime_ms: DEFAULT_COMPUTATION_LIFETIME_MS,
        }
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn serialize_opt_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = AccountConfig::default();
        assert!(!cfg.enable_custom_message);
        assert_eq!(cfg.max_continue_count, 2);
        assert_eq!(cfg.handler_deadline(), Duration::from_secs(5));
        assert_eq!(cfg.api_host(), "api.weixin.qq.com");
        assert_eq!(cfg.encoding_aes_key(), None);
    }

    #[test]
    fn ratio_is_clamped() {
        let mut cfg = AccountConfig::default();
        cfg.retry_wait_timeout_ratio = 7.5;
        assert_eq!(cfg.effective_ratio(), 1.0);
        cfg.retry_wait_timeout_ratio = 0.0;
        assert_eq!(cfg.effective_ratio(), 0.1);
    }

    #[test]
    fn wait_budget_shrinks_on_retries() {
        let mut cfg = AccountConfig::default();
        cfg.handler_deadline_ms = 1_000;
        cfg.retry_wait_timeout_ratio = 0.5;
        assert_eq!(cfg.wait_budget(0), Duration::from_millis(1_000));
        assert_eq!(cfg.wait_budget(1), Duration::from_millis(500));
        assert_eq!(cfg.wait_budget(2), Duration::from_millis(500));
    }

    #[test]
    fn deserialize_partial_json() {
        let cfg: AccountConfig = serde_json::from_str(
            r#"{
                "token": "tok",
                "app_id": "wx123",
                "enable_custom_message": true,
                "retry_wait_timeout_ratio": 0.9
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.token.expose_secret(), "tok");
        assert_eq!(cfg.app_id, "wx123");
        assert!(cfg.enable_custom_message);
        assert_eq!(cfg.retry_wait_timeout_ratio, 0.9);
        // defaults for unspecified fields
        assert_eq!(cfg.max_continue_count, 2);
        assert_eq!(cfg.timeout_message, DEFAULT_TIMEOUT_MESSAGE);
    }

    #[test]
    fn empty_encoding_key_means_plain_transport() {
        let mut cfg = AccountConfig::default();
        cfg.encoding_aes_key = Some(Secret::new(String::new()));
        assert_eq!(cfg.encoding_aes_key(), None);
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut cfg = AccountConfig::default();
        cfg.token = Secret::new("very-secret".into());
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("very-secret"));
    }
}

use std::path::Path;

use {
    anyhow::Context as _,
    secrecy::Secret,
    serde::Deserialize,
};

use wegate_wechat::AccountConfig;

/// Top-level TOML settings file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub account: AccountConfig,
    pub backend: BackendSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Chat endpoint of the AI application.
    pub endpoint: String,
    pub api_key: Option<Secret<String>>,
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, secrecy::ExposeSecret};

    #[test]
    fn minimal_settings_fill_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [account]
            token = "tok"
            app_id = "wx123"

            [backend]
            endpoint = "https://ai.example.com/v1/chat-messages"
            "#,
        )
        .unwrap();
        assert_eq!(settings.server.bind, "127.0.0.1");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.account.app_id, "wx123");
        assert_eq!(
            settings.backend.endpoint,
            "https://ai.example.com/v1/chat-messages"
        );
        assert!(settings.backend.api_key.is_none());
    }

    #[test]
    fn full_settings_parse() {
        let settings: Settings = toml::from_str(
            r#"
            [server]
            bind = "0.0.0.0"
            port = 9000

            [account]
            token = "tok"
            app_id = "wx123"
            app_secret = "shh"
            enable_custom_message = true
            retry_wait_timeout_ratio = 0.5
            max_continue_count = 3

            [backend]
            endpoint = "http://localhost:5001/chat"
            api_key = "app-key"
            "#,
        )
        .unwrap();
        assert_eq!(settings.server.port, 9000);
        assert!(settings.account.enable_custom_message);
        assert_eq!(settings.account.max_continue_count, 3);
        assert_eq!(
            settings.backend.api_key.unwrap().expose_secret(),
            "app-key"
        );
    }
}

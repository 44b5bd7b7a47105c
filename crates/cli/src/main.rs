mod settings;

use std::sync::Arc;

use {
    anyhow::Context as _,
    clap::Parser,
    secrecy::ExposeSecret as _,
    tracing::info,
    tracing_subscriber::EnvFilter,
};

use {
    wegate_common::{AiBackend, ConversationStore, MemoryConversationStore},
    wegate_crypto::TransportCodec,
    wegate_gateway::{AppState, build_webhook_app},
    wegate_wechat::{Coordinator, CustomMessageSender, HttpBackend, MessageTracker},
};

use settings::Settings;

#[derive(Parser)]
#[command(name = "wegate", about = "WeChat Official Account bridge to a slow AI backend")]
struct Cli {
    /// Path to the TOML settings file.
    #[arg(long, default_value = "wegate.toml", env = "WEGATE_CONFIG")]
    config: std::path::PathBuf,

    /// Address to bind to (overrides config value).
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides config value).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let settings = Settings::load(&cli.config)?;
    let account = settings.account.clone();

    let codec = TransportCodec::new(
        account.token.expose_secret(),
        account.encoding_aes_key(),
        &account.app_id,
    )
    .context("building transport codec")?;

    let store: Arc<dyn ConversationStore> = Arc::new(MemoryConversationStore::new());
    let backend: Arc<dyn AiBackend> = Arc::new(HttpBackend::new(
        settings.backend.endpoint.clone(),
        settings.backend.api_key.clone(),
    ));
    let tracker = Arc::new(MessageTracker::new());

    let mut coordinator = Coordinator::new(tracker, backend, store);
    if account.enable_custom_message {
        match account.app_secret.clone() {
            Some(app_secret) => {
                coordinator = coordinator.with_custom_message_sender(Arc::new(
                    CustomMessageSender::new(
                        account.app_id.clone(),
                        app_secret,
                        account.api_proxy_host.as_deref(),
                    ),
                ));
            },
            None => anyhow::bail!("enable_custom_message requires account.app_secret"),
        }
    }

    let app = build_webhook_app(AppState {
        config: account,
        codec: Arc::new(codec),
        coordinator: Arc::new(coordinator),
    });

    let bind = cli.bind.unwrap_or(settings.server.bind);
    let port = cli.port.unwrap_or(settings.server.port);
    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "wegate listening");
    axum::serve(listener, app).await?;
    Ok(())
}

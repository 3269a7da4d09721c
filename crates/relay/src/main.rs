use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_core::{config::Config, relay::RelayLoop};
use relay_openai::OpenAiClient;
use relay_telegram::TelegramClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_core::logging::init("relay")?;

    let cfg = Config::load().context("failed to load configuration")?;
    info!(
        backend = cfg.ai_backend.kind(),
        base_url = cfg.ai_backend.base_url(),
        model = %cfg.ai_model,
        scope = ?cfg.session_scope,
        "configuration loaded"
    );

    let telegram = Arc::new(TelegramClient::new(
        cfg.telegram_api_base.clone(),
        cfg.telegram_bot_token.clone(),
    ));
    let backend = Arc::new(OpenAiClient::from_backend(&cfg.ai_backend, cfg.ai_model.clone()));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));

    let mut relay = RelayLoop::new(telegram.clone(), telegram, backend, cfg.session_scope)
        .with_poll_interval(cfg.poll_interval);
    relay.run(cancel).await.context("relay loop failed")?;

    Ok(())
}

async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM; only Ctrl-C will stop the relay");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
    cancel.cancel();
}

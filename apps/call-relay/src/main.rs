use anyhow::{Context, Result};
use call_relay::cli::{Cli, Commands};
use call_relay::{RelayConfig, RelayState, router};
use call_signaling::{UserId, mint_token};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    // Default to WARN level if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let mut config = RelayConfig::from_env();

    match cli.command {
        Some(Commands::MintToken { user_id, secret }) => {
            let token = mint_token(secret.as_bytes(), UserId(user_id))
                .context("failed to mint token")?;
            println!("{token}");
            return Ok(());
        }
        Some(Commands::Serve { port: Some(port) }) => config.port = port,
        Some(Commands::Serve { port: None }) | None => {}
    }

    info!(
        port = config.port,
        authenticated = config.secret.is_some(),
        heartbeat_timeout_secs = config.heartbeat_timeout_secs,
        "starting call relay"
    );

    let state = RelayState::new(&config);
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("call relay listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("relay server failed")?;
    Ok(())
}

use anyhow::{Context, Result, bail};
use clap::Parser;
use railtail::{Cli, Config, build_dialer, server};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli)?;
    let settings = match config.resolve() {
        Ok(settings) => settings,
        Err(errors) => {
            for e in &errors {
                error!(error = %e, "Configuration error");
            }
            bail!("{} configuration error(s) found", errors.len());
        }
    };

    info!(
        listen_addr = %settings.listen_addr,
        target_addr = %settings.target,
        mode = %settings.mode(),
        socks5_addr = settings.socks5_addr.as_deref().unwrap_or("none (host networking)"),
        insecure_skip_verify = settings.tls.insecure_skip_verify,
        "Starting railtail"
    );

    let listener = TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to address {}", settings.listen_addr))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let dialer = build_dialer(settings.socks5_addr.as_deref());
    server::run(listener, &settings, dialer, shutdown).await?;
    info!("Shutdown complete");
    Ok(())
}

use clap::Parser;
use mesh_relay::{
    app,
    cli::{self, Cli, Commands},
    Config, RelayState,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        identity,
        duration,
    }) = cli.command
    {
        if let Err(e) = cli::run_probe(url, identity, duration).await {
            error!("probe error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let config = Config::from_env();
    let addr = config.listen_addr();
    match config.fanout_delay {
        Some(delay) => info!("pairing peers {:?} after registration", delay),
        None => info!("pairing peers on ready"),
    }

    let state = RelayState::new(config);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    info!("mesh relay listening on {}", addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    };
    if let Err(e) = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("server error: {}", e);
        std::process::exit(1);
    }
}

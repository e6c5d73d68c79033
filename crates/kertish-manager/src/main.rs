use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kertish_manager::cli::{Cli, Command, ServeArgs};
use kertish_manager::{Manager, ManagerApi};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => {
            print!("{}", toml::to_string_pretty(&args.load()?)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.load()?;
    init_tracing(config.log_json);
    tracing::info!(bind = %config.bind_addr, "kertish manager starting");

    let manager = Manager::builder(config).build();
    let shutdown = CancellationToken::new();
    let loops = manager.start(shutdown.clone());
    let api = Arc::new(ManagerApi::new(manager));
    let api_handle = tokio::spawn(api.serve(shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
        res = api_handle => match res {
            Ok(Err(e)) => tracing::error!(error = %e, "API server stopped"),
            Err(e) => tracing::error!(error = %e, "API task panicked"),
            Ok(Ok(())) => {}
        },
    }
    shutdown.cancel();
    if let Err(e) = loops.await {
        tracing::error!(error = %e, "background loops panicked");
    }
    Ok(())
}

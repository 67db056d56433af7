use std::path::Path;

use nitewatch::config::Config;
use nitewatch::service::Service;

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("worker") => {}
        _ => {
            eprintln!("usage: nitewatch worker");
            std::process::exit(1);
        }
    }

    // Run the async main
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting Nitewatch custody guard");

    let config_path =
        std::env::var("NITEWATCH_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = Config::load(Path::new(&config_path))?;
    tracing::info!(
        config = %config_path,
        rpc_url = %config.blockchain.rpc_url,
        contract_address = %config.blockchain.contract_address,
        "Configuration loaded"
    );

    let service = Service::new(config).await?;
    service.run().await?;

    tracing::info!("Nitewatch stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nitewatch=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    // RUST_LOG=debug para mais detalhes, ou RUST_LOG=pairlink_signaling=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    info!("PairLink Display v{}", env!("CARGO_PKG_VERSION"));

    // Loop principal até Ctrl-C
    match app::run().await {
        Ok(()) => {
            info!("PairLink Display exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}

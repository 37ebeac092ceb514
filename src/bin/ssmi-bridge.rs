// ABOUTME: Process entry point: parses options, installs logging and supervises the bridge
// ABOUTME: Exits non-zero when startup fails or reconnects are exhausted; ctrl-c shuts down cleanly

use ssmi_bridge::bridge::supervise;
use ssmi_bridge::broker::AmqpBroker;
use ssmi_bridge::config::{BridgeConfig, Options};
use ssmi_bridge::ssmi::SsmiConnector;
use tokio::sync::watch;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> ssmi_bridge::Result<()> {
    let options: Options = argh::from_env();

    let level = if options.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = BridgeConfig::try_from(options).inspect_err(|e| error!("{e}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for ctrl-c");
            // Keep the sender alive; dropping it would read as a shutdown.
            std::future::pending::<()>().await;
        }
        info!("Interrupted, shutting down");
        let _ = shutdown_tx.send(true);
    });

    let broker = AmqpBroker::new();
    if let Err(e) = supervise(&broker, &SsmiConnector, &config, shutdown_rx).await {
        error!(error = %e, "Bridge terminated");
        return Err(e.into());
    }

    info!("Bridge shut down");
    Ok(())
}

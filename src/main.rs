use paylink::transport::{RadioAdapter, SimulatedRadio};
use paylink::{ConnectionManager, ConnectionResult, DeviceRecord, LinkConfig};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_TARGET: &str = "Kozen";
const SIM_DEVICE_ADDRESS: &str = "00:00:00:00:00:01";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let target = std::env::var("PAYLINK_TARGET").unwrap_or_else(|_| DEFAULT_TARGET.into());
    let config = LinkConfig::default();

    info!("Payment link starting");
    info!("  Target: {}", target);

    match std::env::var("PAYLINK_SIM_ENDPOINT") {
        Ok(endpoint) => {
            info!("  Radio: simulated terminal at {}", endpoint);
            let device = DeviceRecord::new(SIM_DEVICE_ADDRESS, Some(format!("{} (simulated)", target)));
            let radio = Arc::new(SimulatedRadio::new().with_device(device, endpoint));
            run(radio, config, &target).await
        }
        Err(_) => run_bluez(config, &target).await,
    }
}

#[cfg(feature = "bluez")]
async fn run_bluez(config: LinkConfig, target: &str) -> anyhow::Result<()> {
    use paylink::transport::{BluezRadio, RfcommConfig};

    let radio = BluezRadio::open(RfcommConfig::default()).await?;
    info!("  Radio: BlueZ RFCOMM");
    run(Arc::new(radio), config, target).await
}

#[cfg(not(feature = "bluez"))]
async fn run_bluez(_config: LinkConfig, _target: &str) -> anyhow::Result<()> {
    anyhow::bail!("built without BlueZ support; set PAYLINK_SIM_ENDPOINT to use a simulated terminal")
}

async fn run<R: RadioAdapter>(radio: Arc<R>, config: LinkConfig, target: &str) -> anyhow::Result<()> {
    let link = ConnectionManager::new(radio, config);

    // Spawn result and error loggers
    let mut results = link.subscribe_results();
    tokio::spawn(async move {
        loop {
            match results.recv().await {
                Ok(ConnectionResult::ConnectionEstablished) => info!("[LINK] Connected to terminal"),
                Ok(ConnectionResult::TransferSucceeded(message)) => info!("[LINK] <- {}", message.text()),
                Ok(ConnectionResult::Error(reason)) => warn!("[LINK] Connection ended: {}", reason),
                Err(RecvError::Lagged(n)) => warn!("[LINK] Missed {} results", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut errors = link.subscribe_errors();
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(e) => error!("[LINK] {}", e),
                Err(RecvError::Lagged(n)) => warn!("[LINK] Missed {} errors", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    link.start_scan(target).await?;

    // Each stdin line is one command
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => line,
                None => break,
            },
        };

        // A reply may never come; Ctrl-C still shuts down
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            reply = link.send_command(&line) => match reply {
                Ok(reply) => println!("{}", reply.text()),
                Err(e) => warn!("Command failed: {}", e),
            },
        }
    }

    info!("Shutting down");
    link.release().await;
    Ok(())
}

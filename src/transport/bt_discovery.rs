//! Bluetooth device discovery through BlueZ

use anyhow::Result;
use bluer::{Adapter, AdapterEvent, Device};
use futures::StreamExt;
use paylink_shared::DeviceRecord;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Get a powered Bluetooth adapter, by name or the default one
pub async fn get_adapter(name: Option<&str>) -> Result<Adapter> {
    let session = bluer::Session::new().await?;
    let adapter = match name {
        Some(name) => session.adapter(name)?,
        None => session.default_adapter().await?,
    };
    adapter.set_powered(true).await?;
    Ok(adapter)
}

/// Build a record from what BlueZ knows about a device
pub async fn device_record(device: &Device) -> DeviceRecord {
    DeviceRecord {
        address: device.address().to_string(),
        display_name: device.name().await.ok().flatten(),
        bonded: device.is_paired().await.unwrap_or(false),
    }
}

/// List devices paired with the adapter
pub async fn bonded_devices(adapter: &Adapter) -> Result<Vec<DeviceRecord>> {
    let mut bonded = Vec::new();
    for addr in adapter.device_addresses().await? {
        let device = adapter.device(addr)?;
        if device.is_paired().await? {
            bonded.push(device_record(&device).await);
        }
    }
    Ok(bonded)
}

/// Run discovery until cancelled, forwarding every added device to `found`.
///
/// Whether the BlueZ session opened is reported once on `started`.
pub async fn run_discovery(
    adapter: Adapter,
    found: broadcast::Sender<DeviceRecord>,
    cancel: CancellationToken,
    started: oneshot::Sender<Result<()>>,
) {
    let discover = match adapter.discover_devices().await {
        Ok(discover) => discover,
        Err(e) => {
            let _ = started.send(Err(e.into()));
            return;
        }
    };
    tokio::pin!(discover);
    info!("[BT] Discovery started on {}", adapter.name());
    let _ = started.send(Ok(()));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            evt = discover.next() => match evt {
                Some(AdapterEvent::DeviceAdded(addr)) => {
                    if let Ok(device) = adapter.device(addr) {
                        let record = device_record(&device).await;
                        debug!("[BT] Found {}", record);
                        let _ = found.send(record);
                    }
                }
                Some(_) => {}
                None => break,
            }
        }
    }

    // Dropping the stream ends the BlueZ discovery session
    info!("[BT] Discovery stopped");
}

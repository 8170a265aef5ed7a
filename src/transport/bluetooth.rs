//! BlueZ-backed radio using RFCOMM sockets

use crate::transport::bt_discovery;
use crate::transport::rfcomm::{RfcommConfig, RfcommConnector};
use crate::transport::traits::{Permission, RadioAdapter};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::{Adapter, Address};
use paylink_shared::{link::EVENT_CAPACITY, DeviceRecord};
use std::sync::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// The local Bluetooth adapter
pub struct BluezRadio {
    adapter: Adapter,
    config: RfcommConfig,
    discoveries: broadcast::Sender<DeviceRecord>,
    /// Cancels the running discovery task
    scan: Mutex<Option<CancellationToken>>,
}

impl BluezRadio {
    /// Open the configured adapter and power it on
    pub async fn open(config: RfcommConfig) -> Result<Self> {
        let adapter = bt_discovery::get_adapter(config.adapter_name.as_deref()).await?;
        let (discoveries, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            adapter,
            config,
            discoveries,
            scan: Mutex::new(None),
        })
    }

    fn take_scan(&self) -> Option<CancellationToken> {
        self.scan.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[async_trait]
impl RadioAdapter for BluezRadio {
    type Connector = RfcommConnector;

    async fn is_enabled(&self) -> bool {
        self.adapter.is_powered().await.unwrap_or(false)
    }

    /// BlueZ enforces access through D-Bus policy when the session opens,
    /// so an opened adapter may scan and connect.
    fn has_permission(&self, _permission: Permission) -> bool {
        true
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>> {
        bt_discovery::bonded_devices(&self.adapter).await
    }

    async fn start_scan(&self) -> Result<()> {
        if let Some(previous) = self.take_scan() {
            previous.cancel();
        }

        let cancel = CancellationToken::new();
        *self.scan.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel.clone());

        let (started, ready) = oneshot::channel();
        tokio::spawn(bt_discovery::run_discovery(
            self.adapter.clone(),
            self.discoveries.clone(),
            cancel,
            started,
        ));

        let result = ready
            .await
            .unwrap_or_else(|_| Err(anyhow!("discovery task ended before starting")));
        if let Err(e) = &result {
            warn!("[BT] Discovery failed: {}", e);
            self.take_scan();
        }
        result
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(cancel) = self.take_scan() {
            cancel.cancel();
        }
        Ok(())
    }

    fn discoveries(&self) -> broadcast::Receiver<DeviceRecord> {
        self.discoveries.subscribe()
    }

    fn socket_to(&self, address: &str, service: Uuid) -> Result<Self::Connector> {
        let address: Address = address.parse()?;
        Ok(RfcommConnector::new(
            self.adapter.clone(),
            address,
            self.config.channel,
            service,
        ))
    }
}

//! RFCOMM transport implementation for Bluetooth connections

use crate::transport::traits::{TransportConnector, TransportStream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr as RfcommAddr, Stream as RfcommStream};
use bluer::{Adapter, Address};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Default RFCOMM channel of the terminal's serial port service
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

/// RFCOMM stream wrapper implementing TransportStream
pub struct RfcommTransportStream {
    inner: RfcommStream,
    peer_addr: Address,
}

impl RfcommTransportStream {
    /// Create a new RFCOMM transport stream
    pub fn new(stream: RfcommStream, peer_addr: Address) -> Self {
        Self {
            inner: stream,
            peer_addr,
        }
    }
}

impl AsyncRead for RfcommTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RfcommTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl TransportStream for RfcommTransportStream {
    fn peer(&self) -> String {
        self.peer_addr.to_string()
    }
}

/// Configuration for the BlueZ radio
#[derive(Debug, Clone)]
pub struct RfcommConfig {
    /// Adapter name such as "hci0"; the default adapter if unset
    pub adapter_name: Option<String>,
    /// RFCOMM channel number
    pub channel: u8,
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            adapter_name: None,
            channel: DEFAULT_RFCOMM_CHANNEL,
        }
    }
}

/// RFCOMM connector for one terminal
pub struct RfcommConnector {
    adapter: Adapter,
    address: Address,
    channel: u8,
    service: Uuid,
}

impl RfcommConnector {
    /// Create a connector for a known address
    pub fn new(adapter: Adapter, address: Address, channel: u8, service: Uuid) -> Self {
        Self {
            adapter,
            address,
            channel,
            service,
        }
    }

    /// Whether BlueZ has seen the terminal publish our service record
    async fn advertises_service(&self) -> bool {
        let Ok(device) = self.adapter.device(self.address) else {
            return false;
        };
        match device.uuids().await {
            Ok(Some(uuids)) => uuids.contains(&self.service),
            _ => false,
        }
    }
}

#[async_trait]
impl TransportConnector for RfcommConnector {
    type Stream = RfcommTransportStream;

    async fn connect(&self) -> Result<Self::Stream> {
        if !self.advertises_service().await {
            warn!(
                "[BT] {} does not list service {}, trying channel {} anyway",
                self.address, self.service, self.channel
            );
        }

        let socket_addr = RfcommAddr::new(self.address, self.channel);
        info!("[BT] Connecting to {} channel {}", self.address, self.channel);

        let stream = RfcommStream::connect(socket_addr)
            .await
            .map_err(|e| anyhow!("RFCOMM connect failed: {}", e))?;

        info!("[BT] Connected to {}", self.address);
        Ok(RfcommTransportStream::new(stream, self.address))
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RfcommConfig::default();
        assert!(config.adapter_name.is_none());
        assert_eq!(config.channel, DEFAULT_RFCOMM_CHANNEL);
    }

    #[test]
    fn test_address_parsing() {
        let addr: Address = "00:11:22:33:44:55".parse().unwrap();
        assert_eq!(addr, Address::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]));
        assert!("not-an-address".parse::<Address>().is_err());
    }
}

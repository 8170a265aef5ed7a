//! Transport trait abstraction for pluggable radio backends

use anyhow::Result;
use async_trait::async_trait;
use paylink_shared::DeviceRecord;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A connected socket that can read and write bytes
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Human-readable peer identifier for logging
    fn peer(&self) -> String;
}

/// Factory for creating transport connections
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// The stream type this connector produces
    type Stream: TransportStream;

    /// Perform the socket handshake, returning a stream on success
    async fn connect(&self) -> Result<Self::Stream>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}

/// Capability a radio operation needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Scan,
    Connect,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Scan => write!(f, "scan"),
            Permission::Connect => write!(f, "connect"),
        }
    }
}

/// The platform radio as seen by the link.
///
/// Discovery results are delivered through [`discoveries`](Self::discoveries)
/// rather than returned from [`start_scan`](Self::start_scan), so a listener
/// registered once keeps receiving records across scans.
#[async_trait]
pub trait RadioAdapter: Send + Sync + 'static {
    /// Connector produced for a remote device
    type Connector: TransportConnector;

    /// Whether the adapter is powered
    async fn is_enabled(&self) -> bool;

    /// Whether the process may perform operations needing `permission`
    fn has_permission(&self, permission: Permission) -> bool;

    /// Devices paired at the platform level
    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// Start the platform scan
    async fn start_scan(&self) -> Result<()>;

    /// Stop the platform scan
    async fn stop_scan(&self) -> Result<()>;

    /// Register for discovery results, one record per discovered peripheral
    fn discoveries(&self) -> broadcast::Receiver<DeviceRecord>;

    /// Resolve a device address and service to an unconnected socket
    fn socket_to(&self, address: &str, service: Uuid) -> Result<Self::Connector>;
}

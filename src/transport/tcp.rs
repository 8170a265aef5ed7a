//! TCP simulation of the radio for development and tests
//!
//! Each simulated peripheral is a device record paired with a TCP endpoint
//! (typically a terminal emulator). Scans announce the peripherals marked
//! visible; connecting opens a plain TCP stream to the endpoint.

use crate::transport::traits::{Permission, RadioAdapter, TransportConnector, TransportStream};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use paylink_shared::{link::EVENT_CAPACITY, DeviceRecord};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
    peer: String,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream, peer: String) -> Self {
        Self {
            inner: stream,
            peer,
        }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
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

impl TransportStream for TcpTransportStream {
    fn peer(&self) -> String {
        self.peer.clone()
    }
}

/// TCP connector standing in for a radio socket
pub struct TcpConnector {
    /// Device address the socket was resolved for
    device: String,
    /// host:port of the emulated peripheral
    endpoint: String,
}

impl TcpConnector {
    /// Create a new TCP connector for a simulated device
    pub fn new(device: String, endpoint: String) -> Self {
        Self { device, endpoint }
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    type Stream = TcpTransportStream;

    async fn connect(&self) -> Result<Self::Stream> {
        let stream = TcpStream::connect(&self.endpoint).await?;
        Ok(TcpTransportStream::new(
            stream,
            format!("{} via {}", self.device, self.endpoint),
        ))
    }

    fn name(&self) -> &'static str {
        "TcpSimulation"
    }
}

/// One emulated peripheral
#[derive(Debug, Clone)]
struct SimulatedDevice {
    record: DeviceRecord,
    endpoint: String,
    /// Announced by scans
    visible: bool,
}

/// Radio whose peripherals are TCP endpoints
pub struct SimulatedRadio {
    devices: Mutex<Vec<SimulatedDevice>>,
    enabled: AtomicBool,
    scan_permission: AtomicBool,
    connect_permission: AtomicBool,
    scanning: AtomicBool,
    scan_fails: AtomicBool,
    discoveries: broadcast::Sender<DeviceRecord>,
}

impl SimulatedRadio {
    /// Create a powered radio with every permission granted and no devices
    pub fn new() -> Self {
        let (discoveries, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            devices: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
            scan_permission: AtomicBool::new(true),
            connect_permission: AtomicBool::new(true),
            scanning: AtomicBool::new(false),
            scan_fails: AtomicBool::new(false),
            discoveries,
        }
    }

    /// Add a peripheral that scans announce immediately
    pub fn with_device(self, record: DeviceRecord, endpoint: impl Into<String>) -> Self {
        self.add_device(record, endpoint, true);
        self
    }

    /// Add a peripheral; hidden ones only appear after [`advertise`](Self::advertise)
    pub fn add_device(&self, record: DeviceRecord, endpoint: impl Into<String>, visible: bool) {
        let mut devices = self.lock_devices();
        devices.retain(|d| d.record != record);
        devices.push(SimulatedDevice {
            record,
            endpoint: endpoint.into(),
            visible,
        });
    }

    /// Make a peripheral visible, announcing it if a scan is running.
    ///
    /// Returns `false` for unknown addresses.
    pub fn advertise(&self, address: &str) -> bool {
        let record = {
            let mut devices = self.lock_devices();
            let Some(device) = devices.iter_mut().find(|d| d.record.address == address) else {
                return false;
            };
            device.visible = true;
            device.record.clone()
        };
        if self.is_scanning() {
            debug!(address = %address, "simulated device advertising");
            let _ = self.discoveries.send(record);
        }
        true
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_permission(&self, permission: Permission, granted: bool) {
        match permission {
            Permission::Scan => self.scan_permission.store(granted, Ordering::SeqCst),
            Permission::Connect => self.connect_permission.store(granted, Ordering::SeqCst),
        }
    }

    /// Make the platform refuse to start scans
    pub fn set_scan_fails(&self, fails: bool) {
        self.scan_fails.store(fails, Ordering::SeqCst);
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn lock_devices(&self) -> std::sync::MutexGuard<'_, Vec<SimulatedDevice>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioAdapter for SimulatedRadio {
    type Connector = TcpConnector;

    async fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn has_permission(&self, permission: Permission) -> bool {
        match permission {
            Permission::Scan => self.scan_permission.load(Ordering::SeqCst),
            Permission::Connect => self.connect_permission.load(Ordering::SeqCst),
        }
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self
            .lock_devices()
            .iter()
            .filter(|d| d.record.bonded)
            .map(|d| d.record.clone())
            .collect())
    }

    async fn start_scan(&self) -> Result<()> {
        if self.scan_fails.load(Ordering::SeqCst) {
            return Err(anyhow!("discovery unavailable"));
        }
        self.scanning.store(true, Ordering::SeqCst);
        let visible: Vec<DeviceRecord> = self
            .lock_devices()
            .iter()
            .filter(|d| d.visible)
            .map(|d| d.record.clone())
            .collect();
        info!("[SIM] Scan started, {} device(s) visible", visible.len());
        for record in visible {
            let _ = self.discoveries.send(record);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if self.scanning.swap(false, Ordering::SeqCst) {
            info!("[SIM] Scan stopped");
        }
        Ok(())
    }

    fn discoveries(&self) -> broadcast::Receiver<DeviceRecord> {
        self.discoveries.subscribe()
    }

    fn socket_to(&self, address: &str, _service: Uuid) -> Result<Self::Connector> {
        let devices = self.lock_devices();
        let device = devices
            .iter()
            .find(|d| d.record.address == address)
            .ok_or_else(|| anyhow!("unknown device {}", address))?;
        Ok(TcpConnector::new(address.to_string(), device.endpoint.clone()))
    }
}

//! Connection manager owning the link lifecycle and the live channel

use crate::connection::surface::EventSurface;
use crate::discovery::{DiscoverySession, ScanOutcome};
use crate::error::LinkError;
use crate::transfer::{ChannelConfig, ChannelEnd, TransferChannel, TransferEvent};
use crate::transport::{Permission, RadioAdapter, TransportConnector};
use anyhow::anyhow;
use paylink_shared::{
    codec,
    link::{EVENT_CAPACITY, SCAN_TIMEOUT_MS, SERVICE_UUID},
    state_machine::{ConnectionStateMachine, LinkEvent, TransitionResult},
    ConnectionResult, ConnectionState, DeviceRecord, Message,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Service record the terminal's serial port is published under
    pub service_uuid: Uuid,
    /// How long a scan-for-name waits for a match
    pub scan_timeout: Duration,
    /// Upper bound on the socket handshake
    pub connect_timeout: Option<Duration>,
    /// Upper bound on waiting for a command's reply
    pub response_timeout: Option<Duration>,
    /// Transfer channel settings
    pub channel: ChannelConfig,
    /// Capacity of the error and result streams
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: SERVICE_UUID,
            scan_timeout: Duration::from_millis(SCAN_TIMEOUT_MS),
            connect_timeout: Some(Duration::from_secs(15)),
            response_timeout: None,
            channel: ChannelConfig::default(),
            event_capacity: EVENT_CAPACITY,
        }
    }
}

/// The live channel and the task relaying its frames
struct ActiveChannel {
    id: u64,
    channel: Arc<TransferChannel>,
    relay: JoinHandle<()>,
}

impl ActiveChannel {
    async fn teardown(self) {
        self.relay.abort();
        self.channel.close().await;
    }
}

struct Inner<R: RadioAdapter> {
    config: LinkConfig,
    radio: Arc<R>,
    discovery: DiscoverySession<R>,
    surface: EventSurface,
    machine: SyncMutex<ConnectionStateMachine>,
    /// At most one live channel. Never held across a handshake.
    active: Mutex<Option<ActiveChannel>>,
    /// Held for a whole connect so attempts run one at a time
    connecting: Mutex<()>,
    /// Cancels the handshake in flight, tagged with its attempt id
    pending: SyncMutex<Option<(u64, CancellationToken)>>,
    next_channel_id: AtomicU64,
    released: CancellationToken,
}

/// Sole owner of the connection state and the live transfer channel.
///
/// Cheap to clone; every clone drives the same link. Results, errors, state
/// and device sets are published as streams rather than callbacks.
pub struct ConnectionManager<R: RadioAdapter> {
    inner: Arc<Inner<R>>,
}

impl<R: RadioAdapter> Clone for ConnectionManager<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: RadioAdapter> ConnectionManager<R> {
    /// Create a manager for `radio`. Must be called within a runtime.
    pub fn new(radio: Arc<R>, config: LinkConfig) -> Self {
        let surface = EventSurface::new(config.event_capacity);
        let discovery = DiscoverySession::new(radio.clone());

        Self {
            inner: Arc::new(Inner {
                config,
                radio,
                discovery,
                surface,
                machine: SyncMutex::new(ConnectionStateMachine::new()),
                active: Mutex::new(None),
                connecting: Mutex::new(()),
                pending: SyncMutex::new(None),
                next_channel_id: AtomicU64::new(0),
                released: CancellationToken::new(),
            }),
        }
    }

    /// Scan for a device whose name contains `target` and connect to it.
    ///
    /// The scan runs in the background. On timeout the error stream carries
    /// [`LinkError::ScanTimeout`] and the state returns to idle.
    pub async fn start_scan(&self, target: &str) -> Result<(), LinkError> {
        self.inner.ensure_live()?;

        let scan = self
            .inner
            .discovery
            .scan_for_name(target, self.inner.config.scan_timeout)
            .await
            .map_err(|e| self.inner.fail(e))?;
        self.inner.transition(LinkEvent::ScanStarted);

        let manager = self.clone();
        tokio::spawn(async move {
            let target = scan.target().to_string();
            match scan.outcome().await {
                ScanOutcome::Matched(device) => {
                    info!(device = %device, "Found target device");
                    manager.inner.discovery.stop_discovery().await;
                    manager.inner.transition(LinkEvent::ScanStopped);
                    // Failures are already on the error stream
                    let _ = manager.connect(&device).await;
                }
                ScanOutcome::TimedOut => {
                    manager.inner.discovery.stop_discovery().await;
                    manager.inner.transition(LinkEvent::ScanTimedOut);
                    manager.inner.fail(LinkError::ScanTimeout(target));
                }
                ScanOutcome::Cancelled => {
                    debug!(target = %target, "scan cancelled");
                }
            }
        });
        Ok(())
    }

    /// Start an open-ended scan filling the scanned device set
    pub async fn start_discovery(&self) -> Result<(), LinkError> {
        self.inner.ensure_live()?;
        self.inner
            .discovery
            .start_discovery()
            .await
            .map_err(|e| self.inner.fail(e))?;
        self.inner.transition(LinkEvent::ScanStarted);
        Ok(())
    }

    /// Stop scanning and cancel any pending scan-for-name
    pub async fn stop_discovery(&self) {
        self.inner.discovery.stop_discovery().await;
        self.inner.transition(LinkEvent::ScanStopped);
    }

    /// Re-read the radio's bonded devices into the paired set
    pub async fn refresh_paired_devices(&self) -> Vec<DeviceRecord> {
        self.inner.discovery.refresh_paired().await
    }

    /// Open a channel to `device`, replacing any current connection.
    ///
    /// The returned receiver is subscribed before `ConnectionEstablished` is
    /// published, so it sees the whole life of the new connection.
    pub async fn connect(
        &self,
        device: &DeviceRecord,
    ) -> Result<broadcast::Receiver<ConnectionResult>, LinkError> {
        let inner = &self.inner;
        inner.ensure_live()?;

        if !inner.radio.has_permission(Permission::Connect) {
            return Err(inner.fail(LinkError::PermissionDenied(Permission::Connect)));
        }
        if !inner.radio.is_enabled().await {
            return Err(inner.fail(LinkError::AdapterDisabled));
        }

        let connector = inner
            .radio
            .socket_to(&device.address, inner.config.service_uuid)
            .map_err(|e| inner.fail(LinkError::SocketCreationFailed(e.to_string())))?;

        inner.discovery.stop_discovery().await;
        let results = inner.surface.subscribe_results();

        // A newer attempt supersedes one still shaking hands
        let id = inner.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        let attempt = CancellationToken::new();
        if let Some((_, previous)) = inner.replace_pending(Some((id, attempt.clone()))) {
            previous.cancel();
        }
        let _serial = inner.connecting.lock().await;

        let previous = inner.active.lock().await.take();
        if let Some(previous) = previous {
            info!(peer = %previous.channel.peer(), "Closing previous connection");
            previous.teardown().await;
            inner.surface.set_connected(false);
        }

        if attempt.is_cancelled() {
            inner.clear_pending(id);
            inner.transition(LinkEvent::CloseRequested);
            return Err(LinkError::ConnectFailed("connection attempt cancelled".into()));
        }

        inner.transition(LinkEvent::ConnectRequested);
        info!(device = %device, transport = connector.name(), "Connecting");

        let handshake = async {
            match inner.config.connect_timeout {
                Some(limit) => match timeout(limit, connector.connect()).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("timed out after {:?}", limit)),
                },
                None => connector.connect().await,
            }
        };

        let stream = tokio::select! {
            biased;
            _ = inner.released.cancelled() => {
                inner.clear_pending(id);
                return Err(LinkError::Released);
            }
            _ = attempt.cancelled() => {
                // Closed or superseded; a superseding connect moves back to
                // Connecting once it holds the serial lock
                inner.clear_pending(id);
                inner.transition(LinkEvent::CloseRequested);
                return Err(LinkError::ConnectFailed("connection attempt cancelled".into()));
            }
            result = handshake => result,
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                inner.clear_pending(id);
                inner.transition(LinkEvent::ConnectFailed);
                let error = LinkError::ConnectFailed(e.to_string());
                inner.surface.report_connection_error(&error);
                return Err(error);
            }
        };

        let mut active = inner.active.lock().await;
        inner.clear_pending(id);
        if inner.released.is_cancelled() {
            return Err(LinkError::Released);
        }
        if attempt.is_cancelled() {
            inner.transition(LinkEvent::CloseRequested);
            return Err(LinkError::ConnectFailed("connection attempt cancelled".into()));
        }

        inner.transition(LinkEvent::Established);
        inner.surface.publish_result(ConnectionResult::ConnectionEstablished);

        let channel = Arc::new(TransferChannel::new(stream, inner.config.channel.clone()));
        let relay = tokio::spawn(relay_frames(
            Arc::downgrade(inner),
            id,
            channel.subscribe(),
        ));
        info!(peer = %channel.peer(), "Connected");

        *active = Some(ActiveChannel {
            id,
            channel: channel.clone(),
            relay,
        });
        inner.surface.set_connected(true);
        channel.start();

        Ok(results)
    }

    /// Send one command and wait for the next frame from the terminal.
    ///
    /// Replies are matched by arrival order only: whatever frame arrives
    /// first after the write is taken as the reply.
    pub async fn send_command(&self, text: &str) -> Result<Message, LinkError> {
        let inner = &self.inner;
        inner.ensure_live()?;

        if !inner.radio.has_permission(Permission::Connect) {
            return Err(inner.fail(LinkError::PermissionDenied(Permission::Connect)));
        }

        let channel = inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|active| active.channel.clone())
            .ok_or_else(|| inner.fail(LinkError::NotConnected))?;

        let command = Message::local(text);
        let mut events = channel.subscribe();
        if !channel.write(&codec::frame_command(command.text())).await {
            return Err(inner.fail(LinkError::WriteFailed));
        }
        debug!(command = %command.text().trim_end(), "command sent");

        let reply = async {
            loop {
                tokio::select! {
                    biased;
                    event = events.recv() => match event {
                        Ok(TransferEvent::Frame(message)) => return Ok(message),
                        // The relay reports the termination itself
                        Ok(TransferEvent::Terminated(_)) => return Err(LinkError::PeerClosed),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "reply wait lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(LinkError::PeerClosed)
                        }
                    },
                    _ = channel.closed() => return Err(LinkError::PeerClosed),
                }
            }
        };

        match inner.config.response_timeout {
            Some(limit) => match timeout(limit, reply).await {
                Ok(result) => result,
                Err(_) => Err(inner.fail(LinkError::ResponseTimeout)),
            },
            None => reply.await,
        }
    }

    /// Close the current connection, if any
    pub async fn close_connection(&self) {
        self.inner.close_connection().await;
    }

    /// Stop all background work and close the connection for good.
    ///
    /// Later operations fail with [`LinkError::Released`].
    pub async fn release(&self) {
        let inner = &self.inner;
        if inner.released.is_cancelled() {
            return;
        }
        inner.released.cancel();

        inner.discovery.release().await;
        inner.close_connection().await;
        inner.transition(LinkEvent::Released);
        info!("Link released");
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.surface.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.surface.is_connected()
    }

    pub fn scanned_devices(&self) -> Vec<DeviceRecord> {
        self.inner.discovery.scanned()
    }

    pub fn paired_devices(&self) -> Vec<DeviceRecord> {
        self.inner.discovery.paired()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.surface.watch_state()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.surface.watch_connected()
    }

    pub fn watch_scanned(&self) -> watch::Receiver<Vec<DeviceRecord>> {
        self.inner.discovery.watch_scanned()
    }

    pub fn watch_paired(&self) -> watch::Receiver<Vec<DeviceRecord>> {
        self.inner.discovery.watch_paired()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<LinkError> {
        self.inner.surface.subscribe_errors()
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<ConnectionResult> {
        self.inner.surface.subscribe_results()
    }
}

impl<R: RadioAdapter> Inner<R> {
    fn ensure_live(&self) -> Result<(), LinkError> {
        if self.released.is_cancelled() {
            return Err(self.fail(LinkError::Released));
        }
        Ok(())
    }

    /// Publish `error` on the error stream and hand it back for returning
    fn fail(&self, error: LinkError) -> LinkError {
        self.surface.report_error(&error);
        error
    }

    fn transition(&self, event: LinkEvent) -> bool {
        let result = self
            .machine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .process_event(event);

        match result {
            TransitionResult::Success(state) => {
                self.surface.set_state(state);
                true
            }
            TransitionResult::Invalid { from, event } => {
                debug!(state = ?from, event = ?event, "ignored transition");
                false
            }
        }
    }

    fn replace_pending(
        &self,
        next: Option<(u64, CancellationToken)>,
    ) -> Option<(u64, CancellationToken)> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *pending, next)
    }

    /// Forget attempt `id` unless a newer one has taken its place
    fn clear_pending(&self, id: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.as_ref().map(|(pending_id, _)| *pending_id) == Some(id) {
            *pending = None;
        }
    }

    async fn close_connection(&self) {
        if let Some((_, attempt)) = self.replace_pending(None) {
            info!("Cancelling connection attempt");
            attempt.cancel();
        }
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            let peer = previous.channel.peer().to_string();
            previous.teardown().await;
            info!(peer = %peer, "Connection closed");
        }
        self.surface.set_connected(false);
        self.transition(LinkEvent::CloseRequested);
    }

    /// The read loop of channel `id` stopped without being asked to
    async fn on_channel_ended(&self, id: u64, end: ChannelEnd) {
        let mut active = self.active.lock().await;
        if active.as_ref().map(|a| a.id) != Some(id) {
            return;
        }
        if let Some(ended) = active.take() {
            // Called from the relay task itself, so it is left to finish
            ended.channel.close().await;
        }
        drop(active);

        self.surface.set_connected(false);
        self.transition(LinkEvent::ChannelLost);

        let error = match end {
            ChannelEnd::PeerClosed => LinkError::PeerClosed,
            ChannelEnd::ReadFailed(reason) => LinkError::ReadFailed(reason),
        };
        self.surface.report_connection_error(&error);
    }
}

/// Republish a channel's frames as transfer results until it ends
async fn relay_frames<R: RadioAdapter>(
    inner: Weak<Inner<R>>,
    id: u64,
    mut events: broadcast::Receiver<TransferEvent>,
) {
    loop {
        match events.recv().await {
            Ok(TransferEvent::Frame(message)) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner
                    .surface
                    .publish_result(ConnectionResult::TransferSucceeded(message));
            }
            Ok(TransferEvent::Terminated(end)) => {
                if let Some(inner) = inner.upgrade() {
                    inner.on_channel_ended(id, end).await;
                }
                break;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "frame relay lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

//! Scan lifecycle and the device sets it produces

use crate::error::LinkError;
use crate::transport::{Permission, RadioAdapter};
use paylink_shared::{insert_unique, DeviceRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a scan-for-name ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// First device whose name contains the target
    Matched(DeviceRecord),
    /// Nothing matched before the deadline
    TimedOut,
    /// Superseded by another scan, stopped, or released
    Cancelled,
}

/// A pending scan-for-name
pub struct NameScan {
    target: String,
    deadline: Duration,
    scanned: watch::Receiver<Vec<DeviceRecord>>,
    cancel: CancellationToken,
}

impl NameScan {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Wait for the scan to end
    pub async fn outcome(mut self) -> ScanOutcome {
        let target = self.target.clone();
        let scanned = &mut self.scanned;
        let matched = async move {
            loop {
                let found = scanned
                    .borrow_and_update()
                    .iter()
                    .find(|d| d.matches_name(&target))
                    .cloned();
                if found.is_some() {
                    return found;
                }
                if scanned.changed().await.is_err() {
                    return None;
                }
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => ScanOutcome::Cancelled,
            result = timeout(self.deadline, matched) => match result {
                Ok(Some(device)) => ScanOutcome::Matched(device),
                Ok(None) => ScanOutcome::Cancelled,
                Err(_) => ScanOutcome::TimedOut,
            },
        }
    }
}

/// Drives the platform scan and owns the scanned and paired device sets.
///
/// A single pump task folds every discovery notification into the scanned
/// set, de-duplicated by address, for as long as the session lives.
pub struct DiscoverySession<R: RadioAdapter> {
    radio: Arc<R>,
    scanned: Arc<watch::Sender<Vec<DeviceRecord>>>,
    paired: watch::Sender<Vec<DeviceRecord>>,
    scanning: AtomicBool,
    pump: CancellationToken,
    active_scan: Mutex<Option<CancellationToken>>,
}

impl<R: RadioAdapter> DiscoverySession<R> {
    /// Register for discovery notifications. Must be called within a runtime.
    pub fn new(radio: Arc<R>) -> Self {
        let (scanned, _) = watch::channel(Vec::new());
        let scanned = Arc::new(scanned);
        let (paired, _) = watch::channel(Vec::new());
        let pump = CancellationToken::new();

        tokio::spawn(pump_discoveries(
            radio.discoveries(),
            scanned.clone(),
            pump.clone(),
        ));

        Self {
            radio,
            scanned,
            paired,
            scanning: AtomicBool::new(false),
            pump,
            active_scan: Mutex::new(None),
        }
    }

    /// Refresh the paired set, then start the platform scan
    pub async fn start_discovery(&self) -> Result<(), LinkError> {
        if !self.radio.is_enabled().await {
            return Err(LinkError::AdapterDisabled);
        }
        if !self.radio.has_permission(Permission::Scan) {
            return Err(LinkError::PermissionDenied(Permission::Scan));
        }

        self.refresh_paired().await;

        self.scanning.store(true, Ordering::SeqCst);
        if let Err(e) = self.radio.start_scan().await {
            self.scanning.store(false, Ordering::SeqCst);
            return Err(LinkError::ScanFailed(e.to_string()));
        }
        info!("Discovery started");
        Ok(())
    }

    /// Cancel any pending scan-for-name and stop the platform scan
    pub async fn stop_discovery(&self) {
        if let Some(cancel) = self.take_active_scan() {
            cancel.cancel();
        }
        if !self.scanning.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.radio.stop_scan().await {
            warn!(error = %e, "failed to stop discovery");
        }
        info!("Discovery stopped");
    }

    /// Start a fresh scan that resolves on the first device whose name
    /// contains `target`, case-insensitively.
    ///
    /// Any previous scan-for-name resolves as [`ScanOutcome::Cancelled`].
    pub async fn scan_for_name(
        &self,
        target: &str,
        deadline: Duration,
    ) -> Result<NameScan, LinkError> {
        if let Some(previous) = self.take_active_scan() {
            previous.cancel();
        }

        self.scanned.send_replace(Vec::new());
        let scanned = self.scanned.subscribe();
        self.start_discovery().await?;

        let cancel = CancellationToken::new();
        *self.active_scan.lock().unwrap_or_else(|e| e.into_inner()) = Some(cancel.clone());
        info!(target = %target, timeout = ?deadline, "Scanning for device");

        Ok(NameScan {
            target: target.to_string(),
            deadline,
            scanned,
            cancel,
        })
    }

    /// Replace the paired set with the radio's bonded list.
    ///
    /// The previous set is kept if the radio cannot be queried.
    pub async fn refresh_paired(&self) -> Vec<DeviceRecord> {
        match self.radio.bonded_devices().await {
            Ok(bonded) => {
                debug!(count = bonded.len(), "paired devices refreshed");
                self.paired.send_replace(bonded.clone());
                bonded
            }
            Err(e) => {
                warn!(error = %e, "failed to list paired devices");
                self.paired()
            }
        }
    }

    pub fn scanned(&self) -> Vec<DeviceRecord> {
        self.scanned.borrow().clone()
    }

    pub fn paired(&self) -> Vec<DeviceRecord> {
        self.paired.borrow().clone()
    }

    pub fn watch_scanned(&self) -> watch::Receiver<Vec<DeviceRecord>> {
        self.scanned.subscribe()
    }

    pub fn watch_paired(&self) -> watch::Receiver<Vec<DeviceRecord>> {
        self.paired.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Stop scanning and unregister from discovery notifications
    pub async fn release(&self) {
        self.stop_discovery().await;
        self.pump.cancel();
    }

    fn take_active_scan(&self) -> Option<CancellationToken> {
        self.active_scan.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

impl<R: RadioAdapter> Drop for DiscoverySession<R> {
    fn drop(&mut self) {
        self.pump.cancel();
    }
}

async fn pump_discoveries(
    mut found: broadcast::Receiver<DeviceRecord>,
    scanned: Arc<watch::Sender<Vec<DeviceRecord>>>,
    cancel: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            result = found.recv() => match result {
                Ok(record) => record,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "discovery notifications lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let address = record.address.clone();
        if scanned.send_if_modified(|devices| insert_unique(devices, record)) {
            debug!(address = %address, "device discovered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedRadio;

    const ENDPOINT: &str = "127.0.0.1:1";

    fn kozen() -> DeviceRecord {
        DeviceRecord::new("00:11:22:33:44:55", Some("Kozen P10".into()))
    }

    #[tokio::test]
    async fn test_discovery_dedupes_by_address() {
        let radio = Arc::new(
            SimulatedRadio::new()
                .with_device(kozen(), ENDPOINT)
                .with_device(DeviceRecord::new("66:77:88:99:AA:BB", None), ENDPOINT),
        );
        let session = DiscoverySession::new(radio.clone());
        let mut scanned = session.watch_scanned();

        session.start_discovery().await.unwrap();
        assert!(session.is_scanning());
        // A second announcement of the same device
        assert!(radio.advertise("00:11:22:33:44:55"));

        scanned.wait_for(|d| d.len() == 2).await.unwrap();
        tokio::task::yield_now().await;

        let devices = session.scanned();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].address, "00:11:22:33:44:55");
        assert_eq!(devices[1].address, "66:77:88:99:AA:BB");
    }

    #[tokio::test]
    async fn test_start_discovery_refreshes_paired() {
        let radio = Arc::new(SimulatedRadio::new().with_device(
            DeviceRecord::bonded("00:11:22:33:44:55", Some("Kozen P10".into())),
            ENDPOINT,
        ));
        let session = DiscoverySession::new(radio);

        session.start_discovery().await.unwrap();
        let paired = session.paired();
        assert_eq!(paired.len(), 1);
        assert!(paired[0].bonded);
    }

    #[tokio::test]
    async fn test_start_discovery_checks_radio() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = DiscoverySession::new(radio.clone());

        radio.set_permission(Permission::Scan, false);
        assert_eq!(
            session.start_discovery().await,
            Err(LinkError::PermissionDenied(Permission::Scan))
        );

        radio.set_enabled(false);
        assert_eq!(
            session.start_discovery().await,
            Err(LinkError::AdapterDisabled)
        );
        assert!(!session.is_scanning());
        assert!(!radio.is_scanning());
    }

    #[tokio::test]
    async fn test_platform_scan_failure_surfaces() {
        let radio = Arc::new(SimulatedRadio::new());
        radio.set_scan_fails(true);
        let session = DiscoverySession::new(radio);

        assert_eq!(
            session.start_discovery().await,
            Err(LinkError::ScanFailed("discovery unavailable".into()))
        );
        assert!(!session.is_scanning());
    }

    #[tokio::test]
    async fn test_stop_discovery_is_idempotent() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = DiscoverySession::new(radio.clone());

        session.stop_discovery().await;
        session.start_discovery().await.unwrap();
        session.stop_discovery().await;
        session.stop_discovery().await;
        assert!(!session.is_scanning());
        assert!(!radio.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_for_name_matches_late_device() {
        let radio = Arc::new(SimulatedRadio::new());
        radio.add_device(DeviceRecord::new("AA:AA:AA:AA:AA:AA", Some("Printer".into())), ENDPOINT, true);
        radio.add_device(kozen(), ENDPOINT, false);
        let session = DiscoverySession::new(radio.clone());

        let scan = session
            .scan_for_name("kozen", Duration::from_secs(10))
            .await
            .unwrap();
        let outcome = tokio::spawn(scan.outcome());

        tokio::time::sleep(Duration::from_secs(2)).await;
        radio.advertise("00:11:22:33:44:55");

        assert_eq!(outcome.await.unwrap(), ScanOutcome::Matched(kozen()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_for_name_times_out() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = DiscoverySession::new(radio);

        let scan = session
            .scan_for_name("Ghost", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(scan.target(), "Ghost");
        assert_eq!(scan.outcome().await, ScanOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_scan_cancels_previous() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = DiscoverySession::new(radio);

        let first = session
            .scan_for_name("Ghost", Duration::from_secs(10))
            .await
            .unwrap();
        let _second = session
            .scan_for_name("Kozen", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(first.outcome().await, ScanOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_scan() {
        let radio = Arc::new(SimulatedRadio::new());
        let session = DiscoverySession::new(radio);

        let scan = session
            .scan_for_name("Ghost", Duration::from_secs(10))
            .await
            .unwrap();
        session.stop_discovery().await;
        assert_eq!(scan.outcome().await, ScanOutcome::Cancelled);
    }
}

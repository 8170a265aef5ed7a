//! Observable streams published by the connection manager

use crate::error::LinkError;
use paylink_shared::{ConnectionResult, ConnectionState};
use tokio::sync::{broadcast, watch};
use tracing::warn;

/// Snapshots and event streams that observers subscribe to.
///
/// State and the connected flag are snapshots (late subscribers see the
/// current value); errors and results are events (late subscribers miss
/// what was already sent).
pub struct EventSurface {
    state: watch::Sender<ConnectionState>,
    connected: watch::Sender<bool>,
    errors: broadcast::Sender<LinkError>,
    results: broadcast::Sender<ConnectionResult>,
}

impl EventSurface {
    pub fn new(capacity: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (connected, _) = watch::channel(false);
        let (errors, _) = broadcast::channel(capacity.max(1));
        let (results, _) = broadcast::channel(capacity.max(1));
        Self {
            state,
            connected,
            errors,
            results,
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    pub fn publish_result(&self, result: ConnectionResult) {
        let _ = self.results.send(result);
    }

    /// Publish an error to the error stream
    pub fn report_error(&self, error: &LinkError) {
        warn!(error = %error, "link error");
        let _ = self.errors.send(error.clone());
    }

    /// Publish an error that ended a connection, on both streams
    pub fn report_connection_error(&self, error: &LinkError) {
        self.report_error(error);
        self.publish_result(ConnectionResult::Error(error.to_string()));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<LinkError> {
        self.errors.subscribe()
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<ConnectionResult> {
        self.results.subscribe()
    }
}

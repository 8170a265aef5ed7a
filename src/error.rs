//! Errors surfaced by the terminal link

use thiserror::Error;

use crate::transport::Permission;

/// Everything that can go wrong between the caller and the terminal.
///
/// The connection manager publishes each of these once on its error stream
/// and returns it to the immediate caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("no {0} permission for Bluetooth")]
    PermissionDenied(Permission),

    #[error("Bluetooth is turned off")]
    AdapterDisabled,

    #[error("failed to create socket: {0}")]
    SocketCreationFailed(String),

    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("error receiving data: {0}")]
    ReadFailed(String),

    #[error("terminal closed the connection")]
    PeerClosed,

    #[error("failed to send message")]
    WriteFailed,

    #[error("failed to start discovery: {0}")]
    ScanFailed(String),

    #[error("device named {0} not found")]
    ScanTimeout(String),

    #[error("not connected to a device")]
    NotConnected,

    #[error("no response from terminal")]
    ResponseTimeout,

    #[error("link has been released")]
    Released,
}

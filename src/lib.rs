//! Bluetooth payment-terminal link
//!
//! Finds a terminal by name, opens a serial socket to it and exchanges
//! newline-terminated JSON commands for brace-balanced JSON replies.

pub mod connection;
pub mod discovery;
pub mod error;
pub mod transfer;
pub mod transport;

pub use connection::{ConnectionManager, LinkConfig};
pub use error::LinkError;
pub use paylink_shared::{ConnectionResult, ConnectionState, DeviceRecord, Message};

//! Paylink Shared Types
//!
//! This crate provides the framing codec, the connection state machine and
//! the data model shared by every part of the terminal link. Nothing in here
//! performs I/O.

pub mod codec;
pub mod state_machine;

use std::fmt;
use std::hash::{Hash, Hasher};

pub use state_machine::ConnectionState;

/// Protocol parameters for the terminal link
pub mod link {
    use uuid::Uuid;

    /// Service record the payment terminal publishes its serial port under
    pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x27b7d1da_08c7_4505_a6d1_2459987e5e2d);

    /// How long a scan-for-name waits for a matching device
    pub const SCAN_TIMEOUT_MS: u64 = 10_000;

    /// Terminator appended to every outbound frame
    pub const FRAME_TERMINATOR: u8 = b'\n';

    /// Default capacity of the broadcast streams
    pub const EVENT_CAPACITY: usize = 64;
}

/// A peripheral seen by the radio, either bonded or discovered by a scan.
///
/// Two records are the same device when their addresses match, regardless
/// of name or bond state.
#[derive(Debug, Clone, Eq)]
pub struct DeviceRecord {
    /// Stable hardware identifier
    pub address: String,
    /// Advertised name, if the peripheral reported one
    pub display_name: Option<String>,
    /// Paired at the platform level
    pub bonded: bool,
}

impl DeviceRecord {
    /// Create a record for a discovered (not bonded) device
    pub fn new(address: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            address: address.into(),
            display_name,
            bonded: false,
        }
    }

    /// Create a record for a bonded device
    pub fn bonded(address: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            bonded: true,
            ..Self::new(address, display_name)
        }
    }

    /// Case-insensitive substring match on the advertised name.
    ///
    /// Devices without a name never match.
    pub fn matches_name(&self, target: &str) -> bool {
        match &self.display_name {
            Some(name) => name.to_lowercase().contains(&target.to_lowercase()),
            None => false,
        }
    }
}

impl PartialEq for DeviceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Hash for DeviceRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// Append `device` unless a record with the same address is already present.
///
/// The first-seen record keeps its position. Returns `true` if inserted.
pub fn insert_unique(devices: &mut Vec<DeviceRecord>, device: DeviceRecord) -> bool {
    if devices.contains(&device) {
        return false;
    }
    devices.push(device);
    true
}

/// Which side of the link produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A command about to be sent by this side
    Local,
    /// A frame received from the peripheral
    Remote,
}

/// One complete frame, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    text: String,
    origin: Origin,
}

impl Message {
    pub fn local(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: Origin::Local,
        }
    }

    pub fn remote(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: Origin::Remote,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_from_local(&self) -> bool {
        self.origin == Origin::Local
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

/// Events published to observers of a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionResult {
    /// The socket handshake succeeded
    ConnectionEstablished,
    /// A frame arrived from the peripheral
    TransferSucceeded(Message),
    /// The connection attempt or the live connection failed
    Error(String),
}

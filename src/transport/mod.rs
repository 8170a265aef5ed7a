#[cfg(feature = "bluez")]
pub mod bluetooth;
#[cfg(feature = "bluez")]
pub mod bt_discovery;
#[cfg(feature = "bluez")]
pub mod rfcomm;
pub mod tcp;
pub mod traits;

#[cfg(feature = "bluez")]
pub use bluetooth::BluezRadio;
#[cfg(feature = "bluez")]
pub use rfcomm::{RfcommConfig, RfcommConnector, RfcommTransportStream, DEFAULT_RFCOMM_CHANNEL};
pub use tcp::{SimulatedRadio, TcpConnector, TcpTransportStream};
pub use traits::{Permission, RadioAdapter, TransportConnector, TransportStream};

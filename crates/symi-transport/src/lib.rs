//! Symi Transport - Byte-stream links to the gateway
//!
//! Serial (115200-8N1) and TCP connections behind one [`Transport`] type.
//! The transport never reconnects by itself; a lost link surfaces as
//! [`TransportError::Disconnected`] for the owner to act on.

pub mod error;
pub mod transport;

pub use error::{Result, TransportError};
pub use transport::{
    list_serial_ports, BoxedStream, ByteStream, PortInfo, Transport, TransportConfig,
    DEFAULT_CONNECT_TIMEOUT_MS,
};

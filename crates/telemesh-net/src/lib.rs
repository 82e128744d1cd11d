//! Telemesh Network Layer
//!
//! Provides the wire-facing primitives of the overlay:
//! - LOB packet framing (length-prefixed object-plus-body)
//! - The `Transport` trait and the UDP transport
//! - NAT port mapping behind the `Gateway` trait

pub mod error;
pub mod lob;
pub mod nat;
pub mod transport;

pub use error::{NetError, NetResult};
pub use lob::{ChannelHeader, LocalAddr, Packet};
pub use nat::{Gateway, NatMapper};
pub use transport::{PathObject, Transport, UdpTransport, UdpTransportBuilder};

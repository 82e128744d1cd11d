//! Endpoint Events
//!
//! Lifecycle notifications published on the endpoint's broadcast bus.

use crate::hashname::Hashname;

/// An observable lifecycle event
#[derive(Clone, Debug)]
pub enum Event {
    /// An exchange completed its first accepted handshake
    ExchangeOpened { hashname: Hashname },

    /// An exchange reached a terminal state
    ExchangeClosed { hashname: Hashname, broken: bool },

    /// A channel was registered on an exchange
    ChannelOpened {
        hashname: Hashname,
        id: u32,
        typ: String,
    },

    /// A channel was unregistered from an exchange
    ChannelClosed {
        hashname: Hashname,
        id: u32,
        typ: String,
    },
}

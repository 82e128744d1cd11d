//! Telemesh Core Protocol
//!
//! Implements the core of the telemesh end-to-end encrypted overlay:
//! - Hashname identities and identity documents
//! - Exchanges (per-peer authenticated sessions) and their handshakes
//! - Reliable and unreliable channels multiplexed per exchange
//! - Endpoint registry and inbound dispatch
//! - Relay-assisted peer introduction

pub mod address_book;
pub mod broker;
pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod exchange;
pub mod hashname;
pub mod identity;
pub mod timers;

pub use address_book::AddressBook;
pub use broker::{CONNECT_TYPE, PEER_TYPE};
pub use channel::Channel;
pub use config::Config;
pub use endpoint::{Endpoint, EndpointStats, Listener};
pub use error::{CoreError, CoreResult};
pub use events::Event;
pub use exchange::{Exchange, ExchangeState};
pub use hashname::Hashname;
pub use identity::Identity;

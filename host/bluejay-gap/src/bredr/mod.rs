//! BR/EDR connection management
//!
//! The classic transport: paging and accepting connections, interrogating the peer, Secure
//! Simple Pairing (with the legacy PIN fallback), and the cooldown policy for peers the client
//! explicitly disconnected.

mod connection_manager;
mod discovery;
mod interrogation;
mod pairing;

pub use connection_manager::{BrEdrConnectionManager, BrEdrConnectionManagerSettings};
pub use discovery::{BrEdrDiscoveryManager, BrEdrDiscoverySession};
pub use interrogation::InterrogationResult;

//! LE connection management, discovery, and advertising
//!
//! The low energy transport: the scanner and its discovery sessions, the single use connector
//! with its 0x3E retry policy, the connection manager's scan→connect→interrogate→pair pipeline,
//! the advertiser flavors, and the local address policy.

mod address_manager;
mod advertiser;
mod connection_manager;
mod connector;
mod scanner;

pub use address_manager::LocalAddressManager;
pub use advertiser::{
    AdvertisementInstance, AdvertisingCommands, AdvertisingInterval, AdvertisingOptions,
    AndroidVendorAdvertisingCommands, ExtendedAdvertisingCommands, LegacyAdvertisingCommands,
    LowEnergyAdvertiser,
};
pub use connection_manager::{ConnectionOptions, LowEnergyConnectionManager};
pub use scanner::{DiscoverySession, LowEnergyScanner};

//! A Bluetooth host stack
//!
//! `bluejay` is the host side of Bluetooth: everything above the HCI transport and below the
//! profiles. The layers live in their own crates and this crate ties them together:
//!
//! - [`hci`]: the command channel, event demultiplexing, and the flow controlled data channels
//! - [`l2cap`]: fixed and dynamic channels, fragmentation, and the retransmission engines
//! - [`gap`]: the peer cache, connection managers for both transports, pairing, discovery,
//!   advertising, and the [`Adapter`] that boots it all
//!
//! # Getting started
//!
//! Build a [`Transport`] over a Controller driver, hand it to an [`AdapterBuilder`], and
//! initialize. With the `tokio` feature the [`h4`](hci::h4) driver binds the transport to any
//! async byte stream and [`pump::run_dispatcher`] drives the host clock:
//!
//! ```no_run
//! # async fn example(uart: tokio::io::DuplexStream) {
//! use bluejay::hci::h4::driver::new_h4_driver;
//! use bluejay::hci::transport::{DriverFeatures, Transport};
//! use bluejay::{Adapter, AdapterBuilder};
//!
//! let (driver, h4_pump) = new_h4_driver(DriverFeatures::default());
//!
//! let transport = Transport::new(Box::new(driver), bluejay::Dispatcher::new());
//!
//! let adapter = AdapterBuilder::new().local_name("bluejay").build(transport.clone());
//!
//! adapter.initialize(|result| log::info!("adapter up: {:?}", result));
//!
//! let local = tokio::task::LocalSet::new();
//!
//! local.spawn_local(async move { h4_pump.run(uart, &transport).await });
//! local.spawn_local(async move { bluejay::pump::run_dispatcher(adapter.dispatcher()).await });
//!
//! local.await;
//! # }
//! ```
//!
//! [`Transport`]: hci::transport::Transport

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use bluejay_core::dispatch::Dispatcher;
pub use bluejay_core::errors::{Error, HostError};
pub use bluejay_core::security::SecurityLevel;
pub use bluejay_core::{AddressKind, BluetoothDeviceAddress, DeviceAddress};

pub use bluejay_gap as gap;
pub use bluejay_hci as hci;
pub use bluejay_l2cap as l2cap;

pub use bluejay_gap::{Adapter, AdapterBuilder, PeerId};

/// Drives the host dispatcher from an async runtime
#[cfg(feature = "tokio")]
pub mod pump {
    use bluejay_core::dispatch::Dispatcher;
    use core::time::Duration;

    /// The longest the pump sleeps between polls
    const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Advance the dispatcher clock with wall time and run what becomes due
    ///
    /// Runs forever; spawn it on the same thread as everything else (a `LocalSet` on a current
    /// thread runtime).
    pub async fn run_dispatcher(dispatcher: Dispatcher) {
        let mut last = std::time::Instant::now();

        loop {
            let now = std::time::Instant::now();

            dispatcher.advance(now.duration_since(last));

            last = now;

            let sleep_for = dispatcher
                .next_deadline()
                .map(|deadline| deadline.saturating_sub(dispatcher.now()))
                .unwrap_or(MAX_POLL_INTERVAL)
                .min(MAX_POLL_INTERVAL)
                .max(Duration::from_millis(1));

            tokio::time::sleep(sleep_for).await;
        }
    }
}

//! BR/EDR discovery
//!
//! Inquiry uses the same session model as LE discovery: inquiry runs while at least one
//! [`BrEdrDiscoverySession`] is alive, re-issuing itself when an inquiry round completes, and
//! stops when the last session drops. Results (standard, with RSSI, and extended) update the
//! [`PeerCache`]; a name found in extended inquiry response data or through a later remote name
//! request lands on the peer.
//!
//! [`PeerCache`]: crate::peer::PeerCache

use crate::peer::{Peer, PeerCache};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use bluejay_core::DeviceAddress;
use bluejay_hci::command_channel::{CommandChannel, HandlerAction};
use bluejay_hci::commands::link_control::{Inquiry, InquiryCancel, GIAC};
use bluejay_hci::commands::CommandParameter;
use bluejay_hci::events::{Events, EventsData, InquiryResult};
use core::cell::RefCell;

/// Inquiry length in units of 1.28 s (about 10 seconds per round)
const INQUIRY_LENGTH: u8 = 0x08;

type ResultCallback = Box<dyn FnMut(&Peer)>;

struct State {
    command_channel: CommandChannel,
    cache: PeerCache,
    sessions: BTreeMap<u64, ResultCallback>,
    next_token: u64,
    inquiring: bool,
}

/// The BR/EDR discovery manager
#[derive(Clone)]
pub struct BrEdrDiscoveryManager {
    state: Rc<RefCell<State>>,
}

/// A live inquiry session
///
/// Dropping the session removes it; inquiry stops after the round in progress when nothing else
/// wants it.
pub struct BrEdrDiscoverySession {
    manager: Weak<RefCell<State>>,
    token: u64,
}

impl Drop for BrEdrDiscoverySession {
    fn drop(&mut self) {
        if let Some(state) = self.manager.upgrade() {
            let stop = {
                let mut borrowed = state.borrow_mut();

                borrowed.sessions.remove(&self.token);

                borrowed.sessions.is_empty() && borrowed.inquiring
            };

            if stop {
                let command_channel = state.borrow().command_channel.clone();

                command_channel.send_command(InquiryCancel.into_packet(), Box::new(|_| ()));

                state.borrow_mut().inquiring = false;
            }
        }
    }
}

impl BrEdrDiscoveryManager {
    pub fn new(command_channel: CommandChannel, cache: PeerCache) -> Self {
        let manager = BrEdrDiscoveryManager {
            state: Rc::new(RefCell::new(State {
                command_channel: command_channel.clone(),
                cache,
                sessions: BTreeMap::new(),
                next_token: 1,
                inquiring: false,
            })),
        };

        let events = [
            Events::InquiryResult,
            Events::InquiryResultWithRssi,
            Events::ExtendedInquiryResult,
            Events::InquiryComplete,
            Events::RemoteNameRequestComplete,
        ];

        // the handlers unregister themselves once the manager is gone
        for event in events {
            let weak = Rc::downgrade(&manager.state);

            command_channel.add_event_handler(event, move |data| match weak.upgrade() {
                Some(state) => {
                    on_event(&state, data);

                    HandlerAction::Continue
                }
                None => HandlerAction::Remove,
            });
        }

        manager
    }

    /// Start an inquiry session
    pub fn start_discovery(&self, callback: impl FnMut(&Peer) + 'static) -> BrEdrDiscoverySession {
        let (token, start) = {
            let mut state = self.state.borrow_mut();

            let token = state.next_token;

            state.next_token += 1;

            state.sessions.insert(token, Box::new(callback));

            let start = !state.inquiring;

            state.inquiring = true;

            (token, start)
        };

        if start {
            start_inquiry(&self.state);
        }

        BrEdrDiscoverySession {
            manager: Rc::downgrade(&self.state),
            token,
        }
    }
}

fn start_inquiry(state: &Rc<RefCell<State>>) {
    let command_channel = state.borrow().command_channel.clone();

    log::info!("(GAP) starting inquiry");

    command_channel.send_command_expect_status(
        Inquiry {
            lap: GIAC,
            inquiry_length: INQUIRY_LENGTH,
            num_responses: 0,
        }
        .into_packet(),
        Box::new(|_| ()),
    );
}

fn on_event(state: &Rc<RefCell<State>>, data: &EventsData) {
    match data {
        EventsData::InquiryResult(results) | EventsData::InquiryResultWithRssi(results) => {
            for result in &results.results {
                record_result(state, result, None);
            }
        }
        EventsData::ExtendedInquiryResult(extended) => {
            let name = parse_eir_name(&extended.extended_inquiry_response);

            record_result(state, &extended.result, name);
        }
        EventsData::InquiryComplete(_) => {
            // inquiry rounds repeat while any session is alive
            let again = {
                let state = state.borrow();

                state.inquiring && !state.sessions.is_empty()
            };

            if again {
                start_inquiry(state);
            } else {
                state.borrow_mut().inquiring = false;
            }
        }
        EventsData::RemoteNameRequestComplete(complete) => {
            if complete.status.into_result().is_ok() && !complete.remote_name.is_empty() {
                let cache = state.borrow().cache.clone();

                cache.update_peer(DeviceAddress::bredr(complete.address), |peer| {
                    peer.name = Some(complete.remote_name.clone());
                });
            }
        }
        _ => {}
    }
}

fn record_result(state: &Rc<RefCell<State>>, result: &InquiryResult, name: Option<Vec<u8>>) {
    let cache = state.borrow().cache.clone();

    let peer_id = cache.update_peer(DeviceAddress::bredr(result.address), |peer| {
        peer.class_of_device = Some(result.class_of_device);
        peer.page_scan_repetition_mode = Some(result.page_scan_repetition_mode);
        peer.clock_offset = Some(result.clock_offset);

        if result.rssi.is_some() {
            peer.rssi = result.rssi;
        }

        if let Some(name) = name.clone() {
            peer.name = Some(name);
        }
    });

    let Some(peer) = cache.find_by_id(peer_id) else { return };

    // fan out with no manager borrow held
    let tokens: Vec<u64> = state.borrow().sessions.keys().copied().collect();

    for token in tokens {
        let callback = {
            let mut borrowed = state.borrow_mut();

            borrowed
                .sessions
                .get_mut(&token)
                .map(|callback| core::mem::replace(callback, Box::new(|_: &Peer| ())))
        };

        if let Some(mut callback) = callback {
            callback(&peer);

            let mut borrowed = state.borrow_mut();

            if let Some(slot) = borrowed.sessions.get_mut(&token) {
                *slot = callback;
            }
        }
    }
}

/// Pull the local name out of extended inquiry response data
fn parse_eir_name(mut eir: &[u8]) -> Option<Vec<u8>> {
    while eir.len() >= 2 {
        let length = eir[0] as usize;

        if length == 0 || eir[1..].len() < length {
            break;
        }

        let data_type = eir[1];
        let value = &eir[2..1 + length];

        // complete (0x09) or shortened (0x08) local name
        if data_type == 0x09 || data_type == 0x08 {
            return Some(value.to_vec());
        }

        eir = &eir[1 + length..];
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eir_name_extraction() {
        // flags structure then a complete local name
        let eir = [0x02, 0x01, 0x06, 0x05, 0x09, b't', b'e', b's', b't', 0x00];

        assert_eq!(Some(b"test".to_vec()), parse_eir_name(&eir));

        // zero terminator only
        assert_eq!(None, parse_eir_name(&[0x00, 0x00]));
    }

}

//! BR/EDR peer interrogation
//!
//! After the ACL link comes up the peer is interrogated before anything else uses the link: its
//! LMP version, its supported features, and every extended feature page it advertises. Failure
//! of any read fails the interrogation, which the connection manager treats as fatal for the
//! connection.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use bluejay_core::errors::HostError;
use bluejay_hci::command_channel::{CommandChannel, HandlerAction, HandlerId};
use bluejay_hci::commands::link_control::{
    ReadRemoteExtendedFeatures, ReadRemoteSupportedFeatures, ReadRemoteVersionInformation,
};
use bluejay_hci::commands::CommandParameter;
use bluejay_hci::events::{Events, EventsData};
use bluejay_hci::ConnectionHandle;
use core::cell::RefCell;

/// What interrogation learned about the peer
#[derive(Clone, Debug, Default)]
pub struct InterrogationResult {
    pub lmp_version: u8,
    pub manufacturer_name: u16,
    pub lmp_subversion: u16,
    pub lmp_features: [u8; 8],
    pub extended_features: Vec<[u8; 8]>,
}

impl InterrogationResult {
    /// Check if the peer supports Secure Simple Pairing (host side, extended page 1 bit 0)
    pub fn supports_secure_simple_pairing(&self) -> bool {
        self.extended_features
            .first()
            .map(|page| page[0] & 0x01 != 0)
            .unwrap_or(false)
    }
}

type Callback = Box<dyn FnOnce(Result<InterrogationResult, HostError>)>;

enum Step {
    Version,
    Features,
    ExtendedFeatures { next_page: u8, max_page: u8 },
}

struct State {
    handle: ConnectionHandle,
    step: Step,
    result: InterrogationResult,
    callback: Option<Callback>,
    handlers: Vec<HandlerId>,
    canceled: bool,
}

/// One interrogation of one peer
///
/// Dropping the interrogator cancels it; a canceled interrogation never invokes its callback.
pub(crate) struct Interrogator {
    command_channel: CommandChannel,
    state: Rc<RefCell<State>>,
}

impl Interrogator {
    /// Start interrogating the peer on `handle`
    pub(crate) fn start(
        command_channel: CommandChannel,
        handle: ConnectionHandle,
        callback: Callback,
    ) -> Self {
        let state = Rc::new(RefCell::new(State {
            handle,
            step: Step::Version,
            result: InterrogationResult::default(),
            callback: Some(callback),
            handlers: Vec::new(),
            canceled: false,
        }));

        let interrogator = Interrogator {
            command_channel,
            state,
        };

        interrogator.register_handlers();

        interrogator.send_next();

        interrogator
    }

    fn register_handlers(&self) {
        let events = [
            Events::ReadRemoteVersionInformationComplete,
            Events::ReadRemoteSupportedFeaturesComplete,
            Events::ReadRemoteExtendedFeaturesComplete,
        ];

        for event in events {
            let weak = Rc::downgrade(&self.state);
            let command_channel = self.command_channel.clone();

            let id = self.command_channel.add_event_handler(event, move |data| {
                match weak.upgrade() {
                    Some(state) => {
                        on_event(&command_channel, &state, data);

                        HandlerAction::Continue
                    }
                    None => HandlerAction::Remove,
                }
            });

            self.state.borrow_mut().handlers.push(id);
        }
    }

    fn send_next(&self) {
        let (handle, step_command) = {
            let state = self.state.borrow();

            let command = match state.step {
                Step::Version => ReadRemoteVersionInformation {
                    connection_handle: state.handle,
                }
                .into_packet(),
                Step::Features => ReadRemoteSupportedFeatures {
                    connection_handle: state.handle,
                }
                .into_packet(),
                Step::ExtendedFeatures { next_page, .. } => ReadRemoteExtendedFeatures {
                    connection_handle: state.handle,
                    page_number: next_page,
                }
                .into_packet(),
            };

            (state.handle, command)
        };

        let weak = Rc::downgrade(&self.state);

        log::trace!("(GAP) interrogation command for handle {}", handle);

        self.command_channel.send_command_expect_status(
            step_command,
            Box::new(move |result| {
                if let Err(error) = result {
                    if let Some(state) = weak.upgrade() {
                        finish(&state, Err(error));
                    }
                }
            }),
        );
    }

    /// Abandon the interrogation without invoking the callback
    pub(crate) fn cancel(&self) {
        self.state.borrow_mut().canceled = true;
        self.state.borrow_mut().callback = None;
    }
}

impl Drop for Interrogator {
    fn drop(&mut self) {
        let handlers = core::mem::take(&mut self.state.borrow_mut().handlers);

        for id in handlers {
            self.command_channel.remove_event_handler(id);
        }
    }
}

fn on_event(command_channel: &CommandChannel, state: &Rc<RefCell<State>>, data: &EventsData) {
    let next = {
        let mut borrowed = state.borrow_mut();

        if borrowed.canceled || borrowed.callback.is_none() {
            return;
        }

        match data {
            EventsData::ReadRemoteVersionInformationComplete(complete) => {
                if complete.connection_handle != Some(borrowed.handle) {
                    return;
                }

                if let Err(status) = complete.status.into_result() {
                    drop(borrowed);

                    finish(state, Err(HostError::Protocol(status)));

                    return;
                }

                borrowed.result.lmp_version = complete.version;
                borrowed.result.manufacturer_name = complete.manufacturer_name;
                borrowed.result.lmp_subversion = complete.subversion;

                borrowed.step = Step::Features;

                true
            }
            EventsData::ReadRemoteSupportedFeaturesComplete(complete) => {
                if complete.connection_handle != Some(borrowed.handle) {
                    return;
                }

                if let Err(status) = complete.status.into_result() {
                    drop(borrowed);

                    finish(state, Err(HostError::Protocol(status)));

                    return;
                }

                borrowed.result.lmp_features = complete.lmp_features;

                // bit 63 of the LMP features: extended features exist
                if complete.lmp_features[7] & 0x80 != 0 {
                    borrowed.step = Step::ExtendedFeatures {
                        next_page: 1,
                        max_page: 1,
                    };

                    true
                } else {
                    drop(borrowed);

                    let result = state.borrow().result.clone();

                    finish(state, Ok(result));

                    return;
                }
            }
            EventsData::ReadRemoteExtendedFeaturesComplete(complete) => {
                if complete.connection_handle != Some(borrowed.handle) {
                    return;
                }

                if let Err(status) = complete.status.into_result() {
                    drop(borrowed);

                    finish(state, Err(HostError::Protocol(status)));

                    return;
                }

                borrowed.result.extended_features.push(complete.extended_lmp_features);

                let max_page = complete.maximum_page_number;

                if complete.page_number < max_page {
                    borrowed.step = Step::ExtendedFeatures {
                        next_page: complete.page_number + 1,
                        max_page,
                    };

                    true
                } else {
                    drop(borrowed);

                    let result = state.borrow().result.clone();

                    finish(state, Ok(result));

                    return;
                }
            }
            _ => return,
        }
    };

    if next {
        send_step(command_channel, state);
    }
}

fn send_step(command_channel: &CommandChannel, state: &Rc<RefCell<State>>) {
    let command = {
        let borrowed = state.borrow();

        match borrowed.step {
            Step::Version => ReadRemoteVersionInformation {
                connection_handle: borrowed.handle,
            }
            .into_packet(),
            Step::Features => ReadRemoteSupportedFeatures {
                connection_handle: borrowed.handle,
            }
            .into_packet(),
            Step::ExtendedFeatures { next_page, .. } => ReadRemoteExtendedFeatures {
                connection_handle: borrowed.handle,
                page_number: next_page,
            }
            .into_packet(),
        }
    };

    let weak = Rc::downgrade(state);

    command_channel.send_command_expect_status(
        command,
        Box::new(move |result| {
            if let Err(error) = result {
                if let Some(state) = weak.upgrade() {
                    finish(&state, Err(error));
                }
            }
        }),
    );
}

fn finish(state: &Rc<RefCell<State>>, result: Result<InterrogationResult, HostError>) {
    let callback = state.borrow_mut().callback.take();

    if let Some(callback) = callback {
        callback(result);
    }
}

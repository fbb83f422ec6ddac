//! The HCI command channel
//!
//! The command channel sends command packets to the Controller and correlates the Command
//! Complete / Command Status events coming back. Its contracts:
//!
//! - Commands with the same opcode are serialized: a second command with an opcode already in
//!   flight stays queued until the first completes. Commands with differing opcodes may overlap
//!   up to the Controller's `Num_HCI_Command_Packets` credit.
//! - A command normally completes on Command Complete. Callers expecting a long running command
//!   use [`send_command_expect_status`] so the callback fires on Command Status instead.
//! - Every issued command starts the [command timeout]. A Controller that fails to reply is
//!   unrecoverable, so expiry signals a fatal transport error and the channel ceases traffic.
//!
//! The channel is also the event handler registry. Handlers register per event; LE meta events
//! and Vendor Debug events dispatch through secondary tables keyed by their sub event code.
//!
//! [`send_command_expect_status`]: CommandChannel::send_command_expect_status
//! [command timeout]: COMMAND_TIMEOUT

use crate::commands::CommandPacket;
use crate::events::{Events, EventsData, LeMeta};
use crate::transport::{HciPacketType, TransportError, TransportShared};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BTreeSet, VecDeque};
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use bluejay_core::dispatch::TaskId;
use bluejay_core::errors::{Error, HostError};
use core::cell::RefCell;
use core::time::Duration;

/// The response time budget of a single HCI command
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(12);

/// The response to a completed command
#[derive(Clone, Debug)]
pub enum CommandResponse {
    /// The command finished with a Command Complete event
    Complete {
        /// The return parameter, starting with the status byte for commands that have one
        return_parameter: Vec<u8>,
    },
    /// The command was accepted with a Command Status event
    Status { status: Error },
}

impl CommandResponse {
    /// Get the status of the response
    ///
    /// For a Command Complete this is the first byte of the return parameter (success when the
    /// command returns nothing).
    pub fn status(&self) -> Error {
        match self {
            CommandResponse::Complete { return_parameter } => return_parameter
                .first()
                .copied()
                .map(Error::from_raw)
                .unwrap_or(Error::NoError),
            CommandResponse::Status { status } => *status,
        }
    }

    /// Get the return parameter of a Command Complete response
    pub fn return_parameter(&self) -> &[u8] {
        match self {
            CommandResponse::Complete { return_parameter } => return_parameter,
            CommandResponse::Status { .. } => &[],
        }
    }
}

/// Callback invoked with the response to a sent command
pub type CommandCallback = Box<dyn FnOnce(Result<CommandResponse, HostError>)>;

/// Whether an event handler stays registered after an invocation
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandlerAction {
    Continue,
    Remove,
}

/// Identifier of a registered event handler
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct HandlerId(u64);

type EventHandler = Box<dyn FnMut(&EventsData) -> HandlerAction>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Expectation {
    Complete,
    Status,
}

struct QueuedCommand {
    packet: CommandPacket,
    expectation: Expectation,
    callback: CommandCallback,
}

struct ActiveCommand {
    opcode: u16,
    expectation: Expectation,
    callback: CommandCallback,
    timeout: TaskId,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum HandlerKey {
    Event(u8),
    LeMeta(u8),
    VendorDebug(u8),
}

struct State {
    credits: usize,
    queue: VecDeque<QueuedCommand>,
    active: Vec<ActiveCommand>,
    handlers: BTreeMap<HandlerKey, Vec<(HandlerId, EventHandler)>>,
    /// Handlers removed while their table entry was checked out for dispatch
    deferred_removals: BTreeSet<HandlerId>,
    next_handler_id: u64,
}

impl State {
    /// Check if a queued command is currently blocked by an active command with its opcode
    fn is_opcode_active(&self, opcode: u16) -> bool {
        self.active.iter().any(|active| active.opcode == opcode)
    }
}

/// The HCI command channel
///
/// Cloning produces another handle to the same channel.
#[derive(Clone)]
pub struct CommandChannel {
    shared: Rc<TransportShared>,
    state: Rc<RefCell<State>>,
}

impl CommandChannel {
    pub(crate) fn new(shared: Rc<TransportShared>) -> Self {
        CommandChannel {
            shared,
            state: Rc::new(RefCell::new(State {
                // one command may be sent before the first credit update
                credits: 1,
                queue: VecDeque::new(),
                active: Vec::new(),
                handlers: BTreeMap::new(),
                deferred_removals: BTreeSet::new(),
                next_handler_id: 0,
            })),
        }
    }

    /// Send a command completing on Command Complete
    pub fn send_command(&self, packet: CommandPacket, callback: CommandCallback) {
        self.queue_command(packet, Expectation::Complete, callback)
    }

    /// Send a command completing on Command Status
    ///
    /// For the long running commands (Create Connection and friends) whose Command Complete
    /// equivalent is a dedicated completion event.
    pub fn send_command_expect_status(&self, packet: CommandPacket, callback: CommandCallback) {
        self.queue_command(packet, Expectation::Status, callback)
    }

    fn queue_command(&self, packet: CommandPacket, expectation: Expectation, callback: CommandCallback) {
        if self.shared.is_down() {
            let dispatcher = self.shared.dispatcher().clone();

            dispatcher.post(move || callback(Err(HostError::LinkError)));

            return;
        }

        self.state.borrow_mut().queue.push_back(QueuedCommand {
            packet,
            expectation,
            callback,
        });

        self.pump();
    }

    /// Send every queued command that credits and opcode serialization allow
    fn pump(&self) {
        loop {
            let sendable = {
                let mut state = self.state.borrow_mut();

                if state.credits == 0 {
                    break;
                }

                // take the first queued command whose opcode is not in flight; commands with the
                // same opcode stay in submission order because the queue is scanned from the front
                let position = state
                    .queue
                    .iter()
                    .position(|queued| !state.is_opcode_active(queued.packet.get_opcode().into_opcode()));

                let Some(position) = position else { break };

                let queued = state.queue.remove(position).unwrap();

                state.credits -= 1;

                queued
            };

            self.issue(sendable);
        }
    }

    fn issue(&self, queued: QueuedCommand) {
        let opcode = queued.packet.get_opcode().into_opcode();

        log::info!(r#"(HCI) sending command "{}""#, queued.packet.get_opcode());

        let weak = Rc::downgrade(&self.state);
        let shared = self.shared.clone();

        let timeout = self.shared.dispatcher().post_after(COMMAND_TIMEOUT, move || {
            command_timed_out(weak, shared, opcode)
        });

        self.state.borrow_mut().active.push(ActiveCommand {
            opcode,
            expectation: queued.expectation,
            callback: queued.callback,
            timeout,
        });

        self.shared.send(HciPacketType::Command, &queued.packet.to_bytes());
    }

    /// Register a handler for an event
    ///
    /// Registering for a `LeMeta` event keys the handler to the sub event. The Command Complete
    /// and Command Status events are consumed by the channel itself and cannot be handled.
    pub fn add_event_handler(
        &self,
        event: Events,
        handler: impl FnMut(&EventsData) -> HandlerAction + 'static,
    ) -> HandlerId {
        debug_assert!(
            !matches!(event, Events::CommandComplete | Events::CommandStatus),
            "the command response events are consumed by the command channel"
        );

        let key = match event {
            Events::LeMeta(sub_event) => HandlerKey::LeMeta(sub_event.get_sub_event_code()),
            other => HandlerKey::Event(other.get_event_code()),
        };

        self.insert_handler(key, Box::new(handler))
    }

    /// Register a handler for a Vendor Debug sub event
    ///
    /// Vendor Debug events (event code 0xFF) demultiplex on the first byte of their parameter.
    pub fn add_vendor_debug_handler(
        &self,
        sub_event_code: u8,
        handler: impl FnMut(&EventsData) -> HandlerAction + 'static,
    ) -> HandlerId {
        self.insert_handler(HandlerKey::VendorDebug(sub_event_code), Box::new(handler))
    }

    fn insert_handler(&self, key: HandlerKey, handler: EventHandler) -> HandlerId {
        let mut state = self.state.borrow_mut();

        let id = HandlerId(state.next_handler_id);

        state.next_handler_id += 1;

        state.handlers.entry(key).or_default().push((id, handler));

        id
    }

    /// Remove a registered event handler
    pub fn remove_event_handler(&self, id: HandlerId) {
        let mut state = self.state.borrow_mut();

        for handlers in state.handlers.values_mut() {
            if let Some(position) = handlers.iter().position(|(handler_id, _)| *handler_id == id) {
                handlers.remove(position);

                return;
            }
        }

        // the handler may be checked out for dispatch right now
        state.deferred_removals.insert(id);
    }

    /// Process an event from the Controller
    pub(crate) fn on_event(&self, data: &EventsData) {
        match data {
            EventsData::CommandComplete(complete) => {
                self.on_command_response(
                    complete.number_of_hci_command_packets,
                    complete.command_opcode,
                    |expectation| match expectation {
                        Expectation::Complete => Some(Ok(CommandResponse::Complete {
                            return_parameter: complete.return_parameter.clone(),
                        })),
                        Expectation::Status => None,
                    },
                );
            }
            EventsData::CommandStatus(status) => {
                self.on_command_response(
                    status.number_of_hci_command_packets,
                    status.command_opcode,
                    |expectation| match expectation {
                        Expectation::Status => Some(Ok(CommandResponse::Status { status: status.status })),
                        // a failure status terminates a command that was waiting for its
                        // Command Complete; a success status is an intermediate result
                        Expectation::Complete => (!status.status.is_ok())
                            .then(|| Err(HostError::Protocol(status.status))),
                    },
                );
            }
            data => self.dispatch_event(data),
        }
    }

    fn on_command_response(
        &self,
        credits: u8,
        opcode: Option<u16>,
        response: impl Fn(Expectation) -> Option<Result<CommandResponse, HostError>>,
    ) {
        let completed = {
            let mut state = self.state.borrow_mut();

            state.credits = credits as usize;

            opcode.and_then(|opcode| {
                let position = state.active.iter().position(|active| active.opcode == opcode);

                match position {
                    Some(position) => match response(state.active[position].expectation) {
                        Some(result) => {
                            let active = state.active.remove(position);

                            Some((active, result))
                        }
                        None => None,
                    },
                    None => {
                        log::warn!(
                            "(HCI) response for a command that was not sent (opcode {:#06x})",
                            opcode
                        );

                        None
                    }
                }
            })
        };

        if let Some((active, result)) = completed {
            self.shared.dispatcher().cancel(active.timeout);

            (active.callback)(result);
        }

        self.pump();
    }

    fn dispatch_event(&self, data: &EventsData) {
        let key = match data {
            EventsData::VendorDebug(vendor) => HandlerKey::VendorDebug(vendor.sub_event_code),
            data => match data.get_event() {
                Events::LeMeta(sub_event) => HandlerKey::LeMeta(sub_event.get_sub_event_code()),
                event => HandlerKey::Event(event.get_event_code()),
            },
        };

        // check the handler list out of the table so handlers may use the channel re-entrantly
        let checked_out = self.state.borrow_mut().handlers.remove(&key);

        let Some(handlers) = checked_out else {
            log::trace!("(HCI) no handler for event {}", data.get_event());

            return;
        };

        let mut kept = Vec::with_capacity(handlers.len());

        for (id, mut handler) in handlers {
            if self.state.borrow_mut().deferred_removals.remove(&id) {
                continue;
            }

            if handler(data) == HandlerAction::Continue {
                kept.push((id, handler));
            }
        }

        // handlers registered during dispatch landed in the table; they go after the survivors
        let mut state = self.state.borrow_mut();

        let slot = state.handlers.entry(key).or_default();

        kept.extend(slot.drain(..));

        *slot = kept;
    }
}

/// Fire the fatal timeout for a command that got no response
fn command_timed_out(state: Weak<RefCell<State>>, shared: Rc<TransportShared>, opcode: u16) {
    log::error!("(HCI) no response to command with opcode {:#06x}", opcode);

    let Some(state) = state.upgrade() else { return };

    let mut callbacks = Vec::new();

    {
        let mut state = state.borrow_mut();

        let mut timed_out = None;

        for active in core::mem::take(&mut state.active) {
            if active.opcode == opcode && timed_out.is_none() {
                timed_out = Some(active);
            } else {
                callbacks.push((active.callback, HostError::Canceled));
            }
        }

        if let Some(active) = timed_out {
            callbacks.push((active.callback, HostError::Timeout));
        }

        for queued in core::mem::take(&mut state.queue) {
            callbacks.push((queued.callback, HostError::Canceled));
        }

        state.credits = 0;
    }

    shared.signal_error(TransportError::CommandTimeout);

    for (callback, error) in callbacks {
        callback(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::controller_baseband::{Reset, SetEventMask};
    use crate::commands::info_params::ReadBdAddr;
    use crate::commands::CommandParameter;
    use crate::transport::testing::RecordingDriver;
    use crate::transport::Transport;
    use bluejay_core::dispatch::Dispatcher;

    fn command_complete(opcode: u16, credits: u8, return_parameter: &[u8]) -> Vec<u8> {
        let mut packet = alloc::vec![0x0E, 3 + return_parameter.len() as u8, credits];

        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.extend_from_slice(return_parameter);

        packet
    }

    fn new_transport() -> (Transport, RecordingDriver, Dispatcher) {
        let dispatcher = Dispatcher::new();
        let driver = RecordingDriver::new();
        let transport = Transport::new(Box::new(driver.clone()), dispatcher.clone());

        (transport, driver, dispatcher)
    }

    #[test]
    fn same_opcode_commands_are_serialized() {
        let (transport, driver, dispatcher) = new_transport();
        let channel = transport.command_channel();

        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in 0..2 {
            let order = order.clone();

            channel.send_command(
                Reset.into_packet(),
                Box::new(move |_| order.borrow_mut().push(tag)),
            );
        }

        dispatcher.run_until_idle();

        // only the first reset went out
        assert_eq!(1, driver.sent_command_opcodes().len());

        transport.on_received_packet(
            HciPacketType::Event,
            &command_complete(0x0C03, 1, &[0x00]),
        );

        dispatcher.run_until_idle();

        assert_eq!(2, driver.sent_command_opcodes().len());
        assert_eq!(&[0], order.borrow().as_slice());

        transport.on_received_packet(
            HciPacketType::Event,
            &command_complete(0x0C03, 1, &[0x00]),
        );

        dispatcher.run_until_idle();

        // completion callbacks fired in submission order
        assert_eq!(&[0, 1], order.borrow().as_slice());
    }

    #[test]
    fn differing_opcodes_overlap_up_to_credits() {
        let (transport, driver, dispatcher) = new_transport();
        let channel = transport.command_channel();

        // grant two credits through a spontaneous credit update
        transport.on_received_packet(HciPacketType::Event, &command_complete(0, 2, &[]));

        channel.send_command(Reset.into_packet(), Box::new(|_| ()));
        channel.send_command(ReadBdAddr.into_packet(), Box::new(|_| ()));
        channel.send_command(SetEventMask::host_default().into_packet(), Box::new(|_| ()));

        dispatcher.run_until_idle();

        // two in flight, the third awaits a credit
        assert_eq!(2, driver.sent_command_opcodes().len());
    }

    #[test]
    fn command_timeout_is_fatal() {
        let (transport, driver, dispatcher) = new_transport();
        let channel = transport.command_channel();

        let result = Rc::new(RefCell::new(None));
        let errored = Rc::new(RefCell::new(false));

        let result_clone = result.clone();

        channel.send_command(
            Reset.into_packet(),
            Box::new(move |response| *result_clone.borrow_mut() = Some(response)),
        );

        let errored_clone = errored.clone();

        transport.set_error_callback(move |_| *errored_clone.borrow_mut() = true);

        dispatcher.advance(COMMAND_TIMEOUT);

        assert!(matches!(*result.borrow(), Some(Err(HostError::Timeout))));
        assert!(*errored.borrow());

        // the channel ceases traffic
        let before = driver.sent_command_opcodes().len();

        channel.send_command(ReadBdAddr.into_packet(), Box::new(|_| ()));

        dispatcher.run_until_idle();

        assert_eq!(before, driver.sent_command_opcodes().len());
    }

    #[test]
    fn status_failure_completes_a_complete_expectation() {
        let (transport, _driver, dispatcher) = new_transport();
        let channel = transport.command_channel();

        let result = Rc::new(RefCell::new(None));

        let result_clone = result.clone();

        channel.send_command(
            Reset.into_packet(),
            Box::new(move |response| *result_clone.borrow_mut() = Some(response)),
        );

        dispatcher.run_until_idle();

        // Command Status with a failure for a command expecting Command Complete
        let status_packet = [0x0F, 0x04, 0x0C, 0x01, 0x03, 0x0C];

        transport.on_received_packet(HciPacketType::Event, &status_packet);

        dispatcher.run_until_idle();

        assert!(matches!(
            *result.borrow(),
            Some(Err(HostError::Protocol(Error::CommandDisallowed)))
        ));
    }

    #[test]
    fn self_removing_handler() {
        let (transport, _driver, dispatcher) = new_transport();
        let channel = transport.command_channel();

        let hits = Rc::new(RefCell::new(0));

        let hits_clone = hits.clone();

        channel.add_event_handler(Events::RoleChange, move |_| {
            *hits_clone.borrow_mut() += 1;

            HandlerAction::Remove
        });

        let role_change = [0x12, 0x08, 0x00, 1, 2, 3, 4, 5, 6, 0x00];

        transport.on_received_packet(HciPacketType::Event, &role_change);
        transport.on_received_packet(HciPacketType::Event, &role_change);

        dispatcher.run_until_idle();

        assert_eq!(1, *hits.borrow());
    }
}

//! Sequential command execution
//!
//! A [`SequentialCommandRunner`] runs a batch of commands strictly one after another: the next
//! command is not sent until the previous one has completed successfully. Any failure
//! short-circuits the batch and surfaces the failing status through the terminal callback. The
//! adapter's initialization steps and the interrogators are built on this.

use crate::command_channel::{CommandChannel, CommandResponse};
use crate::commands::CommandPacket;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::rc::{Rc, Weak};
use bluejay_core::errors::HostError;
use core::cell::RefCell;

type StepCallback = Box<dyn FnOnce(&CommandResponse)>;
type TerminalCallback = Box<dyn FnOnce(Result<(), HostError>)>;

struct QueuedStep {
    packet: CommandPacket,
    expect_status: bool,
    callback: Option<StepCallback>,
}

struct Inner {
    queue: VecDeque<QueuedStep>,
    terminal: Option<TerminalCallback>,
    running: bool,
    /// Bumped by `cancel` so responses to an abandoned run are ignored
    run_token: u64,
}

/// Runs queued commands one at a time
///
/// Commands may be queued before and during a run. `run_commands` starts the run; the terminal
/// callback fires once, with `Ok` after the last queued command succeeds or with the first
/// failure.
pub struct SequentialCommandRunner {
    channel: CommandChannel,
    inner: Rc<RefCell<Inner>>,
}

impl SequentialCommandRunner {
    /// Create a new `SequentialCommandRunner` sending over `channel`
    pub fn new(channel: CommandChannel) -> Self {
        SequentialCommandRunner {
            channel,
            inner: Rc::new(RefCell::new(Inner {
                queue: VecDeque::new(),
                terminal: None,
                running: false,
                run_token: 0,
            })),
        }
    }

    /// Queue a command with no interest in its return parameter
    pub fn queue(&self, packet: CommandPacket) {
        self.inner.borrow_mut().queue.push_back(QueuedStep {
            packet,
            expect_status: false,
            callback: None,
        });
    }

    /// Queue a command with a callback for its successful response
    ///
    /// The callback only runs when the command succeeds; failures go to the terminal callback.
    pub fn queue_command(&self, packet: CommandPacket, callback: impl FnOnce(&CommandResponse) + 'static) {
        self.inner.borrow_mut().queue.push_back(QueuedStep {
            packet,
            expect_status: false,
            callback: Some(Box::new(callback)),
        });
    }

    /// Queue a command that completes on Command Status
    pub fn queue_command_expect_status(
        &self,
        packet: CommandPacket,
        callback: impl FnOnce(&CommandResponse) + 'static,
    ) {
        self.inner.borrow_mut().queue.push_back(QueuedStep {
            packet,
            expect_status: true,
            callback: Some(Box::new(callback)),
        });
    }

    /// Check if a run is in progress
    pub fn is_running(&self) -> bool {
        self.inner.borrow().running
    }

    /// Check if commands are queued
    pub fn has_queued_commands(&self) -> bool {
        !self.inner.borrow().queue.is_empty()
    }

    /// Run the queued commands
    ///
    /// # Panic
    /// A run must not already be in progress.
    pub fn run_commands(&self, terminal: impl FnOnce(Result<(), HostError>) + 'static) {
        {
            let mut inner = self.inner.borrow_mut();

            assert!(!inner.running, "a command sequence is already running");

            inner.running = true;
            inner.terminal = Some(Box::new(terminal));
        }

        Self::send_next(&self.channel, &self.inner);
    }

    /// Drop the remaining queued commands and suppress pending callbacks
    ///
    /// The response of a command already in flight is ignored. The terminal callback of a
    /// canceled run fires with [`HostError::Canceled`].
    pub fn cancel(&self) {
        let terminal = {
            let mut inner = self.inner.borrow_mut();

            inner.queue.clear();
            inner.run_token += 1;
            inner.running = false;

            inner.terminal.take()
        };

        if let Some(terminal) = terminal {
            terminal(Err(HostError::Canceled));
        }
    }

    fn send_next(channel: &CommandChannel, inner: &Rc<RefCell<Inner>>) {
        let step = {
            let mut borrowed = inner.borrow_mut();

            match borrowed.queue.pop_front() {
                Some(step) => step,
                None => {
                    borrowed.running = false;

                    let terminal = borrowed.terminal.take();

                    drop(borrowed);

                    if let Some(terminal) = terminal {
                        terminal(Ok(()));
                    }

                    return;
                }
            }
        };

        let token = inner.borrow().run_token;

        let weak = Rc::downgrade(inner);
        let channel_clone = channel.clone();

        let on_response = move |result: Result<CommandResponse, HostError>| {
            Self::on_step_response(channel_clone, weak, token, step.callback, result)
        };

        if step.expect_status {
            channel.send_command_expect_status(step.packet, Box::new(on_response));
        } else {
            channel.send_command(step.packet, Box::new(on_response));
        }
    }

    fn on_step_response(
        channel: CommandChannel,
        weak: Weak<RefCell<Inner>>,
        token: u64,
        callback: Option<StepCallback>,
        result: Result<CommandResponse, HostError>,
    ) {
        let Some(inner) = weak.upgrade() else { return };

        if inner.borrow().run_token != token {
            return;
        }

        let failure = match result {
            Ok(response) => match response.status().into_result() {
                Ok(()) => {
                    if let Some(callback) = callback {
                        callback(&response);
                    }

                    Self::send_next(&channel, &inner);

                    return;
                }
                Err(status) => HostError::Protocol(status),
            },
            Err(error) => error,
        };

        let terminal = {
            let mut borrowed = inner.borrow_mut();

            borrowed.queue.clear();
            borrowed.running = false;

            borrowed.terminal.take()
        };

        if let Some(terminal) = terminal {
            terminal(Err(failure));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::controller_baseband::{Reset, SetEventMask};
    use crate::commands::info_params::ReadBdAddr;
    use crate::commands::CommandParameter;
    use crate::transport::testing::RecordingDriver;
    use crate::transport::{HciPacketType, Transport};
    use bluejay_core::dispatch::Dispatcher;
    use bluejay_core::errors::Error;

    fn command_complete(opcode: u16, status: u8) -> Vec<u8> {
        let mut packet = alloc::vec![0x0E, 0x04, 0x01];

        packet.extend_from_slice(&opcode.to_le_bytes());
        packet.push(status);

        packet
    }

    #[test]
    fn runs_in_order_and_terminates_ok() {
        let dispatcher = Dispatcher::new();
        let driver = RecordingDriver::new();
        let transport = Transport::new(Box::new(driver.clone()), dispatcher.clone());

        let runner = SequentialCommandRunner::new(transport.command_channel());

        let done = Rc::new(RefCell::new(None));

        runner.queue(Reset.into_packet());
        runner.queue(ReadBdAddr.into_packet());

        let done_clone = done.clone();

        runner.run_commands(move |result| *done_clone.borrow_mut() = Some(result));

        dispatcher.run_until_idle();

        // strictly one at a time, even though two credits never were consumed
        assert_eq!(alloc::vec![0x0C03], driver.sent_command_opcodes());

        transport.on_received_packet(HciPacketType::Event, &command_complete(0x0C03, 0x00));

        dispatcher.run_until_idle();

        assert_eq!(alloc::vec![0x0C03, 0x1009], driver.sent_command_opcodes());
        assert_eq!(None, *done.borrow());

        let mut bd_addr_complete = alloc::vec![0x0E, 0x0A, 0x01, 0x09, 0x10, 0x00];

        bd_addr_complete.extend_from_slice(&[1, 2, 3, 4, 5, 6]);

        transport.on_received_packet(HciPacketType::Event, &bd_addr_complete);

        dispatcher.run_until_idle();

        assert_eq!(Some(Ok(())), *done.borrow());
    }

    #[test]
    fn failure_short_circuits() {
        let dispatcher = Dispatcher::new();
        let driver = RecordingDriver::new();
        let transport = Transport::new(Box::new(driver.clone()), dispatcher.clone());

        let runner = SequentialCommandRunner::new(transport.command_channel());

        let done = Rc::new(RefCell::new(None));
        let step_ran = Rc::new(RefCell::new(false));

        runner.queue(Reset.into_packet());

        let step_ran_clone = step_ran.clone();

        runner.queue_command(SetEventMask::host_default().into_packet(), move |_| {
            *step_ran_clone.borrow_mut() = true;
        });

        let done_clone = done.clone();

        runner.run_commands(move |result| *done_clone.borrow_mut() = Some(result));

        dispatcher.run_until_idle();

        transport.on_received_packet(HciPacketType::Event, &command_complete(0x0C03, 0x0C));

        dispatcher.run_until_idle();

        assert_eq!(
            Some(Err(HostError::Protocol(Error::CommandDisallowed))),
            *done.borrow()
        );

        // the queued second command never went out and its callback never ran
        assert_eq!(alloc::vec![0x0C03], driver.sent_command_opcodes());
        assert!(!*step_ran.borrow());
    }

    #[test]
    fn cancel_suppresses_in_flight_response() {
        let dispatcher = Dispatcher::new();
        let driver = RecordingDriver::new();
        let transport = Transport::new(Box::new(driver.clone()), dispatcher.clone());

        let runner = SequentialCommandRunner::new(transport.command_channel());

        let done = Rc::new(RefCell::new(None));

        runner.queue(Reset.into_packet());
        runner.queue(ReadBdAddr.into_packet());

        let done_clone = done.clone();

        runner.run_commands(move |result| *done_clone.borrow_mut() = Some(result));

        dispatcher.run_until_idle();

        runner.cancel();

        assert_eq!(Some(Err(HostError::Canceled)), *done.borrow());

        // the in-flight response arrives late and must not restart the run
        transport.on_received_packet(HciPacketType::Event, &command_complete(0x0C03, 0x00));

        dispatcher.run_until_idle();

        assert_eq!(alloc::vec![0x0C03], driver.sent_command_opcodes());
    }
}

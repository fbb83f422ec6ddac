//! The LE connector
//!
//! A connector drives exactly one connection attempt: confirm the target is advertising, issue
//! the create connection command, and hand the completed link back. It is single use; the
//! connection manager makes a fresh one per attempt sequence.
//!
//! The awkward part it encapsulates is status 0x3E, "Connection Failed To Be Established". The
//! link layer race behind it (the CONNECT_IND went out but no packet arrived within six
//! connection intervals) resolves on a retry most of the time, so the connector retries the
//! whole scan→connect sequence a bounded number of times with a short pause between attempts.

use crate::le::scanner::{LowEnergyScanner, WatchToken};
use crate::le::LocalAddressManager;
use alloc::boxed::Box;
use alloc::rc::Rc;
use bluejay_core::dispatch::{Dispatcher, TaskId};
use bluejay_core::errors::{Error, HostError};
use bluejay_core::DeviceAddress;
use bluejay_hci::command_channel::CommandChannel;
use bluejay_hci::commands::le::{
    ConnectionIntervalParameters, CreateConnection, CreateConnectionCancel,
    ExtendedCreateConnection, PhyConnectionParameters, PHY_1M, PHY_2M, PHY_CODED,
};
use bluejay_hci::commands::CommandParameter;
use bluejay_hci::events::LeConnectionCompleteData;
use bluejay_hci::ConnectionHandle;
use core::cell::RefCell;
use core::time::Duration;

/// Time budget of one non background connection request
pub const LE_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Pause between 0x3E retries
const RETRY_PAUSE: Duration = Duration::from_secs(2);

/// Total attempts before 0x3E is surfaced
const MAX_ATTEMPTS: u8 = 3;

/// Scan interval for initiation, in units of 0.625 ms
const INITIATOR_SCAN_INTERVAL: u16 = 0x0060;
const INITIATOR_SCAN_WINDOW: u16 = 0x0030;

fn default_intervals() -> ConnectionIntervalParameters {
    ConnectionIntervalParameters {
        interval_min: 0x0018, // 30 ms
        interval_max: 0x0028, // 50 ms
        max_latency: 0,
        supervision_timeout: 0x002A, // 420 ms
        min_ce_length: 0,
        max_ce_length: 0,
    }
}

type ResultCallback = Box<dyn FnOnce(Result<ConnectionHandle, HostError>)>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Idle,
    Scanning,
    Connecting,
    RetryPause,
    Canceling,
    Complete,
    Failed,
}

struct State {
    command_channel: CommandChannel,
    dispatcher: Dispatcher,
    scanner: LowEnergyScanner,
    address: LocalAddressManager,
    target: DeviceAddress,
    use_extended_commands: bool,
    use_identity_address: bool,
    auto_connect: bool,
    phase: Phase,
    attempts: u8,
    watch: Option<WatchToken>,
    request_timeout: Option<TaskId>,
    retry_task: Option<TaskId>,
    callback: Option<ResultCallback>,
}

/// A single connection attempt sequence
///
/// Cloning produces another handle to the same attempt.
#[derive(Clone)]
pub(crate) struct LowEnergyConnector {
    state: Rc<RefCell<State>>,
}

impl LowEnergyConnector {
    /// Create and start a connector
    ///
    /// `auto_connect` attempts run with no request timeout (background, indefinite scan).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        command_channel: CommandChannel,
        dispatcher: Dispatcher,
        scanner: LowEnergyScanner,
        address: LocalAddressManager,
        target: DeviceAddress,
        use_extended_commands: bool,
        use_identity_address: bool,
        auto_connect: bool,
        callback: ResultCallback,
    ) -> Self {
        let connector = LowEnergyConnector {
            state: Rc::new(RefCell::new(State {
                command_channel,
                dispatcher,
                scanner,
                address,
                target,
                use_extended_commands,
                use_identity_address,
                auto_connect,
                phase: Phase::Idle,
                attempts: 0,
                watch: None,
                request_timeout: None,
                retry_task: None,
                callback: Some(callback),
            })),
        };

        connector.state.borrow().address.checkout();

        if !auto_connect {
            let weak = Rc::downgrade(&connector.state);

            let timeout = connector
                .state
                .borrow()
                .dispatcher
                .post_after(LE_CONNECT_TIMEOUT, move || {
                    if let Some(state) = weak.upgrade() {
                        on_request_timeout(&state);
                    }
                });

            connector.state.borrow_mut().request_timeout = Some(timeout);
        }

        begin_attempt(&connector.state);

        connector
    }

    /// The connection manager routes LE connection complete events here
    ///
    /// Returns true when the event belonged to this connector.
    pub(crate) fn on_connection_complete(&self, complete: &LeConnectionCompleteData) -> bool {
        on_connection_complete(&self.state, complete)
    }

    /// Cancel the attempt
    ///
    /// While the create connection command is in flight this issues the cancel command and lets
    /// the synthetic completion event finish the state machine.
    pub(crate) fn cancel(&self) {
        let phase = self.state.borrow().phase;

        match phase {
            Phase::Scanning | Phase::RetryPause => {
                finish(&self.state, Err(HostError::Canceled));
            }
            Phase::Connecting => {
                {
                    self.state.borrow_mut().phase = Phase::Canceling;
                }

                let command_channel = self.state.borrow().command_channel.clone();

                command_channel.send_command(
                    CreateConnectionCancel.into_packet(),
                    Box::new(|_| ()),
                );
            }
            _ => {}
        }
    }

    /// Check if the attempt already ended
    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.state.borrow().phase, Phase::Complete | Phase::Failed)
    }
}

/// One pass of the scan→connect sequence
fn begin_attempt(state: &Rc<RefCell<State>>) {
    {
        let mut borrowed = state.borrow_mut();

        borrowed.attempts += 1;
        borrowed.phase = Phase::Scanning;

        log::info!(
            "(GAP) LE connection attempt {} to {}",
            borrowed.attempts,
            borrowed.target
        );
    }

    let (scanner, target) = {
        let borrowed = state.borrow();

        (borrowed.scanner.clone(), borrowed.target)
    };

    let weak = Rc::downgrade(state);

    let watch = scanner.watch_for_peer(
        target,
        Box::new(move || {
            if let Some(state) = weak.upgrade() {
                on_target_seen(&state);
            }
        }),
    );

    state.borrow_mut().watch = Some(watch);
}

fn on_target_seen(state: &Rc<RefCell<State>>) {
    let proceed = {
        let mut borrowed = state.borrow_mut();

        borrowed.watch = None;

        if borrowed.phase != Phase::Scanning {
            false
        } else {
            borrowed.phase = Phase::Connecting;

            true
        }
    };

    if !proceed {
        return;
    }

    let (command_channel, command) = {
        let borrowed = state.borrow();

        let own_address_type = borrowed
            .address
            .own_address_type(borrowed.use_identity_address);

        let command = if borrowed.use_extended_commands {
            // initiate on every PHY the controller scans
            let per_phy = PhyConnectionParameters {
                scan_interval: INITIATOR_SCAN_INTERVAL,
                scan_window: INITIATOR_SCAN_WINDOW,
                intervals: default_intervals(),
            };

            ExtendedCreateConnection {
                use_filter_accept_list: false,
                own_address_type,
                peer_address_kind: borrowed.target.kind,
                peer_address: borrowed.target.address,
                initiating_phys: PHY_1M | PHY_2M | PHY_CODED,
                phy_parameters: alloc::vec![per_phy, per_phy, per_phy],
            }
            .into_packet()
        } else {
            CreateConnection {
                scan_interval: INITIATOR_SCAN_INTERVAL,
                scan_window: INITIATOR_SCAN_WINDOW,
                use_filter_accept_list: false,
                peer_address_kind: borrowed.target.kind,
                peer_address: borrowed.target.address,
                own_address_type,
                intervals: default_intervals(),
            }
            .into_packet()
        };

        (borrowed.command_channel.clone(), command)
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

fn on_connection_complete(state: &Rc<RefCell<State>>, complete: &LeConnectionCompleteData) -> bool {
    let phase = state.borrow().phase;

    if !matches!(phase, Phase::Connecting | Phase::Canceling) {
        return false;
    }

    // the completion may be for our target or the synthetic cancel completion
    let ours = {
        let borrowed = state.borrow();

        complete.status == Error::UnknownConnectionIdentifier
            || DeviceAddress::new(complete.peer_address_kind, complete.peer_address)
                .is_same_identity(&borrowed.target)
            || complete.status == Error::ConnectionFailedToBeEstablished
    };

    if !ours {
        return false;
    }

    match complete.status.into_result() {
        Ok(()) => match complete.connection_handle {
            Some(handle) => {
                if phase == Phase::Canceling {
                    // canceled too late; the link exists and the caller did not want it
                    finish(state, Err(HostError::Canceled));

                    return true;
                }

                finish(state, Ok(handle));
            }
            None => finish(state, Err(HostError::LinkError)),
        },
        Err(Error::UnknownConnectionIdentifier) if phase == Phase::Canceling => {
            // the synthetic completion of the cancel command
            finish(state, Err(HostError::Canceled));
        }
        Err(Error::ConnectionFailedToBeEstablished) => retry_or_fail(state),
        Err(failure) => finish(state, Err(HostError::Protocol(failure))),
    }

    true
}

/// Schedule another pass for 0x3E, or surface it once the attempts are spent
fn retry_or_fail(state: &Rc<RefCell<State>>) {
    let give_up = {
        let borrowed = state.borrow();

        borrowed.attempts >= MAX_ATTEMPTS || borrowed.phase == Phase::Canceling
    };

    if give_up {
        finish(
            state,
            Err(HostError::Protocol(Error::ConnectionFailedToBeEstablished)),
        );

        return;
    }

    {
        state.borrow_mut().phase = Phase::RetryPause;
    }

    let weak = Rc::downgrade(state);

    let task = state.borrow().dispatcher.post_after(RETRY_PAUSE, move || {
        let Some(state) = weak.upgrade() else { return };

        if state.borrow().phase == Phase::RetryPause {
            begin_attempt(&state);
        }
    });

    state.borrow_mut().retry_task = Some(task);
}

fn on_request_timeout(state: &Rc<RefCell<State>>) {
    let phase = {
        let mut borrowed = state.borrow_mut();

        borrowed.request_timeout = None;

        borrowed.phase
    };

    match phase {
        Phase::Scanning | Phase::RetryPause => {
            // never saw the peer advertising
            finish(state, Err(HostError::NotFound));
        }
        Phase::Connecting => {
            {
                state.borrow_mut().phase = Phase::Canceling;
            }

            let command_channel = state.borrow().command_channel.clone();

            command_channel.send_command(CreateConnectionCancel.into_packet(), Box::new(|_| ()));
        }
        _ => {}
    }
}

fn finish(state: &Rc<RefCell<State>>, result: Result<ConnectionHandle, HostError>) {
    let (callback, watch) = {
        let mut borrowed = state.borrow_mut();

        if matches!(borrowed.phase, Phase::Complete | Phase::Failed) {
            return;
        }

        borrowed.phase = if result.is_ok() {
            Phase::Complete
        } else {
            Phase::Failed
        };

        if let Some(task) = borrowed.request_timeout.take() {
            borrowed.dispatcher.cancel(task);
        }

        if let Some(task) = borrowed.retry_task.take() {
            borrowed.dispatcher.cancel(task);
        }

        (borrowed.callback.take(), borrowed.watch.take())
    };

    let (scanner, address) = {
        let borrowed = state.borrow();

        (borrowed.scanner.clone(), borrowed.address.clone())
    };

    if let Some(watch) = watch {
        scanner.cancel_watch(watch);
    }

    address.release();

    if let Some(callback) = callback {
        callback(result);
    }
}

/// Attempts taken so far (for the retry accounting of the connection manager)
impl LowEnergyConnector {
    pub(crate) fn attempts(&self) -> u8 {
        self.state.borrow().attempts
    }
}

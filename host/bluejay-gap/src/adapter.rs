//! The adapter
//!
//! The composition root of the host. [`Adapter::initialize`] runs the four step boot sequence —
//! reset and identify the Controller, configure host features, bring up the data paths, then
//! construct the per transport managers — and wires every subsystem together. Each step queues
//! its commands through a [`SequentialCommandRunner`]; a failure in any step aborts
//! initialization and tears back down.
//!
//! [`SequentialCommandRunner`]: bluejay_hci::runner::SequentialCommandRunner

use crate::bredr::{
    BrEdrConnectionManager, BrEdrConnectionManagerSettings, BrEdrDiscoveryManager,
    BrEdrDiscoverySession,
};
use crate::collaborators::{
    Gatt, NoGatt, NoSdpServer, NoSecurityManagerFactory, SdpServer, SecurityManagerFactory,
};
use crate::le::{
    LocalAddressManager, LowEnergyAdvertiser, LowEnergyConnectionManager, LowEnergyScanner,
};
use crate::le::{AdvertisementInstance, AdvertisingOptions, ConnectionOptions, DiscoverySession};
use crate::peer::{Peer, PeerCache};
use crate::{
    BrEdrSecurityMode, DisconnectReason, IoCapability, LeSecurityMode, PairingDelegate, PeerId,
    RejectingPairingDelegate,
};
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use bluejay_core::dispatch::Dispatcher;
use bluejay_core::errors::HostError;
use bluejay_core::security::SecurityLevel;
use bluejay_core::BluetoothDeviceAddress;
use bluejay_hci::command_channel::CommandChannel;
use bluejay_hci::commands::controller_baseband::{
    Reset, SetEventMask, WriteClassOfDevice, WriteInquiryMode, WriteLeHostSupport, WriteLocalName,
    WriteScanEnable, WriteSecureConnectionsHostSupport, WriteSimplePairingMode,
    WriteSynchronousFlowControlEnable,
};
use bluejay_hci::commands::info_params::{
    BufferSize, LocalVersionInformation, ReadBdAddr, ReadBufferSize, ReadLocalExtendedFeatures,
    ReadLocalSupportedCommands, ReadLocalSupportedFeatures, ReadLocalVersionInformation,
};
use bluejay_hci::commands::le::{self as le_commands, LeBufferSize};
use bluejay_hci::commands::vendor::{LeGetVendorCapabilities, VendorCapabilities};
use bluejay_hci::commands::CommandParameter;
use bluejay_hci::data::BufferInfo;
use bluejay_hci::runner::SequentialCommandRunner;
use bluejay_hci::transport::Transport;
use bluejay_hci::ConnectionHandle;
use bluejay_l2cap::{Channel, ChannelManager, ChannelParameters, Psm};
use core::cell::RefCell;

/// Everything discovered about the Controller during initialization
#[derive(Clone, Debug)]
pub struct ControllerInfo {
    pub version: Option<LocalVersionInformation>,
    pub supported_commands: [u8; 64],
    /// LMP feature pages, page 0 first
    pub lmp_features: Vec<[u8; 8]>,
    pub le_features: [u8; 8],
    pub bd_addr: BluetoothDeviceAddress,
    pub buffer_size: Option<BufferSize>,
    pub le_buffer_size: Option<LeBufferSize>,
    pub vendor_capabilities: Option<VendorCapabilities>,
}

impl Default for ControllerInfo {
    fn default() -> Self {
        ControllerInfo {
            version: None,
            supported_commands: [0; 64],
            lmp_features: Vec::new(),
            le_features: [0; 8],
            bd_addr: BluetoothDeviceAddress::zeroed(),
            buffer_size: None,
            le_buffer_size: None,
            vendor_capabilities: None,
        }
    }
}

impl ControllerInfo {
    fn lmp_feature_bit(&self, page: usize, bit: usize) -> bool {
        self.lmp_features
            .get(page)
            .map(|features| features[bit / 8] & (1 << (bit % 8)) != 0)
            .unwrap_or(false)
    }

    fn command_bit(&self, octet: usize, bit: u8) -> bool {
        self.supported_commands[octet] & (1 << bit) != 0
    }

    /// LMP feature bit 38: LE supported (Controller)
    pub fn supports_le(&self) -> bool {
        self.lmp_feature_bit(0, 38)
    }

    /// LMP feature bit 37: BR/EDR not supported
    pub fn supports_bredr(&self) -> bool {
        !self.lmp_feature_bit(0, 37)
    }

    /// LMP feature bit 51: Secure Simple Pairing (Controller)
    pub fn supports_secure_simple_pairing(&self) -> bool {
        self.lmp_feature_bit(0, 51)
    }

    /// Supported command octet 32 bit 1: Write Secure Connections Host Support
    pub fn supports_secure_connections_host(&self) -> bool {
        self.command_bit(32, 1)
    }

    /// Supported command octet 41 bit 7: LE Read Buffer Size v2
    pub fn supports_le_buffer_size_v2(&self) -> bool {
        self.command_bit(41, 7)
    }

    /// Supported command octet 10 bit 4: Write Synchronous Flow Control Enable
    pub fn supports_synchronous_flow_control(&self) -> bool {
        self.command_bit(10, 4)
    }

    /// LE feature bit 12: LE Extended Advertising
    pub fn supports_extended_advertising(&self) -> bool {
        self.le_features[1] & (1 << 4) != 0
    }

    /// The Android vendor multi advertising extension is usable
    pub fn supports_vendor_multi_advertising(&self) -> bool {
        self.vendor_capabilities
            .map(|capabilities| capabilities.max_advt_instances > 1)
            .unwrap_or(false)
    }
}

/// Static configuration of an [`Adapter`]
pub struct AdapterBuilder {
    local_name: Vec<u8>,
    device_class: u32,
    io_capability: IoCapability,
    bredr_security_mode: BrEdrSecurityMode,
    le_security_mode: LeSecurityMode,
    privacy: bool,
    connectable: bool,
    delegate: Rc<dyn PairingDelegate>,
    gatt: Rc<dyn Gatt>,
    sdp: Rc<dyn SdpServer>,
    sm_factory: Rc<dyn SecurityManagerFactory>,
}

impl AdapterBuilder {
    pub fn new() -> Self {
        AdapterBuilder {
            local_name: b"bluejay".to_vec(),
            device_class: 0,
            io_capability: IoCapability::NoInputNoOutput,
            bredr_security_mode: BrEdrSecurityMode::Mode4,
            le_security_mode: LeSecurityMode::Mode1,
            privacy: false,
            connectable: true,
            delegate: Rc::new(RejectingPairingDelegate),
            gatt: Rc::new(NoGatt),
            sdp: Rc::new(NoSdpServer),
            sm_factory: Rc::new(NoSecurityManagerFactory),
        }
    }

    pub fn local_name(mut self, name: impl Into<Vec<u8>>) -> Self {
        self.local_name = name.into();

        self
    }

    pub fn device_class(mut self, class: u32) -> Self {
        self.device_class = class;

        self
    }

    pub fn io_capability(mut self, io_capability: IoCapability) -> Self {
        self.io_capability = io_capability;

        self
    }

    pub fn bredr_security_mode(mut self, mode: BrEdrSecurityMode) -> Self {
        self.bredr_security_mode = mode;

        self
    }

    pub fn le_security_mode(mut self, mode: LeSecurityMode) -> Self {
        self.le_security_mode = mode;

        self
    }

    pub fn privacy(mut self, enabled: bool) -> Self {
        self.privacy = enabled;

        self
    }

    pub fn connectable(mut self, connectable: bool) -> Self {
        self.connectable = connectable;

        self
    }

    pub fn pairing_delegate(mut self, delegate: Rc<dyn PairingDelegate>) -> Self {
        self.delegate = delegate;

        self
    }

    pub fn gatt(mut self, gatt: Rc<dyn Gatt>) -> Self {
        self.gatt = gatt;

        self
    }

    pub fn sdp(mut self, sdp: Rc<dyn SdpServer>) -> Self {
        self.sdp = sdp;

        self
    }

    pub fn security_manager_factory(mut self, factory: Rc<dyn SecurityManagerFactory>) -> Self {
        self.sm_factory = factory;

        self
    }

    /// Build the adapter over a transport
    pub fn build(self, transport: Transport) -> Adapter {
        Adapter::new(transport, self)
    }
}

impl AdapterBuilder {
    fn clone_handle(&self) -> AdapterBuilder {
        AdapterBuilder {
            local_name: self.local_name.clone(),
            device_class: self.device_class,
            io_capability: self.io_capability,
            bredr_security_mode: self.bredr_security_mode,
            le_security_mode: self.le_security_mode,
            privacy: self.privacy,
            connectable: self.connectable,
            delegate: self.delegate.clone(),
            gatt: self.gatt.clone(),
            sdp: self.sdp.clone(),
            sm_factory: self.sm_factory.clone(),
        }
    }
}

impl Default for AdapterBuilder {
    fn default() -> Self {
        AdapterBuilder::new()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum InitState {
    NotInitialized,
    Initializing,
    Initialized,
    ShutDown,
}

struct Subsystems {
    l2cap: ChannelManager,
    scanner: LowEnergyScanner,
    address: LocalAddressManager,
    le_connections: Rc<LowEnergyConnectionManager>,
    advertiser: LowEnergyAdvertiser,
    bredr_connections: Option<Rc<BrEdrConnectionManager>>,
    bredr_discovery: Option<BrEdrDiscoveryManager>,
}

struct Inner {
    init_state: InitState,
    info: ControllerInfo,
    subsystems: Option<Subsystems>,
    /// The runner of the step in flight, kept for cancellation on teardown
    runner: Option<Rc<SequentialCommandRunner>>,
}

/// The assembled host adapter
pub struct Adapter {
    transport: Transport,
    command_channel: CommandChannel,
    dispatcher: Dispatcher,
    cache: PeerCache,
    config: AdapterBuilder,
    inner: Rc<RefCell<Inner>>,
}

impl Adapter {
    fn new(transport: Transport, config: AdapterBuilder) -> Self {
        let command_channel = transport.command_channel();
        let dispatcher = transport.dispatcher();

        let adapter = Adapter {
            transport,
            command_channel,
            dispatcher,
            cache: PeerCache::new(),
            config,
            inner: Rc::new(RefCell::new(Inner {
                init_state: InitState::NotInitialized,
                info: ControllerInfo::default(),
                subsystems: None,
                runner: None,
            })),
        };

        // fatal transport errors tear the whole adapter down
        let inner = Rc::downgrade(&adapter.inner);

        adapter.transport.set_error_callback(move |error| {
            log::error!("(GAP) transport failed: {}; shutting the adapter down", error);

            let Some(inner) = inner.upgrade() else { return };

            let runner = {
                let mut inner = inner.borrow_mut();

                inner.init_state = InitState::ShutDown;
                inner.subsystems = None;

                inner.runner.take()
            };

            // canceling fires the step's terminal callback, which needs the borrow released
            if let Some(runner) = runner {
                runner.cancel();
            }
        });

        adapter
    }

    /// Get the peer cache
    pub fn peer_cache(&self) -> PeerCache {
        self.cache.clone()
    }

    /// Get the dispatcher the adapter runs on
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Get what initialization discovered about the Controller
    pub fn controller_info(&self) -> ControllerInfo {
        self.inner.borrow().info.clone()
    }

    /// Check if the adapter finished initialization
    pub fn is_initialized(&self) -> bool {
        self.inner.borrow().init_state == InitState::Initialized
    }

    /// Run the boot sequence
    ///
    /// # Panic
    /// May only be called once.
    pub fn initialize(&self, callback: impl FnOnce(Result<(), HostError>) + 'static) {
        {
            let mut inner = self.inner.borrow_mut();

            assert_eq!(
                InitState::NotInitialized,
                inner.init_state,
                "the adapter is already initialized"
            );

            inner.init_state = InitState::Initializing;
        }

        log::info!("(GAP) initializing adapter");

        self.step_one(Box::new(callback));
    }

    /// Step 1: reset and identify the Controller
    fn step_one(&self, callback: Box<dyn FnOnce(Result<(), HostError>)>) {
        let runner = Rc::new(SequentialCommandRunner::new(self.command_channel.clone()));

        let inner = self.inner.clone();

        runner.queue(Reset.into_packet());

        let sink = inner.clone();

        runner.queue_command(ReadLocalVersionInformation.into_packet(), move |response| {
            if let Ok(version) =
                ReadLocalVersionInformation::try_parse_return_parameter(response.return_parameter())
            {
                sink.borrow_mut().info.version = Some(version);
            }
        });

        let sink = inner.clone();

        runner.queue_command(ReadLocalSupportedCommands.into_packet(), move |response| {
            if let Ok(commands) =
                ReadLocalSupportedCommands::try_parse_return_parameter(response.return_parameter())
            {
                sink.borrow_mut().info.supported_commands = commands;
            }
        });

        let sink = inner.clone();

        runner.queue_command(ReadLocalSupportedFeatures.into_packet(), move |response| {
            if let Ok(features) =
                ReadLocalSupportedFeatures::try_parse_return_parameter(response.return_parameter())
            {
                sink.borrow_mut().info.lmp_features = alloc::vec![features];
            }
        });

        let sink = inner.clone();

        runner.queue_command(ReadBdAddr.into_packet(), move |response| {
            if let Ok(bd_addr) = ReadBdAddr::try_parse_return_parameter(response.return_parameter()) {
                sink.borrow_mut().info.bd_addr = bd_addr;
            }
        });

        // the vendor capability query tolerates the payload size drift of real controllers
        if self.transport.get_driver_features().android_vendor_extensions {
            let sink = inner.clone();

            runner.queue_command(LeGetVendorCapabilities.into_packet(), move |response| {
                match LeGetVendorCapabilities::try_parse_return_parameter(response.return_parameter())
                {
                    Ok(capabilities) => {
                        sink.borrow_mut().info.vendor_capabilities = Some(capabilities)
                    }
                    Err(error) => {
                        log::warn!("(GAP) unusable vendor capabilities: {}", error);
                    }
                }
            });
        }

        self.run_step(runner, callback, Self::step_two);
    }

    /// Step 2: confirm LE, size the buffers, enable the host features
    fn step_two(&self, callback: Box<dyn FnOnce(Result<(), HostError>)>) {
        if !self.inner.borrow().info.supports_le() {
            log::error!("(GAP) the controller does not support LE");

            self.fail_initialization(callback, HostError::NotSupported);

            return;
        }

        let runner = Rc::new(SequentialCommandRunner::new(self.command_channel.clone()));

        let inner = self.inner.clone();
        let info = self.inner.borrow().info.clone();

        let sink = inner.clone();

        runner.queue_command(ReadBufferSize.into_packet(), move |response| {
            if let Ok(buffer_size) =
                ReadBufferSize::try_parse_return_parameter(response.return_parameter())
            {
                sink.borrow_mut().info.buffer_size = Some(buffer_size);
            }
        });

        if info.supports_le_buffer_size_v2() {
            let sink = inner.clone();

            runner.queue_command(le_commands::ReadBufferSizeV2.into_packet(), move |response| {
                if let Ok(le_buffer) =
                    le_commands::ReadBufferSizeV2::try_parse_return_parameter(response.return_parameter())
                {
                    sink.borrow_mut().info.le_buffer_size = Some(le_buffer);
                }
            });
        } else {
            let sink = inner.clone();

            runner.queue_command(le_commands::ReadBufferSize.into_packet(), move |response| {
                if let Ok(le_buffer) =
                    le_commands::ReadBufferSize::try_parse_return_parameter(response.return_parameter())
                {
                    sink.borrow_mut().info.le_buffer_size = Some(le_buffer);
                }
            });
        }

        let sink = inner.clone();

        runner.queue_command(
            le_commands::ReadLocalSupportedFeatures.into_packet(),
            move |response| {
                if let Ok(le_features) = le_commands::ReadLocalSupportedFeatures::try_parse_return_parameter(
                    response.return_parameter(),
                ) {
                    sink.borrow_mut().info.le_features = le_features;
                }
            },
        );

        if info.supports_secure_simple_pairing() {
            runner.queue(WriteSimplePairingMode { enable: true }.into_packet());
        }

        runner.queue(
            WriteLeHostSupport {
                le_supported_host: true,
            }
            .into_packet(),
        );

        if info.supports_secure_connections_host() {
            runner.queue(WriteSecureConnectionsHostSupport { enable: true }.into_packet());
        }

        // the host bits just changed; page 1 reflects them
        let sink = inner.clone();

        runner.queue_command(
            ReadLocalExtendedFeatures { page_number: 1 }.into_packet(),
            move |response| {
                if let Ok(page) =
                    ReadLocalExtendedFeatures::try_parse_return_parameter(response.return_parameter())
                {
                    let mut borrowed = sink.borrow_mut();

                    if borrowed.info.lmp_features.len() < 2 {
                        borrowed.info.lmp_features.push(page.extended_lmp_features);
                    } else {
                        borrowed.info.lmp_features[1] = page.extended_lmp_features;
                    }
                }
            },
        );

        self.run_step(runner, callback, Self::step_three);
    }

    /// Step 3: bring up the data paths and the event masks
    fn step_three(&self, callback: Box<dyn FnOnce(Result<(), HostError>)>) {
        let info = self.inner.borrow().info.clone();

        // the data channels learn their pools before anything can use them
        let acl = self.transport.acl_data_channel();

        let bredr_buffer = info.buffer_size.as_ref().map(|buffer| BufferInfo {
            max_data_length: buffer.acl_data_packet_length as usize,
            num_packets: buffer.total_num_acl_data_packets as usize,
        });

        let le_buffer = info.le_buffer_size.as_ref().and_then(|buffer| {
            (buffer.le_acl_data_packet_length != 0).then(|| BufferInfo {
                max_data_length: buffer.le_acl_data_packet_length as usize,
                num_packets: buffer.total_num_le_acl_data_packets as usize,
            })
        });

        match bredr_buffer {
            Some(bredr_buffer) => acl.set_buffer_info(bredr_buffer, le_buffer),
            None => {
                self.fail_initialization(callback, HostError::NotSupported);

                return;
            }
        }

        if let Some(buffer) = info.buffer_size.as_ref() {
            if buffer.synchronous_data_packet_length != 0 {
                self.transport.sco_data_channel().set_buffer_info(BufferInfo {
                    max_data_length: buffer.synchronous_data_packet_length as usize,
                    num_packets: buffer.total_num_synchronous_data_packets as usize,
                });
            }
        }

        if let Some(le_buffer) = info.le_buffer_size.as_ref() {
            if let (Some(length), Some(count)) = (
                le_buffer.iso_data_packet_length,
                le_buffer.total_num_iso_data_packets,
            ) {
                self.transport.iso_data_channel().set_buffer_info(BufferInfo {
                    max_data_length: length as usize,
                    num_packets: count as usize,
                });
            }
        }

        let runner = Rc::new(SequentialCommandRunner::new(self.command_channel.clone()));

        runner.queue(SetEventMask::host_default().into_packet());
        runner.queue(le_commands::SetEventMask::host_default().into_packet());

        if info.supports_bredr() && info.supports_synchronous_flow_control() {
            runner.queue(WriteSynchronousFlowControlEnable { enable: true }.into_packet());
        }

        // page 2 exists on controllers with secure connections
        if info.lmp_features.len() >= 2 {
            let sink = self.inner.clone();

            runner.queue_command(
                ReadLocalExtendedFeatures { page_number: 2 }.into_packet(),
                move |response| {
                    if let Ok(page) = ReadLocalExtendedFeatures::try_parse_return_parameter(
                        response.return_parameter(),
                    ) {
                        let mut borrowed = sink.borrow_mut();

                        while borrowed.info.lmp_features.len() <= 2 {
                            borrowed.info.lmp_features.push([0; 8]);
                        }

                        borrowed.info.lmp_features[2] = page.extended_lmp_features;
                    }
                },
            );
        }

        self.run_step(runner, callback, Self::step_four);
    }

    /// Step 4: construct the managers and install the defaults
    fn step_four(&self, callback: Box<dyn FnOnce(Result<(), HostError>)>) {
        let info = self.inner.borrow().info.clone();

        let l2cap = ChannelManager::new(
            self.transport.acl_data_channel(),
            self.command_channel.clone(),
            self.dispatcher.clone(),
        );

        let address = LocalAddressManager::new(
            self.command_channel.clone(),
            self.dispatcher.clone(),
            info.bd_addr,
        );

        if self.config.privacy {
            address.set_privacy(true, None::<fn() -> BluetoothDeviceAddress>);
        }

        let extended = info.supports_extended_advertising();

        let scanner = LowEnergyScanner::new(
            self.command_channel.clone(),
            self.cache.clone(),
            address.clone(),
            extended,
        );

        let le_connections = Rc::new(LowEnergyConnectionManager::new(
            self.command_channel.clone(),
            l2cap.clone(),
            self.cache.clone(),
            self.dispatcher.clone(),
            scanner.clone(),
            address.clone(),
            self.config.sm_factory.clone(),
            self.config.gatt.clone(),
            self.config.io_capability,
            self.config.le_security_mode,
            extended,
        ));

        // the advertiser flavor is picked once, here
        let advertiser = LowEnergyAdvertiser::new(
            self.command_channel.clone(),
            address.clone(),
            select_advertiser_flavor(&info),
        );

        let bredr_connections = info.supports_bredr().then(|| {
            Rc::new(BrEdrConnectionManager::new(
                self.command_channel.clone(),
                l2cap.clone(),
                self.transport.sco_data_channel(),
                self.cache.clone(),
                self.dispatcher.clone(),
                BrEdrConnectionManagerSettings {
                    local_iocap: self.config.io_capability,
                    security_mode: self.config.bredr_security_mode,
                    delegate: self.config.delegate.clone(),
                },
                self.config.sdp.clone(),
            ))
        });

        let bredr_discovery = info
            .supports_bredr()
            .then(|| BrEdrDiscoveryManager::new(self.command_channel.clone(), self.cache.clone()));

        self.inner.borrow_mut().subsystems = Some(Subsystems {
            l2cap,
            scanner,
            address,
            le_connections,
            advertiser,
            bredr_connections,
            bredr_discovery,
        });

        // defaults
        let runner = Rc::new(SequentialCommandRunner::new(self.command_channel.clone()));

        if info.supports_bredr() {
            runner.queue(
                WriteLocalName {
                    name: self.config.local_name.clone(),
                }
                .into_packet(),
            );

            runner.queue(
                WriteClassOfDevice {
                    class_of_device: self.config.device_class,
                }
                .into_packet(),
            );

            runner.queue(WriteInquiryMode { inquiry_mode: 0x02 }.into_packet());

            runner.queue(
                WriteScanEnable {
                    inquiry_scan: false,
                    page_scan: self.config.connectable,
                }
                .into_packet(),
            );
        }

        let inner = self.inner.clone();

        self.run_step(
            runner,
            callback,
            move |adapter: &Adapter, callback: Box<dyn FnOnce(Result<(), HostError>)>| {
                inner.borrow_mut().init_state = InitState::Initialized;

                log::info!(
                    "(GAP) adapter initialized ({} at {})",
                    if adapter.inner.borrow().info.supports_bredr() {
                        "dual mode"
                    } else {
                        "LE only"
                    },
                    adapter.inner.borrow().info.bd_addr
                );

                callback(Ok(()));
            },
        );
    }

    /// Run one step's command batch, then continue or abort
    fn run_step(
        &self,
        runner: Rc<SequentialCommandRunner>,
        callback: Box<dyn FnOnce(Result<(), HostError>)>,
        next: impl FnOnce(&Adapter, Box<dyn FnOnce(Result<(), HostError>)>) + 'static,
    ) {
        self.inner.borrow_mut().runner = Some(runner.clone());

        let adapter = self.clone_handle();

        runner.run_commands(move |result| {
            adapter.inner.borrow_mut().runner = None;

            match result {
                Ok(()) => next(&adapter, callback),
                Err(error) => adapter.fail_initialization(callback, error),
            }
        });
    }

    fn fail_initialization(&self, callback: Box<dyn FnOnce(Result<(), HostError>)>, error: HostError) {
        log::error!("(GAP) adapter initialization failed: {}", error);

        {
            let mut inner = self.inner.borrow_mut();

            inner.init_state = InitState::ShutDown;
            inner.subsystems = None;
        }

        callback(Err(error));
    }

    /// Access to the LE subsystem
    ///
    /// # Panic
    /// The adapter must be initialized.
    pub fn le(&self) -> LeApi {
        let inner = self.inner.borrow();

        let subsystems = inner
            .subsystems
            .as_ref()
            .expect("the adapter is not initialized");

        LeApi {
            connections: subsystems.le_connections.clone(),
            scanner: subsystems.scanner.clone(),
            advertiser: subsystems.advertiser.clone(),
        }
    }

    /// Access to the BR/EDR subsystem
    ///
    /// # Panic
    /// The adapter must be initialized with a dual mode Controller.
    pub fn bredr(&self) -> BrEdrApi {
        let inner = self.inner.borrow();

        let subsystems = inner
            .subsystems
            .as_ref()
            .expect("the adapter is not initialized");

        BrEdrApi {
            connections: subsystems
                .bredr_connections
                .as_ref()
                .expect("the controller is LE only")
                .clone(),
            discovery: subsystems
                .bredr_discovery
                .as_ref()
                .expect("the controller is LE only")
                .clone(),
        }
    }

    /// Access to the L2CAP channel manager
    ///
    /// # Panic
    /// The adapter must be initialized.
    pub fn l2cap(&self) -> ChannelManager {
        self.inner
            .borrow()
            .subsystems
            .as_ref()
            .expect("the adapter is not initialized")
            .l2cap
            .clone()
    }

    fn clone_handle(&self) -> Adapter {
        Adapter {
            transport: self.transport.clone(),
            command_channel: self.command_channel.clone(),
            dispatcher: self.dispatcher.clone(),
            cache: self.cache.clone(),
            config: self.config.clone_handle(),
            inner: self.inner.clone(),
        }
    }
}

/// The LE facing API surface
#[derive(Clone)]
pub struct LeApi {
    connections: Rc<LowEnergyConnectionManager>,
    scanner: LowEnergyScanner,
    advertiser: LowEnergyAdvertiser,
}

impl LeApi {
    pub fn connect(
        &self,
        peer_id: PeerId,
        options: ConnectionOptions,
        callback: impl FnOnce(Result<ConnectionHandle, HostError>) + 'static,
    ) {
        self.connections.connect(peer_id, options, callback)
    }

    pub fn disconnect(&self, peer_id: PeerId) {
        self.connections.disconnect(peer_id, DisconnectReason::ApiRequest)
    }

    pub fn pair(
        &self,
        peer_id: PeerId,
        level: SecurityLevel,
        callback: impl FnOnce(Result<(), HostError>) + 'static,
    ) {
        self.connections.pair(peer_id, level, callback)
    }

    pub fn start_discovery(&self, active: bool, callback: impl FnMut(&Peer) + 'static) -> DiscoverySession {
        self.scanner.start_discovery(active, callback)
    }

    pub fn start_advertising(
        &self,
        options: AdvertisingOptions,
        callback: impl FnOnce(Result<AdvertisementInstance, HostError>) + 'static,
    ) {
        self.advertiser.start_advertising(options, callback)
    }
}

/// The BR/EDR facing API surface
#[derive(Clone)]
pub struct BrEdrApi {
    connections: Rc<BrEdrConnectionManager>,
    discovery: BrEdrDiscoveryManager,
}

impl BrEdrApi {
    pub fn connect(
        &self,
        peer_id: PeerId,
        callback: impl FnOnce(Result<ConnectionHandle, HostError>) + 'static,
    ) {
        self.connections.connect(peer_id, callback)
    }

    pub fn disconnect(&self, peer_id: PeerId) {
        self.connections.disconnect(peer_id, DisconnectReason::ApiRequest)
    }

    pub fn pair(&self, peer_id: PeerId, callback: impl FnOnce(Result<(), HostError>) + 'static) {
        self.connections.pair(peer_id, callback)
    }

    pub fn open_l2cap_channel(
        &self,
        peer_id: PeerId,
        psm: Psm,
        security: SecurityLevel,
        params: ChannelParameters,
        callback: impl FnOnce(Result<Channel, HostError>) + 'static,
    ) {
        self.connections
            .open_l2cap_channel(peer_id, psm, security, params, callback)
    }

    pub fn set_security_mode(&self, mode: BrEdrSecurityMode) {
        self.connections.set_security_mode(mode)
    }

    pub fn start_discovery(&self, callback: impl FnMut(&Peer) + 'static) -> BrEdrDiscoverySession {
        self.discovery.start_discovery(callback)
    }

    /// The manager itself, for the accessors the API surface does not re-export
    pub fn manager(&self) -> Rc<BrEdrConnectionManager> {
        self.connections.clone()
    }
}

/// How many extended advertising sets this host drives concurrently
///
/// Controllers report their own limit; this bounds the host side pool.
const EXTENDED_ADVERTISING_SET_LIMIT: usize = 4;

/// Choose the advertiser flavor for the Controller
fn select_advertiser_flavor(
    info: &ControllerInfo,
) -> Box<dyn crate::le::AdvertisingCommands> {
    use crate::le::{
        AndroidVendorAdvertisingCommands, ExtendedAdvertisingCommands, LegacyAdvertisingCommands,
    };

    if info.supports_extended_advertising() {
        Box::new(ExtendedAdvertisingCommands {
            supported_sets: EXTENDED_ADVERTISING_SET_LIMIT,
        })
    } else if info.supports_vendor_multi_advertising() {
        let capabilities = info.vendor_capabilities.unwrap();

        Box::new(AndroidVendorAdvertisingCommands {
            supported_instances: capabilities.max_advt_instances as usize,
            own_address: info.bd_addr,
        })
    } else {
        Box::new(LegacyAdvertisingCommands)
    }
}

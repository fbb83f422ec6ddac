//! Narrow interfaces of the protocol collaborators
//!
//! GATT, SDP, and the LE Security Manager live outside this layer. What lives here is only the
//! surface the connection managers drive: handing connections over, registering service records,
//! and asking the Security Manager for security upgrades. Implementations are supplied by the
//! embedder; every trait has a no-op (or rejecting) default implementation for hosts without the
//! collaborator.

use crate::peer::Ltk;
use crate::PeerId;
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec::Vec;
use bluejay_core::errors::HostError;
use bluejay_core::security::SecurityLevel;
use bluejay_l2cap::Channel;

/// The GATT layer's view of connections
pub trait Gatt {
    /// A new LE connection is up; `att_channel` is its Attribute Protocol fixed channel
    fn add_connection(&self, peer: PeerId, att_channel: Channel);

    /// The connection for `peer` is gone
    fn remove_connection(&self, peer: PeerId);
}

/// A GATT layer that ignores everything
pub struct NoGatt;

impl Gatt for NoGatt {
    fn add_connection(&self, _: PeerId, _: Channel) {}

    fn remove_connection(&self, _: PeerId) {}
}

/// An opaque SDP service record
///
/// Record contents are built and parsed by the SDP collaborator; this layer only moves them.
#[derive(Clone, Debug)]
pub struct ServiceRecord {
    pub data: Vec<u8>,
}

/// Handle of a registered service record set
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ServiceRecordHandle(pub u32);

/// The SDP server's registration surface
pub trait SdpServer {
    fn register_service(&self, records: Vec<ServiceRecord>) -> Option<ServiceRecordHandle>;

    fn unregister_service(&self, handle: ServiceRecordHandle);
}

/// An SDP server that registers nothing
pub struct NoSdpServer;

impl SdpServer for NoSdpServer {
    fn register_service(&self, _: Vec<ServiceRecord>) -> Option<ServiceRecordHandle> {
        None
    }

    fn unregister_service(&self, _: ServiceRecordHandle) {}
}

/// One LE Security Manager instance, bound to one connection
///
/// The implementation owns the SMP protocol and its cryptography. This layer calls
/// `upgrade_security` on behalf of clients and channels, provides stored keys through
/// `assign_long_term_key`, and reports distributed keys back through the callback installed
/// with [`set_new_ltk_callback`](SecurityManager::set_new_ltk_callback).
pub trait SecurityManager {
    /// Raise the link security to at least `level`
    fn upgrade_security(
        &self,
        level: SecurityLevel,
        callback: Box<dyn FnOnce(Result<SecurityLevel, HostError>)>,
    );

    /// Provide the long term key restored from a bond
    fn assign_long_term_key(&self, ltk: Ltk);

    /// Install the callback observing a newly distributed long term key
    fn set_new_ltk_callback(&self, callback: Box<dyn FnMut(Ltk)>);
}

/// Everything a [`SecurityManagerFactory`] gets about the new connection
pub struct SecurityManagerContext {
    pub peer: PeerId,
    /// The Security Manager Protocol fixed channel of the link
    pub smp_channel: Channel,
    pub io_capability: crate::IoCapability,
    pub bondable: bool,
    pub security_mode: crate::LeSecurityMode,
}

/// Creates a [`SecurityManager`] per LE connection
pub trait SecurityManagerFactory {
    fn create(&self, context: SecurityManagerContext) -> Rc<dyn SecurityManager>;
}

/// A factory whose Security Managers refuse every upgrade
pub struct NoSecurityManagerFactory;

struct RefusingSecurityManager;

impl SecurityManager for RefusingSecurityManager {
    fn upgrade_security(
        &self,
        _: SecurityLevel,
        callback: Box<dyn FnOnce(Result<SecurityLevel, HostError>)>,
    ) {
        callback(Err(HostError::NotSupported))
    }

    fn assign_long_term_key(&self, _: Ltk) {}

    fn set_new_ltk_callback(&self, _: Box<dyn FnMut(Ltk)>) {}
}

impl SecurityManagerFactory for NoSecurityManagerFactory {
    fn create(&self, _: SecurityManagerContext) -> Rc<dyn SecurityManager> {
        Rc::new(RefusingSecurityManager)
    }
}

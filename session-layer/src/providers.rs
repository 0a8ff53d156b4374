//! Collaborator contracts and the provider bundle.
//!
//! The control plane never touches addresses, transports, or shared memory
//! directly. It talks to four collaborators:
//!
//! - [`AddressTable`]: interface addresses and local reachability
//! - [`TransportProvider`]: network connects, closes, and listeners
//! - [`SegmentProvider`]: shared-memory segment managers
//! - [`ProxySetup`]: extra wiring for applications flagged as proxies
//!
//! [`Providers`] bundles them through associated types so the layer carries a
//! single type parameter. [`StandardProviders`] is the stock bundle.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use crate::application::{AppIndex, Application, WorkerIndex};
use crate::endpoint::{FibIndex, InterfaceIndex, SessionEndpoint, SessionEndpointCfg};
use crate::error::{SegmentError, TransportError};
use crate::handle::SessionHandle;

/// Address and route lookups.
pub trait AddressTable: Send + Sync {
    /// True if `ip` is configured on interface `sw_if_index`.
    fn has_local_address(&self, sw_if_index: InterfaceIndex, ip: &IpAddr) -> bool;

    /// True if `ip` is a local (receive) address in routing table `fib_index`.
    fn is_locally_reachable(&self, fib_index: FibIndex, ip: &IpAddr) -> bool;
}

/// Network transport used when no co-located listener serves a connect.
pub trait TransportProvider: Send + Sync {
    /// Originate a network connection for a worker of `app`.
    ///
    /// The returned handle names a session in one of the worker pools,
    /// owned by `app`.
    fn connect(
        &self,
        sep: &SessionEndpointCfg,
        app: AppIndex,
        app_wrk: WorkerIndex,
        api_context: u32,
    ) -> Result<SessionHandle, TransportError>;

    /// Close a session the transport originated.
    fn close(&self, session: SessionHandle);

    /// Start listening for a global-scope application listener.
    fn listen(&self, _endpoint: &SessionEndpoint, _app_wrk: WorkerIndex) -> Result<(), TransportError> {
        Ok(())
    }

    /// Stop listening on an endpoint previously passed to [`Self::listen`].
    fn unlisten(&self, _endpoint: &SessionEndpoint) {}
}

/// Identifier of a segment manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SegmentManagerId(pub u32);

impl std::fmt::Display for SegmentManagerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sm[{}]", self.0)
    }
}

/// Descriptor of a shared-memory segment handed to applications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Segment name applications map.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Opaque handle naming (manager, segment).
    pub handle: u64,
}

/// Read guard over a segment. The manager's reader lock is held until drop.
pub type SegmentReadGuard<'a> = MappedRwLockReadGuard<'a, Segment>;

/// Shared-memory segment managers.
pub trait SegmentProvider: Send + Sync {
    /// Create a manager holding one segment of `segment_size` bytes.
    fn create_manager(&self, name: &str, segment_size: u64) -> Result<SegmentManagerId, SegmentError>;

    /// Read a segment under the manager's reader lock.
    fn acquire_segment(
        &self,
        manager: SegmentManagerId,
        index: u32,
    ) -> Result<SegmentReadGuard<'_>, SegmentError>;

    /// Delete a manager and its segments.
    fn delete_manager(&self, manager: SegmentManagerId);
}

/// Extra wiring for applications flagged as proxies.
pub trait ProxySetup: Send + Sync {
    /// Called once, at attach, for every proxy application.
    fn setup_proxy(&self, app: &Application);
}

/// Bundle of all collaborators for one control plane.
pub trait Providers: Clone + Send + Sync + 'static {
    /// Address table type.
    type Addresses: AddressTable + 'static;
    /// Transport type.
    type Transport: TransportProvider + 'static;
    /// Segment manager type.
    type Segments: SegmentProvider + 'static;
    /// Proxy setup type.
    type Proxy: ProxySetup + 'static;

    /// Address table.
    fn addresses(&self) -> &Self::Addresses;

    /// Transport.
    fn transport(&self) -> &Self::Transport;

    /// Segment managers.
    fn segments(&self) -> &Self::Segments;

    /// Proxy setup.
    fn proxy(&self) -> &Self::Proxy;
}

/// Address table built once from a static list of interface addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticAddressTable {
    interfaces: HashMap<InterfaceIndex, Vec<(IpAddr, FibIndex)>>,
}

impl StaticAddressTable {
    /// Empty table: no interface carries any address.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure `ip` on `sw_if_index`, which sits in `fib_index`.
    pub fn with_address(mut self, sw_if_index: InterfaceIndex, fib_index: FibIndex, ip: IpAddr) -> Self {
        self.interfaces
            .entry(sw_if_index)
            .or_default()
            .push((ip, fib_index));
        self
    }
}

impl AddressTable for StaticAddressTable {
    fn has_local_address(&self, sw_if_index: InterfaceIndex, ip: &IpAddr) -> bool {
        self.interfaces
            .get(&sw_if_index)
            .is_some_and(|addrs| addrs.iter().any(|(addr, _)| addr == ip))
    }

    fn is_locally_reachable(&self, fib_index: FibIndex, ip: &IpAddr) -> bool {
        self.interfaces
            .values()
            .flatten()
            .any(|(addr, fib)| *fib == fib_index && addr == ip)
    }
}

/// Transport that refuses every connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransport;

impl TransportProvider for NoTransport {
    fn connect(
        &self,
        sep: &SessionEndpointCfg,
        _app: AppIndex,
        _app_wrk: WorkerIndex,
        _api_context: u32,
    ) -> Result<SessionHandle, TransportError> {
        Err(TransportError::Unavailable {
            proto: sep.endpoint.transport_proto.to_string(),
        })
    }

    fn close(&self, _session: SessionHandle) {}
}

/// Proxy setup that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProxy;

impl ProxySetup for NoProxy {
    fn setup_proxy(&self, _app: &Application) {}
}

#[derive(Debug, Default)]
struct SegmentManagers {
    next_id: u32,
    managers: HashMap<u32, Vec<Segment>>,
}

/// Heap-backed segment managers.
///
/// Every manager holds exactly one segment, created with the manager.
#[derive(Debug, Default)]
pub struct MemorySegmentManager {
    state: RwLock<SegmentManagers>,
}

impl MemorySegmentManager {
    /// Create an empty set of managers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live managers.
    pub fn manager_count(&self) -> usize {
        self.state.read().managers.len()
    }

    /// True while any reader or writer holds the manager lock.
    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }
}

impl SegmentProvider for MemorySegmentManager {
    fn create_manager(&self, name: &str, segment_size: u64) -> Result<SegmentManagerId, SegmentError> {
        if segment_size == 0 {
            return Err(SegmentError::InvalidSize { size: segment_size });
        }
        let mut state = self.state.write();
        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);
        let segment = Segment {
            name: format!("{name}-seg-{id}"),
            size: segment_size,
            handle: (id as u64) << 32,
        };
        state.managers.insert(id, vec![segment]);
        Ok(SegmentManagerId(id))
    }

    fn acquire_segment(
        &self,
        manager: SegmentManagerId,
        index: u32,
    ) -> Result<SegmentReadGuard<'_>, SegmentError> {
        let guard = self.state.read();
        RwLockReadGuard::try_map(guard, |state| {
            state
                .managers
                .get(&manager.0)
                .and_then(|segments| segments.get(index as usize))
        })
        .map_err(|guard| {
            if guard.managers.contains_key(&manager.0) {
                SegmentError::SegmentNotFound {
                    manager: manager.0,
                    index,
                }
            } else {
                SegmentError::ManagerNotFound { manager: manager.0 }
            }
        })
    }

    fn delete_manager(&self, manager: SegmentManagerId) {
        self.state.write().managers.remove(&manager.0);
    }
}

/// Stock provider bundle: static addresses, heap segments, pluggable
/// transport and proxy setup.
pub struct StandardProviders<T = NoTransport, X = NoProxy> {
    addresses: Arc<StaticAddressTable>,
    transport: Arc<T>,
    segments: Arc<MemorySegmentManager>,
    proxy: Arc<X>,
}

impl<T, X> Clone for StandardProviders<T, X> {
    fn clone(&self) -> Self {
        Self {
            addresses: Arc::clone(&self.addresses),
            transport: Arc::clone(&self.transport),
            segments: Arc::clone(&self.segments),
            proxy: Arc::clone(&self.proxy),
        }
    }
}

impl StandardProviders {
    /// Bundle with the given addresses, no transport and no proxy wiring.
    pub fn new(addresses: StaticAddressTable) -> Self {
        Self {
            addresses: Arc::new(addresses),
            transport: Arc::new(NoTransport),
            segments: Arc::new(MemorySegmentManager::new()),
            proxy: Arc::new(NoProxy),
        }
    }
}

impl Default for StandardProviders {
    fn default() -> Self {
        Self::new(StaticAddressTable::new())
    }
}

impl<T, X> StandardProviders<T, X> {
    /// Swap the transport.
    pub fn with_transport<T2>(self, transport: Arc<T2>) -> StandardProviders<T2, X> {
        StandardProviders {
            addresses: self.addresses,
            transport,
            segments: self.segments,
            proxy: self.proxy,
        }
    }

    /// Swap the proxy setup.
    pub fn with_proxy<X2>(self, proxy: Arc<X2>) -> StandardProviders<T, X2> {
        StandardProviders {
            addresses: self.addresses,
            transport: self.transport,
            segments: self.segments,
            proxy,
        }
    }
}

impl<T, X> Providers for StandardProviders<T, X>
where
    T: TransportProvider + 'static,
    X: ProxySetup + 'static,
{
    type Addresses = StaticAddressTable;
    type Transport = T;
    type Segments = MemorySegmentManager;
    type Proxy = X;

    fn addresses(&self) -> &Self::Addresses {
        &self.addresses
    }

    fn transport(&self) -> &Self::Transport {
        &self.transport
    }

    fn segments(&self) -> &Self::Segments {
        &self.segments
    }

    fn proxy(&self) -> &Self::Proxy {
        &self.proxy
    }
}

//! Applications, their workers, and the events delivered to them.
//!
//! An [`Application`] is one attached client. It owns one or more
//! [`AppWorker`]s (execution contexts), each with its own event queue and
//! segment manager. Both live in generational pools inside [`AppTables`] and
//! are referenced by [`AppIndex`] / [`WorkerIndex`] only.

use std::collections::{BTreeSet, HashMap};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::dispatch::ControlOpKind;
use crate::endpoint::TransportProto;
use crate::error::SessionError;
use crate::handle::{ListenerHandle, SessionHandle};
use crate::listener::ListenerIndex;
use crate::namespace::NamespaceIndex;
use crate::pool::{define_index, Pool};
use crate::providers::SegmentManagerId;
use crate::router::ConnectScope;

define_index!(
    /// Handle of an attached application.
    AppIndex,
    "app"
);

define_index!(
    /// Index of an application worker.
    WorkerIndex,
    "wrk"
);

bitflags! {
    /// Capabilities of an application.
    ///
    /// - `IS_TRANSPORT_APP`: acts as a transport on behalf of other apps
    /// - `IS_PROXY`: gets proxy wiring at attach
    /// - `USE_GLOBAL_SCOPE`: may use the global session table
    /// - `USE_LOCAL_SCOPE`: may use the namespace-local session table
    /// - `IS_BUILTIN`: runs inside the dataplane process
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AppFlags: u32 {
        /// Transport provider acting for an owner application.
        const IS_TRANSPORT_APP = 1 << 0;
        /// Proxy application.
        const IS_PROXY = 1 << 1;
        /// Global scope permitted.
        const USE_GLOBAL_SCOPE = 1 << 2;
        /// Local scope permitted.
        const USE_LOCAL_SCOPE = 1 << 3;
        /// Builtin application.
        const IS_BUILTIN = 1 << 4;
    }
}

impl Default for AppFlags {
    fn default() -> Self {
        AppFlags::USE_GLOBAL_SCOPE | AppFlags::USE_LOCAL_SCOPE
    }
}

// Flags travel as their raw bits.
impl Serialize for AppFlags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AppFlags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bits = u32::deserialize(deserializer)?;
        Ok(AppFlags::from_bits_truncate(bits))
    }
}

/// Attach-time options of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppOptions {
    /// Capability flags.
    #[serde(default)]
    pub flags: AppFlags,
    /// Namespace to attach into, empty for the default one.
    #[serde(default)]
    pub namespace_id: String,
    /// Secret presented to the namespace.
    #[serde(default)]
    pub namespace_secret: Option<u64>,
    /// Size of each worker's first segment, defaults to the layer's setting.
    #[serde(default)]
    pub segment_size: Option<u64>,
    /// Transports a proxy application intercepts.
    #[serde(default)]
    pub proxied_transports: Vec<TransportProto>,
}

impl AppOptions {
    /// Options with the given flags.
    pub fn with_flags(mut self, flags: AppFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Attach into a namespace.
    pub fn in_namespace(mut self, id: impl Into<String>, secret: Option<u64>) -> Self {
        self.namespace_id = id.into();
        self.namespace_secret = secret;
        self
    }
}

/// Notification delivered on a worker's event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// A client connected to one of the worker's listeners.
    Accepted {
        /// Listener the client connected to.
        listener: ListenerHandle,
        /// The new session.
        session: SessionHandle,
        /// Connecting application.
        client: AppIndex,
    },
    /// A connect issued by the worker completed.
    Connected {
        /// The new session.
        session: SessionHandle,
        /// Scope that served the connect.
        scope: ConnectScope,
        /// Caller-supplied context of the connect.
        api_context: u32,
    },
    /// A session of the worker was torn down.
    Disconnected {
        /// The session.
        session: SessionHandle,
    },
    /// A deferred listen completed.
    Listening {
        /// The listener.
        listener: ListenerHandle,
    },
    /// A deferred unlisten completed.
    Unlistened {
        /// The listener.
        listener: ListenerHandle,
    },
    /// The worker was detached.
    Detached,
    /// A deferred operation failed.
    OperationFailed {
        /// Which operation.
        op: ControlOpKind,
        /// Why.
        error: SessionError,
    },
}

/// Sending half of a worker's event queue.
pub type AppEventSender = mpsc::UnboundedSender<AppEvent>;

/// Receiving half of a worker's event queue.
pub type AppEventReceiver = mpsc::UnboundedReceiver<AppEvent>;

/// One attached client.
#[derive(Debug)]
pub struct Application {
    /// Own handle.
    pub app_index: AppIndex,
    /// Application name.
    pub name: String,
    /// API client that attached the application, if any.
    pub api_client_index: Option<u32>,
    /// Namespace the application lives in, fixed at attach.
    pub ns_index: NamespaceIndex,
    /// Capability flags.
    pub flags: AppFlags,
    /// Transports a proxy intercepts.
    pub proxied_transports: Vec<TransportProto>,
    /// Size of each worker's first segment.
    pub segment_size: u64,
    /// Workers, position is the worker map index.
    pub(crate) workers: Vec<Option<WorkerIndex>>,
    /// Listeners owned by the application.
    pub(crate) listeners: BTreeSet<ListenerIndex>,
}

impl Application {
    /// True for transport provider applications.
    pub fn is_transport_app(&self) -> bool {
        self.flags.contains(AppFlags::IS_TRANSPORT_APP)
    }

    /// True for proxy applications.
    pub fn is_proxy(&self) -> bool {
        self.flags.contains(AppFlags::IS_PROXY)
    }

    /// True if the application may route through its namespace's local table.
    pub fn has_local_scope(&self) -> bool {
        self.flags.contains(AppFlags::USE_LOCAL_SCOPE)
    }

    /// True if the application may route through the global table.
    pub fn has_global_scope(&self) -> bool {
        self.flags.contains(AppFlags::USE_GLOBAL_SCOPE)
    }

    /// Worker registered under a worker map index.
    pub fn worker(&self, wrk_map_index: u32) -> Option<WorkerIndex> {
        self.workers.get(wrk_map_index as usize).copied().flatten()
    }

    /// All live workers, in map-index order.
    pub fn workers(&self) -> impl Iterator<Item = WorkerIndex> + '_ {
        self.workers.iter().flatten().copied()
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.workers.iter().flatten().count()
    }

    /// Listeners owned by the application.
    pub fn listeners(&self) -> impl Iterator<Item = ListenerIndex> + '_ {
        self.listeners.iter().copied()
    }

    fn next_map_index(&self) -> u32 {
        self.workers
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.workers.len()) as u32
    }
}

/// One execution context of an application.
#[derive(Debug)]
pub struct AppWorker {
    /// Own index.
    pub wrk_index: WorkerIndex,
    /// Position inside the owning application's worker map.
    pub wrk_map_index: u32,
    /// Owning application.
    pub app_index: AppIndex,
    /// API client that receives the worker's control messages.
    pub api_client_index: Option<u32>,
    /// First segment manager allocated for the worker.
    pub first_segment_manager: SegmentManagerId,
    pub(crate) event_queue: AppEventSender,
    pub(crate) listeners: BTreeSet<ListenerIndex>,
    pub(crate) local_sessions: BTreeSet<SessionHandle>,
    pub(crate) connects: BTreeSet<SessionHandle>,
}

impl AppWorker {
    /// Queue an event for the worker. A closed queue is not an error: the
    /// application simply stopped listening.
    pub fn notify(&self, event: AppEvent) {
        if self.event_queue.send(event).is_err() {
            tracing::trace!(wrk = %self.wrk_index, "event queue closed, event dropped");
        }
    }

    /// Listeners the worker listens through.
    pub fn listeners(&self) -> impl Iterator<Item = ListenerIndex> + '_ {
        self.listeners.iter().copied()
    }

    /// Local sessions the worker is a side of.
    pub fn local_sessions(&self) -> impl Iterator<Item = SessionHandle> + '_ {
        self.local_sessions.iter().copied()
    }

    /// Transport sessions the worker originated.
    pub fn connects(&self) -> impl Iterator<Item = SessionHandle> + '_ {
        self.connects.iter().copied()
    }
}

/// Application and worker tables.
#[derive(Debug, Default)]
pub struct AppTables {
    apps: Pool<Application>,
    workers: Pool<AppWorker>,
    by_api_client: HashMap<u32, AppIndex>,
    by_name: HashMap<String, AppIndex>,
}

/// Everything needed to create an application record.
#[derive(Debug, Clone)]
pub(crate) struct NewApplication {
    pub name: String,
    pub api_client_index: Option<u32>,
    pub ns_index: NamespaceIndex,
    pub flags: AppFlags,
    pub proxied_transports: Vec<TransportProto>,
    pub segment_size: u64,
}

impl AppTables {
    /// Empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Application behind a handle, if still attached.
    pub fn app(&self, app_index: AppIndex) -> Option<&Application> {
        self.apps.get(app_index.0)
    }

    pub(crate) fn app_mut(&mut self, app_index: AppIndex) -> Option<&mut Application> {
        self.apps.get_mut(app_index.0)
    }

    /// Worker behind an index, if still alive.
    pub fn worker(&self, wrk_index: WorkerIndex) -> Option<&AppWorker> {
        self.workers.get(wrk_index.0)
    }

    pub(crate) fn worker_mut(&mut self, wrk_index: WorkerIndex) -> Option<&mut AppWorker> {
        self.workers.get_mut(wrk_index.0)
    }

    /// Application attached by an API client.
    pub fn lookup_api_client(&self, api_client_index: u32) -> Option<AppIndex> {
        self.by_api_client.get(&api_client_index).copied()
    }

    /// Application attached under a name.
    pub fn lookup_name(&self, name: &str) -> Option<AppIndex> {
        self.by_name.get(name).copied()
    }

    /// Number of attached applications.
    pub fn app_count(&self) -> usize {
        self.apps.len()
    }

    /// Number of live workers across all applications.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Worker of an application by map index.
    pub fn app_worker(&self, app_index: AppIndex, wrk_map_index: u32) -> Option<&AppWorker> {
        self.app(app_index)
            .and_then(|app| app.worker(wrk_map_index))
            .and_then(|wrk| self.worker(wrk))
    }

    pub(crate) fn alloc_app(&mut self, new: NewApplication) -> AppIndex {
        let key = self.apps.insert_with(|key| Application {
            app_index: AppIndex(key),
            name: new.name.clone(),
            api_client_index: new.api_client_index,
            ns_index: new.ns_index,
            flags: new.flags,
            proxied_transports: new.proxied_transports.clone(),
            segment_size: new.segment_size,
            workers: Vec::new(),
            listeners: BTreeSet::new(),
        });
        let app_index = AppIndex(key);
        if let Some(api_client_index) = new.api_client_index {
            self.by_api_client.insert(api_client_index, app_index);
        }
        self.by_name.insert(new.name, app_index);
        app_index
    }

    pub(crate) fn free_app(&mut self, app_index: AppIndex) -> Option<Application> {
        let app = self.apps.remove(app_index.0)?;
        if let Some(api_client_index) = app.api_client_index {
            self.by_api_client.remove(&api_client_index);
        }
        if self.by_name.get(&app.name) == Some(&app_index) {
            self.by_name.remove(&app.name);
        }
        Some(app)
    }

    /// Create a worker for an application. Returns `None` if the application
    /// is gone.
    pub(crate) fn alloc_worker(
        &mut self,
        app_index: AppIndex,
        api_client_index: Option<u32>,
        first_segment_manager: SegmentManagerId,
        event_queue: AppEventSender,
    ) -> Option<WorkerIndex> {
        let wrk_map_index = self.app(app_index)?.next_map_index();
        let key = self.workers.insert_with(|key| AppWorker {
            wrk_index: WorkerIndex(key),
            wrk_map_index,
            app_index,
            api_client_index,
            first_segment_manager,
            event_queue,
            listeners: BTreeSet::new(),
            local_sessions: BTreeSet::new(),
            connects: BTreeSet::new(),
        });
        let wrk_index = WorkerIndex(key);
        let app = self.app_mut(app_index)?;
        let slot = wrk_map_index as usize;
        if slot == app.workers.len() {
            app.workers.push(Some(wrk_index));
        } else {
            app.workers[slot] = Some(wrk_index);
        }
        Some(wrk_index)
    }

    pub(crate) fn free_worker(&mut self, wrk_index: WorkerIndex) -> Option<AppWorker> {
        let worker = self.workers.remove(wrk_index.0)?;
        if let Some(app) = self.app_mut(worker.app_index) {
            if let Some(slot) = app.workers.get_mut(worker.wrk_map_index as usize) {
                *slot = None;
            }
        }
        Some(worker)
    }

    /// Queue an event on every worker of an application.
    pub fn notify_app(&self, app_index: AppIndex, event: AppEvent) {
        let Some(app) = self.app(app_index) else {
            return;
        };
        for wrk in app.workers() {
            if let Some(worker) = self.worker(wrk) {
                worker.notify(event.clone());
            }
        }
    }
}

//! The session layer: control-plane tables plus the owner-thread run loop.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::application::{AppEvent, AppIndex, AppTables};
use crate::config::SessionLayerConfig;
use crate::dispatch::{ControlHandle, ControlOp, Dispatched, Dispatcher};
use crate::error::{SessionError, SessionResult};
use crate::handle::ListenerHandle;
use crate::listener::{ListenArgs, ListenerRegistry, UnlistenArgs};
use crate::lookup::{SessionLookup, SessionRule};
use crate::namespace::{NamespaceConfig, NamespaceIndex, NamespaceRegistry};
use crate::providers::Providers;
use crate::router::{close_transport_session, ConnectArgs, Connected, DisconnectArgs};
use crate::session::{SessionPools, OWNER_THREAD_INDEX};
use crate::uri::UriCache;

/// Session layer control plane.
///
/// The thread that creates the layer is its owner thread. Entry points that
/// change structure check they run there and fail with
/// [`SessionError::NotOwnerThread`] otherwise; `detach` and `disconnect`
/// instead queue themselves for the owner thread's run loop.
pub struct SessionLayer<P: Providers> {
    pub(crate) config: SessionLayerConfig,
    pub(crate) providers: P,
    pub(crate) namespaces: NamespaceRegistry,
    pub(crate) apps: AppTables,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) lookup: SessionLookup,
    pub(crate) sessions: Arc<SessionPools>,
    pub(crate) uri_cache: UriCache,
    pub(crate) dispatcher: Dispatcher,
}

impl<P: Providers> std::fmt::Debug for SessionLayer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLayer")
            .field("config", &self.config)
            .field("applications", &self.apps.app_count())
            .field("workers", &self.apps.worker_count())
            .field("listeners", &self.listeners.len())
            .field("namespaces", &self.namespaces.len())
            .finish_non_exhaustive()
    }
}

impl<P: Providers> SessionLayer<P> {
    /// Create a layer owned by the calling thread.
    pub fn new(config: SessionLayerConfig, providers: P) -> Self {
        let mut namespaces = NamespaceRegistry::new();
        for namespace in &config.namespaces {
            namespaces.add_or_update(namespace.clone());
        }
        let sessions = SessionPools::shared(config.worker_threads, config.session_pool_capacity);
        tracing::info!(
            worker_threads = config.worker_threads,
            namespaces = namespaces.len(),
            "session layer created"
        );
        Self {
            uri_cache: UriCache::new(config.uri_cache_capacity),
            config,
            providers,
            namespaces,
            apps: AppTables::new(),
            listeners: ListenerRegistry::new(),
            lookup: SessionLookup::new(),
            sessions,
            dispatcher: Dispatcher::new(),
        }
    }

    pub(crate) fn ensure_owner_thread(&self) -> SessionResult<()> {
        if self.dispatcher.is_owner_thread() {
            Ok(())
        } else {
            Err(SessionError::NotOwnerThread)
        }
    }

    /// Make the calling thread the owner thread.
    pub fn claim_owner_thread(&mut self) {
        self.dispatcher.claim();
        tracing::debug!(thread = ?std::thread::current().id(), "owner thread claimed");
    }

    /// True if the calling thread is the owner thread.
    pub fn is_owner_thread(&self) -> bool {
        self.dispatcher.is_owner_thread()
    }

    /// Handle for submitting operations from other threads.
    pub fn control_handle(&self) -> ControlHandle<P> {
        ControlHandle::new(
            self.dispatcher.sender(),
            Arc::clone(&self.sessions),
            self.providers.clone(),
        )
    }

    /// Configuration the layer was built with.
    pub fn config(&self) -> &SessionLayerConfig {
        &self.config
    }

    /// Collaborators.
    pub fn providers(&self) -> &P {
        &self.providers
    }

    /// Session pools, shared with data-plane workers.
    pub fn session_pools(&self) -> Arc<SessionPools> {
        Arc::clone(&self.sessions)
    }

    /// Application and worker tables.
    pub fn apps(&self) -> &AppTables {
        &self.apps
    }

    /// Application listeners.
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    /// Namespaces.
    pub fn namespaces(&self) -> &NamespaceRegistry {
        &self.namespaces
    }

    /// Lookup tables.
    pub fn lookup(&self) -> &SessionLookup {
        &self.lookup
    }

    /// Create or update a namespace. Owner thread only.
    pub fn add_namespace(&mut self, config: NamespaceConfig) -> SessionResult<NamespaceIndex> {
        self.ensure_owner_thread()?;
        Ok(self.namespaces.add_or_update(config))
    }

    /// Install a local-scope rule in a namespace. Owner thread only.
    pub fn add_session_rule(&mut self, ns_index: NamespaceIndex, rule: SessionRule) -> SessionResult<()> {
        self.ensure_owner_thread()?;
        if self.namespaces.get(ns_index).is_none() {
            return Err(SessionError::InvalidNamespace);
        }
        tracing::debug!(ns = %ns_index, ?rule, "session rule added");
        self.lookup.add_rule(ns_index, rule);
        Ok(())
    }

    /// Tear down a session.
    ///
    /// Transport sessions are closed from any thread. Local sessions live
    /// in the owner pool; off the owner thread their teardown is queued.
    pub fn disconnect(&mut self, args: DisconnectArgs) -> SessionResult<Dispatched<()>> {
        if self.dispatcher.is_owner_thread() {
            return self.disconnect_inline(args).map(Dispatched::Completed);
        }
        if args.handle.thread_index() == OWNER_THREAD_INDEX {
            self.dispatcher.enqueue(ControlOp::Disconnect(args));
            return Ok(Dispatched::Deferred);
        }
        close_transport_session(&self.sessions, self.providers.transport(), args)?;
        Ok(Dispatched::Completed(()))
    }

    /// Bind `proto://[host]address/port` for the first worker of `app`.
    pub fn bind_uri(&mut self, app: AppIndex, uri: &str) -> SessionResult<ListenerHandle> {
        self.ensure_owner_thread()?;
        let endpoint = self.uri_cache.parse(uri)?;
        self.listen_inline(ListenArgs::new(app, endpoint))
    }

    /// Undo [`Self::bind_uri`]. The listener is looked up in the default
    /// routing table of the address family.
    pub fn unbind_uri(&mut self, app: AppIndex, uri: &str) -> SessionResult<()> {
        self.ensure_owner_thread()?;
        let endpoint = self.uri_cache.parse(uri)?;
        let al_index = self
            .lookup
            .lookup_global_exact(0, &endpoint)
            .ok_or(SessionError::AddressNotInUse)?;
        self.unlisten_inline(UnlistenArgs::new(app, al_index.handle()))
    }

    /// Connect the first worker of `app` to `proto://[host]address/port`.
    pub fn connect_uri(&mut self, app: AppIndex, uri: &str, api_context: u32) -> SessionResult<Connected> {
        self.ensure_owner_thread()?;
        let endpoint = self.uri_cache.parse(uri)?;
        self.connect_inline(ConnectArgs::new(app, endpoint).with_context(api_context))
    }

    /// Run every queued operation. Owner thread only.
    ///
    /// Returns the number of operations run.
    pub fn run_pending(&mut self) -> SessionResult<usize> {
        self.ensure_owner_thread()?;
        let mut ran = 0;
        while let Some(op) = self.dispatcher.try_next() {
            self.execute(op);
            ran += 1;
        }
        Ok(ran)
    }

    /// Owner-thread run loop: execute queued operations until `shutdown`
    /// fires or is dropped.
    ///
    /// Must be polled on the owner thread, so run it on a current-thread
    /// runtime or a `LocalSet`.
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) -> SessionResult<()> {
        self.ensure_owner_thread()?;
        tracing::debug!("owner run loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                op = self.dispatcher.next() => match op {
                    Some(op) => self.execute(op),
                    None => break,
                },
            }
        }
        // Anything queued before shutdown still runs.
        self.run_pending()?;
        tracing::debug!("owner run loop stopped");
        Ok(())
    }

    /// Execute one deferred operation and report the outcome on the
    /// issuing application's event queues.
    fn execute(&mut self, op: ControlOp) {
        let kind = op.kind();
        let app = op.app();
        let (wrk_map_index, outcome) = match op {
            ControlOp::Detach(args) => (None, self.detach_inline(args).map(|()| None)),
            ControlOp::Disconnect(args) => (None, self.disconnect_inline(args).map(|()| None)),
            ControlOp::Listen(args) => (
                Some(args.wrk_map_index),
                self.listen_inline(args)
                    .map(|listener| Some(AppEvent::Listening { listener })),
            ),
            ControlOp::Unlisten(args) => {
                let listener = args.handle;
                (
                    Some(args.wrk_map_index),
                    self.unlisten_inline(args)
                        .map(|()| Some(AppEvent::Unlistened { listener })),
                )
            }
            ControlOp::Connect(args) => {
                let api_context = args.api_context;
                (
                    Some(args.wrk_map_index),
                    self.connect_inline(args).map(|connected| {
                        Some(AppEvent::Connected {
                            session: connected.handle,
                            scope: connected.scope,
                            api_context,
                        })
                    }),
                )
            }
        };

        let event = match outcome {
            Ok(None) => return,
            Ok(Some(event)) => event,
            Err(error) => {
                tracing::debug!(?kind, app = %app, %error, "deferred operation failed");
                AppEvent::OperationFailed { op: kind, error }
            }
        };
        self.report(app, wrk_map_index, event);
    }

    fn report(&self, app: AppIndex, wrk_map_index: Option<u32>, event: AppEvent) {
        if self.apps.app(app).is_none() {
            tracing::warn!(app = %app, ?event, "application gone, deferred outcome dropped");
            return;
        }
        match wrk_map_index.and_then(|index| self.apps.app_worker(app, index)) {
            Some(worker) => worker.notify(event),
            None => self.apps.notify_app(app, event),
        }
    }
}

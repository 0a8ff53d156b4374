//! Application listeners: dedup by canonical key, worker attachment, and
//! the bind/unbind entry points.
//!
//! A listener is shared by every worker of the application that first bound
//! its key. Workers of other applications never join it; their binds fail
//! with [`SessionError::AddressInUse`] for as long as the listener lives.

use std::collections::{BTreeSet, HashMap};

use crate::application::{AppIndex, WorkerIndex};
use crate::endpoint::{ListenerKey, SessionEndpoint, SessionEndpointCfg};
use crate::error::{SessionError, SessionResult};
use crate::handle::{ListenerHandle, SessionHandle};
use crate::layer::SessionLayer;
use crate::pool::{define_index, Key, Pool};
use crate::providers::{Providers, TransportProvider};
use crate::resolver::{endpoint_in_namespace, namespace_for_request, resolve_for_app};
use crate::session::{NewSession, SessionKind, SessionState, OWNER_THREAD_INDEX};

define_index!(
    /// Index of an application listener.
    ListenerIndex,
    "listener"
);

impl ListenerIndex {
    /// Opaque handle handed to applications.
    pub fn handle(self) -> ListenerHandle {
        ListenerHandle::encode(self.0.index(), self.0.generation())
    }

    /// Index named by a handle. The generation is kept, so a handle of a
    /// destroyed listener never names its successor.
    pub fn from_handle(handle: ListenerHandle) -> Self {
        ListenerIndex(Key::new(handle.index(), handle.generation()))
    }
}

/// A bound listening point shared by the workers of one application.
#[derive(Debug)]
pub struct AppListener {
    /// Own index.
    pub al_index: ListenerIndex,
    /// Owning application.
    pub app_index: AppIndex,
    /// Canonical key.
    pub key: ListenerKey,
    /// Resolved listen endpoint.
    pub endpoint: SessionEndpoint,
    /// Listener session in the owner pool, for global-scope listeners.
    pub session: Option<SessionHandle>,
    /// Registered in the namespace's local table.
    pub in_local: bool,
    /// Registered in the global table.
    pub in_global: bool,
    pub(crate) workers: BTreeSet<WorkerIndex>,
    next_worker: usize,
}

impl AppListener {
    /// Handle of the listener.
    pub fn handle(&self) -> ListenerHandle {
        self.al_index.handle()
    }

    /// Workers listening through the listener.
    pub fn workers(&self) -> impl Iterator<Item = WorkerIndex> + '_ {
        self.workers.iter().copied()
    }

    /// Number of attached workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Pick the worker that serves the next connect, round-robin over the
    /// attached workers in index order.
    pub(crate) fn select_worker(&mut self) -> Option<WorkerIndex> {
        if self.workers.is_empty() {
            return None;
        }
        let position = self.next_worker % self.workers.len();
        self.next_worker = self.next_worker.wrapping_add(1);
        self.workers.iter().nth(position).copied()
    }
}

/// All application listeners, indexed by key.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    listeners: Pool<AppListener>,
    by_key: HashMap<ListenerKey, ListenerIndex>,
}

impl ListenerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener behind an index, if it still exists.
    pub fn get(&self, al_index: ListenerIndex) -> Option<&AppListener> {
        self.listeners.get(al_index.0)
    }

    pub(crate) fn get_mut(&mut self, al_index: ListenerIndex) -> Option<&mut AppListener> {
        self.listeners.get_mut(al_index.0)
    }

    /// Listener bound on a key.
    pub fn lookup(&self, key: &ListenerKey) -> Option<ListenerIndex> {
        self.by_key.get(key).copied()
    }

    /// Number of listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// True if no listener exists.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Iterate over listeners.
    pub fn iter(&self) -> impl Iterator<Item = &AppListener> {
        self.listeners.iter().map(|(_, listener)| listener)
    }

    fn alloc(&mut self, app_index: AppIndex, key: ListenerKey, endpoint: SessionEndpoint) -> ListenerIndex {
        let lookup_key = key.clone();
        let al_index = ListenerIndex(self.listeners.insert_with(|k| AppListener {
            al_index: ListenerIndex(k),
            app_index,
            key,
            endpoint,
            session: None,
            in_local: false,
            in_global: false,
            workers: BTreeSet::new(),
            next_worker: 0,
        }));
        self.by_key.insert(lookup_key, al_index);
        al_index
    }

    fn free(&mut self, al_index: ListenerIndex) -> Option<AppListener> {
        let listener = self.listeners.remove(al_index.0)?;
        if self.by_key.get(&listener.key) == Some(&al_index) {
            self.by_key.remove(&listener.key);
        }
        Some(listener)
    }
}

/// Arguments of a listen request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenArgs {
    /// Requesting application.
    pub app: AppIndex,
    /// Worker map index of the requesting worker.
    pub wrk_map_index: u32,
    /// Endpoint to bind.
    pub endpoint: SessionEndpointCfg,
}

impl ListenArgs {
    /// Bind `endpoint` for the first worker of `app`.
    pub fn new(app: AppIndex, endpoint: impl Into<SessionEndpointCfg>) -> Self {
        Self {
            app,
            wrk_map_index: 0,
            endpoint: endpoint.into(),
        }
    }

    /// Bind for another worker of the application.
    pub fn for_worker(mut self, wrk_map_index: u32) -> Self {
        self.wrk_map_index = wrk_map_index;
        self
    }
}

/// Arguments of an unlisten request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlistenArgs {
    /// Requesting application.
    pub app: AppIndex,
    /// Worker map index of the requesting worker.
    pub wrk_map_index: u32,
    /// Listener to leave.
    pub handle: ListenerHandle,
}

impl UnlistenArgs {
    /// Leave `handle` with the first worker of `app`.
    pub fn new(app: AppIndex, handle: ListenerHandle) -> Self {
        Self {
            app,
            wrk_map_index: 0,
            handle,
        }
    }

    /// Leave with another worker of the application.
    pub fn for_worker(mut self, wrk_map_index: u32) -> Self {
        self.wrk_map_index = wrk_map_index;
        self
    }
}

impl<P: Providers> SessionLayer<P> {
    /// Bind an endpoint for a worker.
    ///
    /// Binding a key the application already listens on attaches the worker
    /// to the existing listener. Owner thread only.
    pub fn listen(&mut self, args: ListenArgs) -> SessionResult<ListenerHandle> {
        self.ensure_owner_thread()?;
        self.listen_inline(args)
    }

    /// Detach a worker from a listener, destroying the listener when its
    /// last worker leaves. Owner thread only.
    pub fn unlisten(&mut self, args: UnlistenArgs) -> SessionResult<()> {
        self.ensure_owner_thread()?;
        self.unlisten_inline(args)
    }

    pub(crate) fn listen_inline(&mut self, args: ListenArgs) -> SessionResult<ListenerHandle> {
        let app = self
            .apps
            .app(args.app)
            .ok_or(SessionError::ApplicationNotAttached)?;
        let wrk_index = app.worker(args.wrk_map_index).ok_or_else(|| SessionError::InvalidValue2 {
            reason: format!("no worker at map index {}", args.wrk_map_index),
        })?;

        let mut sep = args.endpoint;
        resolve_for_app(&mut sep, app, false, &self.namespaces, &self.apps);
        if !endpoint_in_namespace(&sep.endpoint, self.providers.addresses()) {
            return Err(SessionError::InvalidNamespaceBind);
        }
        let ns_index = namespace_for_request(&sep, app, &self.apps);
        let key = ListenerKey::new(ns_index, &sep.endpoint);

        if let Some(al_index) = self.listeners.lookup(&key) {
            let owner = self.listeners.get(al_index).map(|listener| listener.app_index);
            if owner != Some(args.app) {
                tracing::debug!(app = %args.app, endpoint = %sep.endpoint, "bind rejected, key owned by another application");
                return Err(SessionError::AddressInUse);
            }
            self.start_listen(wrk_index, al_index)?;
            return Ok(al_index.handle());
        }

        let al_index = self.alloc_listener(args.app, wrk_index, key, sep.endpoint)?;
        if let Err(err) = self.start_listen(wrk_index, al_index) {
            self.destroy_listener(al_index);
            return Err(err);
        }
        if let Some(listener) = self.listeners.get(al_index) {
            tracing::info!(
                app = %args.app,
                listener = %al_index,
                endpoint = %listener.endpoint,
                local = listener.in_local,
                global = listener.in_global,
                "listening"
            );
        }
        Ok(al_index.handle())
    }

    pub(crate) fn unlisten_inline(&mut self, args: UnlistenArgs) -> SessionResult<()> {
        let app = self
            .apps
            .app(args.app)
            .ok_or(SessionError::ApplicationNotAttached)?;
        let al_index = ListenerIndex::from_handle(args.handle);
        let listener = self
            .listeners
            .get(al_index)
            .ok_or(SessionError::AddressNotInUse)?;
        if listener.app_index != args.app {
            return Err(SessionError::NotOwner);
        }
        let wrk_index = app
            .worker(args.wrk_map_index)
            .filter(|wrk| listener.workers.contains(wrk))
            .ok_or(SessionError::WorkerNotFound)?;
        self.stop_listen(wrk_index, al_index);
        Ok(())
    }

    /// Allocate a listener and register it in the tables its application's
    /// scopes allow. Rolls everything back on failure.
    fn alloc_listener(
        &mut self,
        app_index: AppIndex,
        wrk_index: WorkerIndex,
        key: ListenerKey,
        endpoint: SessionEndpoint,
    ) -> SessionResult<ListenerIndex> {
        let (local_scope, global_scope) = self
            .apps
            .app(app_index)
            .map(|app| (app.has_local_scope(), app.has_global_scope()))
            .ok_or(SessionError::ApplicationNotAttached)?;
        let ns_index = key.ns_index;
        let al_index = self.listeners.alloc(app_index, key, endpoint.clone());

        if local_scope {
            if self.lookup.insert_local(ns_index, &endpoint, al_index).is_err() {
                self.destroy_listener(al_index);
                return Err(SessionError::AddressInUse);
            }
            if let Some(listener) = self.listeners.get_mut(al_index) {
                listener.in_local = true;
            }
        }

        if global_scope {
            let fib_index = endpoint.fib_index.unwrap_or_default();
            if self.lookup.insert_global(fib_index, &endpoint, al_index).is_err() {
                self.destroy_listener(al_index);
                return Err(SessionError::AddressInUse);
            }
            if let Some(listener) = self.listeners.get_mut(al_index) {
                listener.in_global = true;
            }
            if let Err(err) = self.providers.transport().listen(&endpoint, wrk_index) {
                if let Some(listener) = self.listeners.get_mut(al_index) {
                    listener.in_global = false;
                }
                self.lookup.remove_global(fib_index, &endpoint, al_index);
                self.destroy_listener(al_index);
                return Err(SessionError::ListenFailed {
                    reason: err.to_string(),
                });
            }
            let session = self.sessions.alloc(
                OWNER_THREAD_INDEX,
                NewSession {
                    app_index,
                    app_wrk_index: wrk_index,
                    state: SessionState::Listening,
                    endpoint,
                    kind: SessionKind::Listener { listener: al_index },
                },
            );
            match session {
                Ok(handle) => {
                    if let Some(listener) = self.listeners.get_mut(al_index) {
                        listener.session = Some(handle);
                    }
                }
                Err(err) => {
                    self.destroy_listener(al_index);
                    return Err(err);
                }
            }
        }

        if let Some(app) = self.apps.app_mut(app_index) {
            app.listeners.insert(al_index);
        }
        Ok(al_index)
    }

    /// Attach a worker to a listener. Idempotent.
    fn start_listen(&mut self, wrk_index: WorkerIndex, al_index: ListenerIndex) -> SessionResult<()> {
        let worker = self
            .apps
            .worker_mut(wrk_index)
            .ok_or(SessionError::WorkerNotFound)?;
        let listener = self
            .listeners
            .get_mut(al_index)
            .ok_or(SessionError::AddressNotInUse)?;
        worker.listeners.insert(al_index);
        if listener.workers.insert(wrk_index) {
            tracing::debug!(wrk = %wrk_index, listener = %al_index, "worker joined listener");
        }
        Ok(())
    }

    /// Detach a worker from a listener; the last worker out destroys it.
    pub(crate) fn stop_listen(&mut self, wrk_index: WorkerIndex, al_index: ListenerIndex) {
        if let Some(worker) = self.apps.worker_mut(wrk_index) {
            worker.listeners.remove(&al_index);
        }
        let remaining = match self.listeners.get_mut(al_index) {
            Some(listener) => {
                listener.workers.remove(&wrk_index);
                listener.workers.len()
            }
            None => return,
        };
        tracing::debug!(wrk = %wrk_index, listener = %al_index, remaining, "worker left listener");
        if remaining == 0 {
            self.destroy_listener(al_index);
        }
    }

    /// Remove a listener from every table it was registered in.
    pub(crate) fn destroy_listener(&mut self, al_index: ListenerIndex) {
        let Some(listener) = self.listeners.free(al_index) else {
            return;
        };
        if listener.in_local {
            self.lookup
                .remove_local(listener.key.ns_index, &listener.endpoint, al_index);
        }
        if listener.in_global {
            let fib_index = listener.endpoint.fib_index.unwrap_or_default();
            self.lookup
                .remove_global(fib_index, &listener.endpoint, al_index);
            self.providers.transport().unlisten(&listener.endpoint);
        }
        if let Some(session) = listener.session {
            if let Err(err) = self.sessions.free(session) {
                tracing::warn!(listener = %al_index, %session, %err, "listener session already gone");
            }
        }
        for wrk_index in &listener.workers {
            if let Some(worker) = self.apps.worker_mut(*wrk_index) {
                worker.listeners.remove(&al_index);
            }
        }
        if let Some(app) = self.apps.app_mut(listener.app_index) {
            app.listeners.remove(&al_index);
        }
        tracing::info!(app = %listener.app_index, listener = %al_index, endpoint = %listener.endpoint, "listener destroyed");
    }
}

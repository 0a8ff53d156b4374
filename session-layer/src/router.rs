//! Connect routing and local-session rendezvous.
//!
//! A connect is tried, in order, against:
//!
//! 1. the local-scope table of the caller's namespace (policy rules and
//!    co-located listeners), skipping listeners owned by the caller itself
//! 2. the global table of the resolved FIB
//! 3. the transport collaborator, which goes out to the network
//!
//! The first two tiers end in a rendezvous session between the connecting
//! worker and a worker of the matched listener, without touching the
//! transport.

use crate::application::{AppEvent, AppIndex, WorkerIndex};
use crate::endpoint::SessionEndpointCfg;
use crate::error::{SessionError, SessionResult};
use crate::handle::SessionHandle;
use crate::layer::SessionLayer;
use crate::listener::ListenerIndex;
use crate::lookup::LocalLookup;
use crate::providers::{Providers, TransportProvider};
use crate::resolver::{namespace_for_request, resolve_for_app};
use crate::session::{LocalSession, NewSession, SessionKind, SessionPools, SessionState, OWNER_THREAD_INDEX};

/// Which tier served a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectScope {
    /// Co-located listener found in the namespace's local table.
    Local,
    /// Co-located listener found in the global table.
    Global,
    /// Network connection originated by the transport.
    Transport,
}

/// Arguments of a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectArgs {
    /// Connecting application.
    pub app: AppIndex,
    /// Worker map index of the connecting worker.
    pub wrk_map_index: u32,
    /// Destination.
    pub endpoint: SessionEndpointCfg,
    /// Opaque context echoed back to the caller.
    pub api_context: u32,
}

impl ConnectArgs {
    /// Connect the first worker of `app` to `endpoint`.
    pub fn new(app: AppIndex, endpoint: impl Into<SessionEndpointCfg>) -> Self {
        Self {
            app,
            wrk_map_index: 0,
            endpoint: endpoint.into(),
            api_context: 0,
        }
    }

    /// Connect from another worker of the application.
    pub fn for_worker(mut self, wrk_map_index: u32) -> Self {
        self.wrk_map_index = wrk_map_index;
        self
    }

    /// Set the caller's context.
    pub fn with_context(mut self, api_context: u32) -> Self {
        self.api_context = api_context;
        self
    }
}

/// A completed connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connected {
    /// The new session.
    pub handle: SessionHandle,
    /// Tier that served the connect.
    pub scope: ConnectScope,
}

/// Arguments of a disconnect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectArgs {
    /// Requesting application.
    pub app: AppIndex,
    /// Session to tear down.
    pub handle: SessionHandle,
}

impl<P: Providers> SessionLayer<P> {
    /// Connect a worker to an endpoint. Owner thread only.
    pub fn connect(&mut self, args: ConnectArgs) -> SessionResult<Connected> {
        self.ensure_owner_thread()?;
        self.connect_inline(args)
    }

    pub(crate) fn connect_inline(&mut self, args: ConnectArgs) -> SessionResult<Connected> {
        if args.endpoint.endpoint.is_zero() {
            return Err(SessionError::invalid("cannot connect to the unspecified address"));
        }
        let app = self
            .apps
            .app(args.app)
            .ok_or(SessionError::ApplicationNotAttached)?;
        let client_wrk = app.worker(args.wrk_map_index).ok_or_else(|| SessionError::InvalidValue2 {
            reason: format!("no worker at map index {}", args.wrk_map_index),
        })?;
        let (local_scope, global_scope) = (app.has_local_scope(), app.has_global_scope());

        let mut sep = args.endpoint;
        resolve_for_app(&mut sep, app, true, &self.namespaces, &self.apps);
        let ns_index = namespace_for_request(&sep, app, &self.apps);

        // Every connect of a local-scope app goes through the local table,
        // since rules there may cover non-local destinations too.
        if local_scope {
            match self.lookup.lookup_local(ns_index, &sep.endpoint) {
                LocalLookup::Drop => {
                    tracing::debug!(app = %args.app, endpoint = %sep.endpoint, "connect filtered");
                    return Err(SessionError::ConnectFiltered);
                }
                LocalLookup::NoMatch => {}
                LocalLookup::Listener(al_index) => {
                    match self.listeners.get(al_index).map(|listener| listener.app_index) {
                        Some(owner) if owner == args.app => {
                            tracing::debug!(
                                app = %args.app,
                                listener = %al_index,
                                "local listener belongs to the connecting app, trying global scope"
                            );
                        }
                        Some(_) => {
                            return self.local_session_connect(
                                args.app,
                                client_wrk,
                                al_index,
                                ConnectScope::Local,
                                args.api_context,
                            );
                        }
                        None => {}
                    }
                }
            }
        }

        if sep.endpoint.is_local() {
            return Err(SessionError::SessionConnectLocalOnly);
        }
        if !global_scope {
            return Err(SessionError::ConnectScopeDenied);
        }

        let fib_index = sep.endpoint.fib_index.unwrap_or_default();
        if let Some(al_index) = self.lookup.lookup_global(fib_index, &sep.endpoint) {
            return self.local_session_connect(
                args.app,
                client_wrk,
                al_index,
                ConnectScope::Global,
                args.api_context,
            );
        }

        let handle = self
            .providers
            .transport()
            .connect(&sep, args.app, client_wrk, args.api_context)?;
        if let Some(worker) = self.apps.worker_mut(client_wrk) {
            worker.connects.insert(handle);
        }
        tracing::debug!(app = %args.app, endpoint = %sep.endpoint, %handle, "connect handed to transport");
        Ok(Connected {
            handle,
            scope: ConnectScope::Transport,
        })
    }

    /// Create a rendezvous session between a client worker and a worker of
    /// a listener, and tell the server side.
    fn local_session_connect(
        &mut self,
        client_app: AppIndex,
        client_wrk: WorkerIndex,
        al_index: ListenerIndex,
        scope: ConnectScope,
        api_context: u32,
    ) -> SessionResult<Connected> {
        let listener = self
            .listeners
            .get_mut(al_index)
            .ok_or(SessionError::AddressNotInUse)?;
        let server_wrk = listener.select_worker().ok_or(SessionError::WorkerNotFound)?;
        let server_app = listener.app_index;
        let listener_handle = listener.handle();
        let endpoint = listener.endpoint.clone();

        let handle = self.sessions.alloc(
            OWNER_THREAD_INDEX,
            NewSession {
                app_index: server_app,
                app_wrk_index: server_wrk,
                state: SessionState::Ready,
                endpoint,
                kind: SessionKind::Local(LocalSession {
                    client_app,
                    client_wrk,
                    server_app,
                    server_wrk,
                    listener: al_index,
                    api_context,
                }),
            },
        )?;

        if let Some(worker) = self.apps.worker_mut(client_wrk) {
            worker.local_sessions.insert(handle);
        }
        if let Some(worker) = self.apps.worker_mut(server_wrk) {
            worker.local_sessions.insert(handle);
            worker.notify(AppEvent::Accepted {
                listener: listener_handle,
                session: handle,
                client: client_app,
            });
        }
        tracing::debug!(
            client = %client_wrk,
            server = %server_wrk,
            listener = %al_index,
            %handle,
            ?scope,
            "local session established"
        );
        Ok(Connected { handle, scope })
    }

    pub(crate) fn disconnect_inline(&mut self, args: DisconnectArgs) -> SessionResult<()> {
        if args.handle.thread_index() != OWNER_THREAD_INDEX {
            let wrk_index = close_transport_session(&self.sessions, self.providers.transport(), args)?;
            self.forget_connect(wrk_index, args.handle);
            return Ok(());
        }

        // Already gone: nothing left to do.
        let Ok(session) = self.sessions.snapshot(args.handle) else {
            return Ok(());
        };
        match session.kind {
            SessionKind::Local(local) => {
                if args.app != local.client_app && args.app != local.server_app {
                    return Err(SessionError::NotOwner);
                }
                self.teardown_local_session(args.handle);
                Ok(())
            }
            SessionKind::Listener { .. } => Err(SessionError::invalid(
                "listener sessions are removed with unlisten",
            )),
            SessionKind::Transport => {
                let wrk_index = close_transport_session(&self.sessions, self.providers.transport(), args)?;
                self.forget_connect(wrk_index, args.handle);
                Ok(())
            }
        }
    }

    /// Free a local session and tell both sides.
    pub(crate) fn teardown_local_session(&mut self, handle: SessionHandle) {
        let Ok(session) = self.sessions.free(handle) else {
            return;
        };
        let SessionKind::Local(local) = session.kind else {
            return;
        };
        for wrk_index in [local.client_wrk, local.server_wrk] {
            if let Some(worker) = self.apps.worker_mut(wrk_index) {
                if worker.local_sessions.remove(&handle) {
                    worker.notify(AppEvent::Disconnected { session: handle });
                }
            }
        }
        tracing::debug!(%handle, client = %local.client_wrk, server = %local.server_wrk, "local session closed");
    }

    fn forget_connect(&mut self, wrk_index: WorkerIndex, handle: SessionHandle) {
        if let Some(worker) = self.apps.worker_mut(wrk_index) {
            worker.connects.remove(&handle);
        }
    }
}

/// Close a transport session on behalf of `args.app`, returning the worker
/// that owned it.
///
/// Only reads the session pools, so it runs on any thread.
pub(crate) fn close_transport_session(
    sessions: &SessionPools,
    transport: &impl TransportProvider,
    args: DisconnectArgs,
) -> SessionResult<WorkerIndex> {
    let (owner, wrk_index) = {
        let session = sessions.resolve(args.handle)?;
        (session.app_index, session.app_wrk_index)
    };
    if owner != args.app {
        return Err(SessionError::invalid("session belongs to another application"));
    }
    transport.close(args.handle);
    tracing::debug!(app = %args.app, handle = %args.handle, "transport session closed");
    Ok(wrk_index)
}

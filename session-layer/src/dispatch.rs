//! Owner-thread dispatch.
//!
//! Structural changes to applications, workers, listeners and namespaces
//! happen on one thread only. A request made anywhere else is copied into a
//! [`ControlOp`] and queued for the owner thread's run loop; the caller gets
//! [`Dispatched::Deferred`] back and learns the outcome from its workers'
//! event queues.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use tokio::sync::mpsc;

use crate::application::AppIndex;
use crate::error::{SessionError, SessionResult};
use crate::lifecycle::DetachArgs;
use crate::listener::{ListenArgs, UnlistenArgs};
use crate::providers::Providers;
use crate::router::{close_transport_session, ConnectArgs, DisconnectArgs};
use crate::session::{SessionPools, OWNER_THREAD_INDEX};

/// Control operation queued for the owner thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOp {
    /// Detach an application or some of its workers.
    Detach(DetachArgs),
    /// Tear down a session.
    Disconnect(DisconnectArgs),
    /// Bind an endpoint.
    Listen(ListenArgs),
    /// Leave a listener.
    Unlisten(UnlistenArgs),
    /// Connect to an endpoint.
    Connect(ConnectArgs),
}

/// Kind of a [`ControlOp`], as reported in failure events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOpKind {
    /// [`ControlOp::Detach`].
    Detach,
    /// [`ControlOp::Disconnect`].
    Disconnect,
    /// [`ControlOp::Listen`].
    Listen,
    /// [`ControlOp::Unlisten`].
    Unlisten,
    /// [`ControlOp::Connect`].
    Connect,
}

impl ControlOp {
    /// Kind of the operation.
    pub fn kind(&self) -> ControlOpKind {
        match self {
            ControlOp::Detach(_) => ControlOpKind::Detach,
            ControlOp::Disconnect(_) => ControlOpKind::Disconnect,
            ControlOp::Listen(_) => ControlOpKind::Listen,
            ControlOp::Unlisten(_) => ControlOpKind::Unlisten,
            ControlOp::Connect(_) => ControlOpKind::Connect,
        }
    }

    /// Application that issued the operation.
    pub fn app(&self) -> AppIndex {
        match self {
            ControlOp::Detach(args) => args.app,
            ControlOp::Disconnect(args) => args.app,
            ControlOp::Listen(args) => args.app,
            ControlOp::Unlisten(args) => args.app,
            ControlOp::Connect(args) => args.app,
        }
    }
}

/// Outcome of a dispatched operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched<T> {
    /// Ran synchronously on the owner thread.
    Completed(T),
    /// Queued for the owner thread. Nothing is known about the result yet.
    Deferred,
}

impl<T> Dispatched<T> {
    /// The result, if the operation completed.
    pub fn completed(self) -> Option<T> {
        match self {
            Dispatched::Completed(value) => Some(value),
            Dispatched::Deferred => None,
        }
    }

    /// True if the operation was queued.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Dispatched::Deferred)
    }
}

/// Owner thread identity plus its operation queue.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    owner: ThreadId,
    tx: mpsc::UnboundedSender<ControlOp>,
    rx: mpsc::UnboundedReceiver<ControlOp>,
}

impl Dispatcher {
    /// Dispatcher owned by the calling thread.
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            owner: thread::current().id(),
            tx,
            rx,
        }
    }

    pub(crate) fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub(crate) fn claim(&mut self) {
        self.owner = thread::current().id();
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<ControlOp> {
        self.tx.clone()
    }

    pub(crate) fn enqueue(&self, op: ControlOp) {
        tracing::debug!(kind = ?op.kind(), app = %op.app(), "deferring to owner thread");
        if let Err(err) = self.tx.send(op) {
            tracing::warn!(kind = ?err.0.kind(), app = %err.0.app(), "owner queue closed, operation dropped");
        }
    }

    pub(crate) fn try_next(&mut self) -> Option<ControlOp> {
        self.rx.try_recv().ok()
    }

    pub(crate) async fn next(&mut self) -> Option<ControlOp> {
        self.rx.recv().await
    }
}

/// Submits control operations from any thread.
///
/// Everything except transport-session disconnects runs on the owner thread
/// later; outcomes arrive on the application's event queues.
pub struct ControlHandle<P: Providers> {
    tx: mpsc::UnboundedSender<ControlOp>,
    sessions: Arc<SessionPools>,
    providers: P,
}

impl<P: Providers> Clone for ControlHandle<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            sessions: Arc::clone(&self.sessions),
            providers: self.providers.clone(),
        }
    }
}

impl<P: Providers> std::fmt::Debug for ControlHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlHandle")
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

impl<P: Providers> ControlHandle<P> {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ControlOp>, sessions: Arc<SessionPools>, providers: P) -> Self {
        Self {
            tx,
            sessions,
            providers,
        }
    }

    /// Queue any operation for the owner thread.
    pub fn submit(&self, op: ControlOp) -> SessionResult<()> {
        tracing::debug!(kind = ?op.kind(), app = %op.app(), "submitted to owner thread");
        self.tx.send(op).map_err(|_| SessionError::Shutdown)
    }

    /// Queue a detach.
    pub fn detach(&self, args: DetachArgs) -> SessionResult<()> {
        self.submit(ControlOp::Detach(args))
    }

    /// Queue a listen. Success arrives as [`AppEvent::Listening`](crate::AppEvent::Listening).
    pub fn listen(&self, args: ListenArgs) -> SessionResult<()> {
        self.submit(ControlOp::Listen(args))
    }

    /// Queue an unlisten.
    pub fn unlisten(&self, args: UnlistenArgs) -> SessionResult<()> {
        self.submit(ControlOp::Unlisten(args))
    }

    /// Queue a connect. Success arrives as [`AppEvent::Connected`](crate::AppEvent::Connected).
    pub fn connect(&self, args: ConnectArgs) -> SessionResult<()> {
        self.submit(ControlOp::Connect(args))
    }

    /// Disconnect a session.
    ///
    /// Transport sessions live in worker pools and are closed right here.
    /// Local sessions belong to the owner thread and are queued.
    pub fn disconnect(&self, args: DisconnectArgs) -> SessionResult<Dispatched<()>> {
        if args.handle.thread_index() == OWNER_THREAD_INDEX {
            self.submit(ControlOp::Disconnect(args))?;
            return Ok(Dispatched::Deferred);
        }
        close_transport_session(&self.sessions, self.providers.transport(), args)?;
        Ok(Dispatched::Completed(()))
    }

    /// Session pools, for read-only lookups from the calling thread.
    pub fn sessions(&self) -> &SessionPools {
        &self.sessions
    }
}

//! Per-thread session pools and handle resolution.
//!
//! Each thread owns one pool. Pool 0 belongs to the control-plane owner
//! thread and holds listener objects and local-scope rendezvous sessions;
//! pools `1..=N` belong to data-plane workers and hold transport sessions.
//! Only the owning thread inserts into or frees from its pool. Any thread
//! may *read* another thread's pool, but only through
//! [`SessionPools::resolve`], which re-validates the slot every time.

use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};

use crate::application::{AppIndex, WorkerIndex};
use crate::endpoint::SessionEndpoint;
use crate::error::{SessionError, SessionResult};
use crate::handle::SessionHandle;
use crate::listener::ListenerIndex;
use crate::pool::Pool;

/// Thread index of the control-plane owner thread's pool.
pub const OWNER_THREAD_INDEX: u32 = 0;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Listener object accepting connects.
    Listening,
    /// Connect in progress.
    Connecting,
    /// Established.
    Ready,
    /// Teardown started.
    Closing,
}

/// Rendezvous between a client worker and a server worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSession {
    /// Application that connected.
    pub client_app: AppIndex,
    /// Worker that connected.
    pub client_wrk: WorkerIndex,
    /// Application that accepted.
    pub server_app: AppIndex,
    /// Worker selected to accept.
    pub server_wrk: WorkerIndex,
    /// Listener the connect matched.
    pub listener: ListenerIndex,
    /// Context the client passed with its connect.
    pub api_context: u32,
}

/// What a session is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    /// Underlying object of a global-scope application listener.
    Listener {
        /// Owning application listener.
        listener: ListenerIndex,
    },
    /// Local-scope rendezvous.
    Local(LocalSession),
    /// Network session originated by the transport.
    Transport,
}

/// A session record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Thread whose pool holds the session.
    pub thread_index: u32,
    /// Slot inside that pool.
    pub session_index: u32,
    /// Application owning the session (the server side for local sessions).
    pub app_index: AppIndex,
    /// Worker owning the session.
    pub app_wrk_index: WorkerIndex,
    /// Lifecycle state.
    pub state: SessionState,
    /// Endpoint the session listens on or connects to.
    pub endpoint: SessionEndpoint,
    /// Kind-specific data.
    pub kind: SessionKind,
}

impl Session {
    /// Handle naming this session.
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::encode(self.thread_index, self.session_index)
    }

    /// True for local-scope rendezvous sessions.
    pub fn is_local(&self) -> bool {
        matches!(self.kind, SessionKind::Local(_))
    }
}

/// Fields of a session before it has a slot.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Owning application.
    pub app_index: AppIndex,
    /// Owning worker.
    pub app_wrk_index: WorkerIndex,
    /// Initial state.
    pub state: SessionState,
    /// Endpoint.
    pub endpoint: SessionEndpoint,
    /// Kind-specific data.
    pub kind: SessionKind,
}

/// Read-only view of a session in some thread's pool.
///
/// Holds that pool's reader lock until dropped; it is not `Send`, so it
/// cannot be carried across a thread hop.
pub type SessionRef<'a> = MappedRwLockReadGuard<'a, Session>;

/// All per-thread session pools.
#[derive(Debug)]
pub struct SessionPools {
    threads: Vec<RwLock<Pool<Session>>>,
}

impl SessionPools {
    /// Pools for the owner thread plus `worker_threads` workers.
    pub fn new(worker_threads: u32, capacity: usize) -> Self {
        let threads = (0..=worker_threads)
            .map(|_| RwLock::new(Pool::with_capacity(capacity)))
            .collect();
        Self { threads }
    }

    /// Shared handle, as kept by the layer and by remote submitters.
    pub fn shared(worker_threads: u32, capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(worker_threads, capacity))
    }

    /// Number of pools, owner thread included.
    pub fn thread_count(&self) -> u32 {
        self.threads.len() as u32
    }

    fn pool(&self, thread_index: u32) -> SessionResult<&RwLock<Pool<Session>>> {
        self.threads
            .get(thread_index as usize)
            .ok_or(SessionError::InvalidOwner { thread_index })
    }

    /// Allocate a session in `thread_index`'s pool.
    ///
    /// Must be called from the thread owning that pool.
    pub fn alloc(&self, thread_index: u32, new: NewSession) -> SessionResult<SessionHandle> {
        let mut pool = self.pool(thread_index)?.write();
        let key = pool.insert_with(|key| Session {
            thread_index,
            session_index: key.index(),
            app_index: new.app_index,
            app_wrk_index: new.app_wrk_index,
            state: new.state,
            endpoint: new.endpoint,
            kind: new.kind,
        });
        Ok(SessionHandle::encode(thread_index, key.index()))
    }

    /// Resolve a handle to a live session.
    ///
    /// Fails with [`SessionError::InvalidOwner`] if the thread index names no
    /// pool and with [`SessionError::StaleSlot`] if the slot is free.
    pub fn resolve(&self, handle: SessionHandle) -> SessionResult<SessionRef<'_>> {
        let (thread_index, session_index) = handle.decode();
        let pool = self.pool(thread_index)?.read();
        RwLockReadGuard::try_map(pool, |pool| pool.get_by_index(session_index)).map_err(|_| {
            SessionError::StaleSlot {
                thread_index,
                session_index,
            }
        })
    }

    /// Resolve and copy a session out, releasing the pool lock immediately.
    pub fn snapshot(&self, handle: SessionHandle) -> SessionResult<Session> {
        self.resolve(handle).map(|session| session.clone())
    }

    /// True if the handle currently resolves.
    pub fn is_live(&self, handle: SessionHandle) -> bool {
        self.resolve(handle).is_ok()
    }

    /// Change the state of a session. Owning thread only.
    pub fn set_state(&self, handle: SessionHandle, state: SessionState) -> SessionResult<()> {
        let (thread_index, session_index) = handle.decode();
        let mut pool = self.pool(thread_index)?.write();
        let session = pool
            .get_by_index_mut(session_index)
            .ok_or(SessionError::StaleSlot {
                thread_index,
                session_index,
            })?;
        session.state = state;
        Ok(())
    }

    /// Free a session, returning it. Owning thread only.
    pub fn free(&self, handle: SessionHandle) -> SessionResult<Session> {
        let (thread_index, session_index) = handle.decode();
        let mut pool = self.pool(thread_index)?.write();
        pool.remove_by_index(session_index)
            .ok_or(SessionError::StaleSlot {
                thread_index,
                session_index,
            })
    }

    /// Number of live sessions in one pool.
    pub fn session_count(&self, thread_index: u32) -> usize {
        self.threads
            .get(thread_index as usize)
            .map_or(0, |pool| pool.read().len())
    }
}

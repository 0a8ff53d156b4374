//! Error types for the session layer control plane.
//!
//! Every control operation returns [`SessionResult`]. Collaborator failures
//! have their own enums ([`TransportError`], [`SegmentError`], [`UriError`])
//! and are folded into [`SessionError`] at the layer boundary.

/// Result alias used by every control-plane operation.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors returned by control-plane operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The application handle does not resolve to an attached application.
    #[error("application not attached")]
    ApplicationNotAttached,

    /// An application with the same identity is already attached.
    #[error("application already attached")]
    AlreadyAttached,

    /// Malformed argument.
    #[error("invalid value: {reason}")]
    InvalidValue {
        /// What was wrong with the argument.
        reason: String,
    },

    /// An argument referenced a component that does not exist.
    #[error("invalid value (secondary): {reason}")]
    InvalidValue2 {
        /// What was wrong with the argument.
        reason: String,
    },

    /// The namespace id is not registered.
    #[error("invalid namespace")]
    InvalidNamespace,

    /// The namespace is secret-gated and the secret did not match.
    #[error("wrong namespace secret")]
    WrongNamespaceSecret,

    /// The bind endpoint is not reachable inside the application's namespace.
    #[error("endpoint not configured in namespace")]
    InvalidNamespaceBind,

    /// Another application already listens on the same key.
    #[error("address in use")]
    AddressInUse,

    /// The unlisten target does not exist.
    #[error("address not in use")]
    AddressNotInUse,

    /// The caller does not own the object it tried to act on.
    #[error("application does not own the target")]
    NotOwner,

    /// The worker is not registered with the target.
    #[error("worker not found")]
    WorkerNotFound,

    /// A local-scope rule explicitly denies the destination.
    #[error("connect filtered by local scope rule")]
    ConnectFiltered,

    /// The application lacks permission for the scope that would serve the connect.
    #[error("connect scope denied")]
    ConnectScopeDenied,

    /// A local-only endpoint reached the global lookup path.
    #[error("local-only endpoint cannot be connected through the global scope")]
    SessionConnectLocalOnly,

    /// The transport fallback could not originate a connection.
    #[error("session connect failed: {reason}")]
    SessionConnectFailed {
        /// Reason reported by the transport collaborator.
        reason: String,
    },

    /// The handle names a thread without a session pool.
    #[error("handle owner thread {thread_index} does not exist")]
    InvalidOwner {
        /// Thread index decoded from the handle.
        thread_index: u32,
    },

    /// The handle names a slot that is currently free.
    #[error("stale handle: slot {session_index} on thread {thread_index} is free")]
    StaleSlot {
        /// Thread index decoded from the handle.
        thread_index: u32,
        /// Slot index decoded from the handle.
        session_index: u32,
    },

    /// The transport refused to listen for a global-scope listener.
    #[error("listen failed: {reason}")]
    ListenFailed {
        /// Reason reported by the transport collaborator.
        reason: String,
    },

    /// An owner-thread-only entry point was invoked on another thread.
    #[error("operation must run on the control-plane owner thread")]
    NotOwnerThread,

    /// The owner thread's run loop is gone.
    #[error("control plane shut down")]
    Shutdown,

    /// Segment manager failure.
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    /// URI parsing failure.
    #[error("uri error: {0}")]
    Uri(#[from] UriError),
}

impl SessionError {
    /// Shorthand for [`SessionError::InvalidValue`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        SessionError::InvalidValue {
            reason: reason.into(),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        SessionError::SessionConnectFailed {
            reason: err.to_string(),
        }
    }
}

/// Errors reported by the transport collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No transport is available for the requested protocol.
    #[error("no transport available for {proto}")]
    Unavailable {
        /// Protocol name.
        proto: String,
    },

    /// The transport refused the connection.
    #[error("connection refused: {message}")]
    Refused {
        /// Details from the transport.
        message: String,
    },

    /// The transport could not create a listener.
    #[error("listen failed: {message}")]
    ListenFailed {
        /// Details from the transport.
        message: String,
    },
}

/// Errors reported by the segment manager collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SegmentError {
    /// The segment manager does not exist.
    #[error("segment manager {manager} not found")]
    ManagerNotFound {
        /// Manager identifier.
        manager: u32,
    },

    /// The segment does not exist in the manager.
    #[error("segment {index} not found in manager {manager}")]
    SegmentNotFound {
        /// Manager identifier.
        manager: u32,
        /// Segment index within the manager.
        index: u32,
    },

    /// The requested segment size is unusable.
    #[error("invalid segment size {size}")]
    InvalidSize {
        /// Requested size in bytes.
        size: u64,
    },
}

/// Errors from parsing `proto://[host]address/port` URIs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    /// Missing `://` separator.
    #[error("invalid uri format (expected 'proto://[host]address/port')")]
    InvalidFormat,

    /// Unknown transport protocol.
    #[error("unknown transport protocol: {0}")]
    UnknownProtocol(String),

    /// The address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The port could not be parsed.
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

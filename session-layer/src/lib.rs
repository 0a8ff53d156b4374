//! # session-layer
//!
//! Control plane that lets co-located applications listen, connect and
//! disconnect on top of a packet-processing dataplane.
//!
//! Applications attach into a namespace, then bind and connect endpoints.
//! Every connect is routed through three tiers: the namespace's local
//! table, the global table, and finally the network transport. The first
//! two end in a shared-memory rendezvous between two workers; only the last
//! reaches the network.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       SessionLayer                           │
//! │  attach / detach / listen / unlisten / connect / disconnect  │
//! ├─────────────────┬──────────────────┬─────────────────────────┤
//! │ lifecycle       │ listener         │ router                  │
//! │ • apps, workers │ • key dedup      │ • local → global →      │
//! │ • segments      │ • worker attach  │   transport             │
//! │ • ns admission  │ • lookup tables  │ • loop avoidance        │
//! ├─────────────────┴──────────────────┴─────────────────────────┤
//! │ resolver  •  namespace  •  lookup  •  session pools/handles  │
//! ├──────────────────────────────────────────────────────────────┤
//! │ dispatch: owner-thread queue, ControlHandle elsewhere        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ providers: address table, transport, segments, proxy setup   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threads
//!
//! The thread that creates a [`SessionLayer`] owns all control tables.
//! Data-plane workers hold a [`ControlHandle`] and submit operations that
//! run on the owner thread's [`run`](SessionLayer::run) loop; results come
//! back as [`AppEvent`]s. Sessions are named by [`SessionHandle`]s that any
//! thread can resolve through [`SessionPools::resolve`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use session_layer::*;
//!
//! let providers = StandardProviders::new(
//!     StaticAddressTable::new().with_address(1, 0, "10.0.0.1".parse()?),
//! );
//! let mut layer = SessionLayer::new(SessionLayerConfig::default(), providers);
//!
//! let server = layer.attach(AttachArgs::named("server"))?;
//! layer.bind_uri(server.app, "tcp://10.0.0.1/80")?;
//!
//! let client = layer.attach(AttachArgs::named("client"))?;
//! let connected = layer.connect_uri(client.app, "tcp://10.0.0.1/80", 0)?;
//! assert_eq!(connected.scope, ConnectScope::Local);
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod application;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod handle;
pub mod layer;
pub mod lifecycle;
pub mod listener;
pub mod lookup;
pub mod namespace;
mod pool;
pub mod providers;
pub mod resolver;
pub mod router;
pub mod session;
pub mod uri;

pub use application::{
    AppEvent, AppEventReceiver, AppEventSender, AppFlags, AppIndex, AppOptions, AppTables, AppWorker,
    Application, WorkerIndex,
};
pub use config::SessionLayerConfig;
pub use dispatch::{ControlHandle, ControlOp, ControlOpKind, Dispatched};
pub use endpoint::{
    FibIndex, FibProto, InterfaceIndex, ListenerKey, PeerEndpoint, SessionEndpoint, SessionEndpointCfg,
    TransportProto,
};
pub use error::{SegmentError, SessionError, SessionResult, TransportError, UriError};
pub use handle::{ListenerHandle, SessionHandle};
pub use layer::SessionLayer;
pub use lifecycle::{AttachArgs, Attached, DetachArgs, WorkerAttachment};
pub use listener::{AppListener, ListenArgs, ListenerIndex, ListenerRegistry, UnlistenArgs};
pub use lookup::{LocalLookup, RuleAction, SessionLookup, SessionRule};
pub use namespace::{AppNamespace, NamespaceConfig, NamespaceIndex, NamespaceRegistry, DEFAULT_NAMESPACE_ID};
pub use providers::{
    AddressTable, MemorySegmentManager, NoProxy, NoTransport, Providers, ProxySetup, Segment,
    SegmentManagerId, SegmentProvider, SegmentReadGuard, StandardProviders, StaticAddressTable,
    TransportProvider,
};
pub use router::{ConnectArgs, ConnectScope, Connected, DisconnectArgs};
pub use session::{
    LocalSession, NewSession, Session, SessionKind, SessionPools, SessionRef, SessionState,
    OWNER_THREAD_INDEX,
};
pub use uri::{parse_uri, UriCache};

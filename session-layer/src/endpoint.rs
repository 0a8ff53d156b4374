//! Session endpoints: (protocol, address, port) plus routing constraints.
//!
//! An endpoint is *local* when its address is unspecified or loopback; such
//! an endpoint is only meaningful inside the local scope and never carries a
//! routed address. Routing constraints (`fib_index`, `sw_if_index`) start
//! unset and are filled in by the [resolver](crate::resolver).

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::application::WorkerIndex;
use crate::namespace::NamespaceIndex;

/// Routing (FIB) table index.
pub type FibIndex = u32;

/// Network interface index.
pub type InterfaceIndex = u32;

/// Transport protocols sessions can be opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProto {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// TLS over TCP.
    Tls,
    /// QUIC.
    Quic,
}

impl TransportProto {
    /// Lowercase protocol name, as used in URIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProto::Tcp => "tcp",
            TransportProto::Udp => "udp",
            TransportProto::Tls => "tls",
            TransportProto::Quic => "quic",
        }
    }

    /// Parse a protocol name (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "tcp" => Some(TransportProto::Tcp),
            "udp" => Some(TransportProto::Udp),
            "tls" => Some(TransportProto::Tls),
            "quic" => Some(TransportProto::Quic),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address family selecting which FIB of a namespace applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FibProto {
    /// IPv4 tables.
    Ip4,
    /// IPv6 tables.
    Ip6,
}

/// A (protocol, address, port) triple with routing constraints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionEndpoint {
    /// IPv4 or IPv6 address.
    pub ip: IpAddr,
    /// Port in host byte order.
    pub port: u16,
    /// Transport protocol.
    pub transport_proto: TransportProto,
    /// Optional hostname (e.g. TLS server name).
    pub hostname: Option<String>,
    /// Routing table, unset until resolved.
    pub fib_index: Option<FibIndex>,
    /// Interface constraint, unset means unconstrained.
    pub sw_if_index: Option<InterfaceIndex>,
}

impl SessionEndpoint {
    /// Endpoint without routing constraints.
    pub fn new(transport_proto: TransportProto, ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            transport_proto,
            hostname: None,
            fib_index: None,
            sw_if_index: None,
        }
    }

    /// The all-zero endpoint for a protocol.
    pub fn unspecified(transport_proto: TransportProto) -> Self {
        Self::new(transport_proto, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    /// Attach a hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Request an explicit routing table.
    pub fn with_fib_index(mut self, fib_index: FibIndex) -> Self {
        self.fib_index = Some(fib_index);
        self
    }

    /// Constrain to an interface.
    pub fn with_sw_if_index(mut self, sw_if_index: InterfaceIndex) -> Self {
        self.sw_if_index = Some(sw_if_index);
        self
    }

    /// True for IPv4 endpoints.
    pub fn is_ip4(&self) -> bool {
        self.ip.is_ipv4()
    }

    /// True if the address is unspecified.
    pub fn is_zero(&self) -> bool {
        self.ip.is_unspecified()
    }

    /// True if the endpoint only makes sense in the local scope.
    pub fn is_local(&self) -> bool {
        self.ip.is_unspecified() || self.ip.is_loopback()
    }

    /// Address family of the endpoint.
    pub fn fib_proto(&self) -> FibProto {
        if self.is_ip4() {
            FibProto::Ip4
        } else {
            FibProto::Ip6
        }
    }
}

impl std::fmt::Display for SessionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://", self.transport_proto)?;
        if let Some(hostname) = &self.hostname {
            write!(f, "[{hostname}]")?;
        }
        write!(f, "{}/{}", self.ip, self.port)
    }
}

/// Local-side constraints of a connect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerEndpoint {
    /// Local address to connect from, if pinned.
    pub ip: Option<IpAddr>,
    /// Local port to connect from, 0 for any.
    pub port: u16,
    /// Routing table the connect originates in.
    pub fib_index: Option<FibIndex>,
    /// Interface the connect must leave through.
    pub sw_if_index: Option<InterfaceIndex>,
}

/// Endpoint plus the per-request context used during bind and connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndpointCfg {
    /// Listen address for binds, destination for connects.
    pub endpoint: SessionEndpoint,
    /// Local-side constraints, only meaningful for connects.
    pub peer: PeerEndpoint,
    /// Worker on whose behalf the request is made.
    pub app_wrk_index: Option<WorkerIndex>,
}

impl SessionEndpointCfg {
    /// Wrap an endpoint with empty request context.
    pub fn new(endpoint: SessionEndpoint) -> Self {
        Self {
            endpoint,
            peer: PeerEndpoint::default(),
            app_wrk_index: None,
        }
    }

    /// Act on behalf of another application's worker.
    pub fn on_behalf_of(mut self, worker: WorkerIndex) -> Self {
        self.app_wrk_index = Some(worker);
        self
    }

    /// Pin the local interface of a connect.
    pub fn with_peer_sw_if_index(mut self, sw_if_index: InterfaceIndex) -> Self {
        self.peer.sw_if_index = Some(sw_if_index);
        self
    }
}

impl From<SessionEndpoint> for SessionEndpointCfg {
    fn from(endpoint: SessionEndpoint) -> Self {
        Self::new(endpoint)
    }
}

/// Canonical identity of an application listener.
///
/// Two binds map to the same listener exactly when their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey {
    /// Namespace the listener was bound in.
    pub ns_index: NamespaceIndex,
    /// Transport protocol.
    pub transport_proto: TransportProto,
    /// Resolved routing table.
    pub fib_index: Option<FibIndex>,
    /// Resolved interface constraint.
    pub sw_if_index: Option<InterfaceIndex>,
    /// Listen address.
    pub ip: IpAddr,
    /// Listen port.
    pub port: u16,
}

impl ListenerKey {
    /// Key of a resolved bind endpoint inside a namespace.
    pub fn new(ns_index: NamespaceIndex, endpoint: &SessionEndpoint) -> Self {
        Self {
            ns_index,
            transport_proto: endpoint.transport_proto,
            fib_index: endpoint.fib_index,
            sw_if_index: endpoint.sw_if_index,
            ip: endpoint.ip,
            port: endpoint.port,
        }
    }
}

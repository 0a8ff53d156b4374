//! Application namespaces: isolation domains with optional secrets.
//!
//! The registry always holds the default namespace at index 0 (id
//! `"default"`, no secret, FIB 0 for both families). Namespaces are created
//! or updated through [`NamespaceRegistry::add_or_update`] and never deleted,
//! so a [`NamespaceIndex`] stays valid for the life of the process.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::endpoint::{FibIndex, FibProto, InterfaceIndex};
use crate::error::{SessionError, SessionResult};

/// Id of the namespace every application lands in by default.
pub const DEFAULT_NAMESPACE_ID: &str = "default";

/// Index of a namespace in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespaceIndex(pub u32);

impl NamespaceIndex {
    /// The default namespace.
    pub const DEFAULT: NamespaceIndex = NamespaceIndex(0);

    /// True for the default namespace.
    pub fn is_default(self) -> bool {
        self == Self::DEFAULT
    }
}

impl std::fmt::Display for NamespaceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ns[{}]", self.0)
    }
}

/// Definition of a namespace, as configured by an administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    /// Namespace id applications attach with.
    pub id: String,
    /// Secret applications must present, if any.
    #[serde(default)]
    pub secret: Option<u64>,
    /// Interface the namespace is bound to, if any.
    #[serde(default)]
    pub sw_if_index: Option<InterfaceIndex>,
    /// IPv4 routing table.
    #[serde(default)]
    pub ip4_fib_index: FibIndex,
    /// IPv6 routing table.
    #[serde(default)]
    pub ip6_fib_index: FibIndex,
}

impl NamespaceConfig {
    /// Namespace with no secret and no interface in FIB 0.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            secret: None,
            sw_if_index: None,
            ip4_fib_index: 0,
            ip6_fib_index: 0,
        }
    }

    /// Gate the namespace with a secret.
    pub fn with_secret(mut self, secret: u64) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Bind the namespace to an interface.
    pub fn with_sw_if_index(mut self, sw_if_index: InterfaceIndex) -> Self {
        self.sw_if_index = Some(sw_if_index);
        self
    }

    /// Select the routing tables.
    pub fn with_fibs(mut self, ip4_fib_index: FibIndex, ip6_fib_index: FibIndex) -> Self {
        self.ip4_fib_index = ip4_fib_index;
        self.ip6_fib_index = ip6_fib_index;
        self
    }
}

/// A registered namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppNamespace {
    /// Index in the registry.
    pub ns_index: NamespaceIndex,
    /// Namespace id.
    pub ns_id: String,
    /// Secret, if the namespace is gated.
    pub ns_secret: Option<u64>,
    /// Bound interface, if any.
    pub sw_if_index: Option<InterfaceIndex>,
    /// IPv4 routing table.
    pub ip4_fib_index: FibIndex,
    /// IPv6 routing table.
    pub ip6_fib_index: FibIndex,
}

impl AppNamespace {
    /// Routing table of the namespace for an address family.
    pub fn fib_index(&self, proto: FibProto) -> FibIndex {
        match proto {
            FibProto::Ip4 => self.ip4_fib_index,
            FibProto::Ip6 => self.ip6_fib_index,
        }
    }

    fn admits(&self, secret: Option<u64>) -> bool {
        match (self.ns_secret, secret) {
            (None, _) => true,
            (Some(expected), Some(given)) => bool::from(expected.ct_eq(&given)),
            (Some(_), None) => false,
        }
    }
}

/// Process-wide namespace table.
#[derive(Debug, Clone)]
pub struct NamespaceRegistry {
    namespaces: Vec<AppNamespace>,
    by_id: HashMap<String, NamespaceIndex>,
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceRegistry {
    /// Registry holding only the default namespace.
    pub fn new() -> Self {
        let mut registry = Self {
            namespaces: Vec::new(),
            by_id: HashMap::new(),
        };
        registry.add_or_update(NamespaceConfig::new(DEFAULT_NAMESPACE_ID));
        registry
    }

    /// Create a namespace, or update the one with the same id.
    ///
    /// The default namespace can be rebound to other tables or an interface,
    /// but it never gets a secret.
    pub fn add_or_update(&mut self, config: NamespaceConfig) -> NamespaceIndex {
        if let Some(&ns_index) = self.by_id.get(&config.id) {
            let ns = &mut self.namespaces[ns_index.0 as usize];
            ns.ns_secret = if ns_index.is_default() {
                None
            } else {
                config.secret
            };
            ns.sw_if_index = config.sw_if_index;
            ns.ip4_fib_index = config.ip4_fib_index;
            ns.ip6_fib_index = config.ip6_fib_index;
            tracing::debug!(ns = %ns_index, id = %config.id, "namespace updated");
            return ns_index;
        }

        let ns_index = NamespaceIndex(self.namespaces.len() as u32);
        self.namespaces.push(AppNamespace {
            ns_index,
            ns_id: config.id.clone(),
            ns_secret: config.secret,
            sw_if_index: config.sw_if_index,
            ip4_fib_index: config.ip4_fib_index,
            ip6_fib_index: config.ip6_fib_index,
        });
        tracing::debug!(ns = %ns_index, id = %config.id, "namespace created");
        self.by_id.insert(config.id, ns_index);
        ns_index
    }

    /// Namespace at an index.
    pub fn get(&self, ns_index: NamespaceIndex) -> Option<&AppNamespace> {
        self.namespaces.get(ns_index.0 as usize)
    }

    /// Index of the namespace with an id.
    pub fn index_from_id(&self, id: &str) -> Option<NamespaceIndex> {
        self.by_id.get(id).copied()
    }

    /// Number of namespaces, the default one included.
    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    /// Always false: the default namespace exists.
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    /// Admission check for attach.
    ///
    /// An empty id selects the default namespace without looking at the
    /// secret. Otherwise the id must be known and, if the namespace has a
    /// secret, `secret` must match it.
    pub fn resolve_namespace(&self, id: &str, secret: Option<u64>) -> SessionResult<NamespaceIndex> {
        if id.is_empty() {
            return Ok(NamespaceIndex::DEFAULT);
        }
        let ns_index = self
            .index_from_id(id)
            .ok_or(SessionError::InvalidNamespace)?;
        let ns = self.get(ns_index).ok_or(SessionError::InvalidNamespace)?;
        if !ns.admits(secret) {
            return Err(SessionError::WrongNamespaceSecret);
        }
        Ok(ns_index)
    }
}

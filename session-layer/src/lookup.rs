//! Session lookup tables consulted by bind and connect.
//!
//! Two kinds of table:
//!
//! - one **local-scope table** per namespace: listeners reachable only by
//!   co-located applications of that namespace, plus session rules that can
//!   deny or redirect destinations
//! - one **global table** per (address family, FIB): listeners reachable by
//!   anything routed through that FIB
//!
//! Listener lookups try the exact address first, then the wildcard
//! (unspecified) address of the same family and port.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::endpoint::{FibIndex, FibProto, SessionEndpoint, TransportProto};
use crate::listener::ListenerIndex;
use crate::namespace::NamespaceIndex;

type TableKey = (TransportProto, IpAddr, u16);

fn table_key(endpoint: &SessionEndpoint) -> TableKey {
    (endpoint.transport_proto, endpoint.ip, endpoint.port)
}

fn wildcard_key(endpoint: &SessionEndpoint) -> TableKey {
    let any = match endpoint.ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    (endpoint.transport_proto, any, endpoint.port)
}

/// Result of a local-scope lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalLookup {
    /// A rule explicitly denies the destination.
    Drop,
    /// Nothing in the local scope serves the destination.
    NoMatch,
    /// The destination is served by a listener.
    Listener(ListenerIndex),
}

/// What a matching session rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Refuse the connect.
    Deny,
    /// Hand the connect to a listener.
    Forward(ListenerIndex),
}

/// Local-scope policy rule matching destinations by prefix and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRule {
    /// Protocol the rule applies to.
    pub transport_proto: TransportProto,
    /// Destination prefix address.
    pub remote_ip: IpAddr,
    /// Destination prefix length.
    pub remote_prefix_len: u8,
    /// Destination port, `None` for any.
    pub remote_port: Option<u16>,
    /// Action on match.
    pub action: RuleAction,
}

impl SessionRule {
    /// Rule denying a destination prefix.
    pub fn deny(transport_proto: TransportProto, remote_ip: IpAddr, remote_prefix_len: u8) -> Self {
        Self {
            transport_proto,
            remote_ip,
            remote_prefix_len,
            remote_port: None,
            action: RuleAction::Deny,
        }
    }

    /// Rule forwarding a destination prefix to a listener.
    pub fn forward(
        transport_proto: TransportProto,
        remote_ip: IpAddr,
        remote_prefix_len: u8,
        listener: ListenerIndex,
    ) -> Self {
        Self {
            transport_proto,
            remote_ip,
            remote_prefix_len,
            remote_port: None,
            action: RuleAction::Forward(listener),
        }
    }

    /// Restrict the rule to one destination port.
    pub fn on_port(mut self, port: u16) -> Self {
        self.remote_port = Some(port);
        self
    }

    /// True if the rule covers the endpoint.
    pub fn matches(&self, endpoint: &SessionEndpoint) -> bool {
        self.transport_proto == endpoint.transport_proto
            && self.remote_port.is_none_or(|port| port == endpoint.port)
            && prefix_contains(self.remote_ip, self.remote_prefix_len, endpoint.ip)
    }

    fn specificity(&self) -> (u8, bool) {
        (self.remote_prefix_len, self.remote_port.is_some())
    }
}

fn prefix_contains(prefix: IpAddr, len: u8, ip: IpAddr) -> bool {
    match (prefix, ip) {
        (IpAddr::V4(prefix), IpAddr::V4(ip)) => {
            let len = u32::from(len.min(32));
            let mask = u32::MAX.checked_shl(32 - len).unwrap_or(0);
            u32::from(prefix) & mask == u32::from(ip) & mask
        }
        (IpAddr::V6(prefix), IpAddr::V6(ip)) => {
            let len = u32::from(len.min(128));
            let mask = u128::MAX.checked_shl(128 - len).unwrap_or(0);
            u128::from(prefix) & mask == u128::from(ip) & mask
        }
        _ => false,
    }
}

/// Local-scope table of one namespace.
#[derive(Debug, Clone, Default)]
pub struct LocalTable {
    listeners: HashMap<TableKey, ListenerIndex>,
    rules: Vec<SessionRule>,
}

impl LocalTable {
    /// Look up a destination: rules first, then listeners.
    pub fn lookup(&self, endpoint: &SessionEndpoint) -> LocalLookup {
        let rule = self
            .rules
            .iter()
            .filter(|rule| rule.matches(endpoint))
            .fold(None::<&SessionRule>, |best, rule| match best {
                Some(best) if best.specificity() >= rule.specificity() => Some(best),
                _ => Some(rule),
            });
        if let Some(rule) = rule {
            return match rule.action {
                RuleAction::Deny => LocalLookup::Drop,
                RuleAction::Forward(listener) => LocalLookup::Listener(listener),
            };
        }
        self.listeners
            .get(&table_key(endpoint))
            .or_else(|| self.listeners.get(&wildcard_key(endpoint)))
            .map_or(LocalLookup::NoMatch, |&listener| LocalLookup::Listener(listener))
    }

    /// Register a listener. Fails with the current occupant if the
    /// endpoint is taken.
    pub fn insert_listener(
        &mut self,
        endpoint: &SessionEndpoint,
        listener: ListenerIndex,
    ) -> Result<(), ListenerIndex> {
        insert_unique(&mut self.listeners, table_key(endpoint), listener)
    }

    /// Remove a listener, and every rule forwarding to it.
    pub fn remove_listener(&mut self, endpoint: &SessionEndpoint, listener: ListenerIndex) {
        remove_if_owned(&mut self.listeners, &table_key(endpoint), listener);
        self.rules
            .retain(|rule| rule.action != RuleAction::Forward(listener));
    }

    /// Add a rule.
    pub fn add_rule(&mut self, rule: SessionRule) {
        self.rules.push(rule);
    }

    /// Number of rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Global table of one (family, FIB) pair.
#[derive(Debug, Clone, Default)]
pub struct GlobalTable {
    listeners: HashMap<TableKey, ListenerIndex>,
}

impl GlobalTable {
    /// Listener serving a destination.
    pub fn lookup(&self, endpoint: &SessionEndpoint) -> Option<ListenerIndex> {
        self.listeners
            .get(&table_key(endpoint))
            .or_else(|| self.listeners.get(&wildcard_key(endpoint)))
            .copied()
    }

    /// Listener registered on exactly this endpoint (no wildcard fallback).
    pub fn lookup_exact(&self, endpoint: &SessionEndpoint) -> Option<ListenerIndex> {
        self.listeners.get(&table_key(endpoint)).copied()
    }
}

fn insert_unique(
    map: &mut HashMap<TableKey, ListenerIndex>,
    key: TableKey,
    listener: ListenerIndex,
) -> Result<(), ListenerIndex> {
    match map.get(&key) {
        Some(&existing) if existing != listener => Err(existing),
        _ => {
            map.insert(key, listener);
            Ok(())
        }
    }
}

fn remove_if_owned(map: &mut HashMap<TableKey, ListenerIndex>, key: &TableKey, listener: ListenerIndex) {
    if map.get(key) == Some(&listener) {
        map.remove(key);
    }
}

/// All lookup tables.
#[derive(Debug, Clone, Default)]
pub struct SessionLookup {
    local: HashMap<NamespaceIndex, LocalTable>,
    global: HashMap<(FibProto, FibIndex), GlobalTable>,
}

impl SessionLookup {
    /// Empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Local-scope lookup in a namespace.
    pub fn lookup_local(&self, ns_index: NamespaceIndex, endpoint: &SessionEndpoint) -> LocalLookup {
        self.local
            .get(&ns_index)
            .map_or(LocalLookup::NoMatch, |table| table.lookup(endpoint))
    }

    /// Global lookup in a FIB.
    pub fn lookup_global(&self, fib_index: FibIndex, endpoint: &SessionEndpoint) -> Option<ListenerIndex> {
        self.global
            .get(&(endpoint.fib_proto(), fib_index))
            .and_then(|table| table.lookup(endpoint))
    }

    /// Exact global lookup in a FIB.
    pub fn lookup_global_exact(
        &self,
        fib_index: FibIndex,
        endpoint: &SessionEndpoint,
    ) -> Option<ListenerIndex> {
        self.global
            .get(&(endpoint.fib_proto(), fib_index))
            .and_then(|table| table.lookup_exact(endpoint))
    }

    /// Register a local-scope listener.
    pub fn insert_local(
        &mut self,
        ns_index: NamespaceIndex,
        endpoint: &SessionEndpoint,
        listener: ListenerIndex,
    ) -> Result<(), ListenerIndex> {
        self.local
            .entry(ns_index)
            .or_default()
            .insert_listener(endpoint, listener)
    }

    /// Register a global listener.
    pub fn insert_global(
        &mut self,
        fib_index: FibIndex,
        endpoint: &SessionEndpoint,
        listener: ListenerIndex,
    ) -> Result<(), ListenerIndex> {
        let table = self
            .global
            .entry((endpoint.fib_proto(), fib_index))
            .or_default();
        insert_unique(&mut table.listeners, table_key(endpoint), listener)
    }

    /// Remove a local-scope listener.
    pub fn remove_local(&mut self, ns_index: NamespaceIndex, endpoint: &SessionEndpoint, listener: ListenerIndex) {
        if let Some(table) = self.local.get_mut(&ns_index) {
            table.remove_listener(endpoint, listener);
        }
    }

    /// Remove a global listener.
    pub fn remove_global(&mut self, fib_index: FibIndex, endpoint: &SessionEndpoint, listener: ListenerIndex) {
        if let Some(table) = self.global.get_mut(&(endpoint.fib_proto(), fib_index)) {
            remove_if_owned(&mut table.listeners, &table_key(endpoint), listener);
        }
    }

    /// Add a local-scope rule to a namespace.
    pub fn add_rule(&mut self, ns_index: NamespaceIndex, rule: SessionRule) {
        self.local.entry(ns_index).or_default().add_rule(rule);
    }

    /// Local table of a namespace, if it has one.
    pub fn local_table(&self, ns_index: NamespaceIndex) -> Option<&LocalTable> {
        self.local.get(&ns_index)
    }
}

//! `proto://[hostname]address/port` parsing and the parsed-URI cache.
//!
//! ```text
//! tcp://10.0.0.1/80
//! tls://[example.com]10.0.0.1/443
//! udp://::1/53
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use crate::endpoint::{SessionEndpoint, TransportProto};
use crate::error::UriError;

/// Parse a URI into an endpoint without routing constraints.
pub fn parse_uri(uri: &str) -> Result<SessionEndpoint, UriError> {
    let (proto, rest) = uri.split_once("://").ok_or(UriError::InvalidFormat)?;
    let transport_proto =
        TransportProto::parse(proto).ok_or_else(|| UriError::UnknownProtocol(proto.to_string()))?;

    let (hostname, rest) = match rest.strip_prefix('[') {
        Some(bracketed) => {
            let (host, rest) = bracketed.split_once(']').ok_or(UriError::InvalidFormat)?;
            if host.is_empty() {
                return Err(UriError::InvalidFormat);
            }
            (Some(host), rest)
        }
        None => (None, rest),
    };

    let (addr, port) = rest.rsplit_once('/').ok_or(UriError::InvalidFormat)?;
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| UriError::InvalidAddress(addr.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| UriError::InvalidPort(port.to_string()))?;

    let endpoint = SessionEndpoint::new(transport_proto, ip, port);
    Ok(match hostname {
        Some(host) => endpoint.with_hostname(host),
        None => endpoint,
    })
}

/// Bounded cache of parsed URIs keyed by the exact input string.
///
/// Oldest entries are evicted first. Not synchronized: it belongs to the
/// owner thread together with the rest of the layer.
#[derive(Debug, Clone, Default)]
pub struct UriCache {
    capacity: usize,
    entries: HashMap<String, SessionEndpoint>,
    order: VecDeque<String>,
}

impl UriCache {
    /// Cache holding at most `capacity` entries; `0` disables it.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Parse `uri`, serving repeated inputs from the cache.
    pub fn parse(&mut self, uri: &str) -> Result<SessionEndpoint, UriError> {
        if let Some(endpoint) = self.entries.get(uri) {
            return Ok(endpoint.clone());
        }
        let endpoint = parse_uri(uri)?;
        if self.capacity > 0 {
            if self.order.len() == self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
            self.order.push_back(uri.to_string());
            self.entries.insert(uri.to_string(), endpoint.clone());
        }
        Ok(endpoint)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if `uri` is cached.
    pub fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }
}

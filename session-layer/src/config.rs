//! Configuration of the session layer.

use serde::{Deserialize, Serialize};

use crate::namespace::NamespaceConfig;

/// Configuration for a [`SessionLayer`](crate::SessionLayer).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLayerConfig {
    /// Number of data-plane worker threads, each with its own session pool.
    /// The owner thread's pool comes on top.
    pub worker_threads: u32,

    /// Initial capacity hint of every session pool.
    pub session_pool_capacity: usize,

    /// Size in bytes of each worker's first segment, unless the application
    /// overrides it at attach.
    pub segment_size: u64,

    /// Number of parsed URIs to keep.
    ///
    /// Set to `0` to disable caching.
    pub uri_cache_capacity: usize,

    /// Namespaces to create at startup, in addition to the default one.
    pub namespaces: Vec<NamespaceConfig>,
}

impl Default for SessionLayerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            session_pool_capacity: 1024,
            segment_size: 1 << 20,
            uri_cache_capacity: 16,
            namespaces: Vec::new(),
        }
    }
}

impl SessionLayerConfig {
    /// Load a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Set the number of worker threads.
    pub fn with_worker_threads(mut self, worker_threads: u32) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Set the default first-segment size.
    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Set the URI cache capacity.
    pub fn with_uri_cache_capacity(mut self, capacity: usize) -> Self {
        self.uri_cache_capacity = capacity;
        self
    }

    /// Create a namespace at startup.
    pub fn with_namespace(mut self, namespace: NamespaceConfig) -> Self {
        self.namespaces.push(namespace);
        self
    }

    /// Configuration for tests and embedded use: one worker, small segments.
    pub fn small() -> Self {
        Self {
            worker_threads: 1,
            session_pool_capacity: 16,
            segment_size: 4096,
            uri_cache_capacity: 4,
            namespaces: Vec::new(),
        }
    }
}

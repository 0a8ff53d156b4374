//! Opaque 64-bit handles for sessions and listeners.
//!
//! A [`SessionHandle`] packs the index of the thread that owns the session
//! pool together with the slot inside that pool:
//!
//! ```text
//! 63                32 31                 0
//! ┌───────────────────┬───────────────────┐
//! │  session (slot)   │   thread index    │
//! └───────────────────┴───────────────────┘
//! ```
//!
//! Encoding and decoding are pure. Turning a handle into a session goes
//! through [`SessionPools::resolve`](crate::SessionPools::resolve), which
//! re-checks that the slot is still live.

use serde::{Deserialize, Serialize};

/// Handle naming a session owned by some thread's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHandle(u64);

impl SessionHandle {
    /// Handle that never resolves.
    pub const INVALID: SessionHandle = SessionHandle(u64::MAX);

    /// Pack a thread index and a slot index.
    pub const fn encode(thread_index: u32, session_index: u32) -> Self {
        SessionHandle(((session_index as u64) << 32) | thread_index as u64)
    }

    /// Unpack into `(thread_index, session_index)`.
    pub const fn decode(self) -> (u32, u32) {
        (self.thread_index(), self.session_index())
    }

    /// Index of the thread owning the session pool.
    pub const fn thread_index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Slot of the session inside its pool.
    pub const fn session_index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw wire value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from its raw value.
    pub const fn from_u64(raw: u64) -> Self {
        SessionHandle(raw)
    }
}

impl std::fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Handle naming an application listener.
///
/// Packs the listener's pool generation in the high half and its pool index
/// in the low half, so a handle for a destroyed listener never resolves to
/// a listener that later reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerHandle(u64);

impl ListenerHandle {
    /// Pack a pool index and generation.
    pub const fn encode(index: u32, generation: u32) -> Self {
        ListenerHandle(((generation as u64) << 32) | index as u64)
    }

    /// Pool index of the listener.
    pub const fn index(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Pool generation of the listener.
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw wire value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from its raw value.
    pub const fn from_u64(raw: u64) -> Self {
        ListenerHandle(raw)
    }
}

impl std::fmt::Display for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

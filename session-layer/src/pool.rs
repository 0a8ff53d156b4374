//! Generational arena used for every control-plane table and session pool.
//!
//! Objects are referenced by a [`Key`] (slot index + generation) rather than
//! by pointer. Freeing a slot bumps nothing; allocating into a slot bumps its
//! generation, so a key that outlived its object never matches the object
//! that later reuses the slot. Freed slots are reused last-in first-out.

/// Stable reference to a pool slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    /// Build a key from its parts.
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index.
    pub const fn index(&self) -> u32 {
        self.index
    }

    /// Generation of the slot when the key was issued.
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Pack into 64 bits (generation high, index low).
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Unpack from [`Key::to_raw`].
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: (raw & 0xFFFF_FFFF) as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generational arena.
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Pool<T> {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create an empty pool with room for `capacity` objects.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value built from the key it will live under.
    pub fn insert_with(&mut self, build: impl FnOnce(Key) -> T) -> Key {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let key = Key::new(index, slot.generation);
        slot.value = Some(build(key));
        self.len += 1;
        key
    }

    /// Get the value if `key` is still current.
    pub fn get(&self, key: Key) -> Option<&T> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Mutable variant of [`Pool::get`].
    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Get whatever currently occupies `index`, ignoring generations.
    ///
    /// This is the liveness-only check used for handles that do not carry a
    /// generation.
    pub fn get_by_index(&self, index: u32) -> Option<&T> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Mutable variant of [`Pool::get_by_index`].
    pub fn get_by_index_mut(&mut self, index: u32) -> Option<&mut T> {
        self.slots
            .get_mut(index as usize)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Key of the object currently occupying `index`.
    pub fn key_at(&self, index: u32) -> Option<Key> {
        let slot = self.slots.get(index as usize)?;
        slot.value.as_ref().map(|_| Key::new(index, slot.generation))
    }

    /// Remove the value if `key` is still current.
    pub fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let value = slot.value.take()?;
        self.free.push(key.index);
        self.len -= 1;
        Some(value)
    }

    /// Remove whatever occupies `index`.
    pub fn remove_by_index(&mut self, index: u32) -> Option<T> {
        let key = self.key_at(index)?;
        self.remove(key)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the pool holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live objects.
    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Key::new(index as u32, slot.generation), value))
        })
    }
}

/// Declare a typed index over a pool [`Key`].
macro_rules! define_index {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) $crate::pool::Key);

        impl $name {
            /// Pack into an opaque 64-bit value.
            pub const fn to_raw(self) -> u64 {
                self.0.to_raw()
            }

            /// Rebuild from [`Self::to_raw`].
            pub const fn from_raw(raw: u64) -> Self {
                Self($crate::pool::Key::from_raw(raw))
            }

            /// Slot index inside the owning pool.
            pub const fn index(self) -> u32 {
                self.0.index()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}[{}.{}]", $label, self.0.index(), self.0.generation())
            }
        }
    };
}

pub(crate) use define_index;

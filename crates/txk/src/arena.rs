//! Generational slot storage for kernel objects.
//!
//! A [`Slot`] is an `(index, generation)` pair. Removing a value bumps the
//! slot's generation, so handles that outlive their object are rejected
//! instead of aliasing whatever reuses the index.

use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot {
    index: u32,
    generation: u32,
}

impl Slot {
    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

pub(crate) struct Arena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Slot {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            return Slot {
                index,
                generation: entry.generation,
            };
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        Slot {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, slot: Slot) -> Option<&T> {
        self.entries
            .get(slot.index as usize)
            .filter(|entry| entry.generation == slot.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut T> {
        self.entries
            .get_mut(slot.index as usize)
            .filter(|entry| entry.generation == slot.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.get(slot).is_some()
    }

    pub fn remove(&mut self, slot: Slot) -> Option<T> {
        let entry = self.entries.get_mut(slot.index as usize)?;
        if entry.generation != slot.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(slot.index);
        self.len -= 1;
        Some(value)
    }

    /// Live value at `index`. Indices come from intrusive links, which only
    /// ever name live entries.
    pub fn node(&self, index: u32) -> &T {
        match self.entries.get(index as usize).and_then(|e| e.value.as_ref()) {
            Some(value) => value,
            None => panic!("arena link names vacant slot {index}"),
        }
    }

    pub fn node_mut(&mut self, index: u32) -> &mut T {
        match self
            .entries
            .get_mut(index as usize)
            .and_then(|e| e.value.as_mut())
        {
            Some(value) => value,
            None => panic!("arena link names vacant slot {index}"),
        }
    }

    /// Current handle for a live index.
    pub fn slot_of(&self, index: u32) -> Slot {
        Slot {
            index,
            generation: self.entries[index as usize].generation,
        }
    }

    pub fn is_live(&self, index: u32) -> bool {
        self.entries
            .get(index as usize)
            .is_some_and(|entry| entry.value.is_some())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| entry.value.as_ref().map(|v| (index as u32, v)))
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Declares a typed, copyable handle around a [`Slot`].
macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) $crate::arena::Slot);

        impl $name {
            /// Arena index of the object; stable for the object's lifetime.
            pub const fn index(self) -> u32 {
                self.0.index()
            }
        }
    };
}

pub(crate) use handle;

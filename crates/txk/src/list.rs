//! Index-based circular doubly-linked rings.
//!
//! Nodes live in an [`Arena`] and carry one [`Link`] per ring they can join.
//! The marker type `K` selects which link a ring threads through, so a thread
//! can sit on a ready ring and the created ring at the same time. All
//! operations are O(1) except iteration.

use core::marker::PhantomData;

use crate::arena::Arena;

/// Neighbour indices of a node inside one ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Link {
    next: u32,
    prev: u32,
}

/// Selects the [`Link`] a node uses for ring kind `K`.
pub(crate) trait Linked<K> {
    fn link(&self) -> &Link;
    fn link_mut(&mut self) -> &mut Link;
}

/// Ring kinds.
pub(crate) mod kind {
    /// Per-priority ready rings.
    pub struct Ready;
    /// Suspension list of a blocking object.
    pub struct Suspended;
    /// Global list of created objects of one kind.
    pub struct Created;
    /// Mutexes owned by a thread.
    pub struct Owned;
}

pub(crate) struct Ring<K> {
    head: Option<u32>,
    len: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Default for Ring<K> {
    fn default() -> Self {
        Self {
            head: None,
            len: 0,
            _kind: PhantomData,
        }
    }
}

impl<K> core::fmt::Debug for Ring<K> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ring")
            .field("head", &self.head)
            .field("len", &self.len)
            .finish()
    }
}

impl<K> Ring<K> {
    pub fn head(&self) -> Option<u32> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back<T: Linked<K>>(&mut self, arena: &mut Arena<T>, index: u32) {
        match self.head {
            None => {
                *arena.node_mut(index).link_mut() = Link {
                    next: index,
                    prev: index,
                };
                self.head = Some(index);
            }
            Some(head) => {
                let tail = arena.node(head).link().prev;
                *arena.node_mut(index).link_mut() = Link {
                    next: head,
                    prev: tail,
                };
                arena.node_mut(tail).link_mut().next = index;
                arena.node_mut(head).link_mut().prev = index;
            }
        }
        self.len += 1;
    }

    pub fn push_front<T: Linked<K>>(&mut self, arena: &mut Arena<T>, index: u32) {
        self.push_back(arena, index);
        self.head = Some(index);
    }

    /// Unlinks `index`, which must be a member of this ring.
    pub fn remove<T: Linked<K>>(&mut self, arena: &mut Arena<T>, index: u32) {
        debug_assert!(self.len > 0, "remove from empty ring");
        if self.len == 1 {
            self.head = None;
        } else {
            let Link { next, prev } = *arena.node(index).link();
            arena.node_mut(prev).link_mut().next = next;
            arena.node_mut(next).link_mut().prev = prev;
            if self.head == Some(index) {
                self.head = Some(next);
            }
        }
        *arena.node_mut(index).link_mut() = Link::default();
        self.len -= 1;
    }

    pub fn pop_front<T: Linked<K>>(&mut self, arena: &mut Arena<T>) -> Option<u32> {
        let head = self.head?;
        self.remove(arena, head);
        Some(head)
    }

    /// Makes `index`, a member of this ring, the new head without changing
    /// the cyclic order.
    pub fn set_head(&mut self, index: u32) {
        debug_assert!(self.len > 0, "set_head on empty ring");
        self.head = Some(index);
    }

    pub fn iter<'a, T: Linked<K>>(&self, arena: &'a Arena<T>) -> RingIter<'a, T, K> {
        RingIter {
            arena,
            next: self.head,
            remaining: self.len,
            _kind: PhantomData,
        }
    }
}

pub(crate) struct RingIter<'a, T, K> {
    arena: &'a Arena<T>,
    next: Option<u32>,
    remaining: usize,
    _kind: PhantomData<fn() -> K>,
}

impl<T: Linked<K>, K> Iterator for RingIter<'_, T, K> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next?;
        self.remaining -= 1;
        self.next = Some(self.arena.node(current).link().next);
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// Implements [`Linked`] for a struct field.
macro_rules! linked {
    ($ty:ty, $kind:ty, $field:ident) => {
        impl $crate::list::Linked<$kind> for $ty {
            fn link(&self) -> &$crate::list::Link {
                &self.$field
            }

            fn link_mut(&mut self) -> &mut $crate::list::Link {
                &mut self.$field
            }
        }
    };
}

pub(crate) use linked;

//! Recursive mutexes with optional priority inheritance.
//!
//! With inheritance the owner runs at least at the priority of its most
//! urgent waiter across every inheriting mutex it holds. The inherited
//! priority is recomputed whenever that set changes: a waiter arrives,
//! leaves by timeout or abort, or a mutex is released.

use alloc::vec::Vec;

use crate::arena::handle;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::list::{kind, linked, Link, Ring};
use crate::state::{Caller, KernelState};
use crate::suspend::{Blocking, QueueEnd, SuspendInfo, Timeout, WaitTarget, WakePayload};
use crate::thread::{ThreadId, ThreadState};
use crate::trace::{records::mutex as rec, Payload};

handle!(
    /// Handle of a mutex.
    MutexId
);

pub(crate) struct MutexCb {
    pub name: &'static str,
    pub inherit: bool,
    pub owner: Option<u32>,
    pub ownership_count: u32,
    /// Most urgent priority among the waiters, when inheriting.
    pub highest_waiting: Option<u32>,
    pub waiters: Ring<kind::Suspended>,
    pub created: Link,
    pub owned: Link,
}

linked!(MutexCb, kind::Created, created);
linked!(MutexCb, kind::Owned, owned);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexInfo {
    pub name: &'static str,
    pub ownership_count: u32,
    pub owner: Option<ThreadId>,
    pub inherit: bool,
    pub first_waiter: Option<ThreadId>,
    pub suspended_count: usize,
}

impl KernelState {
    fn mutex_index(&self, id: MutexId) -> KernelResult<u32> {
        if self.mutexes.contains(id.0) {
            Ok(id.0.index())
        } else {
            Err(KernelError::MutexError)
        }
    }

    fn mutex_id(&self, index: u32) -> MutexId {
        MutexId(self.mutexes.slot_of(index))
    }

    fn take_ownership(&mut self, mutex: u32, thread: u32) {
        let mx = self.mutexes.node_mut(mutex);
        mx.owner = Some(thread);
        mx.ownership_count = 1;
        mx.highest_waiting = None;
        self.threads
            .node_mut(thread)
            .owned
            .push_back(&mut self.mutexes, mutex);
    }

    /// Most urgent waiter priority over the inheriting mutexes `thread` owns.
    fn inherited_floor(&self, thread: u32) -> Option<u32> {
        self.threads
            .node(thread)
            .owned
            .iter(&self.mutexes)
            .map(|index| self.mutexes.node(index))
            .filter(|mx| mx.inherit)
            .filter_map(|mx| mx.highest_waiting)
            .min()
    }

    /// Brings the priority of `thread` in line with its user priority and
    /// whatever it currently inherits.
    fn update_inheritance(&mut self, thread: u32) {
        let floor = self.inherited_floor(thread);
        let tcb = self.threads.node_mut(thread);
        tcb.inherit_priority = floor;
        let target = floor.map_or(tcb.user_priority, |floor| floor.min(tcb.user_priority));
        if tcb.priority != target {
            self.mutex_priority_change(thread, target);
        }
    }

    /// Priority change on behalf of inheritance. The user threshold is kept
    /// when it is more restrictive than the new priority.
    fn mutex_priority_change(&mut self, thread: u32, priority: u32) {
        let threshold = self.threads.node(thread).user_preempt_threshold.min(priority);
        log::trace!("thread {thread} runs at inherited priority {priority}");
        self.reprioritize(thread, priority, threshold);
    }

    fn refresh_highest_waiting(&mut self, mutex: u32) {
        let mx = self.mutexes.node(mutex);
        let highest = mx
            .waiters
            .iter(&self.threads)
            .map(|thread| self.threads.node(thread).priority)
            .min();
        self.mutexes.node_mut(mutex).highest_waiting = highest;
    }

    /// A waiter left `mutex` through timeout, abort or termination.
    pub(crate) fn mutex_waiter_left(&mut self, mutex: u32) {
        if !self.mutexes.is_live(mutex) || !self.mutexes.node(mutex).inherit {
            return;
        }
        self.refresh_highest_waiting(mutex);
        if let Some(owner) = self.mutexes.node(mutex).owner {
            self.update_inheritance(owner);
        }
    }

    /// Drops the last ownership level of `mutex`: restores the owner's
    /// priority and hands the mutex to the next waiter, if any.
    fn mutex_release(&mut self, mutex: u32) {
        let Some(owner) = self.mutexes.node(mutex).owner else {
            return;
        };
        self.threads
            .node_mut(owner)
            .owned
            .remove(&mut self.mutexes, mutex);

        let id = self.mutex_id(mutex);
        let target = WaitTarget::Mutex(id);
        let inherit = self.mutexes.node(mutex).inherit;
        if inherit && self.mutexes.node(mutex).waiters.len() > 1 {
            self.prioritize(target);
        }

        let next = self.take_waiter(target);
        let mx = self.mutexes.node_mut(mutex);
        mx.owner = None;
        mx.ownership_count = 0;
        mx.highest_waiting = None;

        if let Some(next) = next {
            self.take_ownership(mutex, next);
            if inherit {
                self.prioritize(target);
                self.refresh_highest_waiting(mutex);
                self.update_inheritance(next);
            }
        }
        if inherit {
            self.update_inheritance(owner);
        }
        if let Some(next) = next {
            self.finish_wait(next, Ok(WakePayload::None));
        }
        self.trace(rec::PUT, Payload::new().u32(mutex).u32(0));
    }

    /// Releases every mutex `thread` owns, as on termination.
    pub(crate) fn release_owned_mutexes(&mut self, thread: u32) {
        while let Some(mutex) = self.threads.node(thread).owned.head() {
            self.mutex_release(mutex);
        }
    }
}

impl Kernel {
    /// Creates a mutex; `inherit` enables priority inheritance.
    pub fn mutex_create(&self, name: &'static str, inherit: bool) -> KernelResult<MutexId> {
        self.critical(|s| {
            let slot = s.mutexes.insert(MutexCb {
                name,
                inherit,
                owner: None,
                ownership_count: 0,
                highest_waiting: None,
                waiters: Ring::default(),
                created: Link::default(),
                owned: Link::default(),
            });
            s.created.mutexes.push_back(&mut s.mutexes, slot.index());
            log::debug!("mutex '{name}' created (inherit: {inherit})");
            s.trace(rec::CREATE, Payload::new().u32(slot.index()).u32(0));
            Ok(MutexId(slot))
        })
    }

    /// Deletes the mutex. The owner is released (and its priority restored)
    /// and every waiter resumes with [`KernelError::Deleted`].
    pub fn mutex_delete(&self, id: MutexId) -> KernelResult<()> {
        self.critical(|s| {
            let index = s.mutex_index(id)?;
            let waiters = core::mem::take(&mut s.mutexes.node_mut(index).waiters);
            s.mutex_release(index);
            s.created.mutexes.remove(&mut s.mutexes, index);
            let mx = s.mutexes.remove(id.0).ok_or(KernelError::MutexError)?;
            log::debug!("mutex '{}' deleted", mx.name);
            s.trace(rec::DELETE, Payload::new().u32(index));
            s.drain_deleted(waiters);
            Ok(())
        })
    }

    /// Acquires the mutex, recursively when the caller already owns it.
    pub fn mutex_get(&self, id: MutexId, timeout: Timeout) -> KernelResult<Blocking<()>> {
        self.critical(|s| {
            let index = s.mutex_index(id)?;
            let Caller::Thread(thread) = s.caller() else {
                return Err(KernelError::CallerError);
            };
            match s.mutexes.node(index).owner {
                None => {
                    s.take_ownership(index, thread);
                    s.trace(rec::GET, Payload::new().u32(index).u32(1));
                    return Ok(Blocking::Complete(()));
                }
                Some(owner) if owner == thread => {
                    let mx = s.mutexes.node_mut(index);
                    mx.ownership_count += 1;
                    let count = mx.ownership_count;
                    s.trace(rec::GET, Payload::new().u32(index).u32(count));
                    return Ok(Blocking::Complete(()));
                }
                Some(_) if timeout == Timeout::NoWait => return Err(KernelError::NotAvailable),
                Some(owner) => {
                    s.blocking_caller()?;
                    if s.mutexes.node(index).inherit {
                        let priority = s.threads.node(thread).priority;
                        let mx = s.mutexes.node_mut(index);
                        mx.highest_waiting =
                            Some(mx.highest_waiting.map_or(priority, |p| p.min(priority)));
                        s.update_inheritance(owner);
                    }
                }
            }
            s.block_on(
                thread,
                WaitTarget::Mutex(id),
                ThreadState::MutexSusp,
                SuspendInfo::None,
                QueueEnd::Back,
                timeout,
            );
            Ok(Blocking::Suspended)
        })
    }

    /// Drops one ownership level; the last one releases the mutex.
    pub fn mutex_put(&self, id: MutexId) -> KernelResult<()> {
        self.critical(|s| {
            let index = s.mutex_index(id)?;
            let Caller::Thread(thread) = s.caller() else {
                return Err(KernelError::CallerError);
            };
            let mx = s.mutexes.node_mut(index);
            if mx.ownership_count == 0 || mx.owner != Some(thread) {
                return Err(KernelError::NotOwned);
            }
            mx.ownership_count -= 1;
            if mx.ownership_count > 0 {
                let count = mx.ownership_count;
                s.trace(rec::PUT, Payload::new().u32(index).u32(count));
                return Ok(());
            }
            s.mutex_release(index);
            Ok(())
        })
    }

    pub fn mutex_prioritize(&self, id: MutexId) -> KernelResult<()> {
        self.critical(|s| {
            s.mutex_index(id)?;
            s.prioritize(WaitTarget::Mutex(id));
            Ok(())
        })
    }

    pub fn mutex_info(&self, id: MutexId) -> KernelResult<MutexInfo> {
        self.critical(|s| {
            let index = s.mutex_index(id)?;
            let mx = s.mutexes.node(index);
            Ok(MutexInfo {
                name: mx.name,
                ownership_count: mx.ownership_count,
                owner: mx.owner.map(|t| s.thread_id(t)),
                inherit: mx.inherit,
                first_waiter: mx.waiters.head().map(|t| s.thread_id(t)),
                suspended_count: mx.waiters.len(),
            })
        })
    }

    /// Mutexes in creation order.
    pub fn mutex_list(&self) -> Vec<MutexId> {
        self.critical(|s| {
            s.created
                .mutexes
                .iter(&s.mutexes)
                .map(|index| s.mutex_id(index))
                .collect()
        })
    }
}

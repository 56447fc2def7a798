//! Counting semaphores.

use alloc::vec::Vec;

use crate::arena::handle;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::list::{kind, linked, Link, Ring};
use crate::state::KernelState;
use crate::suspend::{Blocking, QueueEnd, SuspendInfo, Timeout, WaitTarget, WakePayload};
use crate::sync::Arc;
use crate::thread::{ThreadId, ThreadState};
use crate::trace::{records::semaphore as rec, Payload};

handle!(
    /// Handle of a counting semaphore.
    SemaphoreId
);

/// Invoked after every successful put.
pub type SemaphoreNotify = Arc<dyn Fn(SemaphoreId) + Send + Sync>;

pub(crate) struct SemaphoreCb {
    pub name: &'static str,
    pub count: u32,
    pub waiters: Ring<kind::Suspended>,
    pub created: Link,
    pub put_notify: Option<SemaphoreNotify>,
}

linked!(SemaphoreCb, kind::Created, created);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreInfo {
    pub name: &'static str,
    pub count: u32,
    pub first_waiter: Option<ThreadId>,
    pub suspended_count: usize,
}

impl KernelState {
    fn semaphore_mut(&mut self, id: SemaphoreId) -> KernelResult<&mut SemaphoreCb> {
        self.semaphores.get_mut(id.0).ok_or(KernelError::SemaphoreError)
    }

    fn semaphore_put(&mut self, id: SemaphoreId, ceiling: Option<u32>) -> KernelResult<()> {
        let target = WaitTarget::Semaphore(id);
        let sem = self.semaphore_mut(id)?;
        let index = id.0.index();

        if sem.waiters.is_empty() {
            let limit = ceiling.unwrap_or(u32::MAX);
            if sem.count >= limit {
                return Err(KernelError::CeilingExceeded);
            }
            sem.count += 1;
            let count = sem.count;
            self.trace(rec::PUT, Payload::new().u32(index).u32(count));
        } else if let Some(waiter) = self.take_waiter(target) {
            self.trace(rec::PUT, Payload::new().u32(index).u32(0));
            self.finish_wait(waiter, Ok(WakePayload::None));
        }

        if let Some(notify) = self.semaphores.get(id.0).and_then(|s| s.put_notify.clone()) {
            self.defer(move || notify(id));
        }
        Ok(())
    }
}

impl Kernel {
    pub fn semaphore_create(&self, name: &'static str, initial: u32) -> KernelResult<SemaphoreId> {
        self.critical(|s| {
            let slot = s.semaphores.insert(SemaphoreCb {
                name,
                count: initial,
                waiters: Ring::default(),
                created: Link::default(),
                put_notify: None,
            });
            s.created.semaphores.push_back(&mut s.semaphores, slot.index());
            log::debug!("semaphore '{name}' created with count {initial}");
            s.trace(rec::CREATE, Payload::new().u32(slot.index()).u32(initial));
            Ok(SemaphoreId(slot))
        })
    }

    /// Deletes the semaphore; every waiter resumes with
    /// [`KernelError::Deleted`].
    pub fn semaphore_delete(&self, id: SemaphoreId) -> KernelResult<()> {
        self.critical(|s| {
            s.semaphore_mut(id)?;
            s.created.semaphores.remove(&mut s.semaphores, id.0.index());
            let sem = s.semaphores.remove(id.0).ok_or(KernelError::SemaphoreError)?;
            log::debug!("semaphore '{}' deleted", sem.name);
            s.trace(rec::DELETE, Payload::new().u32(id.0.index()));
            s.drain_deleted(sem.waiters);
            Ok(())
        })
    }

    /// Takes one instance, waiting up to `timeout` when none is available.
    pub fn semaphore_get(&self, id: SemaphoreId, timeout: Timeout) -> KernelResult<Blocking<()>> {
        self.critical(|s| {
            let sem = s.semaphore_mut(id)?;
            if sem.count > 0 {
                sem.count -= 1;
                let count = sem.count;
                s.trace(rec::GET, Payload::new().u32(id.0.index()).u32(count));
                return Ok(Blocking::Complete(()));
            }
            if timeout == Timeout::NoWait {
                return Err(KernelError::NoInstance);
            }
            let thread = s.blocking_caller()?;
            s.block_on(
                thread,
                WaitTarget::Semaphore(id),
                ThreadState::SemaphoreSusp,
                SuspendInfo::None,
                QueueEnd::Back,
                timeout,
            );
            Ok(Blocking::Suspended)
        })
    }

    /// Releases one instance, handing it straight to the first waiter when
    /// there is one.
    pub fn semaphore_put(&self, id: SemaphoreId) -> KernelResult<()> {
        self.critical(|s| s.semaphore_put(id, None))
    }

    /// Like [`Kernel::semaphore_put`], but fails with
    /// [`KernelError::CeilingExceeded`] instead of raising the count past
    /// `ceiling`.
    pub fn semaphore_ceiling_put(&self, id: SemaphoreId, ceiling: u32) -> KernelResult<()> {
        if ceiling == 0 {
            return Err(KernelError::InvalidCeiling);
        }
        self.critical(|s| s.semaphore_put(id, Some(ceiling)))
    }

    pub fn semaphore_prioritize(&self, id: SemaphoreId) -> KernelResult<()> {
        self.critical(|s| {
            s.semaphore_mut(id)?;
            s.prioritize(WaitTarget::Semaphore(id));
            Ok(())
        })
    }

    pub fn semaphore_put_notify(
        &self,
        id: SemaphoreId,
        notify: Option<SemaphoreNotify>,
    ) -> KernelResult<()> {
        self.critical(|s| {
            s.semaphore_mut(id)?.put_notify = notify;
            Ok(())
        })
    }

    pub fn semaphore_info(&self, id: SemaphoreId) -> KernelResult<SemaphoreInfo> {
        self.critical(|s| {
            let sem = s.semaphores.get(id.0).ok_or(KernelError::SemaphoreError)?;
            Ok(SemaphoreInfo {
                name: sem.name,
                count: sem.count,
                first_waiter: sem.waiters.head().map(|t| s.thread_id(t)),
                suspended_count: sem.waiters.len(),
            })
        })
    }

    /// Semaphores in creation order.
    pub fn semaphore_list(&self) -> Vec<SemaphoreId> {
        self.critical(|s| {
            s.created
                .semaphores
                .iter(&s.semaphores)
                .map(|index| SemaphoreId(s.semaphores.slot_of(index)))
                .collect()
        })
    }
}

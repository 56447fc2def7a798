//! Shared suspension protocol.
//!
//! Every blocking service parks its caller the same way: the thread joins the
//! object's suspension ring, records what it is waiting for, optionally arms
//! a timeout and leaves the ready queue. Whoever satisfies the wait (a put, a
//! timeout, an abort, a delete) takes the thread off the ring, stores the
//! outcome in the control block and resumes it.

use crate::arena::Arena;
use crate::block_pool::{BlockPoolId, MemoryBlock};
use crate::byte_pool::{ByteBlock, BytePoolId};
use crate::error::{KernelError, KernelResult};
use crate::event_flags::{EventFlagsId, EventOption};
use crate::list::{kind, Ring};
use crate::mutex::MutexId;
use crate::queue::{Message, QueueId};
use crate::semaphore::SemaphoreId;
use crate::state::{Caller, KernelState};
use crate::thread::{Tcb, ThreadState};

/// Object a thread is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitTarget {
    Semaphore(SemaphoreId),
    Mutex(MutexId),
    Queue(QueueId),
    EventFlags(EventFlagsId),
    BlockPool(BlockPoolId),
    BytePool(BytePoolId),
    Sleep,
}

/// How long a service may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Timeout {
    /// Fail immediately instead of waiting.
    #[default]
    NoWait,
    Ticks(u32),
    Forever,
}

impl From<u32> for Timeout {
    /// `0` means no wait and `u32::MAX` waits forever.
    fn from(ticks: u32) -> Self {
        match ticks {
            0 => Self::NoWait,
            u32::MAX => Self::Forever,
            ticks => Self::Ticks(ticks),
        }
    }
}

/// Outcome of a service that may block.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocking<T> {
    /// The service completed without waiting.
    Complete(T),
    /// The calling thread was suspended. Its result is delivered through
    /// [`ThreadContext::take_wake`](crate::ThreadContext::take_wake).
    Suspended,
}

impl<T> Blocking<T> {
    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended)
    }

    pub fn complete(self) -> Option<T> {
        match self {
            Self::Complete(value) => Some(value),
            Self::Suspended => None,
        }
    }
}

/// Value handed to a thread whose wait was satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakePayload {
    None,
    Message(Message),
    Block(MemoryBlock),
    Bytes(ByteBlock),
    /// Flags as they were when the request was satisfied.
    Flags(u32),
}

impl WakePayload {
    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn into_block(self) -> Option<MemoryBlock> {
        match self {
            Self::Block(block) => Some(block),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<ByteBlock> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn into_flags(self) -> Option<u32> {
        match self {
            Self::Flags(flags) => Some(flags),
            _ => None,
        }
    }
}

/// Result delivered to a woken thread.
pub type WakeResult = Result<WakePayload, KernelError>;

/// Per-wait request data kept in the control block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) enum SuspendInfo {
    #[default]
    None,
    /// Sender blocked on a full queue.
    Send(Message),
    /// Receiver blocked on an empty queue.
    Receive,
    /// Byte pool request size.
    Bytes(u32),
    Flags { requested: u32, option: EventOption },
}

/// Where a waiter joins its suspension ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum QueueEnd {
    #[default]
    Back,
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeReason {
    Timeout,
    Abort,
}

impl KernelState {
    /// Thread that may suspend, or [`KernelError::WaitError`] for interrupt
    /// and initialization callers and while preemption is disabled.
    pub(crate) fn blocking_caller(&self) -> KernelResult<u32> {
        match self.caller() {
            Caller::Thread(thread) if self.sched.preempt_disable == 0 => Ok(thread),
            _ => Err(KernelError::WaitError),
        }
    }

    fn suspension_ring(
        &mut self,
        target: WaitTarget,
    ) -> Option<(&mut Ring<kind::Suspended>, &mut Arena<Tcb>)> {
        let ring = match target {
            WaitTarget::Semaphore(id) => &mut self.semaphores.get_mut(id.0)?.waiters,
            WaitTarget::Mutex(id) => &mut self.mutexes.get_mut(id.0)?.waiters,
            WaitTarget::Queue(id) => &mut self.queues.get_mut(id.0)?.waiters,
            WaitTarget::EventFlags(id) => &mut self.event_flags.get_mut(id.0)?.waiters,
            WaitTarget::BlockPool(id) => &mut self.block_pools.get_mut(id.0)?.waiters,
            WaitTarget::BytePool(id) => &mut self.byte_pools.get_mut(id.0)?.waiters,
            WaitTarget::Sleep => return None,
        };
        Some((ring, &mut self.threads))
    }

    /// Parks `thread` on `target`.
    pub(crate) fn block_on(
        &mut self,
        thread: u32,
        target: WaitTarget,
        state: ThreadState,
        info: SuspendInfo,
        end: QueueEnd,
        timeout: Timeout,
    ) {
        if let Some((ring, threads)) = self.suspension_ring(target) {
            match end {
                QueueEnd::Back => ring.push_back(threads, thread),
                QueueEnd::Front => ring.push_front(threads, thread),
            }
        }

        let tcb = self.threads.node_mut(thread);
        tcb.state = state;
        tcb.suspend_cleanup = Some(target);
        tcb.suspend_info = info;
        tcb.suspend_option = end;
        tcb.wake = None;
        tcb.time_slice = tcb.new_time_slice;

        if let Timeout::Ticks(ticks) = timeout {
            self.timers.arm(thread, ticks);
        }
        log::trace!("thread {thread} waiting on {target:?}");
        self.suspend_thread(thread);
    }

    /// Removes and returns the first waiter of `target`.
    pub(crate) fn take_waiter(&mut self, target: WaitTarget) -> Option<u32> {
        let (ring, threads) = self.suspension_ring(target)?;
        ring.pop_front(threads)
    }

    pub(crate) fn first_waiter(&mut self, target: WaitTarget) -> Option<u32> {
        self.suspension_ring(target)?.0.head()
    }

    /// Delivers `result` to a thread already off its suspension ring and
    /// makes it ready.
    pub(crate) fn finish_wait(&mut self, thread: u32, result: WakeResult) {
        self.timers.disarm(thread);
        let tcb = self.threads.node_mut(thread);
        tcb.suspend_cleanup = None;
        tcb.suspend_info = SuspendInfo::None;
        tcb.wake = Some(result);
        self.resume_thread(thread);
    }

    /// Takes a waiting thread off whatever it waits on without resuming it.
    pub(crate) fn unlink_waiter(&mut self, thread: u32) -> Option<WaitTarget> {
        let target = self.threads.node_mut(thread).suspend_cleanup.take()?;
        if let Some((ring, threads)) = self.suspension_ring(target) {
            ring.remove(threads, thread);
        }
        self.timers.disarm(thread);
        Some(target)
    }

    /// Ends the wait of `thread` because of a timeout or an abort.
    pub(crate) fn wait_cleanup(&mut self, thread: u32, reason: WakeReason) {
        if !self.threads.node(thread).state.is_waiting() {
            return;
        }
        let sending = matches!(self.threads.node(thread).suspend_info, SuspendInfo::Send(_));
        let Some(target) = self.unlink_waiter(thread) else {
            return;
        };

        let result = match reason {
            WakeReason::Abort => Err(KernelError::WaitAborted),
            WakeReason::Timeout => match target {
                WaitTarget::Semaphore(_) => Err(KernelError::NoInstance),
                WaitTarget::Mutex(_) => Err(KernelError::NotAvailable),
                WaitTarget::Queue(_) if sending => Err(KernelError::QueueFull),
                WaitTarget::Queue(_) => Err(KernelError::QueueEmpty),
                WaitTarget::EventFlags(_) => Err(KernelError::NoEvents),
                WaitTarget::BlockPool(_) | WaitTarget::BytePool(_) => Err(KernelError::NoMemory),
                WaitTarget::Sleep => Ok(WakePayload::None),
            },
        };
        if let WaitTarget::Mutex(mutex) = target {
            self.mutex_waiter_left(mutex.0.index());
        }
        self.finish_wait(thread, result);
    }

    /// Resumes every thread on `waiters` with [`KernelError::Deleted`].
    pub(crate) fn drain_deleted(&mut self, mut waiters: Ring<kind::Suspended>) {
        while let Some(thread) = waiters.pop_front(&mut self.threads) {
            self.finish_wait(thread, Err(KernelError::Deleted));
        }
    }

    /// Moves the most urgent waiter of `target` to the front of its ring.
    /// Waiters of equal priority keep their FIFO order.
    pub(crate) fn prioritize(&mut self, target: WaitTarget) {
        let Some((ring, threads)) = self.suspension_ring(target) else {
            return;
        };
        if ring.len() < 2 {
            return;
        }
        let best = ring
            .iter(threads)
            .min_by_key(|&thread| threads.node(thread).priority);
        if let Some(best) = best {
            if ring.head() != Some(best) {
                ring.remove(threads, best);
                ring.push_front(threads, best);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_from_raw_ticks() {
        assert_eq!(Timeout::from(0), Timeout::NoWait);
        assert_eq!(Timeout::from(25), Timeout::Ticks(25));
        assert_eq!(Timeout::from(u32::MAX), Timeout::Forever);
    }

    #[test]
    fn blocking_accessors() {
        assert_eq!(Blocking::Complete(3).complete(), Some(3));
        assert!(Blocking::<u8>::Suspended.is_suspended());
        assert_eq!(WakePayload::Flags(0x11).into_flags(), Some(0x11));
        assert_eq!(WakePayload::None.into_message(), None);
    }
}

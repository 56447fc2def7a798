//! Threads: control block, configuration and thread services.
//!
//! A thread body is a step closure. The dispatcher invokes it whenever the
//! thread is the running thread of a core; each invocation runs until the
//! closure returns. A service call that has to wait returns
//! [`Blocking::Suspended`](crate::Blocking::Suspended); the closure should
//! then return [`ThreadAction::Continue`] and, on its next invocation,
//! collect the outcome with [`ThreadContext::take_wake`].

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::arena::handle;
use crate::error::{FatalError, KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::list::{kind, linked, Link, Ring};
use crate::state::{Caller, KernelState};
use crate::suspend::{
    Blocking, QueueEnd, SuspendInfo, Timeout, WaitTarget, WakeReason, WakeResult,
};
use crate::sync::Arc;
use crate::trace::{records::thread as rec, Payload};

/// Fill pattern written over fresh stacks.
pub const STACK_FILL: u8 = 0xEF;
/// Bytes at the bottom of every stack that must keep the fill pattern.
pub const STACK_GUARD: usize = 16;
const STACK_USED: u8 = 0x5A;

handle!(
    /// Handle of a thread.
    ThreadId
);

/// Thread body. Invoked once per dispatch of the thread.
pub type ThreadEntry = Box<dyn FnMut(&mut ThreadContext<'_>) -> ThreadAction + Send>;

/// Called when a thread's stack guard has been overwritten.
pub type StackErrorNotify = Arc<dyn Fn(ThreadId) + Send + Sync>;

/// Called when a thread first runs and when it completes or terminates.
pub type EntryExitNotify = Arc<dyn Fn(ThreadId, ThreadEvent) + Send + Sync>;

/// What the thread body wants after one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadAction {
    /// Keep the thread alive; it runs again when next dispatched.
    Continue,
    /// The thread returned from its entry function.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadEvent {
    Entry,
    Exit,
}

/// Thread execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    Ready,
    Completed,
    Terminated,
    Suspended,
    Sleep,
    QueueSusp,
    SemaphoreSusp,
    EventFlag,
    BlockMemory,
    ByteMemory,
    MutexSusp,
    PriorityChange,
}

impl ThreadState {
    /// True for states entered through the suspension protocol.
    pub fn is_waiting(self) -> bool {
        matches!(
            self,
            Self::Sleep
                | Self::QueueSusp
                | Self::SemaphoreSusp
                | Self::EventFlag
                | Self::BlockMemory
                | Self::ByteMemory
                | Self::MutexSusp
        )
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Terminated)
    }

    pub(crate) fn code(self) -> u8 {
        self as u8
    }
}

/// Configuration for creating a thread.
pub struct ThreadConfig {
    pub name: &'static str,
    pub priority: u32,
    pub preempt_threshold: Option<u32>,
    pub time_slice: u32,
    pub stack_size: Option<usize>,
    pub entry_input: u32,
    pub auto_start: bool,
    pub entry: ThreadEntry,
}

impl ThreadConfig {
    /// Creates a configuration that starts the thread immediately with the
    /// kernel's default stack size and no time slicing.
    pub fn new<F>(name: &'static str, priority: u32, entry: F) -> Self
    where
        F: FnMut(&mut ThreadContext<'_>) -> ThreadAction + Send + 'static,
    {
        Self {
            name,
            priority,
            preempt_threshold: None,
            time_slice: 0,
            stack_size: None,
            entry_input: 0,
            auto_start: true,
            entry: Box::new(entry),
        }
    }

    pub fn with_preemption_threshold(mut self, threshold: u32) -> Self {
        self.preempt_threshold = Some(threshold);
        self
    }

    pub fn with_time_slice(mut self, ticks: u32) -> Self {
        self.time_slice = ticks;
        self
    }

    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn with_entry_input(mut self, input: u32) -> Self {
        self.entry_input = input;
        self
    }

    /// Leaves the thread Suspended after creation when `false`.
    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

impl fmt::Debug for ThreadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadConfig")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("preempt_threshold", &self.preempt_threshold)
            .field("time_slice", &self.time_slice)
            .field("stack_size", &self.stack_size)
            .field("auto_start", &self.auto_start)
            .finish()
    }
}

/// Snapshot returned by [`Kernel::thread_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub name: &'static str,
    pub state: ThreadState,
    pub run_count: u64,
    pub priority: u32,
    pub user_priority: u32,
    pub preemption_threshold: u32,
    pub time_slice: u32,
    pub owned_mutexes: usize,
    pub waiting_on: Option<WaitTarget>,
    pub delayed_suspend: bool,
    pub stack_size: usize,
    pub stack_highest_usage: usize,
    pub cores_allowed: u32,
}

/// Handed to the thread body on every invocation.
pub struct ThreadContext<'k> {
    kernel: &'k Kernel,
    id: ThreadId,
    iteration: u64,
    core: usize,
}

impl<'k> ThreadContext<'k> {
    pub(crate) fn new(kernel: &'k Kernel, id: ThreadId, iteration: u64, core: usize) -> Self {
        Self {
            kernel,
            id,
            iteration,
            core,
        }
    }

    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Number of earlier invocations of this body since creation or reset.
    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn core(&self) -> usize {
        self.core
    }

    /// Outcome of the last wait, if the thread was woken since it was last
    /// asked.
    pub fn take_wake(&self) -> Option<WakeResult> {
        self.kernel.take_wake(self.id)
    }

    /// Marks `depth` bytes below the initial frame as used, standing in for
    /// the stack consumption of the code that just ran.
    pub fn use_stack(&self, depth: usize) {
        self.kernel.touch_stack(self.id, depth);
    }
}

/// Thread control block.
pub(crate) struct Tcb {
    pub name: &'static str,
    pub state: ThreadState,
    pub priority: u32,
    pub user_priority: u32,
    pub preempt_threshold: u32,
    pub user_preempt_threshold: u32,
    pub inherit_priority: Option<u32>,
    pub time_slice: u32,
    pub new_time_slice: u32,
    pub stack: Vec<u8>,
    pub stack_ptr: usize,
    pub stack_highest: usize,
    pub stack_overflowed: bool,
    pub entry_input: u32,
    pub suspend_cleanup: Option<WaitTarget>,
    pub suspend_info: SuspendInfo,
    pub suspend_option: QueueEnd,
    pub delayed_suspend: bool,
    pub ready: Link,
    pub suspended: Link,
    pub created: Link,
    pub owned: Ring<kind::Owned>,
    pub cores_allowed: u32,
    pub last_core: Option<usize>,
    pub run_count: u64,
    pub entered: bool,
    pub wake: Option<WakeResult>,
    pub entry_exit_notify: Option<EntryExitNotify>,
}

linked!(Tcb, kind::Ready, ready);
linked!(Tcb, kind::Suspended, suspended);
linked!(Tcb, kind::Created, created);

impl Tcb {
    fn new(config: &ThreadConfig, threshold: u32, stack: Vec<u8>, stack_ptr: usize, cores: u32) -> Self {
        Self {
            name: config.name,
            state: ThreadState::Suspended,
            priority: config.priority,
            user_priority: config.priority,
            preempt_threshold: threshold,
            user_preempt_threshold: threshold,
            inherit_priority: None,
            time_slice: config.time_slice,
            new_time_slice: config.time_slice,
            stack,
            stack_ptr,
            stack_highest: stack_ptr,
            stack_overflowed: false,
            entry_input: config.entry_input,
            suspend_cleanup: None,
            suspend_info: SuspendInfo::None,
            suspend_option: QueueEnd::Back,
            delayed_suspend: false,
            ready: Link::default(),
            suspended: Link::default(),
            created: Link::default(),
            owned: Ring::default(),
            cores_allowed: cores,
            last_core: None,
            run_count: 0,
            entered: false,
            wake: None,
            entry_exit_notify: None,
        }
    }

    /// Rescans the stack for the deepest byte that no longer holds the fill
    /// pattern. Returns `true` when the guard area has been reached.
    pub fn analyze_stack(&mut self) -> bool {
        let deepest = self
            .stack
            .iter()
            .position(|&byte| byte != STACK_FILL)
            .unwrap_or(self.stack.len());
        self.stack_highest = self.stack_highest.min(deepest);
        deepest < STACK_GUARD.min(self.stack.len())
    }

    pub fn stack_usage(&self) -> usize {
        self.stack.len() - self.stack_highest
    }
}

impl fmt::Debug for Tcb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tcb")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("priority", &self.priority)
            .field("preempt_threshold", &self.preempt_threshold)
            .finish()
    }
}

impl KernelState {
    pub(crate) fn thread_index(&self, id: ThreadId) -> KernelResult<u32> {
        if self.threads.contains(id.0) {
            Ok(id.0.index())
        } else {
            Err(KernelError::ThreadError)
        }
    }

    pub(crate) fn thread_id(&self, index: u32) -> ThreadId {
        ThreadId(self.threads.slot_of(index))
    }

    fn create_thread(&mut self, tcb: Tcb, auto_start: bool) -> ThreadId {
        let name = tcb.name;
        let priority = tcb.priority;
        let slot = self.threads.insert(tcb);
        let index = slot.index();
        self.created.threads.push_back(&mut self.threads, index);
        log::debug!("thread '{name}' created at priority {priority}");
        self.trace(rec::CREATE, Payload::new().u32(index).u32(priority));
        if auto_start {
            self.resume_thread(index);
        }
        ThreadId(slot)
    }

    /// Moves `index` into a finished state, unwinding whatever it was doing.
    pub(crate) fn finish_thread(&mut self, index: u32, state: ThreadState) {
        let current = self.threads.node(index).state;
        if current.is_finished() {
            return;
        }
        if current.is_waiting() {
            if let Some(WaitTarget::Mutex(mutex)) = self.unlink_waiter(index) {
                self.mutex_waiter_left(mutex.0.index());
            }
        }
        self.timers.disarm(index);

        let tcb = self.threads.node_mut(index);
        tcb.delayed_suspend = false;
        tcb.suspend_info = SuspendInfo::None;
        tcb.state = state;
        if current == ThreadState::Ready {
            self.suspend_thread(index);
        }
        self.release_owned_mutexes(index);

        let id = self.thread_id(index);
        if let Some(notify) = self.threads.node(index).entry_exit_notify.clone() {
            self.defer(move || notify(id, ThreadEvent::Exit));
        }
        log::debug!("thread {index} finished as {state:?}");
        self.trace(rec::TERMINATE, Payload::new().u32(index).u8(state.code()));
    }

    /// Runs the stack check for `index`, raising a fatal error once.
    pub(crate) fn check_stack(&mut self, index: u32) {
        if !self.stack_checking || !self.threads.is_live(index) {
            return;
        }
        let tcb = self.threads.node_mut(index);
        if tcb.analyze_stack() && !tcb.stack_overflowed {
            tcb.stack_overflowed = true;
            let thread = self.thread_id(index);
            self.raise(FatalError::StackOverflow { thread });
        }
    }
}

#[cfg(test)]
impl KernelState {
    /// Registers a thread without starting it; the kernel-free path used by
    /// scheduler unit tests.
    pub(crate) fn insert_test_thread(&mut self, config: ThreadConfig) -> u32 {
        let threshold = config.preempt_threshold.unwrap_or(config.priority);
        let tcb = Tcb::new(&config, threshold, vec![STACK_FILL; 256], 240, 1);
        self.create_thread(tcb, false).index()
    }
}

impl Kernel {
    /// Creates a thread. With `auto_start` it becomes Ready at once,
    /// otherwise it stays Suspended until [`Kernel::thread_resume`].
    pub fn thread_create(&self, config: ThreadConfig) -> KernelResult<ThreadId> {
        let cfg = self.config();
        if config.priority >= cfg.max_priorities {
            return Err(KernelError::PriorityError);
        }
        let threshold = config.preempt_threshold.unwrap_or(config.priority);
        if threshold > config.priority {
            return Err(KernelError::ThreshError);
        }
        let stack_size = config.stack_size.unwrap_or(cfg.default_stack_size);
        if stack_size < cfg.minimum_stack {
            return Err(KernelError::SizeError);
        }

        let mut stack = vec![STACK_FILL; stack_size];
        let stack_ptr = self.port().build_stack(&mut stack, config.entry_input);
        let tcb = Tcb::new(&config, threshold, stack, stack_ptr, cfg.core_mask());
        let auto_start = config.auto_start;
        let id = self.critical(|s| s.create_thread(tcb, auto_start));
        self.install_entry(id, config.entry);
        Ok(id)
    }

    /// Deletes a Completed or Terminated thread. A thread cannot delete
    /// itself.
    pub fn thread_delete(&self, thread: ThreadId) -> KernelResult<()> {
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            if s.caller_thread() == Some(index) {
                return Err(KernelError::CallerError);
            }
            if !s.threads.node(index).state.is_finished() {
                return Err(KernelError::DeleteError);
            }
            s.timers.disarm(index);
            s.created.threads.remove(&mut s.threads, index);
            s.threads.remove(thread.0);
            log::debug!("thread {index} deleted");
            s.trace(rec::DELETE, Payload::new().u32(index));
            Ok(())
        })?;
        self.remove_entry(thread);
        Ok(())
    }

    /// Suspends a thread. A thread that is waiting keeps waiting and is
    /// suspended once the wait ends.
    pub fn thread_suspend(&self, thread: ThreadId) -> KernelResult<()> {
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            let state = s.threads.node(index).state;
            match state {
                ThreadState::Ready => {
                    if s.caller_thread() == Some(index) && s.sched.preempt_disable > 0 {
                        return Err(KernelError::SuspendError);
                    }
                    s.threads.node_mut(index).state = ThreadState::Suspended;
                    s.suspend_thread(index);
                    Ok(())
                }
                ThreadState::Suspended => Ok(()),
                ThreadState::Completed | ThreadState::Terminated => {
                    Err(KernelError::SuspendError)
                }
                _ => {
                    s.threads.node_mut(index).delayed_suspend = true;
                    Ok(())
                }
            }
        })
    }

    /// Resumes a Suspended thread, or lifts a pending delayed suspension.
    pub fn thread_resume(&self, thread: ThreadId) -> KernelResult<()> {
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            let tcb = s.threads.node_mut(index);
            if tcb.state == ThreadState::Suspended {
                s.resume_thread(index);
                Ok(())
            } else if tcb.delayed_suspend {
                tcb.delayed_suspend = false;
                Err(KernelError::SuspendLifted)
            } else {
                Err(KernelError::ResumeError)
            }
        })
    }

    /// Terminates a thread, releasing every mutex it owns.
    pub fn thread_terminate(&self, thread: ThreadId) -> KernelResult<()> {
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            s.finish_thread(index, ThreadState::Terminated);
            Ok(())
        })
    }

    /// Returns a finished thread to its initial Suspended state so it can be
    /// resumed from the start of its body.
    pub fn thread_reset(&self, thread: ThreadId) -> KernelResult<()> {
        let port = self.port();
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            if s.caller_thread() == Some(index) {
                return Err(KernelError::CallerError);
            }
            let tcb = s.threads.node_mut(index);
            if !tcb.state.is_finished() {
                return Err(KernelError::NotDone);
            }
            tcb.stack.fill(STACK_FILL);
            tcb.stack_ptr = port.build_stack(&mut tcb.stack, tcb.entry_input);
            tcb.stack_highest = tcb.stack_ptr;
            tcb.stack_overflowed = false;
            tcb.priority = tcb.user_priority;
            tcb.preempt_threshold = tcb.user_preempt_threshold;
            tcb.inherit_priority = None;
            tcb.time_slice = tcb.new_time_slice;
            tcb.wake = None;
            tcb.entered = false;
            tcb.state = ThreadState::Suspended;
            Ok(())
        })?;
        self.reset_entry(thread);
        Ok(())
    }

    /// Sleeps the calling thread for `ticks` timer ticks.
    pub fn thread_sleep(&self, ticks: u32) -> KernelResult<Blocking<()>> {
        self.critical(|s| {
            let Caller::Thread(index) = s.caller() else {
                return Err(KernelError::CallerError);
            };
            if ticks == 0 {
                return Ok(Blocking::Complete(()));
            }
            if s.sched.preempt_disable > 0 {
                return Err(KernelError::WaitError);
            }
            s.trace(rec::SLEEP, Payload::new().u32(index).u32(ticks));
            s.block_on(
                index,
                WaitTarget::Sleep,
                ThreadState::Sleep,
                SuspendInfo::None,
                QueueEnd::Back,
                Timeout::Ticks(ticks),
            );
            Ok(Blocking::Suspended)
        })
    }

    /// Lets the other ready threads at the caller's priority run first.
    pub fn thread_relinquish(&self) {
        self.critical(|s| {
            if let Caller::Thread(index) = s.caller() {
                s.relinquish(index);
                s.trace(rec::RELINQUISH, Payload::new().u32(index));
            }
        })
    }

    /// Changes the user priority and returns the previous one. The
    /// preemption threshold is reset to the new priority; an inherited
    /// priority keeps the thread at least as urgent as its waiters.
    pub fn thread_priority_change(&self, thread: ThreadId, priority: u32) -> KernelResult<u32> {
        let max = self.config().max_priorities;
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            if priority >= max {
                return Err(KernelError::PriorityError);
            }
            let tcb = s.threads.node_mut(index);
            if tcb.state.is_finished() {
                return Err(KernelError::ThreadError);
            }
            let old = tcb.user_priority;
            tcb.user_priority = priority;
            tcb.user_preempt_threshold = priority;
            let effective = match tcb.inherit_priority {
                Some(inherited) if inherited < priority => inherited,
                _ => priority,
            };
            s.reprioritize(index, effective, effective);
            s.trace(
                rec::PRIORITY_CHANGE,
                Payload::new().u32(index).u32(old).u32(priority),
            );
            Ok(old)
        })
    }

    /// Changes the preemption threshold and returns the previous one.
    pub fn thread_preemption_change(&self, thread: ThreadId, threshold: u32) -> KernelResult<u32> {
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            let tcb = s.threads.node(index);
            if threshold > tcb.user_priority {
                return Err(KernelError::ThreshError);
            }
            let old = tcb.user_preempt_threshold;
            s.change_threshold(index, threshold);
            s.trace(
                rec::PREEMPTION_CHANGE,
                Payload::new().u32(index).u32(old).u32(threshold),
            );
            Ok(old)
        })
    }

    /// Changes the time slice (0 disables slicing) and returns the old one.
    pub fn thread_time_slice_change(&self, thread: ThreadId, ticks: u32) -> KernelResult<u32> {
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            let tcb = s.threads.node_mut(index);
            let old = tcb.new_time_slice;
            tcb.new_time_slice = ticks;
            tcb.time_slice = ticks;
            Ok(old)
        })
    }

    /// Ends the wait of `thread` with [`KernelError::WaitAborted`].
    pub fn thread_wait_abort(&self, thread: ThreadId) -> KernelResult<()> {
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            if !s.threads.node(index).state.is_waiting() {
                return Err(KernelError::WaitAbortError);
            }
            s.wait_cleanup(index, WakeReason::Abort);
            s.trace(rec::WAIT_ABORT, Payload::new().u32(index));
            Ok(())
        })
    }

    /// Thread running on the calling core, including the thread an ISR
    /// interrupted.
    pub fn thread_identify(&self) -> Option<ThreadId> {
        self.critical(|s| {
            let core = s.core;
            s.sched.current[core].map(|index| s.thread_id(index))
        })
    }

    pub fn thread_info(&self, thread: ThreadId) -> KernelResult<ThreadInfo> {
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            let tcb = s.threads.node(index);
            Ok(ThreadInfo {
                name: tcb.name,
                state: tcb.state,
                run_count: tcb.run_count,
                priority: tcb.priority,
                user_priority: tcb.user_priority,
                preemption_threshold: tcb.preempt_threshold,
                time_slice: tcb.new_time_slice,
                owned_mutexes: tcb.owned.len(),
                waiting_on: tcb.suspend_cleanup,
                delayed_suspend: tcb.delayed_suspend,
                stack_size: tcb.stack.len(),
                stack_highest_usage: tcb.stack_usage(),
                cores_allowed: tcb.cores_allowed,
            })
        })
    }

    /// Threads in creation order.
    pub fn thread_list(&self) -> Vec<ThreadId> {
        self.critical(|s| {
            s.created
                .threads
                .iter(&s.threads)
                .map(|index| s.thread_id(index))
                .collect()
        })
    }

    /// Registers the application's stack overflow handler.
    pub fn thread_stack_error_notify(&self, notify: Option<StackErrorNotify>) {
        self.critical(|s| s.stack_error_notify = notify);
    }

    pub fn thread_entry_exit_notify(
        &self,
        thread: ThreadId,
        notify: Option<EntryExitNotify>,
    ) -> KernelResult<()> {
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            s.threads.node_mut(index).entry_exit_notify = notify;
            Ok(())
        })
    }

    /// Restricts `thread` to the cores not set in `excluded`.
    pub fn thread_smp_core_exclude(&self, thread: ThreadId, excluded: u32) -> KernelResult<()> {
        let mask = self.config().core_mask();
        self.critical(|s| {
            let index = s.thread_index(thread)?;
            let tcb = s.threads.node_mut(index);
            tcb.cores_allowed = !excluded & mask;
            if tcb.state == ThreadState::Ready && s.sched.cores() > 1 {
                s.rebalance();
            }
            Ok(())
        })
    }

    /// Core the caller is running on.
    pub fn thread_smp_core_get(&self) -> usize {
        self.port().core_id()
    }

    pub(crate) fn touch_stack(&self, thread: ThreadId, depth: usize) {
        self.critical(|s| {
            if let Some(tcb) = s.threads.get_mut(thread.0) {
                let top = tcb.stack_ptr;
                let bottom = top.saturating_sub(depth);
                tcb.stack[bottom..top].fill(STACK_USED);
            }
        });
    }
}

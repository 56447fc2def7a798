//! Everything the critical section protects.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::arena::Arena;
use crate::block_pool::BlockPoolCb;
use crate::byte_pool::BytePoolCb;
use crate::error::FatalError;
use crate::event_flags::EventFlagsCb;
use crate::kernel::KernelConfig;
use crate::list::{kind, Ring};
use crate::mutex::MutexCb;
use crate::queue::QueueCb;
use crate::scheduler::Scheduler;
use crate::semaphore::SemaphoreCb;
use crate::thread::{StackErrorNotify, Tcb};
use crate::timer::TimerWheel;
use crate::trace::Payload;

/// Work produced inside the critical section and carried out after it is
/// released: trace records and application callbacks.
pub(crate) enum Effect {
    Trace { record: u8, payload: Payload },
    Call(Box<dyn FnOnce() + Send>),
    Fatal {
        error: FatalError,
        notify: Option<StackErrorNotify>,
    },
}

/// Who is making the current service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Caller {
    /// The body of the running thread on this core.
    Thread(u32),
    /// An interrupt handler.
    Isr,
    /// Initialization or other code outside any thread.
    Init,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CoreState {
    pub isr_nesting: u32,
    pub in_step: bool,
}

/// Created lists, one per object kind, in creation order.
#[derive(Debug, Default)]
pub(crate) struct Created {
    pub threads: Ring<kind::Created>,
    pub semaphores: Ring<kind::Created>,
    pub mutexes: Ring<kind::Created>,
    pub queues: Ring<kind::Created>,
    pub event_flags: Ring<kind::Created>,
    pub block_pools: Ring<kind::Created>,
    pub byte_pools: Ring<kind::Created>,
}

pub(crate) struct KernelState {
    pub threads: Arena<Tcb>,
    pub semaphores: Arena<SemaphoreCb>,
    pub mutexes: Arena<MutexCb>,
    pub queues: Arena<QueueCb>,
    pub event_flags: Arena<EventFlagsCb>,
    pub block_pools: Arena<BlockPoolCb>,
    pub byte_pools: Arena<BytePoolCb>,
    pub created: Created,
    pub sched: Scheduler,
    pub timers: TimerWheel,
    pub cores: Vec<CoreState>,
    /// Core making the current call.
    pub core: usize,
    pub started: bool,
    pub tick: u64,
    pub time_slicing: bool,
    pub stack_checking: bool,
    pub tracing: bool,
    pub stack_error_notify: Option<StackErrorNotify>,
    effects: Vec<Effect>,
}

impl KernelState {
    pub fn new(config: &KernelConfig, tracing: bool) -> Self {
        Self {
            threads: Arena::new(),
            semaphores: Arena::new(),
            mutexes: Arena::new(),
            queues: Arena::new(),
            event_flags: Arena::new(),
            block_pools: Arena::new(),
            byte_pools: Arena::new(),
            created: Created::default(),
            sched: Scheduler::new(config.max_priorities, config.cores),
            timers: TimerWheel::default(),
            cores: vec![CoreState::default(); config.cores],
            core: 0,
            started: false,
            tick: 0,
            time_slicing: config.time_slicing,
            stack_checking: config.stack_checking,
            tracing,
            stack_error_notify: None,
            effects: Vec::new(),
        }
    }

    pub fn caller(&self) -> Caller {
        let core = &self.cores[self.core];
        if core.isr_nesting > 0 {
            return Caller::Isr;
        }
        match self.sched.current[self.core] {
            Some(thread) if core.in_step => Caller::Thread(thread),
            _ => Caller::Init,
        }
    }

    pub fn caller_thread(&self) -> Option<u32> {
        match self.caller() {
            Caller::Thread(thread) => Some(thread),
            _ => None,
        }
    }

    pub fn trace(&mut self, record: u8, payload: Payload) {
        if self.tracing {
            self.effects.push(Effect::Trace { record, payload });
        }
    }

    /// Queues an application callback to run once the section is released.
    pub fn defer(&mut self, f: impl FnOnce() + Send + 'static) {
        self.effects.push(Effect::Call(Box::new(f)));
    }

    pub fn raise(&mut self, error: FatalError) {
        log::error!("fatal kernel condition: {error}");
        let notify = match error {
            FatalError::StackOverflow { .. } => self.stack_error_notify.clone(),
            _ => None,
        };
        self.effects.push(Effect::Fatal { error, notify });
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        core::mem::take(&mut self.effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;

    #[test]
    fn caller_follows_core_context() {
        let mut state = KernelState::new(&KernelConfig::default(), false);
        assert_eq!(state.caller(), Caller::Init);

        state.sched.current[0] = Some(3);
        assert_eq!(state.caller(), Caller::Init);
        state.cores[0].in_step = true;
        assert_eq!(state.caller(), Caller::Thread(3));
        assert_eq!(state.caller_thread(), Some(3));

        state.cores[0].isr_nesting = 1;
        assert_eq!(state.caller(), Caller::Isr);
        assert_eq!(state.caller_thread(), None);
    }

    #[test]
    fn traces_are_dropped_when_disabled() {
        let mut state = KernelState::new(&KernelConfig::default(), false);
        state.trace(1, Payload::new().u32(1));
        state.defer(|| {});
        let effects = state.take_effects();
        assert_eq!(effects.len(), 1);
        assert!(matches!(effects[0], Effect::Call(_)));
        assert!(state.take_effects().is_empty());
    }
}

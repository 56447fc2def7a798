//! Kernel facade: configuration, construction, the dispatcher and interrupt
//! context.
//!
//! Every service call runs its state change inside the critical section and
//! then lets the scheduler perform whatever context switches have become
//! legal. Trace records and application callbacks produced along the way run
//! once the section is released.

use alloc::vec::Vec;
use core::fmt;

use crate::critical::KernelCell;
use crate::error::{ConfigError, FatalError};
use crate::port::{HostPort, Port};
use crate::priority::MAX_PRIORITY_LEVELS;
use crate::state::{Effect, KernelState};
use crate::suspend::WakeResult;
use crate::sync::{Arc, Mutex};
use crate::thread::{ThreadAction, ThreadContext, ThreadEntry, ThreadEvent, ThreadId, ThreadState};
use crate::trace::{
    records::{isr, sched},
    Payload, TraceHook,
};

const MAX_CORES: usize = 32;

/// Kernel-wide settings, fixed at construction.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub name: &'static str,
    /// Number of priority levels; a multiple of 32 up to 1024.
    pub max_priorities: u32,
    pub cores: usize,
    pub time_slicing: bool,
    pub stack_checking: bool,
    pub minimum_stack: usize,
    pub default_stack_size: usize,
    /// Called whenever a core finds nothing to run.
    pub idle_callback: Option<fn()>,
    /// Receives fatal conditions that no thread-level notify handled.
    pub error_handler: Option<fn(&FatalError)>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: "txk",
            max_priorities: 32,
            cores: 1,
            time_slicing: true,
            stack_checking: true,
            minimum_stack: 256,
            default_stack_size: 1024,
            idle_callback: None,
            error_handler: None,
        }
    }
}

impl KernelConfig {
    pub fn builder() -> KernelConfigBuilder {
        KernelConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let levels = self.max_priorities;
        if levels == 0 || levels % 32 != 0 || levels > MAX_PRIORITY_LEVELS {
            return Err(ConfigError::InvalidPriorityCount(levels));
        }
        if self.cores == 0 || self.cores > MAX_CORES {
            return Err(ConfigError::InvalidCoreCount(self.cores));
        }
        if self.default_stack_size < self.minimum_stack {
            return Err(ConfigError::StackTooSmall {
                size: self.default_stack_size,
                minimum: self.minimum_stack,
            });
        }
        Ok(())
    }

    /// Mask with one bit per configured core.
    pub fn core_mask(&self) -> u32 {
        crate::smp::core_mask(self.cores)
    }
}

/// Builder for [`KernelConfig`].
#[derive(Debug, Clone, Default)]
pub struct KernelConfigBuilder {
    config: KernelConfig,
}

impl KernelConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: &'static str) -> Self {
        self.config.name = name;
        self
    }

    pub fn max_priorities(mut self, levels: u32) -> Self {
        self.config.max_priorities = levels;
        self
    }

    pub fn cores(mut self, cores: usize) -> Self {
        self.config.cores = cores;
        self
    }

    pub fn time_slicing(mut self, enabled: bool) -> Self {
        self.config.time_slicing = enabled;
        self
    }

    pub fn stack_checking(mut self, enabled: bool) -> Self {
        self.config.stack_checking = enabled;
        self
    }

    pub fn minimum_stack(mut self, bytes: usize) -> Self {
        self.config.minimum_stack = bytes;
        self
    }

    pub fn default_stack_size(mut self, bytes: usize) -> Self {
        self.config.default_stack_size = bytes;
        self
    }

    pub fn idle_callback(mut self, callback: fn()) -> Self {
        self.config.idle_callback = Some(callback);
        self
    }

    pub fn error_handler(mut self, handler: fn(&FatalError)) -> Self {
        self.config.error_handler = Some(handler);
        self
    }

    pub fn build(self) -> Result<KernelConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Builder for [`Kernel`].
pub struct KernelBuilder {
    config: KernelConfig,
    trace: Option<TraceHook>,
    port: Option<Arc<dyn Port>>,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            trace: None,
            port: None,
        }
    }

    pub fn with_config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the hook that receives kernel trace records.
    pub fn with_trace_hook(mut self, hook: TraceHook) -> Self {
        self.trace = Some(hook);
        self
    }

    /// Replaces the default [`HostPort`].
    pub fn with_port(mut self, port: Arc<dyn Port>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn build(self) -> Result<Kernel, ConfigError> {
        self.config.validate()?;
        let port = self
            .port
            .unwrap_or_else(|| Arc::new(HostPort::new()) as Arc<dyn Port>);
        let state = KernelState::new(&self.config, self.trace.is_some());
        log::debug!(
            "kernel '{}' built: {} priorities, {} core(s)",
            self.config.name,
            self.config.max_priorities,
            self.config.cores
        );
        Ok(Kernel {
            config: self.config,
            state: KernelCell::new(state),
            entries: Mutex::new(Vec::new()),
            port,
            trace: self.trace,
        })
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread body storage, outside the critical section so that bodies can call
/// kernel services.
struct EntrySlot {
    generation: u32,
    entry: Option<ThreadEntry>,
    iterations: u64,
}

fn entry_slot(entries: &mut [Option<EntrySlot>], thread: ThreadId) -> Option<&mut EntrySlot> {
    entries
        .get_mut(thread.index() as usize)?
        .as_mut()
        .filter(|slot| slot.generation == thread.0.generation())
}

/// Number of live objects of each kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectCounts {
    pub threads: usize,
    pub semaphores: usize,
    pub mutexes: usize,
    pub queues: usize,
    pub event_flags: usize,
    pub block_pools: usize,
    pub byte_pools: usize,
}

/// A kernel instance. Independent instances do not share any state.
pub struct Kernel {
    config: KernelConfig,
    state: KernelCell<KernelState>,
    entries: Mutex<Vec<Option<EntrySlot>>>,
    port: Arc<dyn Port>,
    trace: Option<TraceHook>,
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.config.name)
            .field("cores", &self.config.cores)
            .finish_non_exhaustive()
    }
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub(crate) fn port(&self) -> &dyn Port {
        &*self.port
    }

    /// Runs `f` on the kernel state inside the critical section, performs
    /// the context switches that became legal and then carries out the
    /// deferred effects.
    pub(crate) fn critical<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let core = self.port.core_id();
        let (result, effects) = self.state.with(|s| {
            s.core = core.min(s.cores.len() - 1);
            let result = f(s);
            s.dispatch();
            (result, s.take_effects())
        });
        self.apply(effects);
        result
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Trace { record, payload } => {
                    if let Some(hook) = &self.trace {
                        let _ = hook(record, payload.as_slice(), true);
                    }
                }
                Effect::Call(call) => call(),
                Effect::Fatal { error, notify } => match (error, notify) {
                    (FatalError::StackOverflow { thread }, Some(notify)) => notify(thread),
                    _ => match self.config.error_handler {
                        Some(handler) => handler(&error),
                        None => panic!("{error}"),
                    },
                },
            }
        }
    }

    /// Marks the kernel running; from here on the dispatcher switches
    /// threads.
    pub fn start(&self) {
        self.critical(|s| {
            s.started = true;
            log::info!("kernel '{}' started", self.config.name);
        });
    }

    pub fn is_started(&self) -> bool {
        self.critical(|s| s.started)
    }

    /// Runs one step of the thread current on `core`. Returns `false` when
    /// the core is idle.
    pub fn step_core(&self, core: usize) -> bool {
        if core >= self.config.cores {
            return false;
        }
        self.port.bind_core(core);
        let picked = self.critical(|s| {
            if !s.started {
                return None;
            }
            let index = s.sched.current[core]?;
            s.cores[core].in_step = true;
            let id = s.thread_id(index);
            let tcb = s.threads.node_mut(index);
            if !tcb.entered {
                tcb.entered = true;
                if let Some(notify) = tcb.entry_exit_notify.clone() {
                    s.defer(move || notify(id, ThreadEvent::Entry));
                }
            }
            Some((index, id))
        });
        let Some((index, id)) = picked else {
            if let Some(idle) = self.config.idle_callback {
                idle();
            }
            return false;
        };

        let action = match self.take_entry(id) {
            Some((mut entry, iteration)) => {
                let mut context = ThreadContext::new(self, id, iteration, core);
                let action = entry(&mut context);
                self.return_entry(id, entry);
                action
            }
            None => ThreadAction::Complete,
        };

        self.critical(|s| {
            s.cores[core].in_step = false;
            if s.threads.contains(id.0) {
                s.check_stack(index);
                if action == ThreadAction::Complete {
                    s.finish_thread(index, ThreadState::Completed);
                }
            }
        });
        true
    }

    /// Steps every core once. Returns `false` when all cores were idle.
    pub fn step(&self) -> bool {
        let mut ran = false;
        for core in 0..self.config.cores {
            ran |= self.step_core(core);
        }
        ran
    }

    /// Steps until every core is idle or `max_steps` rounds have run.
    /// Returns the number of rounds in which some thread ran.
    pub fn run(&self, max_steps: usize) -> usize {
        let mut rounds = 0;
        while rounds < max_steps && self.step() {
            rounds += 1;
        }
        rounds
    }

    /// Enters interrupt context on the calling core. Context switches are
    /// held back until the outermost [`Kernel::isr_exit`].
    pub fn isr_enter(&self) {
        self.critical(|s| {
            let core = s.core;
            s.cores[core].isr_nesting += 1;
            if s.cores[core].isr_nesting == 1 {
                s.trace(isr::ENTER, Payload::new().u8(core as u8));
            }
        });
    }

    pub fn isr_exit(&self) {
        self.critical(|s| {
            let core = s.core;
            let nesting = &mut s.cores[core].isr_nesting;
            *nesting = nesting.saturating_sub(1);
            if *nesting == 0 {
                s.trace(isr::EXIT, Payload::new().u8(core as u8));
            }
        });
    }

    /// Timer tick, processed in interrupt context: expires timeouts and
    /// sleeps, then advances time slices.
    pub fn tick(&self) {
        self.isr_enter();
        self.critical(KernelState::process_tick);
        self.isr_exit();
    }

    pub fn tick_count(&self) -> u64 {
        self.critical(|s| s.tick)
    }

    /// Nests a preemption-disable level and returns the new depth.
    pub fn preempt_disable(&self) -> u32 {
        self.critical(|s| {
            s.sched.preempt_disable += 1;
            let depth = s.sched.preempt_disable;
            s.trace(sched::LOCK, Payload::new().u32(depth));
            depth
        })
    }

    /// Drops one preemption-disable level; at zero any pending preemption
    /// takes place.
    pub fn preempt_enable(&self) -> u32 {
        self.critical(|s| {
            s.sched.preempt_disable = s.sched.preempt_disable.saturating_sub(1);
            let depth = s.sched.preempt_disable;
            s.trace(sched::UNLOCK, Payload::new().u32(depth));
            depth
        })
    }

    /// Thread running on `core`.
    pub fn current_thread(&self, core: usize) -> Option<ThreadId> {
        self.critical(|s| {
            s.sched
                .current
                .get(core)
                .copied()
                .flatten()
                .map(|index| s.thread_id(index))
        })
    }

    /// Thread each core should run, as decided by the scheduler.
    pub fn execute_list(&self) -> Vec<Option<ThreadId>> {
        self.critical(|s| {
            s.sched
                .execute
                .iter()
                .map(|slot| slot.map(|index| s.thread_id(index)))
                .collect()
        })
    }

    pub fn object_counts(&self) -> ObjectCounts {
        self.critical(|s| ObjectCounts {
            threads: s.threads.len(),
            semaphores: s.semaphores.len(),
            mutexes: s.mutexes.len(),
            queues: s.queues.len(),
            event_flags: s.event_flags.len(),
            block_pools: s.block_pools.len(),
            byte_pools: s.byte_pools.len(),
        })
    }

    pub(crate) fn take_wake(&self, thread: ThreadId) -> Option<WakeResult> {
        self.critical(|s| s.threads.get_mut(thread.0)?.wake.take())
    }

    pub(crate) fn install_entry(&self, thread: ThreadId, entry: ThreadEntry) {
        let index = thread.index() as usize;
        let mut entries = self.entries.lock();
        if entries.len() <= index {
            entries.resize_with(index + 1, || None);
        }
        entries[index] = Some(EntrySlot {
            generation: thread.0.generation(),
            entry: Some(entry),
            iterations: 0,
        });
    }

    pub(crate) fn remove_entry(&self, thread: ThreadId) {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.get_mut(thread.index() as usize) {
            if slot.as_ref().is_some_and(|e| e.generation == thread.0.generation()) {
                *slot = None;
            }
        }
    }

    /// Restarts the iteration count of the body of `thread`.
    pub(crate) fn reset_entry(&self, thread: ThreadId) {
        if let Some(slot) = entry_slot(&mut self.entries.lock(), thread) {
            slot.iterations = 0;
        }
    }

    fn take_entry(&self, thread: ThreadId) -> Option<(ThreadEntry, u64)> {
        let mut entries = self.entries.lock();
        let slot = entry_slot(&mut entries, thread)?;
        let entry = slot.entry.take()?;
        Some((entry, slot.iterations))
    }

    fn return_entry(&self, thread: ThreadId, entry: ThreadEntry) {
        let mut entries = self.entries.lock();
        if let Some(slot) = entry_slot(&mut entries, thread) {
            slot.entry = Some(entry);
            slot.iterations += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use crate::thread::ThreadConfig;

    fn spin(name: &'static str, priority: u32) -> ThreadConfig {
        ThreadConfig::new(name, priority, |_| ThreadAction::Continue)
    }

    #[test]
    fn config_validation() {
        assert!(KernelConfig::default().validate().is_ok());
        assert_eq!(
            KernelConfig::builder().max_priorities(48).build().err(),
            Some(ConfigError::InvalidPriorityCount(48))
        );
        assert_eq!(
            KernelConfig::builder().cores(0).build().err(),
            Some(ConfigError::InvalidCoreCount(0))
        );
        assert_eq!(
            KernelConfig::builder()
                .minimum_stack(512)
                .default_stack_size(256)
                .build()
                .err(),
            Some(ConfigError::StackTooSmall {
                size: 256,
                minimum: 512
            })
        );
    }

    #[test]
    fn nothing_runs_before_start() -> Result<(), KernelError> {
        let kernel = KernelBuilder::new().build().expect("kernel");
        let t = kernel.thread_create(spin("t", 4))?;
        assert_eq!(kernel.current_thread(0), None);
        assert!(!kernel.step());

        kernel.start();
        assert_eq!(kernel.current_thread(0), Some(t));
        assert_eq!(kernel.run(3), 3);
        Ok(())
    }

    #[test]
    fn interrupts_defer_the_switch() -> Result<(), KernelError> {
        let kernel = KernelBuilder::new().build().expect("kernel");
        let low = kernel.thread_create(spin("low", 10))?;
        kernel.start();

        kernel.isr_enter();
        kernel.isr_enter();
        let high = kernel.thread_create(spin("high", 1))?;
        assert_eq!(kernel.execute_list(), vec![Some(high)]);
        kernel.isr_exit();
        assert_eq!(kernel.current_thread(0), Some(low));
        kernel.isr_exit();
        assert_eq!(kernel.current_thread(0), Some(high));
        Ok(())
    }

    #[test]
    fn preemption_disable_holds_the_running_thread() -> Result<(), KernelError> {
        let kernel = KernelBuilder::new().build().expect("kernel");
        let low = kernel.thread_create(spin("low", 10))?;
        kernel.start();

        assert_eq!(kernel.preempt_disable(), 1);
        let high = kernel.thread_create(spin("high", 1))?;
        assert_eq!(kernel.current_thread(0), Some(low));
        assert_eq!(kernel.preempt_enable(), 0);
        assert_eq!(kernel.current_thread(0), Some(high));
        Ok(())
    }

    #[test]
    fn completed_body_finishes_the_thread() -> Result<(), KernelError> {
        let kernel = KernelBuilder::new().build().expect("kernel");
        let t = kernel.thread_create(ThreadConfig::new("once", 3, |_| ThreadAction::Complete))?;
        kernel.start();
        assert!(kernel.step());
        assert_eq!(kernel.thread_info(t)?.state, ThreadState::Completed);
        assert_eq!(kernel.current_thread(0), None);
        kernel.thread_delete(t)?;
        assert_eq!(kernel.object_counts().threads, 0);
        Ok(())
    }
}

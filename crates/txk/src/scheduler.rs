//! Ready queue, preemption-threshold and context-switch decisions.
//!
//! ## Scheduling policy
//!
//! 1. Ready threads sit on one FIFO ring per priority; a bitmap finds the
//!    most urgent non-empty ring.
//! 2. The running thread can only be preempted by a thread more urgent than
//!    its preemption threshold.
//! 3. A threshold thread preempted that way is remembered in the preempted
//!    map and gets the processor back before anything at or below its
//!    threshold.
//! 4. With several cores the execute list is rebuilt by [`crate::smp`]
//!    after every ready-set change.
//! 5. The switch itself happens in [`KernelState::dispatch`], only where no
//!    interrupt is active, no thread body is mid-step and preemption is
//!    enabled (or the running thread already left the ready state).

use alloc::vec::Vec;

use crate::arena::Arena;
use crate::list::{kind, Ring};
use crate::priority::PriorityMap;
use crate::smp::{self, Candidate, RebalanceInput};
use crate::state::KernelState;
use crate::thread::{Tcb, ThreadState};
use crate::trace::{
    records::{sched, thread as rec},
    Payload,
};

/// Scheduler part of the kernel state.
pub(crate) struct Scheduler {
    pub ready: Vec<Ring<kind::Ready>>,
    pub map: PriorityMap,
    pub preempted: PriorityMap,
    /// Thread each core should run.
    pub execute: Vec<Option<u32>>,
    /// Thread each core is running.
    pub current: Vec<Option<u32>>,
    pub preempt_disable: u32,
    /// Last threshold thread placed by the SMP rebalance.
    pub threshold_scheduled: Option<u32>,
}

impl Scheduler {
    pub fn new(levels: u32, cores: usize) -> Self {
        Self {
            ready: (0..levels).map(|_| Ring::default()).collect(),
            map: PriorityMap::new(levels),
            preempted: PriorityMap::new(levels),
            execute: alloc::vec![None; cores],
            current: alloc::vec![None; cores],
            preempt_disable: 0,
            threshold_scheduled: None,
        }
    }

    pub fn cores(&self) -> usize {
        self.execute.len()
    }

    fn unlink(&mut self, threads: &mut Arena<Tcb>, thread: u32) {
        let prio = threads.node(thread).priority;
        let ring = &mut self.ready[prio as usize];
        let was_head = ring.head() == Some(thread);
        ring.remove(threads, thread);
        if ring.is_empty() {
            self.map.clear(prio);
            self.preempted.clear(prio);
        } else if was_head {
            self.preempted.clear(prio);
        }
    }

    /// Uniprocessor choice after the running thread left the ready set.
    fn select_next(&mut self, threads: &Arena<Tcb>) -> Option<u32> {
        let highest = self.map.lowest()?;
        let mut next = self.ready[highest as usize].head();
        if let Some(prio) = self.preempted.lowest() {
            if let Some(holder) = self.ready[prio as usize].head() {
                if highest >= threads.node(holder).preempt_threshold {
                    next = Some(holder);
                    self.preempted.clear(prio);
                }
            }
        }
        next
    }

    fn is_executing(&self, thread: u32) -> bool {
        self.execute.contains(&Some(thread))
    }
}

impl KernelState {
    /// Makes `thread` ready, or Suspended when a suspension was requested
    /// while it waited.
    pub(crate) fn resume_thread(&mut self, thread: u32) {
        self.timers.disarm(thread);
        let tcb = self.threads.node_mut(thread);
        if tcb.state == ThreadState::Ready {
            return;
        }
        if tcb.delayed_suspend {
            tcb.delayed_suspend = false;
            tcb.state = ThreadState::Suspended;
            return;
        }
        tcb.state = ThreadState::Ready;
        let prio = tcb.priority;

        let highest = self.sched.map.lowest();
        let ring = &mut self.sched.ready[prio as usize];
        let was_empty = ring.is_empty();
        ring.push_back(&mut self.threads, thread);
        self.sched.map.set(prio);
        log::trace!("thread {thread} ready at priority {prio}");
        self.trace(rec::RESUME, Payload::new().u32(thread).u32(prio));

        if self.sched.cores() > 1 {
            self.rebalance();
            return;
        }
        if !was_empty || highest.is_some_and(|highest| prio >= highest) {
            return;
        }
        match self.sched.execute[0] {
            None => self.sched.execute[0] = Some(thread),
            Some(running) => {
                let running = self.threads.node(running);
                if prio < running.preempt_threshold {
                    if running.preempt_threshold != running.priority {
                        self.sched.preempted.set(running.priority);
                    }
                    self.sched.execute[0] = Some(thread);
                }
            }
        }
    }

    /// Removes `thread` from the ready set. The caller has already moved it
    /// out of the Ready state.
    pub(crate) fn suspend_thread(&mut self, thread: u32) {
        self.sched.unlink(&mut self.threads, thread);
        let state = self.threads.node(thread).state;
        log::trace!("thread {thread} left the ready set as {state:?}");
        self.trace(rec::SUSPEND, Payload::new().u32(thread).u8(state.code()));

        if self.sched.cores() > 1 {
            if self.sched.threshold_scheduled == Some(thread) {
                self.sched.threshold_scheduled = None;
            }
            self.rebalance();
            return;
        }
        if self.sched.execute[0] == Some(thread) {
            self.sched.execute[0] = self.sched.select_next(&self.threads);
        }
    }

    /// Sets the effective priority and threshold of `thread`, moving it
    /// between ready rings when it is ready.
    pub(crate) fn reprioritize(&mut self, thread: u32, priority: u32, threshold: u32) {
        let tcb = self.threads.node_mut(thread);
        if tcb.state != ThreadState::Ready {
            tcb.priority = priority;
            tcb.preempt_threshold = threshold;
            return;
        }
        if self.sched.cores() > 1 && self.simple_priority_change(thread, priority, threshold) {
            return;
        }

        let was_executing = self.sched.is_executing(thread);
        self.sched.preempt_disable += 1;
        self.threads.node_mut(thread).state = ThreadState::PriorityChange;
        self.suspend_thread(thread);

        let tcb = self.threads.node_mut(thread);
        tcb.priority = priority;
        tcb.preempt_threshold = threshold;
        self.resume_thread(thread);
        self.sched.preempt_disable -= 1;

        if !was_executing || self.threads.node(thread).state != ThreadState::Ready {
            return;
        }
        if self.sched.cores() > 1 {
            self.sched.ready[priority as usize].set_head(thread);
            self.rebalance();
            return;
        }
        // A thread that was running keeps the processor unless something
        // more urgent is now ready.
        if let Some(next) = self.sched.execute[0] {
            if priority <= self.threads.node(next).priority {
                self.sched.ready[priority as usize].set_head(thread);
                self.sched.execute[0] = Some(thread);
            }
        }
    }

    /// SMP priority change that cannot alter the execute list: an executing
    /// thread being raised, or an idle one that stays less urgent than every
    /// executing thread on a fully busy system. Neither may involve a
    /// preemption threshold.
    fn simple_priority_change(&mut self, thread: u32, priority: u32, threshold: u32) -> bool {
        let tcb = self.threads.node(thread);
        if tcb.preempt_threshold != tcb.priority
            || threshold != priority
            || self.sched.threshold_scheduled.is_some()
        {
            return false;
        }
        let executing = self.sched.is_executing(thread);
        let unchanged = if executing {
            priority < tcb.priority
        } else {
            self.sched.execute.iter().all(|slot| {
                slot.is_some_and(|running| self.threads.node(running).priority < priority)
            })
        };
        if !unchanged {
            return false;
        }

        self.sched.unlink(&mut self.threads, thread);
        let tcb = self.threads.node_mut(thread);
        tcb.priority = priority;
        tcb.preempt_threshold = threshold;
        let ring = &mut self.sched.ready[priority as usize];
        if executing {
            ring.push_front(&mut self.threads, thread);
        } else {
            ring.push_back(&mut self.threads, thread);
        }
        self.sched.map.set(priority);
        true
    }

    /// Applies a new user preemption threshold, clamped to any inherited
    /// priority currently in force.
    pub(crate) fn change_threshold(&mut self, thread: u32, threshold: u32) {
        let tcb = self.threads.node_mut(thread);
        let old = tcb.preempt_threshold;
        tcb.user_preempt_threshold = threshold;
        let effective = threshold.min(tcb.priority);
        tcb.preempt_threshold = effective;
        let prio = tcb.priority;
        if tcb.state != ThreadState::Ready {
            return;
        }
        if self.sched.cores() > 1 {
            self.rebalance();
            return;
        }
        if effective <= old {
            return;
        }
        self.sched.preempted.clear(prio);
        if self.sched.execute[0] != Some(thread) {
            return;
        }
        if let Some(highest) = self.sched.map.lowest() {
            if highest < effective {
                if effective < prio {
                    self.sched.preempted.set(prio);
                }
                self.sched.execute[0] = self.sched.ready[highest as usize].head();
            }
        }
    }

    /// Moves `thread` behind the other ready threads of its priority.
    pub(crate) fn relinquish(&mut self, thread: u32) {
        let tcb = self.threads.node_mut(thread);
        tcb.time_slice = tcb.new_time_slice;
        let prio = tcb.priority as usize;
        if tcb.state != ThreadState::Ready {
            return;
        }
        let ring = &mut self.sched.ready[prio];
        if ring.len() > 1 {
            ring.remove(&mut self.threads, thread);
            ring.push_back(&mut self.threads, thread);
        }
        if self.sched.cores() > 1 {
            self.rebalance();
        } else if self.sched.execute[0] == Some(thread) {
            self.sched.execute[0] = self.sched.select_next(&self.threads);
        }
    }

    /// Counts down the time slice of every running thread and rotates the
    /// ones that expire. Threads with an active preemption threshold keep
    /// their place.
    pub(crate) fn time_slice(&mut self) {
        if !self.time_slicing {
            return;
        }
        for core in 0..self.sched.cores() {
            let Some(thread) = self.sched.current[core] else {
                continue;
            };
            if !self.threads.is_live(thread) {
                continue;
            }
            let tcb = self.threads.node_mut(thread);
            if tcb.state != ThreadState::Ready || tcb.time_slice == 0 {
                continue;
            }
            tcb.time_slice -= 1;
            if tcb.time_slice > 0 {
                continue;
            }
            tcb.time_slice = tcb.new_time_slice;
            if tcb.preempt_threshold < tcb.priority {
                continue;
            }
            let prio = tcb.priority as usize;
            let ring = &mut self.sched.ready[prio];
            if ring.len() < 2 {
                continue;
            }
            ring.remove(&mut self.threads, thread);
            ring.push_back(&mut self.threads, thread);
            log::trace!("time slice of thread {thread} expired");
            if self.sched.cores() > 1 {
                self.rebalance();
            } else if self.sched.execute[0] == Some(thread) {
                self.sched.execute[0] = self.sched.select_next(&self.threads);
            }
        }
    }

    /// Rebuilds the SMP execute list from the ready set.
    pub(crate) fn rebalance(&mut self) {
        let mut candidates = Vec::new();
        for prio in self.sched.map.iter() {
            for thread in self.sched.ready[prio as usize].iter(&self.threads) {
                let tcb = self.threads.node(thread);
                candidates.push(Candidate {
                    thread,
                    priority: tcb.priority,
                    threshold: tcb.preempt_threshold,
                    cores_allowed: tcb.cores_allowed,
                    last_core: tcb.last_core,
                });
            }
        }
        let holder = self.sched.threshold_scheduled.and_then(|holder| {
            candidates
                .iter()
                .position(|c| c.thread == holder && c.threshold < c.priority)
        });

        let cores = self.sched.cores();
        let assignment = smp::rebalance(&RebalanceInput {
            cores,
            candidates: &candidates,
            holder,
        });

        for (core, slot) in assignment.cores.iter().enumerate() {
            let thread = slot.map(|index| candidates[index].thread);
            self.sched.execute[core] = thread;
            if let Some(thread) = thread {
                self.threads.node_mut(thread).last_core = Some(core);
            }
        }
        self.sched.threshold_scheduled = assignment
            .threshold_scheduled
            .map(|index| candidates[index].thread);
        self.trace(sched::REBALANCE, Payload::new().u8(cores as u8));
    }

    fn switch_allowed(&self, core: usize) -> bool {
        let state = &self.cores[core];
        if state.isr_nesting > 0 || state.in_step {
            return false;
        }
        if self.sched.preempt_disable == 0 {
            return true;
        }
        match self.sched.current[core] {
            Some(thread) => {
                !self.threads.is_live(thread)
                    || self.threads.node(thread).state != ThreadState::Ready
            }
            None => true,
        }
    }

    /// Switches every core whose running thread differs from its execute
    /// thread, where a switch is currently allowed.
    pub(crate) fn dispatch(&mut self) {
        if !self.started {
            return;
        }
        let cores = self.sched.cores();
        let allowed: Vec<bool> = (0..cores).map(|core| self.switch_allowed(core)).collect();

        for core in 0..cores {
            if !allowed[core] {
                continue;
            }
            let mut next = self.sched.execute[core];
            if let Some(thread) = next {
                let pinned_elsewhere = (0..cores).any(|other| {
                    other != core && !allowed[other] && self.sched.current[other] == Some(thread)
                });
                if pinned_elsewhere {
                    next = None;
                }
            }
            if self.sched.current[core] == next {
                continue;
            }
            self.sched.current[core] = next;
            match next {
                Some(thread) => {
                    let tcb = self.threads.node_mut(thread);
                    tcb.run_count += 1;
                    tcb.last_core = Some(core);
                    log::trace!("core {core} switched to thread {thread}");
                    self.trace(sched::NEXT, Payload::new().u8(core as u8).u32(thread));
                }
                None => {
                    log::trace!("core {core} idle");
                    self.trace(sched::IDLE, Payload::new().u8(core as u8));
                }
            }
        }
    }
}

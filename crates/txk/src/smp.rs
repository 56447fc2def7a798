//! SMP execute-list rebalancing.
//!
//! Pure function over a snapshot of the ready set: the scheduler lists every
//! ready thread in priority order (FIFO within a priority) and receives the
//! thread each core should run.
//!
//! Placement walks the candidates from most to least urgent:
//!
//! - A thread goes to the core it last ran on when that core is still free
//!   and allowed, otherwise to the lowest free allowed core.
//! - When every allowed core is taken, already placed threads are shifted
//!   along a chain of allowed cores to open one up.
//! - A thread with an active preemption threshold is the last one placed,
//!   and is skipped when something already placed is at or below its
//!   threshold.
//! - The threshold thread placed by the previous pass (the holder) is
//!   placed as soon as the walk reaches its threshold, ahead of anything at
//!   that level.

use alloc::vec;
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub thread: u32,
    pub priority: u32,
    pub threshold: u32,
    pub cores_allowed: u32,
    pub last_core: Option<usize>,
}

impl Candidate {
    fn has_threshold(&self) -> bool {
        self.threshold < self.priority
    }
}

pub(crate) struct RebalanceInput<'a> {
    pub cores: usize,
    /// Ready threads, most urgent first.
    pub candidates: &'a [Candidate],
    /// Index into `candidates` of the previously placed threshold thread.
    pub holder: Option<usize>,
}

/// Candidate index per core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Assignment {
    pub cores: Vec<Option<usize>>,
    pub threshold_scheduled: Option<usize>,
}

fn bit(core: usize) -> u32 {
    1 << core
}

fn lowest(mask: u32) -> usize {
    mask.trailing_zeros() as usize
}

fn bits(mut mask: u32) -> impl Iterator<Item = usize> {
    core::iter::from_fn(move || {
        if mask == 0 {
            return None;
        }
        let core = lowest(mask);
        mask &= mask - 1;
        Some(core)
    })
}

pub(crate) fn core_mask(cores: usize) -> u32 {
    if cores >= 32 {
        u32::MAX
    } else {
        (1 << cores) - 1
    }
}

struct Plan<'a> {
    candidates: &'a [Candidate],
    schedule: Vec<Option<usize>>,
    mapped: Vec<Option<usize>>,
}

impl Plan<'_> {
    /// Shifts placed threads so that `index` can take one of
    /// `thread_possible`. Returns the core freed up for the last thread in
    /// the shift chain.
    fn remap(
        &mut self,
        index: usize,
        available: u32,
        thread_possible: u32,
        mut test_possible: u32,
    ) -> Option<usize> {
        let mut wants: Vec<Option<usize>> = vec![None; self.schedule.len()];
        let mut queue = Vec::new();

        let mut pending = thread_possible;
        if let Some(core) = self.mapped[index] {
            if pending & bit(core) != 0 {
                wants[core] = Some(index);
                queue.push(core);
                pending &= !bit(core);
            }
        }
        for core in bits(pending) {
            wants[core] = Some(index);
            queue.push(core);
        }

        let mut head = 0;
        let mut last = None;
        while head < queue.len() {
            let core = queue[head];
            head += 1;
            let Some(occupant) = self.schedule[core] else {
                continue;
            };
            let possible = self.candidates[occupant].cores_allowed & test_possible;
            if possible == 0 {
                continue;
            }
            if possible & available != 0 {
                last = Some((occupant, possible & available));
                break;
            }
            test_possible &= !possible;
            for core in bits(possible) {
                wants[core] = Some(occupant);
                queue.push(core);
            }
        }

        let (last_thread, last_cores) = last?;
        let mut core = self.mapped[last_thread]?;
        let mut mover = wants[core]?;
        while mover != index {
            self.schedule[core] = Some(mover);
            let previous = core;
            core = self.mapped[mover]?;
            self.mapped[mover] = Some(previous);
            mover = wants[core]?;
        }
        self.schedule[core] = Some(index);
        self.mapped[index] = Some(core);

        let free = lowest(last_cores);
        self.schedule[free] = Some(last_thread);
        self.mapped[last_thread] = Some(free);
        Some(free)
    }
}

pub(crate) fn rebalance(input: &RebalanceInput<'_>) -> Assignment {
    let candidates = input.candidates;
    let mut plan = Plan {
        candidates,
        schedule: vec![None; input.cores],
        mapped: candidates.iter().map(|c| c.last_core).collect(),
    };
    let mut considered = vec![false; candidates.len()];
    let mut possible = core_mask(input.cores);
    let mut available = possible;
    let mut holder = input.holder;
    let mut threshold_scheduled = None;
    let mut level = None;
    let mut last_priority = 0;
    let mut placed = 0;
    let mut cursor = 0;

    while placed < input.cores {
        while cursor < candidates.len() && considered[cursor] {
            cursor += 1;
        }
        if cursor >= candidates.len() {
            break;
        }

        let mut index = cursor;
        let next_level = candidates[cursor].priority;
        if level != Some(next_level) {
            level = Some(next_level);
            if let Some(h) = holder {
                let held = &candidates[h];
                if next_level >= held.threshold {
                    if next_level > held.priority {
                        break;
                    }
                    index = h;
                    holder = None;
                }
            }
        }
        considered[index] = true;

        let candidate = &candidates[index];
        let thread_possible = candidate.cores_allowed & possible;
        if thread_possible == 0 {
            continue;
        }
        if candidate.has_threshold() && placed != 0 && last_priority >= candidate.threshold {
            continue;
        }

        if thread_possible & available != 0 {
            let free = thread_possible & available;
            let core = match plan.mapped[index] {
                Some(core) if free & bit(core) != 0 => core,
                _ => lowest(free),
            };
            plan.schedule[core] = Some(index);
            plan.mapped[index] = Some(core);
            available &= !bit(core);
        } else {
            let test_possible = possible & !thread_possible;
            match plan.remap(index, available, thread_possible, test_possible) {
                Some(core) => available &= !bit(core),
                None if Some(index) == input.holder => break,
                None => {
                    possible &= !thread_possible;
                    continue;
                }
            }
        }

        placed += 1;
        if candidate.has_threshold() {
            threshold_scheduled = Some(index);
            break;
        }
        last_priority = candidate.priority;
    }

    Assignment {
        cores: plan.schedule,
        threshold_scheduled,
    }
}

//! Event flag groups: 32 flags per group, with AND/OR waits and optional
//! consumption of the flags a waiter was satisfied by.

use alloc::vec::Vec;

use crate::arena::handle;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::list::{kind, linked, Link, Ring};
use crate::state::KernelState;
use crate::suspend::{Blocking, QueueEnd, SuspendInfo, Timeout, WaitTarget, WakePayload};
use crate::sync::Arc;
use crate::thread::{ThreadId, ThreadState};
use crate::trace::{records::event_flags as rec, Payload};

handle!(
    /// Handle of an event flag group.
    EventFlagsId
);

/// Invoked after every set.
pub type EventFlagsNotify = Arc<dyn Fn(EventFlagsId) + Send + Sync>;

/// How requested flags are matched on get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventOption {
    /// All requested flags must be set.
    And,
    /// Like `And`, and the requested flags are cleared once satisfied.
    AndClear,
    /// Any requested flag suffices.
    Or,
    /// Like `Or`, and the requested flags are cleared once satisfied.
    OrClear,
}

impl EventOption {
    fn satisfied(self, flags: u32, requested: u32) -> bool {
        match self {
            Self::And | Self::AndClear => flags & requested == requested,
            Self::Or | Self::OrClear => flags & requested != 0,
        }
    }

    fn clears(self) -> bool {
        matches!(self, Self::AndClear | Self::OrClear)
    }
}

/// How set combines the new flags with the current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetOption {
    /// `current &= flags`
    And,
    /// `current |= flags`
    Or,
}

pub(crate) struct EventFlagsCb {
    pub name: &'static str,
    pub current: u32,
    pub waiters: Ring<kind::Suspended>,
    pub created: Link,
    pub set_notify: Option<EventFlagsNotify>,
}

linked!(EventFlagsCb, kind::Created, created);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFlagsInfo {
    pub name: &'static str,
    pub current: u32,
    pub first_waiter: Option<ThreadId>,
    pub suspended_count: usize,
}

impl KernelState {
    fn event_flags_mut(&mut self, id: EventFlagsId) -> KernelResult<&mut EventFlagsCb> {
        self.event_flags.get_mut(id.0).ok_or(KernelError::GroupError)
    }

    /// Resumes every waiter the flags in `snapshot` satisfy, then clears the
    /// bits consumed by `*Clear` waiters.
    fn wake_flag_waiters(&mut self, id: EventFlagsId, snapshot: u32) {
        let Some(group) = self.event_flags.get(id.0) else {
            return;
        };
        let waiters: Vec<u32> = group.waiters.iter(&self.threads).collect();
        let mut consumed = 0;
        for thread in waiters {
            let SuspendInfo::Flags { requested, option } = self.threads.node(thread).suspend_info
            else {
                continue;
            };
            if !option.satisfied(snapshot, requested) {
                continue;
            }
            if option.clears() {
                consumed |= requested;
            }
            self.unlink_waiter(thread);
            self.finish_wait(thread, Ok(WakePayload::Flags(snapshot)));
        }
        if let Some(group) = self.event_flags.get_mut(id.0) {
            group.current &= !consumed;
        }
    }
}

impl Kernel {
    pub fn event_flags_create(&self, name: &'static str) -> KernelResult<EventFlagsId> {
        self.critical(|s| {
            let slot = s.event_flags.insert(EventFlagsCb {
                name,
                current: 0,
                waiters: Ring::default(),
                created: Link::default(),
                set_notify: None,
            });
            s.created.event_flags.push_back(&mut s.event_flags, slot.index());
            log::debug!("event flags '{name}' created");
            s.trace(rec::CREATE, Payload::new().u32(slot.index()).u32(0));
            Ok(EventFlagsId(slot))
        })
    }

    /// Deletes the group; every waiter resumes with [`KernelError::Deleted`].
    pub fn event_flags_delete(&self, id: EventFlagsId) -> KernelResult<()> {
        self.critical(|s| {
            s.event_flags_mut(id)?;
            s.created.event_flags.remove(&mut s.event_flags, id.0.index());
            let group = s.event_flags.remove(id.0).ok_or(KernelError::GroupError)?;
            log::debug!("event flags '{}' deleted", group.name);
            s.trace(rec::DELETE, Payload::new().u32(id.0.index()));
            s.drain_deleted(group.waiters);
            Ok(())
        })
    }

    /// Combines `flags` into the group and resumes every waiter the result
    /// satisfies.
    pub fn event_flags_set(&self, id: EventFlagsId, flags: u32, option: SetOption) -> KernelResult<()> {
        self.critical(|s| {
            let group = s.event_flags_mut(id)?;
            match option {
                SetOption::And => group.current &= flags,
                SetOption::Or => group.current |= flags,
            }
            let snapshot = group.current;
            let waiting = !group.waiters.is_empty();
            s.trace(rec::SET, Payload::new().u32(id.0.index()).u32(snapshot));
            // Clearing bits cannot satisfy anyone new.
            if waiting && option == SetOption::Or {
                s.wake_flag_waiters(id, snapshot);
            }
            if let Some(notify) = s.event_flags.get(id.0).and_then(|g| g.set_notify.clone()) {
                s.defer(move || notify(id));
            }
            Ok(())
        })
    }

    /// Waits for `requested` flags. Completes with the group's flags as they
    /// were when the request was satisfied.
    pub fn event_flags_get(
        &self,
        id: EventFlagsId,
        requested: u32,
        option: EventOption,
        timeout: Timeout,
    ) -> KernelResult<Blocking<u32>> {
        self.critical(|s| {
            let group = s.event_flags_mut(id)?;
            let current = group.current;
            if option.satisfied(current, requested) {
                if option.clears() {
                    group.current &= !requested;
                }
                s.trace(rec::GET, Payload::new().u32(id.0.index()).u32(current));
                return Ok(Blocking::Complete(current));
            }
            if timeout == Timeout::NoWait {
                return Err(KernelError::NoEvents);
            }
            let thread = s.blocking_caller()?;
            s.block_on(
                thread,
                WaitTarget::EventFlags(id),
                ThreadState::EventFlag,
                SuspendInfo::Flags { requested, option },
                QueueEnd::Back,
                timeout,
            );
            Ok(Blocking::Suspended)
        })
    }

    pub fn event_flags_prioritize(&self, id: EventFlagsId) -> KernelResult<()> {
        self.critical(|s| {
            s.event_flags_mut(id)?;
            s.prioritize(WaitTarget::EventFlags(id));
            Ok(())
        })
    }

    pub fn event_flags_set_notify(
        &self,
        id: EventFlagsId,
        notify: Option<EventFlagsNotify>,
    ) -> KernelResult<()> {
        self.critical(|s| {
            s.event_flags_mut(id)?.set_notify = notify;
            Ok(())
        })
    }

    pub fn event_flags_info(&self, id: EventFlagsId) -> KernelResult<EventFlagsInfo> {
        self.critical(|s| {
            let group = s.event_flags.get(id.0).ok_or(KernelError::GroupError)?;
            Ok(EventFlagsInfo {
                name: group.name,
                current: group.current,
                first_waiter: group.waiters.head().map(|t| s.thread_id(t)),
                suspended_count: group.waiters.len(),
            })
        })
    }

    /// Event flag groups in creation order.
    pub fn event_flags_list(&self) -> Vec<EventFlagsId> {
        self.critical(|s| {
            s.created
                .event_flags
                .iter(&s.event_flags)
                .map(|index| EventFlagsId(s.event_flags.slot_of(index)))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelBuilder;

    #[test]
    fn options_match_requested_bits() {
        assert!(EventOption::And.satisfied(0b111, 0b101));
        assert!(!EventOption::And.satisfied(0b100, 0b101));
        assert!(EventOption::OrClear.satisfied(0b100, 0b101));
        assert!(!EventOption::Or.satisfied(0b010, 0b101));
        assert!(EventOption::AndClear.clears());
        assert!(!EventOption::Or.clears());
    }

    #[test]
    fn clear_options_consume_flags() -> Result<(), KernelError> {
        let kernel = KernelBuilder::new().build().expect("kernel");
        let group = kernel.event_flags_create("ev")?;
        kernel.event_flags_set(group, 0b1011, SetOption::Or)?;

        let got = kernel.event_flags_get(group, 0b0011, EventOption::AndClear, Timeout::NoWait)?;
        assert_eq!(got, Blocking::Complete(0b1011));
        assert_eq!(kernel.event_flags_info(group)?.current, 0b1000);

        assert_eq!(
            kernel.event_flags_get(group, 0b0001, EventOption::Or, Timeout::NoWait),
            Err(KernelError::NoEvents)
        );
        Ok(())
    }

    #[test]
    fn and_set_masks_flags() -> Result<(), KernelError> {
        let kernel = KernelBuilder::new().build().expect("kernel");
        let group = kernel.event_flags_create("ev")?;
        kernel.event_flags_set(group, 0xFF, SetOption::Or)?;
        kernel.event_flags_set(group, 0x0F, SetOption::And)?;
        assert_eq!(kernel.event_flags_info(group)?.current, 0x0F);
        kernel.event_flags_delete(group)?;
        assert_eq!(
            kernel.event_flags_set(group, 1, SetOption::Or),
            Err(KernelError::GroupError)
        );
        Ok(())
    }
}

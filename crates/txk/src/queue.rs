//! Fixed-size message queues.
//!
//! Messages are 1, 2, 4, 8 or 16 words. Storage is a ring of message slots;
//! `read` and `write` are slot indices. A receiver waiting on an empty queue
//! is handed the next message directly, and a sender waiting on a full one
//! keeps its message in the control block until a slot frees up. The
//! message of a sender suspended by a front send goes straight to the next
//! receiver.

use alloc::vec;
use alloc::vec::Vec;

use crate::arena::handle;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::list::{kind, linked, Link, Ring};
use crate::state::KernelState;
use crate::suspend::{Blocking, QueueEnd, SuspendInfo, Timeout, WaitTarget, WakePayload};
use crate::sync::Arc;
use crate::thread::{ThreadId, ThreadState};
use crate::trace::{records::queue as rec, Payload};

/// Largest message, in words.
pub const MAX_MESSAGE_WORDS: usize = 16;

/// One queue message.
pub type Message = heapless::Vec<u32, MAX_MESSAGE_WORDS>;

handle!(
    /// Handle of a message queue.
    QueueId
);

/// Invoked after every successful send.
pub type QueueNotify = Arc<dyn Fn(QueueId) + Send + Sync>;

pub(crate) struct QueueCb {
    pub name: &'static str,
    pub message_words: usize,
    pub capacity: u32,
    pub storage: Vec<u32>,
    pub read: u32,
    pub write: u32,
    pub enqueued: u32,
    pub available: u32,
    pub waiters: Ring<kind::Suspended>,
    pub created: Link,
    pub send_notify: Option<QueueNotify>,
}

linked!(QueueCb, kind::Created, created);

impl QueueCb {
    fn slot(&mut self, index: u32) -> &mut [u32] {
        let start = index as usize * self.message_words;
        &mut self.storage[start..start + self.message_words]
    }

    fn push_back(&mut self, message: &[u32]) {
        let write = self.write;
        self.slot(write).copy_from_slice(message);
        self.write = (write + 1) % self.capacity;
        self.enqueued += 1;
        self.available -= 1;
    }

    fn push_front(&mut self, message: &[u32]) {
        self.read = (self.read + self.capacity - 1) % self.capacity;
        let read = self.read;
        self.slot(read).copy_from_slice(message);
        self.enqueued += 1;
        self.available -= 1;
    }

    fn pop(&mut self) -> Message {
        let read = self.read;
        let mut message = Message::new();
        // Slots never exceed the message capacity.
        let _ = message.extend_from_slice(self.slot(read));
        self.read = (read + 1) % self.capacity;
        self.enqueued -= 1;
        self.available += 1;
        message
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: &'static str,
    pub enqueued: u32,
    pub available_storage: u32,
    pub first_waiter: Option<ThreadId>,
    pub suspended_count: usize,
}

fn valid_message_words(words: usize) -> bool {
    matches!(words, 1 | 2 | 4 | 8 | 16)
}

impl KernelState {
    fn queue_mut(&mut self, id: QueueId) -> KernelResult<&mut QueueCb> {
        self.queues.get_mut(id.0).ok_or(KernelError::QueueError)
    }

    fn queue_send(
        &mut self,
        id: QueueId,
        message: &[u32],
        end: QueueEnd,
        timeout: Timeout,
    ) -> KernelResult<Blocking<()>> {
        let target = WaitTarget::Queue(id);
        let queue = self.queue_mut(id)?;
        if message.len() != queue.message_words {
            return Err(KernelError::SizeError);
        }
        let record = match end {
            QueueEnd::Back => rec::SEND,
            QueueEnd::Front => rec::FRONT_SEND,
        };

        if queue.available > 0 {
            if queue.waiters.is_empty() {
                match end {
                    QueueEnd::Back => queue.push_back(message),
                    QueueEnd::Front => queue.push_front(message),
                }
                let enqueued = queue.enqueued;
                self.trace(record, Payload::new().u32(id.0.index()).u32(enqueued));
            } else if let Some(receiver) = self.take_waiter(target) {
                // Waiters on a queue with free storage are receivers.
                let mut handed = Message::new();
                let _ = handed.extend_from_slice(message);
                self.trace(record, Payload::new().u32(id.0.index()).u32(0));
                self.finish_wait(receiver, Ok(WakePayload::Message(handed)));
            }
            if let Some(notify) = self.queues.get(id.0).and_then(|q| q.send_notify.clone()) {
                self.defer(move || notify(id));
            }
            return Ok(Blocking::Complete(()));
        }

        if timeout == Timeout::NoWait {
            return Err(KernelError::QueueFull);
        }
        let thread = self.blocking_caller()?;
        let mut pending = Message::new();
        let _ = pending.extend_from_slice(message);
        self.block_on(
            thread,
            target,
            ThreadState::QueueSusp,
            SuspendInfo::Send(pending),
            end,
            timeout,
        );
        Ok(Blocking::Suspended)
    }

    /// Hands over the message of a sender suspended by a front send. Such a
    /// message is next in line, so it bypasses the full storage entirely.
    fn take_front_sender(&mut self, id: QueueId) -> Option<Message> {
        let target = WaitTarget::Queue(id);
        let sender = self.first_waiter(target)?;
        let tcb = self.threads.node_mut(sender);
        if tcb.suspend_option != QueueEnd::Front {
            return None;
        }
        let SuspendInfo::Send(message) = core::mem::take(&mut tcb.suspend_info) else {
            return None;
        };
        self.take_waiter(target);
        self.finish_wait(sender, Ok(WakePayload::None));
        Some(message)
    }

    /// Moves the first suspended sender's message into the slot a receive
    /// just freed.
    fn refill_from_sender(&mut self, id: QueueId) {
        let Some(sender) = self.take_waiter(WaitTarget::Queue(id)) else {
            return;
        };
        let info = core::mem::take(&mut self.threads.node_mut(sender).suspend_info);
        if let (SuspendInfo::Send(message), Some(queue)) = (info, self.queues.get_mut(id.0)) {
            queue.push_back(&message);
        }
        self.finish_wait(sender, Ok(WakePayload::None));
    }
}

impl Kernel {
    /// Creates a queue of `capacity` messages of `message_words` words each.
    pub fn queue_create(
        &self,
        name: &'static str,
        message_words: usize,
        capacity: u32,
    ) -> KernelResult<QueueId> {
        if !valid_message_words(message_words) || capacity == 0 {
            return Err(KernelError::SizeError);
        }
        self.critical(|s| {
            let slot = s.queues.insert(QueueCb {
                name,
                message_words,
                capacity,
                storage: vec![0; message_words * capacity as usize],
                read: 0,
                write: 0,
                enqueued: 0,
                available: capacity,
                waiters: Ring::default(),
                created: Link::default(),
                send_notify: None,
            });
            s.created.queues.push_back(&mut s.queues, slot.index());
            log::debug!("queue '{name}' created: {capacity} x {message_words} words");
            s.trace(rec::CREATE, Payload::new().u32(slot.index()).u32(capacity));
            Ok(QueueId(slot))
        })
    }

    /// Deletes the queue; every waiter resumes with [`KernelError::Deleted`].
    pub fn queue_delete(&self, id: QueueId) -> KernelResult<()> {
        self.critical(|s| {
            s.queue_mut(id)?;
            s.created.queues.remove(&mut s.queues, id.0.index());
            let queue = s.queues.remove(id.0).ok_or(KernelError::QueueError)?;
            log::debug!("queue '{}' deleted", queue.name);
            s.trace(rec::DELETE, Payload::new().u32(id.0.index()));
            s.drain_deleted(queue.waiters);
            Ok(())
        })
    }

    /// Appends `message`, waiting up to `timeout` while the queue is full.
    pub fn queue_send(
        &self,
        id: QueueId,
        message: &[u32],
        timeout: Timeout,
    ) -> KernelResult<Blocking<()>> {
        self.critical(|s| s.queue_send(id, message, QueueEnd::Back, timeout))
    }

    /// Places `message` ahead of everything already queued.
    pub fn queue_front_send(
        &self,
        id: QueueId,
        message: &[u32],
        timeout: Timeout,
    ) -> KernelResult<Blocking<()>> {
        self.critical(|s| s.queue_send(id, message, QueueEnd::Front, timeout))
    }

    /// Takes the oldest message, waiting up to `timeout` while the queue is
    /// empty.
    pub fn queue_receive(&self, id: QueueId, timeout: Timeout) -> KernelResult<Blocking<Message>> {
        self.critical(|s| {
            let queue = s.queue_mut(id)?;
            if queue.enqueued > 0 {
                if let Some(message) = s.take_front_sender(id) {
                    let enqueued = s.queue_mut(id)?.enqueued;
                    s.trace(rec::RECEIVE, Payload::new().u32(id.0.index()).u32(enqueued));
                    return Ok(Blocking::Complete(message));
                }
                let queue = s.queue_mut(id)?;
                let message = queue.pop();
                let enqueued = queue.enqueued;
                s.trace(rec::RECEIVE, Payload::new().u32(id.0.index()).u32(enqueued));
                s.refill_from_sender(id);
                return Ok(Blocking::Complete(message));
            }
            if timeout == Timeout::NoWait {
                return Err(KernelError::QueueEmpty);
            }
            let thread = s.blocking_caller()?;
            s.block_on(
                thread,
                WaitTarget::Queue(id),
                ThreadState::QueueSusp,
                SuspendInfo::Receive,
                QueueEnd::Back,
                timeout,
            );
            Ok(Blocking::Suspended)
        })
    }

    /// Discards every queued message. Suspended senders resume successfully
    /// and their messages are dropped.
    pub fn queue_flush(&self, id: QueueId) -> KernelResult<()> {
        self.critical(|s| {
            let queue = s.queue_mut(id)?;
            let had_messages = queue.enqueued > 0;
            queue.read = 0;
            queue.write = 0;
            queue.enqueued = 0;
            queue.available = queue.capacity;
            // Waiters on a non-empty queue are senders; receivers stay put.
            let mut waiters = if had_messages {
                core::mem::take(&mut queue.waiters)
            } else {
                Ring::default()
            };
            s.trace(rec::FLUSH, Payload::new().u32(id.0.index()));
            while let Some(sender) = waiters.pop_front(&mut s.threads) {
                s.finish_wait(sender, Ok(WakePayload::None));
            }
            Ok(())
        })
    }

    pub fn queue_prioritize(&self, id: QueueId) -> KernelResult<()> {
        self.critical(|s| {
            s.queue_mut(id)?;
            s.prioritize(WaitTarget::Queue(id));
            Ok(())
        })
    }

    pub fn queue_send_notify(&self, id: QueueId, notify: Option<QueueNotify>) -> KernelResult<()> {
        self.critical(|s| {
            s.queue_mut(id)?.send_notify = notify;
            Ok(())
        })
    }

    pub fn queue_info(&self, id: QueueId) -> KernelResult<QueueInfo> {
        self.critical(|s| {
            let queue = s.queues.get(id.0).ok_or(KernelError::QueueError)?;
            Ok(QueueInfo {
                name: queue.name,
                enqueued: queue.enqueued,
                available_storage: queue.available,
                first_waiter: queue.waiters.head().map(|t| s.thread_id(t)),
                suspended_count: queue.waiters.len(),
            })
        })
    }

    /// Queues in creation order.
    pub fn queue_list(&self) -> Vec<QueueId> {
        self.critical(|s| {
            s.created
                .queues
                .iter(&s.queues)
                .map(|index| QueueId(s.queues.slot_of(index)))
                .collect()
        })
    }
}

//! # txk - preemptive real-time kernel core
//!
//! Threads, a priority scheduler with preemption-threshold, and the
//! synchronization primitives built on a shared suspension protocol:
//! mutexes with priority inheritance, counting semaphores, message queues,
//! event flag groups, and block and byte memory pools. With more than one
//! core the ready threads are spread across cores by a rebalancing pass
//! that runs after every change to the ready set.
//!
//! ## Execution model
//!
//! The kernel is a deterministic state machine owned by a [`Kernel`] value.
//! Thread bodies are step closures; the dispatcher ([`Kernel::step`]) runs
//! the body of the thread current on each core. A service that has to wait
//! returns [`Blocking::Suspended`] and the thread learns the outcome through
//! [`ThreadContext::take_wake`] the next time it runs.
//!
//! ```
//! use txk::{Blocking, KernelBuilder, ThreadAction, ThreadConfig, Timeout};
//!
//! let kernel = KernelBuilder::new().build().expect("valid configuration");
//! let sem = kernel.semaphore_create("ready", 0).expect("semaphore");
//! kernel
//!     .thread_create(ThreadConfig::new("worker", 5, move |ctx| {
//!         if ctx.take_wake().is_some() {
//!             return ThreadAction::Complete;
//!         }
//!         match ctx.kernel().semaphore_get(sem, Timeout::Forever) {
//!             Ok(Blocking::Suspended) => ThreadAction::Continue,
//!             _ => ThreadAction::Complete,
//!         }
//!     }))
//!     .expect("thread");
//! kernel.start();
//! kernel.run(10);
//! kernel.semaphore_put(sem).expect("put");
//! kernel.run(10);
//! ```
//!
//! ## Module Overview
//!
//! - [`kernel`] - configuration, builder, dispatcher and interrupt context
//! - [`thread`] - thread control block and thread services
//! - [`mutex`], [`semaphore`], [`queue`], [`event_flags`] - synchronization
//! - [`block_pool`], [`byte_pool`] - memory pools
//! - [`critical`] - the critical section guarding all kernel state
//! - [`port`] - the machine interface

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod arena;
pub mod block_pool;
pub mod byte_pool;
pub mod critical;
pub mod error;
pub mod event_flags;
pub mod kernel;
mod list;
pub mod mutex;
pub mod port;
mod priority;
pub mod queue;
mod scheduler;
pub mod semaphore;
mod smp;
mod state;
mod suspend;
mod sync;
pub mod thread;
mod timer;
pub mod trace;

pub use arena::Slot;
pub use block_pool::{BlockPoolId, BlockPoolInfo, MemoryBlock, PoolStats};
pub use byte_pool::{ByteBlock, BytePoolId, BytePoolInfo, BytePoolStats};
pub use error::{ConfigError, FatalError, KernelError, KernelResult};
pub use event_flags::{EventFlagsId, EventFlagsInfo, EventFlagsNotify, EventOption, SetOption};
pub use kernel::{Kernel, KernelBuilder, KernelConfig, KernelConfigBuilder, ObjectCounts};
pub use mutex::{MutexId, MutexInfo};
pub use port::{HostPort, Port};
pub use queue::{Message, QueueId, QueueInfo, QueueNotify, MAX_MESSAGE_WORDS};
pub use semaphore::{SemaphoreId, SemaphoreInfo, SemaphoreNotify};
pub use suspend::{Blocking, Timeout, WaitTarget, WakePayload, WakeResult};
pub use thread::{
    EntryExitNotify, StackErrorNotify, ThreadAction, ThreadConfig, ThreadContext, ThreadEntry,
    ThreadEvent, ThreadId, ThreadInfo, ThreadState,
};
pub use trace::TraceHook;

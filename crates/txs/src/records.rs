//! Canonical kernel trace record identifiers shared across the workspace.
//!
//! Identifiers are grouped by the kernel object family that emits them. The
//! numbering is local to this workspace; payload layouts are documented next
//! to each constant and are always little-endian.

/// Thread lifecycle and scheduling records.
pub mod thread {
    /// Thread created (`[slot: u32, priority: u32]`).
    pub const CREATE: u8 = 1;
    /// Thread deleted (`[slot: u32]`).
    pub const DELETE: u8 = 2;
    /// Thread resumed into the ready queue (`[slot: u32, priority: u32]`).
    pub const RESUME: u8 = 3;
    /// Thread left the ready queue (`[slot: u32, state: u8]`).
    pub const SUSPEND: u8 = 4;
    /// Thread completed or terminated (`[slot: u32, state: u8]`).
    pub const TERMINATE: u8 = 5;
    /// Priority changed (`[slot: u32, old: u32, new: u32]`).
    pub const PRIORITY_CHANGE: u8 = 6;
    /// Preemption threshold changed (`[slot: u32, old: u32, new: u32]`).
    pub const PREEMPTION_CHANGE: u8 = 7;
    /// Thread relinquished its time slice (`[slot: u32]`).
    pub const RELINQUISH: u8 = 8;
    /// Wait aborted (`[slot: u32]`).
    pub const WAIT_ABORT: u8 = 9;
    /// Thread went to sleep (`[slot: u32, ticks: u32]`).
    pub const SLEEP: u8 = 10;
}

/// Scheduler records.
pub mod sched {
    /// Preemption disabled (`[nesting: u32]`).
    pub const LOCK: u8 = 50;
    /// Preemption enabled again (`[nesting: u32]`).
    pub const UNLOCK: u8 = 51;
    /// Context switch on a core (`[core: u8, next: u32]`).
    pub const NEXT: u8 = 52;
    /// Core became idle (`[core: u8]`).
    pub const IDLE: u8 = 53;
    /// SMP execute list rebuilt (`[cores: u8]`).
    pub const REBALANCE: u8 = 54;
}

/// Semaphore records (`[slot: u32, count: u32]`).
pub mod semaphore {
    pub const CREATE: u8 = 60;
    pub const DELETE: u8 = 61;
    pub const GET: u8 = 62;
    pub const PUT: u8 = 63;
}

/// Mutex records (`[slot: u32, ownership_count: u32]`).
pub mod mutex {
    pub const CREATE: u8 = 70;
    pub const DELETE: u8 = 71;
    pub const GET: u8 = 72;
    pub const PUT: u8 = 73;
}

/// Queue records (`[slot: u32, enqueued: u32]`).
pub mod queue {
    pub const CREATE: u8 = 80;
    pub const DELETE: u8 = 81;
    pub const SEND: u8 = 82;
    pub const FRONT_SEND: u8 = 83;
    pub const RECEIVE: u8 = 84;
    pub const FLUSH: u8 = 85;
}

/// Event flag group records (`[slot: u32, flags: u32]`).
pub mod event_flags {
    pub const CREATE: u8 = 90;
    pub const DELETE: u8 = 91;
    pub const SET: u8 = 92;
    pub const GET: u8 = 93;
}

/// Block pool records (`[slot: u32, available: u32]`).
pub mod block_pool {
    pub const CREATE: u8 = 100;
    pub const DELETE: u8 = 101;
    pub const ALLOCATE: u8 = 102;
    pub const RELEASE: u8 = 103;
}

/// Byte pool records (`[slot: u32, available: u32]`).
pub mod byte_pool {
    pub const CREATE: u8 = 110;
    pub const DELETE: u8 = 111;
    pub const ALLOCATE: u8 = 112;
    pub const RELEASE: u8 = 113;
}

/// Interrupt and timer records.
pub mod isr {
    /// Outermost ISR entered (`[core: u8]`).
    pub const ENTER: u8 = 120;
    /// Outermost ISR left (`[core: u8]`).
    pub const EXIT: u8 = 121;
    /// Timer tick processed (`[tick: u64]`).
    pub const TICK: u8 = 122;
}

/// First identifier available to applications.
pub const USER: u8 = 200;

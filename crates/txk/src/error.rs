//! Kernel status codes and fatal conditions.

use thiserror::Error;

use crate::thread::ThreadId;

/// Recoverable service-call status.
///
/// Every variant maps onto a stable numeric code (see [`KernelError::code`]),
/// which keeps the status taxonomy compatible with existing tooling that
/// decodes raw status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum KernelError {
    #[error("object was deleted while the thread was waiting on it")]
    Deleted,
    #[error("invalid memory pool handle")]
    PoolError,
    #[error("invalid memory block")]
    PtrError,
    #[error("caller cannot suspend in this context")]
    WaitError,
    #[error("invalid size")]
    SizeError,
    #[error("invalid event flags group handle")]
    GroupError,
    #[error("requested event flags are not present")]
    NoEvents,
    #[error("invalid option")]
    OptionError,
    #[error("invalid queue handle")]
    QueueError,
    #[error("queue is empty")]
    QueueEmpty,
    #[error("queue is full")]
    QueueFull,
    #[error("invalid semaphore handle")]
    SemaphoreError,
    #[error("semaphore has no instance available")]
    NoInstance,
    #[error("invalid thread handle")]
    ThreadError,
    #[error("invalid priority")]
    PriorityError,
    #[error("not enough memory available")]
    NoMemory,
    #[error("thread is not in a deletable state")]
    DeleteError,
    #[error("thread is not suspended")]
    ResumeError,
    #[error("service is not available from this caller")]
    CallerError,
    #[error("thread cannot be suspended")]
    SuspendError,
    #[error("invalid preemption threshold")]
    ThreshError,
    #[error("delayed suspension was lifted")]
    SuspendLifted,
    #[error("wait was aborted")]
    WaitAborted,
    #[error("thread is not waiting")]
    WaitAbortError,
    #[error("invalid mutex handle")]
    MutexError,
    #[error("mutex is not available")]
    NotAvailable,
    #[error("mutex is not owned by the caller")]
    NotOwned,
    #[error("invalid priority inheritance option")]
    InheritError,
    #[error("operation not done")]
    NotDone,
    #[error("semaphore ceiling exceeded")]
    CeilingExceeded,
    #[error("invalid semaphore ceiling")]
    InvalidCeiling,
}

impl KernelError {
    /// Numeric status code of this error.
    pub const fn code(self) -> u32 {
        match self {
            Self::Deleted => 0x01,
            Self::PoolError => 0x02,
            Self::PtrError => 0x03,
            Self::WaitError => 0x04,
            Self::SizeError => 0x05,
            Self::GroupError => 0x06,
            Self::NoEvents => 0x07,
            Self::OptionError => 0x08,
            Self::QueueError => 0x09,
            Self::QueueEmpty => 0x0A,
            Self::QueueFull => 0x0B,
            Self::SemaphoreError => 0x0C,
            Self::NoInstance => 0x0D,
            Self::ThreadError => 0x0E,
            Self::PriorityError => 0x0F,
            Self::NoMemory => 0x10,
            Self::DeleteError => 0x11,
            Self::ResumeError => 0x12,
            Self::CallerError => 0x13,
            Self::SuspendError => 0x14,
            Self::ThreshError => 0x18,
            Self::SuspendLifted => 0x19,
            Self::WaitAborted => 0x1A,
            Self::WaitAbortError => 0x1B,
            Self::MutexError => 0x1C,
            Self::NotAvailable => 0x1D,
            Self::NotOwned => 0x1E,
            Self::InheritError => 0x1F,
            Self::NotDone => 0x20,
            Self::CeilingExceeded => 0x21,
            Self::InvalidCeiling => 0x22,
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Unrecoverable conditions. These never surface as a status code; they are
/// routed to the registered handlers and halt the system when none exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FatalError {
    #[error("stack overflow detected in thread {thread:?}")]
    StackOverflow { thread: ThreadId },
    #[error("corrupted block list in byte pool {index}")]
    Corrupted { index: u32 },
}

/// Rejected kernel configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("priority count {0} must be a non-zero multiple of 32 up to 1024")]
    InvalidPriorityCount(u32),
    #[error("core count {0} must be between 1 and 32")]
    InvalidCoreCount(usize),
    #[error("default stack size {size} is below the minimum of {minimum}")]
    StackTooSmall { size: usize, minimum: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_status_table() {
        assert_eq!(KernelError::Deleted.code(), 0x01);
        assert_eq!(KernelError::NoInstance.code(), 0x0D);
        assert_eq!(KernelError::NoMemory.code(), 0x10);
        assert_eq!(KernelError::ThreshError.code(), 0x18);
        assert_eq!(KernelError::WaitAborted.code(), 0x1A);
        assert_eq!(KernelError::NotAvailable.code(), 0x1D);
        assert_eq!(KernelError::CeilingExceeded.code(), 0x21);
    }
}

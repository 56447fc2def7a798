//! Interrupt-posture critical section.
//!
//! All kernel state lives in a [`KernelCell`]; every mutation goes through
//! [`KernelCell::with`], which holds the global critical section for the
//! duration of the closure. The raw [`enter`]/[`leave`] pair is exposed for
//! ports and applications that need to bracket their own short sections.

use core::cell::RefCell;

use critical_section::RestoreState;

/// Interrupt posture captured by [`enter`].
#[must_use = "the posture must be handed back to `leave`"]
pub struct Posture(RestoreState);

/// Disables interrupt delivery and returns the previous posture.
pub fn enter() -> Posture {
    // SAFETY: the matching release happens in `leave`, which consumes the
    // posture, so acquire/release are always paired.
    Posture(unsafe { critical_section::acquire() })
}

/// Restores the posture returned by [`enter`].
pub fn leave(posture: Posture) {
    // SAFETY: the posture was produced by `enter` and is consumed here.
    unsafe { critical_section::release(posture.0) }
}

/// RAII wrapper around [`enter`]/[`leave`].
pub struct CriticalGuard {
    posture: Option<Posture>,
}

impl CriticalGuard {
    pub fn new() -> Self {
        Self {
            posture: Some(enter()),
        }
    }
}

impl Default for CriticalGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CriticalGuard {
    fn drop(&mut self) {
        if let Some(posture) = self.posture.take() {
            leave(posture);
        }
    }
}

/// Kernel state protected by the global critical section.
///
/// Re-entering the same cell from inside [`KernelCell::with`] panics: the
/// kernel never suspends, calls back into applications or switches context
/// while a borrow is live.
pub struct KernelCell<T> {
    inner: critical_section::Mutex<RefCell<T>>,
}

impl<T> KernelCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: critical_section::Mutex::new(RefCell::new(value)),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|cs| {
            let mut state = self.inner.borrow_ref_mut(cs);
            f(&mut state)
        })
    }
}

//! Architecture port interface.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Machine-specific services the kernel consumes.
pub trait Port: Send + Sync {
    /// Core whose instruction stream is making the current call.
    fn core_id(&self) -> usize;

    /// Called by the dispatcher before it runs a thread on `core`. Ports
    /// that read the core number from hardware ignore it.
    fn bind_core(&self, _core: usize) {}

    /// Builds the initial frame at the top of `stack` and returns the
    /// resulting stack pointer as an offset into `stack`.
    fn build_stack(&self, stack: &mut [u8], entry_input: u32) -> usize;
}

/// In-process port for hosts and tests.
///
/// The "core" is whatever the dispatcher last bound; the initial frame is a
/// 16-byte record holding the entry input and a frame marker.
#[derive(Debug, Default)]
pub struct HostPort {
    core: AtomicUsize,
}

const FRAME_MARKER: u32 = 0x5478_4b46;
const FRAME_SIZE: usize = 16;

impl HostPort {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Port for HostPort {
    fn core_id(&self) -> usize {
        self.core.load(Ordering::Acquire)
    }

    fn bind_core(&self, core: usize) {
        self.core.store(core, Ordering::Release);
    }

    fn build_stack(&self, stack: &mut [u8], entry_input: u32) -> usize {
        let top = stack.len() & !7;
        let Some(base) = top.checked_sub(FRAME_SIZE) else {
            return top;
        };
        let frame = &mut stack[base..top];
        frame[0..4].copy_from_slice(&entry_input.to_le_bytes());
        frame[4..8].copy_from_slice(&FRAME_MARKER.to_le_bytes());
        frame[8..].fill(0);
        base
    }
}

//! Trace hook plumbing.
//!
//! With the `trace` feature the hook and record identifiers come from `txs`.
//! Without it the hook is a local type and the record table is compiled in
//! from the same source file, so the kernel body is identical in both builds.

#[cfg(feature = "trace")]
pub use txs::{records, TraceError, TraceHook};

#[cfg(not(feature = "trace"))]
use alloc::sync::Arc;

#[cfg(not(feature = "trace"))]
pub type TraceError = core::convert::Infallible;

#[cfg(not(feature = "trace"))]
pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> Result<(), TraceError> + Send + Sync>;

#[cfg(not(feature = "trace"))]
#[path = "../../txs/src/records.rs"]
pub mod records;

/// Matches the default record length of `txs`.
const PAYLOAD_CAPACITY: usize = 32;

/// Little-endian record payload assembled inside the critical section and
/// handed to the hook after it is released.
#[derive(Debug, Clone, Default)]
pub(crate) struct Payload(heapless::Vec<u8, PAYLOAD_CAPACITY>);

impl Payload {
    pub fn new() -> Self {
        Self(heapless::Vec::new())
    }

    pub fn u8(mut self, value: u8) -> Self {
        let _ = self.0.push(value);
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        let _ = self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(mut self, value: u64) -> Self {
        let _ = self.0.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

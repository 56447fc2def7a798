//! Kernel event tracing with pluggable backends.
//!
//! The kernel reports scheduling and object events as small binary *records*:
//! a record identifier from [`records`] plus a little-endian payload. Records
//! flow through a [`TraceHook`], which is usually produced by a
//! [`TracerHandle`]. The tracer stamps each record with a sequence number and
//! an optional timestamp and hands it to a [`TraceBackend`].
//!
//! Tracing is a pure side channel: the kernel ignores hook results, so a
//! failing backend never changes kernel behavior.

use std::fmt::Write as _;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

pub mod records;

/// Maximum payload length for a single record.
const DEFAULT_MAX_RECORD_LEN: usize = 32;

/// Default number of records retained by [`MemoryBackend`].
const DEFAULT_MEMORY_DEPTH: usize = 1024;

/// Configuration for the tracer.
#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub max_record_len: usize,
    pub include_timestamp: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_record_len: DEFAULT_MAX_RECORD_LEN,
            include_timestamp: true,
        }
    }
}

/// A single trace record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub seq: u32,
    pub record_type: u8,
    pub timestamp: Option<Duration>,
    pub payload: Vec<u8>,
}

/// Errors that can occur while emitting trace data.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("backend error: {0}")]
    Backend(#[from] io::Error),
}

/// Backend trait that consumes finished records.
pub trait TraceBackend: Send + Sync {
    fn write_record(&self, record: &TraceRecord) -> Result<(), TraceError>;
}

/// Hook signature used by the kernel: `(record_type, payload, with_timestamp)`.
pub type TraceHook = Arc<dyn Fn(u8, &[u8], bool) -> Result<(), TraceError> + Send + Sync>;

/// Backend that writes one text line per record to any `Write` implementation.
///
/// Line layout: `seq type [timestamp_us] payload-hex`.
pub struct WriterBackend<W: Write + Send + 'static> {
    writer: Arc<Mutex<W>>,
}

impl<W: Write + Send + 'static> WriterBackend<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Returns the shared writer, e.g. to inspect an in-memory buffer.
    pub fn writer(&self) -> Arc<Mutex<W>> {
        Arc::clone(&self.writer)
    }
}

impl<W: Write + Send + 'static> TraceBackend for WriterBackend<W> {
    fn write_record(&self, record: &TraceRecord) -> Result<(), TraceError> {
        let line = format_line(record);
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        guard.write_all(line.as_bytes()).map_err(TraceError::from)
    }
}

/// Backend that retains the most recent records in memory.
///
/// Once `depth` records are stored the oldest record is discarded.
#[derive(Clone)]
pub struct MemoryBackend {
    depth: usize,
    records: Arc<Mutex<Vec<TraceRecord>>>,
}

impl MemoryBackend {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            records: Arc::new(Mutex::new(Vec::with_capacity(depth.min(64)))),
        }
    }

    /// Snapshot of the retained records, oldest first.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Retained records with the given identifier.
    pub fn records_of(&self, record_type: u8) -> Vec<TraceRecord> {
        self.records()
            .into_iter()
            .filter(|record| record.record_type == record_type)
            .collect()
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_DEPTH)
    }
}

impl TraceBackend for MemoryBackend {
    fn write_record(&self, record: &TraceRecord) -> Result<(), TraceError> {
        let mut guard = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.len() == self.depth {
            guard.remove(0);
        }
        guard.push(record.clone());
        Ok(())
    }
}

/// Backend that forwards records to the `log` facade at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBackend;

impl TraceBackend for LogBackend {
    fn write_record(&self, record: &TraceRecord) -> Result<(), TraceError> {
        log::trace!(target: "txs", "{}", format_line(record).trim_end());
        Ok(())
    }
}

/// Record stamper that forwards to a backend.
#[derive(Debug)]
pub struct Tracer<B: TraceBackend> {
    backend: B,
    cfg: TraceConfig,
    seq: u32,
    epoch: Instant,
}

#[derive(Clone)]
pub struct TracerHandle<B: TraceBackend> {
    inner: Arc<Mutex<Tracer<B>>>,
}

impl<B: TraceBackend> Tracer<B> {
    pub fn new(cfg: TraceConfig, backend: B) -> Self {
        Self {
            backend,
            cfg,
            seq: 0,
            epoch: Instant::now(),
        }
    }

    pub fn into_handle(self) -> TracerHandle<B> {
        TracerHandle {
            inner: Arc::new(Mutex::new(self)),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn record(
        &mut self,
        record_type: u8,
        payload: &[u8],
        with_timestamp: bool,
    ) -> Result<TraceRecord, TraceError> {
        if payload.len() > self.cfg.max_record_len {
            return Err(TraceError::PayloadTooLarge(payload.len()));
        }

        let timestamp = if self.cfg.include_timestamp && with_timestamp {
            Some(self.epoch.elapsed())
        } else {
            None
        };

        self.seq = self.seq.wrapping_add(1);
        let record = TraceRecord {
            seq: self.seq,
            record_type,
            timestamp,
            payload: payload.to_vec(),
        };

        self.backend.write_record(&record)?;
        Ok(record)
    }
}

impl<B: TraceBackend + 'static> TracerHandle<B> {
    pub fn emit(&self, record_type: u8, payload: &[u8]) -> Result<TraceRecord, TraceError> {
        self.lock().record(record_type, payload, false)
    }

    pub fn emit_with_timestamp(
        &self,
        record_type: u8,
        payload: &[u8],
    ) -> Result<TraceRecord, TraceError> {
        self.lock().record(record_type, payload, true)
    }

    /// Builds a hook that the kernel can call for every record.
    pub fn hook(&self) -> TraceHook {
        let inner = Arc::clone(&self.inner);
        Arc::new(move |record_type, payload, with_timestamp| {
            let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
            guard
                .record(record_type, payload, with_timestamp)
                .map(|_| ())
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tracer<B>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Convenience backend that writes lines to stdout; handy for early bring-up.
pub fn stdout_backend() -> WriterBackend<io::Stdout> {
    WriterBackend::new(io::stdout())
}

/// Builds a hook that keeps records in memory, returning the backend for
/// inspection.
pub fn memory_hook(depth: usize) -> (TraceHook, MemoryBackend) {
    let backend = MemoryBackend::new(depth);
    let handle = Tracer::new(TraceConfig::default(), backend.clone()).into_handle();
    (handle.hook(), backend)
}

fn format_line(record: &TraceRecord) -> String {
    let mut line = String::with_capacity(16 + record.payload.len() * 2);
    let _ = write!(line, "{:08} {:3}", record.seq, record.record_type);
    if let Some(ts) = record.timestamp {
        let _ = write!(line, " {}us", ts.as_micros());
    }
    if !record.payload.is_empty() {
        line.push(' ');
        for byte in &record.payload {
            let _ = write!(line, "{byte:02x}");
        }
    }
    line.push('\n');
    line
}

//! Shared reference-trace buffers.
//!
//! Three FIFO queues (execution packets plus the two optional
//! extensions), the mismatch counter and the `trace_done` flag, all
//! behind one lock. The reference drain pushes at the tail; the
//! comparator pops at the head. The extension queues are positional
//! subsets of the execution queue: the i-th execution entry with an
//! availability flag set corresponds to the i-th entry of that
//! extension queue among flagged entries.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::decoder::TraceRecord;
use crate::packet::{ExecutionPacketV2, IntegerExtension, MemAccessExtension};

pub(crate) struct TraceBuffers {
    inner: Mutex<BuffersInner>,
}

pub(crate) struct BuffersInner {
    pub exec: VecDeque<ExecutionPacketV2>,
    pub integer: VecDeque<IntegerExtension>,
    pub memory: VecDeque<MemAccessExtension>,
    pub mismatches: u32,
    pub trace_done: bool,
}

impl TraceBuffers {
    pub fn new() -> TraceBuffers {
        TraceBuffers {
            inner: Mutex::new(BuffersInner {
                exec: VecDeque::new(),
                integer: VecDeque::new(),
                memory: VecDeque::new(),
                mismatches: 0,
                trace_done: true,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<BuffersInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends one drained record and clears `trace_done`.
    pub fn push_record(&self, record: TraceRecord) {
        let mut inner = self.lock();
        inner.exec.push_back(record.exec);
        if let Some(ext) = record.integer {
            inner.integer.push_back(ext);
        }
        if let Some(ext) = record.memory {
            inner.memory.push_back(ext);
        }
        inner.trace_done = false;
    }

    pub fn mismatch_count(&self) -> u32 {
        self.lock().mismatches
    }

    /// Raises `trace_done` and drops any queued entries.
    pub fn finish(&self) {
        let mut inner = self.lock();
        inner.trace_done = true;
        inner.exec.clear();
        inner.integer.clear();
        inner.memory.clear();
    }

    #[cfg(test)]
    pub fn depths(&self) -> (usize, usize, usize) {
        let inner = self.lock();
        (inner.exec.len(), inner.integer.len(), inner.memory.len())
    }
}

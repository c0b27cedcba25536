use spin::Mutex;

use crate::exception::{ExceptionCode, ExceptionDisposition, ExceptionFlags, ExceptionRecord};
use crate::runtime_function::FunctionEntry;

pub const DEFAULT_EXCEPTION_LOG_CAPACITY: usize = 16;

/// One exception handler invocation seen by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionLogEntry {
    pub code: ExceptionCode,
    pub flags: ExceptionFlags,
    pub control_pc: u64,
    pub function: FunctionEntry,
    pub handler: u64,
    pub establisher_frame: u64,
    /// Filled in once the handler returns.
    pub disposition: Option<ExceptionDisposition>,
}

struct LogRing {
    /// `(sequence number, entry)`, indexed by sequence number modulo capacity.
    slots: Vec<Option<(usize, ExceptionLogEntry)>>,
    next: usize,
}

/// A fixed-size ring of the most recent handler invocations made while
/// searching for a handler. Termination handlers run by an unwind are not
/// recorded.
///
/// Logging never blocks: if the ring is busy the record is dropped.
pub struct ExceptionLog {
    ring: Mutex<LogRing>,
}

impl Default for ExceptionLog {
    fn default() -> Self {
        Self::new(DEFAULT_EXCEPTION_LOG_CAPACITY)
    }
}

impl ExceptionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(LogRing {
                slots: vec![None; capacity.max(1)],
                next: 0,
            }),
        }
    }

    /// Records a handler about to be called. Returns the sequence number to
    /// pass to [`log_disposition`](Self::log_disposition), or `None` if the
    /// record was dropped.
    pub fn log_handler(
        &self,
        record: &ExceptionRecord,
        control_pc: u64,
        function: FunctionEntry,
        handler: u64,
        establisher_frame: u64,
    ) -> Option<usize> {
        let Some(mut ring) = self.ring.try_lock() else {
            log::warn!("exception log busy, dropping record for 0x{:x}", control_pc);
            return None;
        };
        let sequence = ring.next;
        let slot = sequence % ring.slots.len();
        ring.slots[slot] = Some((
            sequence,
            ExceptionLogEntry {
                code: record.code,
                flags: record.flags,
                control_pc,
                function,
                handler,
                establisher_frame,
                disposition: None,
            },
        ));
        ring.next += 1;
        Some(sequence)
    }

    /// Stores the disposition for an earlier record, unless it has been
    /// overwritten since.
    pub fn log_disposition(&self, sequence: usize, disposition: ExceptionDisposition) {
        let Some(mut ring) = self.ring.try_lock() else {
            return;
        };
        let slot = sequence % ring.slots.len();
        if let Some((stored, entry)) = &mut ring.slots[slot] {
            if *stored == sequence {
                entry.disposition = Some(disposition);
            }
        }
    }

    /// The retained records, oldest first.
    pub fn records(&self) -> Vec<ExceptionLogEntry> {
        let ring = self.ring.lock();
        let capacity = ring.slots.len();
        let first = ring.next.saturating_sub(capacity);
        (first..ring.next)
            .filter_map(|sequence| ring.slots[sequence % capacity].map(|(_, entry)| entry))
            .collect()
    }
}

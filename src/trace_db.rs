use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::context::Context;
use crate::frame_walker::BackTrace;
use crate::runtime::SehRuntime;

/// The deepest trace [`SehRuntime::log_stack_back_trace`] records.
pub const MAX_STACK_DEPTH: usize = 32;

/// The bytes an entry costs on top of its frames.
const ENTRY_OVERHEAD: usize = std::mem::size_of::<StackTraceEntry>();

/// A stored trace. Entries never move once added.
#[derive(Debug)]
pub struct StackTraceEntry {
    index: u16,
    hash: u32,
    frames: Box<[u64]>,
    ref_count: AtomicU32,
}

impl StackTraceEntry {
    /// The entry's index; never 0.
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn frames(&self) -> &[u64] {
        &self.frames
    }

    /// How many times the trace was added.
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Relaxed)
    }
}

struct Buckets {
    /// Entry indices per `hash % len`.
    chains: Vec<Vec<u16>>,
    used_bytes: usize,
}

/// An append-only store of distinct stack traces.
///
/// Each distinct trace gets a small index, starting at 1, that stays valid
/// for the life of the database. Adding never blocks: if another thread
/// holds the lock the trace is dropped and 0 returned.
pub struct StackTraceDatabase {
    buckets: Mutex<Buckets>,
    entries: boxcar::Vec<StackTraceEntry>,
    capacity_bytes: usize,
}

impl StackTraceDatabase {
    pub fn new(capacity_bytes: usize, bucket_count: usize) -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                chains: vec![Vec::new(); bucket_count.max(1)],
                used_bytes: 0,
            }),
            entries: boxcar::Vec::new(),
            capacity_bytes,
        }
    }

    /// Adds `trace`, or bumps the reference count of the identical trace
    /// already stored. Returns the trace's index, or 0 if the trace is empty,
    /// the database is full or busy.
    pub fn add_trace(&self, trace: &BackTrace) -> u16 {
        if trace.is_empty() {
            return 0;
        }
        let Some(mut buckets) = self.buckets.try_lock() else {
            log::debug!("trace database busy");
            return 0;
        };
        let bucket = trace.hash as usize % buckets.chains.len();
        let existing = buckets.chains[bucket].iter().find_map(|&index| {
            let entry = self.trace(index)?;
            (entry.hash == trace.hash && *entry.frames == *trace.frames).then_some(entry)
        });
        if let Some(entry) = existing {
            entry.ref_count.fetch_add(1, Ordering::Relaxed);
            return entry.index;
        }

        let size = ENTRY_OVERHEAD + trace.frames.len() * std::mem::size_of::<u64>();
        let used_bytes = buckets.used_bytes + size;
        if used_bytes > self.capacity_bytes {
            log::debug!("trace database full");
            return 0;
        }
        // Indices are 1-based, so the next one is the current count plus one.
        let Ok(index) = u16::try_from(self.entries.count() + 1) else {
            return 0;
        };
        self.entries.push(StackTraceEntry {
            index,
            hash: trace.hash,
            frames: trace.frames.clone().into_boxed_slice(),
            ref_count: AtomicU32::new(1),
        });
        buckets.used_bytes = used_bytes;
        buckets.chains[bucket].push(index);
        index
    }

    pub fn trace(&self, index: u16) -> Option<&StackTraceEntry> {
        let slot = usize::from(index).checked_sub(1)?;
        self.entries.get(slot)
    }

    pub fn len(&self) -> usize {
        self.entries.count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: Deref<Target = [u8]>> SehRuntime<'_, D> {
    /// Captures the stack at `context` and stores it in `database`. Returns
    /// the trace's index, or 0 if nothing was stored.
    pub fn log_stack_back_trace(
        &self,
        database: &StackTraceDatabase,
        context: &Context,
        frames_to_skip: usize,
    ) -> u16 {
        let trace = self.capture_back_trace(context, frames_to_skip, MAX_STACK_DEPTH);
        database.add_trace(&trace)
    }
}

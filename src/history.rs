use arrayvec::ArrayVec;

use crate::runtime_function::FunctionEntry;

/// The number of function entries a [`HistoryTable`] remembers.
pub const UNWIND_HISTORY_TABLE_SIZE: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryMode {
    /// Lookups that miss the table get recorded until it is full.
    Record,
    /// Lookups consult the recorded entries first.
    Search,
}

/// A small per-call cache of function entry lookups.
///
/// Dispatch records the entries it visits; the unwind that follows switches
/// the same table to search mode, so the frames it revisits are found
/// without a binary search. The table never changes lookup results.
///
/// Entries are stored as found in the function table, indirect entries
/// included; the directory converts them on a hit.
#[derive(Clone, Debug)]
pub struct HistoryTable {
    mode: HistoryMode,
    entries: ArrayVec<FunctionEntry, UNWIND_HISTORY_TABLE_SIZE>,
    low_address: u64,
    high_address: u64,
}

impl Default for HistoryTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryTable {
    pub fn new() -> Self {
        Self {
            mode: HistoryMode::Record,
            entries: ArrayVec::new(),
            low_address: u64::MAX,
            high_address: 0,
        }
    }

    pub fn mode(&self) -> HistoryMode {
        self.mode
    }

    pub fn set_search(&mut self) {
        self.mode = HistoryMode::Search;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The address range covered by the recorded entries.
    pub fn address_range(&self) -> std::ops::Range<u64> {
        self.low_address..self.high_address
    }

    /// Empties the table and puts it back into record mode.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Looks `pc` up among the recorded entries. Only search mode consults
    /// the table.
    pub fn find(&self, pc: u64) -> Option<FunctionEntry> {
        if self.mode != HistoryMode::Search || !self.address_range().contains(&pc) {
            return None;
        }
        self.entries.iter().find(|entry| entry.contains(pc)).copied()
    }

    /// Remembers an entry found by a full lookup, if in record mode and not
    /// yet full.
    pub fn record(&mut self, entry: FunctionEntry) {
        if self.mode != HistoryMode::Record || self.entries.try_push(entry).is_err() {
            return;
        }
        self.low_address = self.low_address.min(entry.start_address());
        self.high_address = self.high_address.max(entry.end_address());
    }
}

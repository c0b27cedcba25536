use std::cmp::Ordering;
use std::fmt::Debug;
use std::ops::{Deref, Range};

use crate::history::HistoryTable;
use crate::image::{ImageView, Module};
use crate::runtime_function::{FunctionEntry, RuntimeFunction};
use crate::x86_64::UnwindChain;

/// Supplies function entries for a range of generated code on demand.
///
/// Returned entries are relative to the base the callback was installed with.
pub trait FunctionTableCallback {
    fn lookup(&self, pc: u64) -> Option<RuntimeFunction>;
}

impl<F> FunctionTableCallback for F
where
    F: Fn(u64) -> Option<RuntimeFunction>,
{
    fn lookup(&self, pc: u64) -> Option<RuntimeFunction> {
        self(pc)
    }
}

enum DynamicEntries {
    /// Sorted by begin address.
    Table(Vec<RuntimeFunction>),
    Callback(Box<dyn FunctionTableCallback>),
}

/// A function table registered at runtime for code outside any loaded module.
struct DynamicFunctionTable<D: Deref<Target = [u8]>> {
    identifier: u64,
    base_address: u64,
    address_range: Range<u64>,
    image: D,
    entries: DynamicEntries,
}

impl<D: Deref<Target = [u8]>> DynamicFunctionTable<D> {
    fn lookup(&self, pc: u64) -> Option<RuntimeFunction> {
        let rva = u32::try_from(pc - self.base_address).ok()?;
        match &self.entries {
            DynamicEntries::Table(entries) => entries
                .binary_search_by(|function| compare_rva(rva, function.begin_address, function.end_address))
                .ok()
                .map(|index| entries[index]),
            DynamicEntries::Callback(callback) => callback.lookup(pc),
        }
    }
}

/// Orders a function `[begin, end)` relative to `rva`, for binary searches.
fn compare_rva(rva: u32, begin: u32, end: u32) -> Ordering {
    if rva < begin {
        Ordering::Greater
    } else if rva >= end {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

/// Maps instruction addresses to the function entries that describe them.
///
/// Loaded modules are consulted first; addresses outside every module fall
/// through to the dynamic function tables, in registration order.
pub struct FunctionTableDirectory<D: Deref<Target = [u8]>> {
    /// Sorted by base address.
    modules: Vec<Module<D>>,
    dynamic_tables: Vec<DynamicFunctionTable<D>>,
}

impl<D: Deref<Target = [u8]>> Default for FunctionTableDirectory<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Deref<Target = [u8]>> Debug for FunctionTableDirectory<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTableDirectory")
            .field("modules", &self.modules)
            .field("dynamic_tables", &self.dynamic_tables.len())
            .finish()
    }
}

impl<D: Deref<Target = [u8]>> FunctionTableDirectory<D> {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            dynamic_tables: Vec::new(),
        }
    }

    /// Adds a loaded image. An image already registered at the same base is
    /// replaced.
    pub fn add_module(&mut self, module: Module<D>) {
        let base = module.base_address();
        let index = self.modules.partition_point(|m| m.base_address() < base);
        if self.has_module_at(index, base) {
            log::warn!("{} replaces {} at 0x{:x}", module.name(), self.modules[index].name(), base);
            self.modules[index] = module;
        } else {
            self.modules.insert(index, module);
        }
    }

    /// Drops the image based at `base_address`. Returns false if there was
    /// none.
    pub fn remove_module(&mut self, base_address: u64) -> bool {
        let index = self.modules.partition_point(|m| m.base_address() < base_address);
        let found = self.has_module_at(index, base_address);
        if found {
            self.modules.remove(index);
        }
        found
    }

    fn has_module_at(&self, index: usize, base_address: u64) -> bool {
        self.modules
            .get(index)
            .is_some_and(|module| module.base_address() == base_address)
    }

    /// Registers entries for generated code. `image` holds the code and its
    /// unwind info, starting at `base_address`; the covered range is the span
    /// of the entries.
    pub fn add_function_table(
        &mut self,
        identifier: u64,
        base_address: u64,
        image: D,
        mut entries: Vec<RuntimeFunction>,
    ) {
        entries.sort_by_key(|function| function.begin_address);
        let start = entries.first().map_or(0, |f| u64::from(f.begin_address));
        let end = entries
            .iter()
            .map(|f| u64::from(f.end_address))
            .max()
            .unwrap_or(0);
        self.dynamic_tables.push(DynamicFunctionTable {
            identifier,
            base_address,
            address_range: base_address.saturating_add(start)..base_address.saturating_add(end),
            image,
            entries: DynamicEntries::Table(entries),
        });
    }

    /// Registers a callback that produces entries for `[base_address,
    /// base_address + length)` on demand.
    pub fn install_function_table_callback(
        &mut self,
        identifier: u64,
        base_address: u64,
        length: u64,
        image: D,
        callback: Box<dyn FunctionTableCallback>,
    ) {
        self.dynamic_tables.push(DynamicFunctionTable {
            identifier,
            base_address,
            address_range: base_address..base_address.saturating_add(length),
            image,
            entries: DynamicEntries::Callback(callback),
        });
    }

    /// Removes the dynamic table registered under `identifier`. Returns false
    /// if there was none.
    pub fn delete_function_table(&mut self, identifier: u64) -> bool {
        match self
            .dynamic_tables
            .iter()
            .position(|table| table.identifier == identifier)
        {
            Some(index) => {
                self.dynamic_tables.remove(index);
                true
            }
            None => false,
        }
    }

    /// The image whose mapped range covers `pc`.
    pub fn find_module(&self, pc: u64) -> Option<&Module<D>> {
        // Images do not overlap, so only the last one based at or below pc
        // can hold it.
        let candidate = self.modules.partition_point(|m| m.base_address() <= pc);
        let module = &self.modules[candidate.checked_sub(1)?];
        module.address_range().contains(&pc).then_some(module)
    }

    fn find_dynamic_table(&self, pc: u64) -> Option<&DynamicFunctionTable<D>> {
        self.dynamic_tables
            .iter()
            .find(|table| table.address_range.contains(&pc))
    }

    /// The image holding the code at `address` and its unwind info.
    pub fn image_for(&self, address: u64) -> Option<ImageView<'_>> {
        if let Some(module) = self.find_module(address) {
            return Some(module.view());
        }
        self.find_dynamic_table(address)
            .map(|table| ImageView::new(table.base_address, &table.image))
    }

    /// Finds the entry for `pc` as stored, without resolving indirect entries.
    fn find_stored_entry(&self, pc: u64) -> Option<FunctionEntry> {
        if let Some(module) = self.find_module(pc) {
            let rva = (pc - module.base_address()) as u32;
            let table = match module.function_table() {
                Ok(table) => table,
                Err(err) => {
                    log::warn!("module {}: {}", module.name(), err);
                    return None;
                }
            };
            let index = table
                .binary_search_by(|f| compare_rva(rva, f.begin_address(), f.end_address()))
                .ok()?;
            return Some(FunctionEntry::new(module.base_address(), table[index].get()));
        }
        let table = self.find_dynamic_table(pc)?;
        let function = table.lookup(pc)?;
        Some(FunctionEntry::new(table.base_address, function))
    }

    /// Resolves an indirect entry to the master entry it forwards to.
    fn convert_entry(&self, entry: FunctionEntry) -> Option<FunctionEntry> {
        let Some(master_rva) = entry.function.master_entry_rva() else {
            return Some(entry);
        };
        let image = self.image_for(entry.start_address())?;
        match image.runtime_function_at(master_rva) {
            Ok(master) => Some(FunctionEntry::new(entry.image_base, master)),
            Err(err) => {
                log::warn!("indirect function entry {:?}: {}", entry, err);
                None
            }
        }
    }

    /// Finds the function entry for `pc`.
    ///
    /// A history table in search mode is consulted first. A full lookup
    /// records its result into a history table in record mode.
    pub fn lookup_function_entry(
        &self,
        pc: u64,
        history: Option<&mut HistoryTable>,
    ) -> Option<FunctionEntry> {
        if let Some(entry) = history.as_deref().and_then(|history| history.find(pc)) {
            return self.convert_entry(entry);
        }
        let entry = self.find_stored_entry(pc)?;
        if let Some(history) = history {
            history.record(entry);
        }
        self.convert_entry(entry)
    }

    /// The entry at the end of `entry`'s chain, which describes the
    /// function's real prologue.
    pub fn primary_function_entry(&self, entry: &FunctionEntry) -> Option<FunctionEntry> {
        let image = self.image_for(entry.start_address())?;
        match UnwindChain::new(image.data(), entry).primary() {
            Ok((primary, _)) => Some(primary),
            Err(err) => {
                log::warn!("unwind chain of {:?}: {}", entry, err);
                None
            }
        }
    }

    /// If `address` lies in a fragment of the same function as `entry`,
    /// judged by the fragments sharing a primary entry, returns that primary
    /// entry.
    pub fn same_function(&self, entry: &FunctionEntry, address: u64) -> Option<FunctionEntry> {
        let primary = self.primary_function_entry(entry)?;
        let target = self.lookup_function_entry(address, None)?;
        let target_primary = self.primary_function_entry(&target)?;
        (primary == target_primary).then_some(primary)
    }
}

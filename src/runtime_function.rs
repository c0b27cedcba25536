use std::fmt::Debug;

use object::read::ReadRef;
use object::{LittleEndian, Pod, U32};

use crate::display_utils::HexNum;

/// One function table entry, as the linker lays it out: a 12-byte record of
/// image-relative addresses.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct RawRuntimeFunction {
    begin_address: U32<LittleEndian>,
    end_address: U32<LittleEndian>,
    unwind_data: U32<LittleEndian>,
}

unsafe impl Pod for RawRuntimeFunction {}

impl RawRuntimeFunction {
    pub const SIZE: usize = std::mem::size_of::<RawRuntimeFunction>();

    pub fn parse(data: &[u8], offset: u64) -> Option<RuntimeFunction> {
        data.read_at::<RawRuntimeFunction>(offset)
            .ok()
            .map(RawRuntimeFunction::get)
    }

    pub fn parse_table(data: &[u8], offset: u64, count: usize) -> Option<&[RawRuntimeFunction]> {
        data.read_slice_at::<RawRuntimeFunction>(offset, count).ok()
    }

    pub fn begin_address(&self) -> u32 {
        self.begin_address.get(LittleEndian)
    }

    pub fn end_address(&self) -> u32 {
        self.end_address.get(LittleEndian)
    }

    pub fn get(&self) -> RuntimeFunction {
        RuntimeFunction {
            begin_address: self.begin_address(),
            end_address: self.end_address(),
            unwind_data: self.unwind_data.get(LittleEndian),
        }
    }
}

/// The address range of one function (or one fragment of a split function)
/// and where its unwind info lives. All fields are relative to the image base.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RuntimeFunction {
    pub begin_address: u32,
    pub end_address: u32,
    /// The RVA of the unwind info, or, with bit 0 set, `1 +` the RVA of the
    /// master entry this indirect entry forwards to.
    pub unwind_data: u32,
}

/// Bit 0 of `unwind_data` marks an indirect entry.
pub const RUNTIME_FUNCTION_INDIRECT: u32 = 0x1;

impl RuntimeFunction {
    pub fn new(begin_address: u32, end_address: u32, unwind_data: u32) -> Self {
        Self {
            begin_address,
            end_address,
            unwind_data,
        }
    }

    pub fn is_indirect(&self) -> bool {
        self.unwind_data & RUNTIME_FUNCTION_INDIRECT != 0
    }

    /// For an indirect entry, the RVA of the master entry.
    pub fn master_entry_rva(&self) -> Option<u32> {
        self.is_indirect().then(|| self.unwind_data - 1)
    }

    pub fn contains_rva(&self, rva: u32) -> bool {
        (self.begin_address..self.end_address).contains(&rva)
    }

    /// The little-endian encoding of this entry.
    pub fn to_bytes(&self) -> [u8; 12] {
        let mut bytes = [0; 12];
        bytes[0..4].copy_from_slice(&self.begin_address.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.end_address.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.unwind_data.to_le_bytes());
        bytes
    }
}

impl Debug for RuntimeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeFunction")
            .field("begin_address", &HexNum(self.begin_address))
            .field("end_address", &HexNum(self.end_address))
            .field("unwind_data", &HexNum(self.unwind_data))
            .finish()
    }
}

/// A function table entry together with the base of the image it belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FunctionEntry {
    pub image_base: u64,
    pub function: RuntimeFunction,
}

impl FunctionEntry {
    pub fn new(image_base: u64, function: RuntimeFunction) -> Self {
        Self {
            image_base,
            function,
        }
    }

    /// Absolute address of the first instruction.
    pub fn start_address(&self) -> u64 {
        self.image_base.saturating_add(self.function.begin_address.into())
    }

    /// Absolute address one past the last instruction.
    pub fn end_address(&self) -> u64 {
        self.image_base.saturating_add(self.function.end_address.into())
    }

    pub fn contains(&self, address: u64) -> bool {
        (self.start_address()..self.end_address()).contains(&address)
    }

    /// The offset of `pc` from the start of this entry, as the prologue
    /// offset unwind codes are compared against. Addresses before the entry
    /// wrap around to large offsets.
    pub fn offset_of(&self, pc: u64) -> u32 {
        pc.wrapping_sub(self.start_address()) as u32
    }
}

impl Debug for FunctionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionEntry")
            .field("start", &HexNum(self.start_address()))
            .field("end", &HexNum(self.end_address()))
            .field("unwind_data", &HexNum(self.function.unwind_data))
            .finish()
    }
}

use std::fmt::Debug;

use bitflags::bitflags;
use fallible_iterator::FallibleIterator;
use object::read::ReadRef;
use object::{LittleEndian, Pod, U16};

use crate::context::Reg;
use crate::display_utils::HexNum;
use crate::runtime_function::{FunctionEntry, RawRuntimeFunction, RuntimeFunction};

/// Chained unwind info deeper than this is treated as corrupt (it would
/// otherwise let a cycle in the chain spin forever).
pub const MAX_CHAIN_DEPTH: usize = 32;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindInfoError {
    #[error("unwind info at RVA 0x{0:x} is truncated")]
    Truncated(u32),

    #[error("unsupported unwind info version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown unwind opcode {0}")]
    UnknownOpcode(u8),

    #[error("unwind code in slot {0} is missing its operand slots")]
    MissingOperand(usize),

    #[error("unwind info sets a frame register but does not name one")]
    NoFrameRegister,

    #[error("chained unwind info nests deeper than {0} levels")]
    ChainTooDeep(usize),
}

bitflags! {
    /// Flags in the unwind info header. The two handler bits double as the
    /// handler type a virtual unwind asks for; the empty set asks for none.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct UnwindInfoFlags: u8 {
        const EXCEPTION_HANDLER = 0x1;
        const TERMINATION_HANDLER = 0x2;
        const CHAINED = 0x4;
    }
}

/// The four fixed bytes at the start of every unwind info block.
#[derive(Clone, Copy)]
#[repr(C)]
struct RawUnwindInfoHeader {
    version_and_flags: u8,
    size_of_prolog: u8,
    count_of_codes: u8,
    frame_register_and_offset: u8,
}

unsafe impl Pod for RawUnwindInfoHeader {}

const HEADER_SIZE: u32 = 4;

/// The raw operation codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UnwindOpCode {
    PushNonvolatile = 0,
    AllocLarge = 1,
    AllocSmall = 2,
    SetFramePointer = 3,
    SaveNonvolatile = 4,
    SaveNonvolatileFar = 5,
    Epilogue = 6,
    Spare = 7,
    SaveXmm128 = 8,
    SaveXmm128Far = 9,
    PushMachineFrame = 10,
}

impl UnwindOpCode {
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::PushNonvolatile,
            1 => Self::AllocLarge,
            2 => Self::AllocSmall,
            3 => Self::SetFramePointer,
            4 => Self::SaveNonvolatile,
            5 => Self::SaveNonvolatileFar,
            6 => Self::Epilogue,
            7 => Self::Spare,
            8 => Self::SaveXmm128,
            9 => Self::SaveXmm128Far,
            10 => Self::PushMachineFrame,
            _ => return None,
        })
    }
}

/// One prologue side effect, with its operands decoded into byte quantities.
///
/// Offsets of save operations are relative to the establisher frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindOperation {
    PushNonvolatile(Reg),
    AllocLarge(u32),
    AllocSmall(u32),
    SetFramePointer,
    SaveNonvolatile { reg: Reg, offset: u32 },
    SaveNonvolatileFar { reg: Reg, offset: u32 },
    SaveXmm128 { reg: u8, offset: u32 },
    SaveXmm128Far { reg: u8, offset: u32 },
    /// The hardware pushed a trap frame (SS, RSP, EFLAGS, CS, RIP), optionally
    /// preceded by an error code.
    PushMachineFrame { error_code: bool },
}

impl UnwindOperation {
    pub fn opcode(&self) -> UnwindOpCode {
        match self {
            UnwindOperation::PushNonvolatile(_) => UnwindOpCode::PushNonvolatile,
            UnwindOperation::AllocLarge(_) => UnwindOpCode::AllocLarge,
            UnwindOperation::AllocSmall(_) => UnwindOpCode::AllocSmall,
            UnwindOperation::SetFramePointer => UnwindOpCode::SetFramePointer,
            UnwindOperation::SaveNonvolatile { .. } => UnwindOpCode::SaveNonvolatile,
            UnwindOperation::SaveNonvolatileFar { .. } => UnwindOpCode::SaveNonvolatileFar,
            UnwindOperation::SaveXmm128 { .. } => UnwindOpCode::SaveXmm128,
            UnwindOperation::SaveXmm128Far { .. } => UnwindOpCode::SaveXmm128Far,
            UnwindOperation::PushMachineFrame { .. } => UnwindOpCode::PushMachineFrame,
        }
    }
}

/// The location of a language handler and its data, both image-relative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerInfo {
    pub handler_rva: u32,
    pub data_rva: u32,
}

/// A parsed unwind info block borrowing from the image it lives in.
#[derive(Clone, Copy)]
pub struct UnwindInfo<'a> {
    rva: u32,
    header: RawUnwindInfoHeader,
    codes: &'a [U16<LittleEndian>],
    image: &'a [u8],
}

impl<'a> UnwindInfo<'a> {
    /// Parses the unwind info at `rva` in `image`, where `image[0]` is the
    /// image base.
    pub fn parse(image: &'a [u8], rva: u32) -> Result<Self, UnwindInfoError> {
        let header = *image
            .read_at::<RawUnwindInfoHeader>(rva.into())
            .map_err(|()| UnwindInfoError::Truncated(rva))?;
        let version = header.version_and_flags & 0x7;
        if version != 1 && version != 2 {
            return Err(UnwindInfoError::UnsupportedVersion(version));
        }
        let codes = image
            .read_slice_at::<U16<LittleEndian>>(
                u64::from(rva) + u64::from(HEADER_SIZE),
                usize::from(header.count_of_codes),
            )
            .map_err(|()| UnwindInfoError::Truncated(rva))?;
        Ok(Self {
            rva,
            header,
            codes,
            image,
        })
    }

    pub fn rva(&self) -> u32 {
        self.rva
    }

    pub fn version(&self) -> u8 {
        self.header.version_and_flags & 0x7
    }

    pub fn flags(&self) -> UnwindInfoFlags {
        UnwindInfoFlags::from_bits_retain(self.header.version_and_flags >> 3)
    }

    pub fn is_chained(&self) -> bool {
        self.flags().contains(UnwindInfoFlags::CHAINED)
    }

    pub fn size_of_prolog(&self) -> u8 {
        self.header.size_of_prolog
    }

    pub fn count_of_codes(&self) -> u8 {
        self.header.count_of_codes
    }

    /// The frame register, if the function establishes one.
    pub fn frame_register(&self) -> Option<Reg> {
        match self.header.frame_register_and_offset & 0xf {
            0 => None,
            number => Reg::from_number(number),
        }
    }

    /// The distance in bytes between the frame register and the stack
    /// pointer at the moment the frame register was set.
    pub fn frame_offset(&self) -> u64 {
        u64::from(self.header.frame_register_and_offset >> 4) * 16
    }

    pub fn operations(&self) -> UnwindOperations<'a> {
        UnwindOperations {
            codes: self.codes,
            index: 0,
            version: self.version(),
        }
    }

    /// The prologue offset at which the frame register gets set, if ever.
    pub fn set_frame_pointer_offset(&self) -> Result<Option<u8>, UnwindInfoError> {
        self.operations()
            .find(|(_, op)| Ok(*op == UnwindOperation::SetFramePointer))
            .map(|found| found.map(|(offset, _)| offset))
    }

    /// The RVA of whatever follows the code slots, which are padded to an even
    /// count.
    fn trailer_rva(&self) -> u32 {
        let slots = (u32::from(self.count_of_codes()) + 1) & !1;
        self.rva + HEADER_SIZE + slots * 2
    }

    /// The language handler, if the header announces one.
    pub fn handler(&self) -> Result<Option<HandlerInfo>, UnwindInfoError> {
        let handler_flags =
            UnwindInfoFlags::EXCEPTION_HANDLER | UnwindInfoFlags::TERMINATION_HANDLER;
        if self.is_chained() || !self.flags().intersects(handler_flags) {
            return Ok(None);
        }
        let trailer = self.trailer_rva();
        let handler_rva = self
            .image
            .read_at::<object::U32<LittleEndian>>(trailer.into())
            .map_err(|()| UnwindInfoError::Truncated(self.rva))?
            .get(LittleEndian);
        Ok(Some(HandlerInfo {
            handler_rva,
            data_rva: trailer + 4,
        }))
    }

    /// The function entry whose unwind info continues this one.
    pub fn chained_function(&self) -> Result<Option<RuntimeFunction>, UnwindInfoError> {
        if !self.is_chained() {
            return Ok(None);
        }
        RawRuntimeFunction::parse(self.image, self.trailer_rva().into())
            .map(Some)
            .ok_or(UnwindInfoError::Truncated(self.rva))
    }
}

impl Debug for UnwindInfo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwindInfo")
            .field("rva", &HexNum(self.rva))
            .field("flags", &self.flags())
            .field("size_of_prolog", &self.size_of_prolog())
            .field("count_of_codes", &self.count_of_codes())
            .field("frame_register", &self.frame_register())
            .field("frame_offset", &self.frame_offset())
            .finish()
    }
}

/// Iterates the operations of one unwind info block in stored order, which
/// is descending prologue offset, yielding `(prologue offset, operation)`.
#[derive(Clone)]
pub struct UnwindOperations<'a> {
    codes: &'a [U16<LittleEndian>],
    index: usize,
    version: u8,
}

impl UnwindOperations<'_> {
    fn slot(&self, index: usize) -> Result<u16, UnwindInfoError> {
        self.codes
            .get(index)
            .map(|slot| slot.get(LittleEndian))
            .ok_or(UnwindInfoError::MissingOperand(self.index))
    }

    fn wide_operand(&self) -> Result<u32, UnwindInfoError> {
        let low = u32::from(self.slot(self.index + 1)?);
        let high = u32::from(self.slot(self.index + 2)?);
        Ok(low | (high << 16))
    }
}

impl FallibleIterator for UnwindOperations<'_> {
    type Item = (u8, UnwindOperation);
    type Error = UnwindInfoError;

    fn next(&mut self) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.index >= self.codes.len() {
                return Ok(None);
            }
            let slot = self.slot(self.index)?;
            let code_offset = slot as u8;
            let op = ((slot >> 8) & 0xf) as u8;
            let info = (slot >> 12) as u8;
            let reg = Reg::ALL[usize::from(info)];

            let (operation, slots) = match UnwindOpCode::from_u8(op) {
                Some(UnwindOpCode::PushNonvolatile) => (UnwindOperation::PushNonvolatile(reg), 1),
                Some(UnwindOpCode::AllocLarge) if info == 0 => {
                    let size = u32::from(self.slot(self.index + 1)?) * 8;
                    (UnwindOperation::AllocLarge(size), 2)
                }
                Some(UnwindOpCode::AllocLarge) => (UnwindOperation::AllocLarge(self.wide_operand()?), 3),
                Some(UnwindOpCode::AllocSmall) => {
                    (UnwindOperation::AllocSmall(u32::from(info) * 8 + 8), 1)
                }
                Some(UnwindOpCode::SetFramePointer) => (UnwindOperation::SetFramePointer, 1),
                Some(UnwindOpCode::SaveNonvolatile) => {
                    let offset = u32::from(self.slot(self.index + 1)?) * 8;
                    (UnwindOperation::SaveNonvolatile { reg, offset }, 2)
                }
                Some(UnwindOpCode::SaveNonvolatileFar) => {
                    let offset = self.wide_operand()?;
                    (UnwindOperation::SaveNonvolatileFar { reg, offset }, 3)
                }
                Some(UnwindOpCode::SaveXmm128) => {
                    let offset = u32::from(self.slot(self.index + 1)?) * 16;
                    (UnwindOperation::SaveXmm128 { reg: info, offset }, 2)
                }
                Some(UnwindOpCode::SaveXmm128Far) => {
                    let offset = self.wide_operand()?;
                    (UnwindOperation::SaveXmm128Far { reg: info, offset }, 3)
                }
                Some(UnwindOpCode::PushMachineFrame) => {
                    (UnwindOperation::PushMachineFrame { error_code: info != 0 }, 1)
                }
                Some(UnwindOpCode::Epilogue) if self.version >= 2 => {
                    // Version 2 epilogue descriptors only locate epilogues.
                    self.index += 1;
                    continue;
                }
                _ => return Err(UnwindInfoError::UnknownOpcode(op)),
            };
            self.index += slots;
            return Ok(Some((code_offset, operation)));
        }
    }
}

/// Walks a function entry and the entries its unwind info chains to, from
/// the entry itself out to the primary entry.
pub struct UnwindChain<'a> {
    image: &'a [u8],
    image_base: u64,
    next: Option<RuntimeFunction>,
    depth: usize,
}

impl<'a> UnwindChain<'a> {
    pub fn new(image: &'a [u8], entry: &FunctionEntry) -> Self {
        Self {
            image,
            image_base: entry.image_base,
            next: Some(entry.function),
            depth: 0,
        }
    }

    /// The last element of the chain: the primary entry and its unwind info.
    pub fn primary(self) -> Result<(FunctionEntry, UnwindInfo<'a>), UnwindInfoError> {
        let start = self.next;
        match self.last()? {
            Some(primary) => Ok(primary),
            None => Err(UnwindInfoError::Truncated(
                start.map_or(0, |function| function.unwind_data),
            )),
        }
    }
}

impl<'a> FallibleIterator for UnwindChain<'a> {
    type Item = (FunctionEntry, UnwindInfo<'a>);
    type Error = UnwindInfoError;

    fn next(&mut self) -> Result<Option<Self::Item>, Self::Error> {
        let Some(function) = self.next.take() else {
            return Ok(None);
        };
        if self.depth == MAX_CHAIN_DEPTH {
            return Err(UnwindInfoError::ChainTooDeep(MAX_CHAIN_DEPTH));
        }
        self.depth += 1;
        let info = UnwindInfo::parse(self.image, function.unwind_data)?;
        self.next = info.chained_function()?;
        Ok(Some((FunctionEntry::new(self.image_base, function), info)))
    }
}

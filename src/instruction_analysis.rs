use arrayvec::ArrayVec;

use crate::context::Reg;

/// Recognizes function epilogues from raw instruction bytes.
///
/// Unwind codes only describe prologues. When the instruction pointer sits
/// inside an epilogue, part of the frame is already torn down, and the
/// virtual unwinder has to emulate the rest of the epilogue instead.
pub trait InstructionDecoder {
    /// Decodes `code`, the bytes from `pc` to the end of the function entry,
    /// returning the epilogue they begin, if any. `frame_register` is the
    /// function's frame register; a `lea` based stack restore only counts if
    /// it uses that register.
    fn decode_epilogue(&self, pc: u64, code: &[u8], frame_register: Option<Reg>)
        -> Option<Epilogue>;
}

/// How the epilogue restores the stack pointer before popping registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackAdjustment {
    /// `add rsp, imm`
    AddRsp(i32),
    /// `lea rsp, [reg + displacement]`
    LeaFromFrame { reg: Reg, displacement: i32 },
}

/// How the epilogue leaves the function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpilogueExit {
    Return,
    /// A relative jump. Whether it leaves the function is up to the caller,
    /// who knows the function's extent.
    Jump { target: u64 },
    /// An indirect jump, which always counts as leaving the function.
    IndirectJump,
}

/// A decoded epilogue: an optional stack adjustment, the registers popped in
/// order, and the final control transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Epilogue {
    pub stack_adjustment: Option<StackAdjustment>,
    pub pops: ArrayVec<Reg, 16>,
    pub exit: EpilogueExit,
}

use std::fmt::Debug;

use crate::display_utils::HexNum;

/// An amd64 general-purpose register, numbered the way unwind info and
/// instruction encodings number them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::RAX,
        Reg::RCX,
        Reg::RDX,
        Reg::RBX,
        Reg::RSP,
        Reg::RBP,
        Reg::RSI,
        Reg::RDI,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// Registers a callee must preserve. These are the only integer registers
    /// an unwind restores.
    pub const NONVOLATILE: [Reg; 8] = [
        Reg::RBX,
        Reg::RBP,
        Reg::RDI,
        Reg::RSI,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// Returns the register with the given 4-bit encoding.
    pub fn from_number(number: u8) -> Option<Reg> {
        Self::ALL.get(usize::from(number)).copied()
    }

    pub fn number(self) -> u8 {
        self as u8
    }
}

/// The register file of a thread at one point of its execution.
///
/// Field order follows the amd64 ABI layout: sixteen integer registers in
/// encoding order, the instruction pointer, flags, then the sixteen XMM
/// registers.
#[derive(Clone, PartialEq, Eq)]
#[repr(C)]
pub struct Context {
    gpr: [u64; 16],
    rip: u64,
    eflags: u32,
    mxcsr: u32,
    seg_cs: u16,
    seg_ss: u16,
    xmm: [u128; 16],
}

impl Default for Context {
    fn default() -> Self {
        Self {
            gpr: [0; 16],
            rip: 0,
            eflags: 0,
            mxcsr: 0x1f80,
            seg_cs: 0,
            seg_ss: 0,
            xmm: [0; 16],
        }
    }
}

impl Context {
    pub fn new(rip: u64, rsp: u64) -> Self {
        let mut context = Self::default();
        context.rip = rip;
        context.set(Reg::RSP, rsp);
        context
    }

    #[inline(always)]
    pub fn get(&self, reg: Reg) -> u64 {
        self.gpr[reg as usize]
    }
    #[inline(always)]
    pub fn set(&mut self, reg: Reg, value: u64) {
        self.gpr[reg as usize] = value
    }

    #[inline(always)]
    pub fn rip(&self) -> u64 {
        self.rip
    }
    #[inline(always)]
    pub fn set_rip(&mut self, rip: u64) {
        self.rip = rip
    }

    #[inline(always)]
    pub fn rsp(&self) -> u64 {
        self.get(Reg::RSP)
    }
    #[inline(always)]
    pub fn set_rsp(&mut self, rsp: u64) {
        self.set(Reg::RSP, rsp)
    }

    #[inline(always)]
    pub fn rax(&self) -> u64 {
        self.get(Reg::RAX)
    }

    pub fn eflags(&self) -> u32 {
        self.eflags
    }
    pub fn set_eflags(&mut self, eflags: u32) {
        self.eflags = eflags
    }

    pub fn mxcsr(&self) -> u32 {
        self.mxcsr
    }

    pub fn segments(&self) -> (u16, u16) {
        (self.seg_cs, self.seg_ss)
    }
    pub fn set_segments(&mut self, cs: u16, ss: u16) {
        self.seg_cs = cs;
        self.seg_ss = ss;
    }

    /// Returns XMM register `index`. Panics if `index >= 16`.
    pub fn xmm(&self, index: u8) -> u128 {
        self.xmm[usize::from(index)]
    }
    pub fn set_xmm(&mut self, index: u8, value: u128) {
        self.xmm[usize::from(index)] = value
    }

    /// Copies the state an unwind needs to carry across frames: the
    /// instruction and stack pointers, nonvolatile integer registers, XMM6-15,
    /// segments, MXCSR and flags. Volatile registers of `self` are left alone.
    pub fn copy_nonvolatile_from(&mut self, source: &Context) {
        self.rip = source.rip;
        self.set(Reg::RSP, source.rsp());
        for reg in Reg::NONVOLATILE {
            self.set(reg, source.get(reg));
        }
        self.xmm[6..].copy_from_slice(&source.xmm[6..]);
        self.seg_cs = source.seg_cs;
        self.seg_ss = source.seg_ss;
        self.mxcsr = source.mxcsr;
        self.eflags = source.eflags;
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("rip", &HexNum(self.rip))
            .field("rsp", &HexNum(self.rsp()))
            .field("rbp", &HexNum(self.get(Reg::RBP)))
            .field("rax", &HexNum(self.rax()))
            .field("rbx", &HexNum(self.get(Reg::RBX)))
            .field("rsi", &HexNum(self.get(Reg::RSI)))
            .field("rdi", &HexNum(self.get(Reg::RDI)))
            .field("r12", &HexNum(self.get(Reg::R12)))
            .field("r13", &HexNum(self.get(Reg::R13)))
            .field("r14", &HexNum(self.get(Reg::R14)))
            .field("r15", &HexNum(self.get(Reg::R15)))
            .finish()
    }
}

/// Where each register was restored from during a virtual unwind.
///
/// A debugger uses these to write a modified register value back into the
/// frame that saved it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ContextPointers {
    integer: [Option<u64>; 16],
    xmm: [Option<u64>; 16],
}

impl ContextPointers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn integer(&self, reg: Reg) -> Option<u64> {
        self.integer[reg as usize]
    }

    pub fn xmm(&self, index: u8) -> Option<u64> {
        self.xmm.get(usize::from(index)).copied().flatten()
    }

    pub(crate) fn record_integer(&mut self, reg: Reg, address: u64) {
        self.integer[reg as usize] = Some(address);
    }

    pub(crate) fn record_xmm(&mut self, index: u8, address: u64) {
        if let Some(slot) = self.xmm.get_mut(usize::from(index)) {
            *slot = Some(address);
        }
    }
}

impl Debug for ContextPointers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for reg in Reg::ALL {
            if let Some(address) = self.integer(reg) {
                map.entry(&reg, &HexNum(address));
            }
        }
        for index in 0..16u8 {
            if let Some(address) = self.xmm(index) {
                map.entry(&format_args!("XMM{index}"), &HexNum(address));
            }
        }
        map.finish()
    }
}

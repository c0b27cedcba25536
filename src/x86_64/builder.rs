use crate::context::Reg;
use crate::runtime_function::RuntimeFunction;

use super::unwind_info::{UnwindInfoFlags, UnwindOpCode};

/// Encodes unwind info in the binary layout [`UnwindInfo`](super::UnwindInfo)
/// parses. This is the producer side for generated code that wants to
/// register a dynamic function table.
///
/// Operations are added in prologue order, i.e. with increasing prologue
/// offsets; they are stored in reverse. The smallest encoding is picked for
/// each operation.
#[derive(Clone, Debug, Default)]
pub struct UnwindInfoBuilder {
    version: u8,
    flags: UnwindInfoFlags,
    size_of_prolog: Option<u8>,
    frame_register: Option<Reg>,
    scaled_frame_offset: u8,
    /// One group of slots per operation, in prologue order.
    operations: Vec<Vec<u16>>,
    handler: Option<(u32, Vec<u8>)>,
    chained: Option<RuntimeFunction>,
}

fn slot(code_offset: u8, op: UnwindOpCode, info: u8) -> u16 {
    u16::from(code_offset) | (u16::from(op as u8) << 8) | (u16::from(info & 0xf) << 12)
}

fn split(value: u32) -> [u16; 2] {
    [value as u16, (value >> 16) as u16]
}

impl UnwindInfoBuilder {
    pub fn new() -> Self {
        Self {
            version: 1,
            ..Default::default()
        }
    }

    /// Overrides the prologue size, which otherwise is the largest operation
    /// offset.
    pub fn size_of_prolog(mut self, size: u8) -> Self {
        self.size_of_prolog = Some(size);
        self
    }

    pub fn push_nonvolatile(mut self, code_offset: u8, reg: Reg) -> Self {
        self.operations
            .push(vec![slot(code_offset, UnwindOpCode::PushNonvolatile, reg.number())]);
        self
    }

    /// `sub rsp, size`. `size` should be a multiple of 8.
    pub fn alloc(mut self, code_offset: u8, size: u32) -> Self {
        let slots = if (8..=128).contains(&size) && size % 8 == 0 {
            vec![slot(code_offset, UnwindOpCode::AllocSmall, (size / 8 - 1) as u8)]
        } else if size % 8 == 0 && size / 8 <= 0xffff {
            vec![slot(code_offset, UnwindOpCode::AllocLarge, 0), (size / 8) as u16]
        } else {
            let [low, high] = split(size);
            vec![slot(code_offset, UnwindOpCode::AllocLarge, 1), low, high]
        };
        self.operations.push(slots);
        self
    }

    /// `lea reg, [rsp + 16 * scaled_offset]`. Only the low four bits of
    /// `scaled_offset` are encodable.
    pub fn set_frame_register(mut self, code_offset: u8, reg: Reg, scaled_offset: u8) -> Self {
        self.frame_register = Some(reg);
        self.scaled_frame_offset = scaled_offset & 0xf;
        self.operations
            .push(vec![slot(code_offset, UnwindOpCode::SetFramePointer, 0)]);
        self
    }

    /// `mov [frame + offset], reg`
    pub fn save_nonvolatile(mut self, code_offset: u8, reg: Reg, offset: u32) -> Self {
        let slots = if offset % 8 == 0 && offset / 8 <= 0xffff {
            vec![
                slot(code_offset, UnwindOpCode::SaveNonvolatile, reg.number()),
                (offset / 8) as u16,
            ]
        } else {
            let [low, high] = split(offset);
            vec![
                slot(code_offset, UnwindOpCode::SaveNonvolatileFar, reg.number()),
                low,
                high,
            ]
        };
        self.operations.push(slots);
        self
    }

    /// `movaps [frame + offset], xmm<reg>`
    pub fn save_xmm128(mut self, code_offset: u8, reg: u8, offset: u32) -> Self {
        let slots = if offset % 16 == 0 && offset / 16 <= 0xffff {
            vec![
                slot(code_offset, UnwindOpCode::SaveXmm128, reg),
                (offset / 16) as u16,
            ]
        } else {
            let [low, high] = split(offset);
            vec![slot(code_offset, UnwindOpCode::SaveXmm128Far, reg), low, high]
        };
        self.operations.push(slots);
        self
    }

    pub fn push_machine_frame(mut self, code_offset: u8, error_code: bool) -> Self {
        self.operations.push(vec![slot(
            code_offset,
            UnwindOpCode::PushMachineFrame,
            u8::from(error_code),
        )]);
        self
    }

    /// Attaches a language handler. `flags` selects whether it runs during
    /// the search phase, the unwind phase, or both; `data` is copied after
    /// the handler address.
    pub fn handler(mut self, flags: UnwindInfoFlags, handler_rva: u32, data: &[u8]) -> Self {
        let handler_flags = UnwindInfoFlags::EXCEPTION_HANDLER | UnwindInfoFlags::TERMINATION_HANDLER;
        self.flags = (self.flags - handler_flags) | (flags & handler_flags);
        self.handler = Some((handler_rva, data.to_vec()));
        self
    }

    pub fn exception_handler(self, handler_rva: u32, data: &[u8]) -> Self {
        self.handler(UnwindInfoFlags::EXCEPTION_HANDLER, handler_rva, data)
    }

    pub fn termination_handler(self, handler_rva: u32, data: &[u8]) -> Self {
        self.handler(UnwindInfoFlags::TERMINATION_HANDLER, handler_rva, data)
    }

    /// Continues this unwind info with the entry `parent`. A chained block
    /// cannot also have a handler.
    pub fn chained(mut self, parent: RuntimeFunction) -> Self {
        self.flags = UnwindInfoFlags::CHAINED;
        self.handler = None;
        self.chained = Some(parent);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let slots: Vec<u16> = self.operations.iter().rev().flatten().copied().collect();
        let size_of_prolog = self.size_of_prolog.unwrap_or_else(|| {
            self.operations
                .iter()
                .filter_map(|op| op.first())
                .map(|first| *first as u8)
                .max()
                .unwrap_or(0)
        });
        let frame = self.frame_register.map_or(0, Reg::number) | (self.scaled_frame_offset << 4);

        let mut bytes = vec![
            (self.version & 0x7) | (self.flags.bits() << 3),
            size_of_prolog,
            slots.len() as u8,
            frame,
        ];
        for slot in &slots {
            bytes.extend_from_slice(&slot.to_le_bytes());
        }
        if slots.len() % 2 == 1 {
            bytes.extend_from_slice(&[0, 0]);
        }
        if let Some(parent) = &self.chained {
            bytes.extend_from_slice(&parent.to_bytes());
        } else if let Some((handler_rva, data)) = &self.handler {
            bytes.extend_from_slice(&handler_rva.to_le_bytes());
            bytes.extend_from_slice(data);
        }
        bytes
    }
}

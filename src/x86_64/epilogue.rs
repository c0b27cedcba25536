use arrayvec::ArrayVec;

use crate::context::Reg;
use crate::instruction_analysis::{Epilogue, EpilogueExit, InstructionDecoder, StackAdjustment};

/// Matches the exact epilogue sequences the amd64 calling convention allows
/// compilers to emit.
#[derive(Clone, Copy, Debug, Default)]
pub struct Amd64EpilogueDecoder;

const RET: u8 = 0xc3;
const RET_IMM16: u8 = 0xc2;
const REP: u8 = 0xf3;
const JMP_REL8: u8 = 0xeb;
const JMP_REL32: u8 = 0xe9;
const JMP_INDIRECT: u8 = 0xff;
const LEA: u8 = 0x8d;

fn is_rex(byte: u8) -> bool {
    byte & 0xf0 == 0x40
}

fn read_i32(bytes: &[u8], at: usize) -> Option<i32> {
    let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(i32::from_le_bytes(raw))
}

/// Decodes the optional stack restore at the start of `code`, returning it
/// with its encoded length.
fn stack_adjustment(code: &[u8], frame_register: Option<Reg>) -> Option<(StackAdjustment, usize)> {
    match *code {
        [0x48, 0x83, 0xc4, imm8, ..] => Some((StackAdjustment::AddRsp(i32::from(imm8 as i8)), 4)),
        [0x48, 0x81, 0xc4, ..] => Some((StackAdjustment::AddRsp(read_i32(code, 3)?), 7)),
        [rex, LEA, modrm, ..] if rex & 0xfe == 0x48 => {
            let number = ((rex & 1) << 3) | (modrm & 7);
            let reg = frame_register.filter(|fp| number != 0 && fp.number() == number)?;
            match modrm & 0xf8 {
                0x60 => {
                    let displacement = i32::from(*code.get(3)? as i8);
                    Some((StackAdjustment::LeaFromFrame { reg, displacement }, 4))
                }
                0xa0 => {
                    let displacement = read_i32(code, 3)?;
                    Some((StackAdjustment::LeaFromFrame { reg, displacement }, 7))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

impl InstructionDecoder for Amd64EpilogueDecoder {
    fn decode_epilogue(
        &self,
        pc: u64,
        code: &[u8],
        frame_register: Option<Reg>,
    ) -> Option<Epilogue> {
        let (stack_adjustment, mut cursor) = match stack_adjustment(code, frame_register) {
            Some((adjustment, len)) => (Some(adjustment), len),
            None => (None, 0),
        };

        let mut pops = ArrayVec::new();
        loop {
            let (rex_b, opcode, len) = match code.get(cursor..)? {
                [rex, op, ..] if is_rex(*rex) && op & 0xf8 == 0x58 => ((rex & 1) << 3, *op, 2),
                [op, ..] if op & 0xf8 == 0x58 => (0, *op, 1),
                _ => break,
            };
            let reg = Reg::from_number(rex_b | (opcode & 7))?;
            pops.try_push(reg).ok()?;
            cursor += len;
        }

        let rest = code.get(cursor..)?;
        let after_jump = |len: usize, displacement: i64| {
            pc.wrapping_add((cursor + len) as u64)
                .wrapping_add_signed(displacement)
        };
        let exit = match *rest {
            [RET, ..] | [RET_IMM16, ..] | [REP, RET, ..] => EpilogueExit::Return,
            [JMP_REL8, disp8, ..] => EpilogueExit::Jump {
                target: after_jump(2, i64::from(disp8 as i8)),
            },
            [JMP_REL32, ..] => EpilogueExit::Jump {
                target: after_jump(5, i64::from(read_i32(rest, 1)?)),
            },
            [JMP_INDIRECT, 0x25, ..] => EpilogueExit::IndirectJump,
            [rex, JMP_INDIRECT, modrm, ..] if rex & 0xf8 == 0x48 && modrm & 0x38 == 0x20 => {
                EpilogueExit::IndirectJump
            }
            _ => return None,
        };

        Some(Epilogue {
            stack_adjustment,
            pops,
            exit,
        })
    }
}

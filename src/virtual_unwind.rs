use std::ops::Deref;

use fallible_iterator::FallibleIterator;

use crate::context::{Context, ContextPointers, Reg};
use crate::error::Error;
use crate::image::{ImageError, ImageView};
use crate::instruction_analysis::{EpilogueExit, StackAdjustment};
use crate::runtime::SehRuntime;
use crate::runtime_function::FunctionEntry;
use crate::x86_64::{UnwindChain, UnwindInfo, UnwindInfoError, UnwindInfoFlags, UnwindOperation};

/// A language handler found during a virtual unwind, as absolute addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerRef {
    pub address: u64,
    pub data: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VirtualUnwind {
    pub establisher_frame: u64,
    /// Only present if control left the function body (not its prologue or
    /// an epilogue) and the function has a handler of the requested type.
    pub handler: Option<HandlerRef>,
}

fn add(base: u64, offset: u64) -> Result<u64, Error> {
    base.checked_add(offset).ok_or(Error::IntegerOverflow)
}

fn add_signed(base: u64, offset: i32) -> Result<u64, Error> {
    base.checked_add_signed(offset.into())
        .ok_or(Error::IntegerOverflow)
}

fn record_integer(pointers: &mut Option<&mut ContextPointers>, reg: Reg, address: u64) {
    if let Some(pointers) = pointers {
        pointers.record_integer(reg, address);
    }
}

impl<D: Deref<Target = [u8]>> SehRuntime<'_, D> {
    /// Unwinds `context` from the function described by `entry`, where
    /// control left it at `control_pc`, to the state at its caller.
    ///
    /// `handler_type` selects which handler to report:
    /// [`EXCEPTION_HANDLER`](UnwindInfoFlags::EXCEPTION_HANDLER) while
    /// dispatching, [`TERMINATION_HANDLER`](UnwindInfoFlags::TERMINATION_HANDLER)
    /// while unwinding, or neither. If `pointers` is given, it receives the
    /// stack address each restored register was loaded from.
    pub fn virtual_unwind(
        &self,
        handler_type: UnwindInfoFlags,
        control_pc: u64,
        entry: &FunctionEntry,
        context: &mut Context,
        mut pointers: Option<&mut ContextPointers>,
    ) -> Result<VirtualUnwind, Error> {
        let image = self
            .directory
            .image_for(entry.start_address())
            .ok_or(ImageError::RvaOutOfRange(entry.function.begin_address))?;
        let info = image.unwind_info(entry.function.unwind_data)?;
        let establisher_frame = establisher_frame(&info, entry.offset_of(control_pc), context)?;

        if self.unwind_epilogue(&image, &info, control_pc, entry, context, &mut pointers)? {
            log::trace!("0x{:x} is in an epilogue", control_pc);
            return Ok(VirtualUnwind {
                establisher_frame,
                handler: None,
            });
        }

        let (primary, primary_info) =
            self.unwind_prologue(image.data(), control_pc, establisher_frame, entry, context, pointers)?;

        let past_prologue =
            primary.offset_of(control_pc) >= u32::from(primary_info.size_of_prolog());
        let handler = match primary_info.handler()? {
            Some(handler) if past_prologue && primary_info.flags().intersects(handler_type) => {
                Some(HandlerRef {
                    address: add(image.base(), handler.handler_rva.into())?,
                    data: add(image.base(), handler.data_rva.into())?,
                })
            }
            _ => None,
        };
        Ok(VirtualUnwind {
            establisher_frame,
            handler,
        })
    }

    /// If `control_pc` is inside an epilogue, executes the rest of it on
    /// `context` and returns true.
    fn unwind_epilogue(
        &self,
        image: &ImageView<'_>,
        info: &UnwindInfo<'_>,
        control_pc: u64,
        entry: &FunctionEntry,
        context: &mut Context,
        pointers: &mut Option<&mut ContextPointers>,
    ) -> Result<bool, Error> {
        let Some(pc_rva) = image.rva_of(control_pc) else {
            return Ok(false);
        };
        let Ok(code) = image.bytes_in(pc_rva, entry.function.end_address) else {
            return Ok(false);
        };
        let Some(epilogue) = self
            .decoder
            .decode_epilogue(control_pc, code, info.frame_register())
        else {
            return Ok(false);
        };

        let leaves_function = match epilogue.exit {
            EpilogueExit::Return | EpilogueExit::IndirectJump => true,
            EpilogueExit::Jump { target } => self.is_tail_jump(entry, info, target),
        };
        if !leaves_function {
            return Ok(false);
        }

        match epilogue.stack_adjustment {
            Some(StackAdjustment::AddRsp(amount)) => {
                context.set_rsp(add_signed(context.rsp(), amount)?);
            }
            Some(StackAdjustment::LeaFromFrame { reg, displacement }) => {
                context.set_rsp(add_signed(context.get(reg), displacement)?);
            }
            None => {}
        }
        for reg in epilogue.pops {
            let rsp = context.rsp();
            context.set(reg, self.read_stack(rsp)?);
            record_integer(pointers, reg, rsp);
            context.set_rsp(add(rsp, 8)?);
        }
        // A tail jump returns to our caller just like a ret.
        self.unwind_leaf(context)?;
        Ok(true)
    }

    /// Whether a relative jump at the end of an epilogue candidate is a tail
    /// call rather than a branch inside the function.
    fn is_tail_jump(&self, entry: &FunctionEntry, info: &UnwindInfo<'_>, target: u64) -> bool {
        if entry.contains(target) {
            // A jump back to our own start is a recursive tail call.
            return target == entry.start_address() && !info.is_chained();
        }
        match self.directory.same_function(entry, target) {
            None => true,
            Some(primary) => target == primary.start_address(),
        }
    }

    /// Undoes the prologue effects recorded for `entry` and every entry it
    /// chains to, then pops the return address unless a machine frame
    /// supplied it. Returns the primary entry and its unwind info.
    fn unwind_prologue<'i>(
        &self,
        image: &'i [u8],
        control_pc: u64,
        frame_base: u64,
        entry: &FunctionEntry,
        context: &mut Context,
        mut pointers: Option<&mut ContextPointers>,
    ) -> Result<(FunctionEntry, UnwindInfo<'i>), Error> {
        let mut machine_frame = false;
        let mut primary = None;
        let mut chain = UnwindChain::new(image, entry);
        while let Some((element, info)) = chain.next()? {
            // Chained parents see a wrapped offset, so their whole prologue
            // applies.
            let prolog_offset = element.offset_of(control_pc);
            let mut operations = info.operations();
            while let Some((code_offset, operation)) = operations.next()? {
                if prolog_offset < u32::from(code_offset) {
                    continue;
                }
                log::trace!("undo {:?} at prologue offset {}", operation, code_offset);
                if self.undo_operation(operation, &info, frame_base, context, &mut pointers)? {
                    machine_frame = true;
                }
            }
            primary = Some((element, info));
        }
        let primary =
            primary.ok_or(UnwindInfoError::Truncated(entry.function.unwind_data))?;
        if !machine_frame {
            self.unwind_leaf(context)?;
        }
        Ok(primary)
    }

    /// Reverses one prologue operation. Returns true for a machine frame,
    /// which also restores the instruction pointer.
    fn undo_operation(
        &self,
        operation: UnwindOperation,
        info: &UnwindInfo<'_>,
        frame_base: u64,
        context: &mut Context,
        pointers: &mut Option<&mut ContextPointers>,
    ) -> Result<bool, Error> {
        match operation {
            UnwindOperation::PushNonvolatile(reg) => {
                let rsp = context.rsp();
                context.set(reg, self.read_stack(rsp)?);
                record_integer(pointers, reg, rsp);
                context.set_rsp(add(rsp, 8)?);
            }
            UnwindOperation::AllocLarge(size) | UnwindOperation::AllocSmall(size) => {
                context.set_rsp(add(context.rsp(), size.into())?);
            }
            UnwindOperation::SetFramePointer => {
                let fp = info
                    .frame_register()
                    .ok_or(UnwindInfoError::NoFrameRegister)?;
                let rsp = context
                    .get(fp)
                    .checked_sub(info.frame_offset())
                    .ok_or(Error::IntegerOverflow)?;
                context.set_rsp(rsp);
            }
            UnwindOperation::SaveNonvolatile { reg, offset }
            | UnwindOperation::SaveNonvolatileFar { reg, offset } => {
                let address = add(frame_base, offset.into())?;
                context.set(reg, self.read_stack(address)?);
                record_integer(pointers, reg, address);
            }
            UnwindOperation::SaveXmm128 { reg, offset }
            | UnwindOperation::SaveXmm128Far { reg, offset } => {
                let address = add(frame_base, offset.into())?;
                context.set_xmm(reg, self.read_stack_u128(address)?);
                if let Some(pointers) = pointers {
                    pointers.record_xmm(reg, address);
                }
            }
            UnwindOperation::PushMachineFrame { error_code } => {
                let frame = add(context.rsp(), if error_code { 8 } else { 0 })?;
                let rip = self.read_stack(frame)?;
                let rsp = self.read_stack(add(frame, 3 * 8)?)?;
                context.set_rip(rip);
                context.set_rsp(rsp);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// The frame's establisher frame: the stack pointer, or the frame register
/// minus its offset once the prologue has set it.
fn establisher_frame(info: &UnwindInfo<'_>, prolog_offset: u32, context: &Context) -> Result<u64, Error> {
    let Some(fp) = info.frame_register() else {
        return Ok(context.rsp());
    };
    let frame_set = if prolog_offset >= u32::from(info.size_of_prolog()) || info.is_chained() {
        true
    } else {
        matches!(info.set_frame_pointer_offset()?, Some(offset) if prolog_offset >= u32::from(offset))
    };
    if frame_set {
        context
            .get(fp)
            .checked_sub(info.frame_offset())
            .ok_or(Error::IntegerOverflow)
    } else {
        Ok(context.rsp())
    }
}

use std::ops::Deref;

use crate::context::Context;
use crate::error::Error;
use crate::exception::{DispatcherContext, ExceptionDisposition, ExceptionFlags, ExceptionRecord};
use crate::history::HistoryTable;
use crate::runtime::{SehRuntime, MAX_STALLED_FRAMES};
use crate::runtime_function::FunctionEntry;
use crate::x86_64::UnwindInfoFlags;

impl<D: Deref<Target = [u8]>> SehRuntime<'_, D> {
    /// Searches the stack for a frame whose exception handler handles
    /// `record`, which was raised with register state `context`.
    ///
    /// Returns `Ok(true)` if a handler continued execution. `context` then
    /// holds whatever state the handler repaired it to. Returns `Ok(false)`
    /// if the walk left the stack or found no willing handler.
    pub fn dispatch_exception(
        &self,
        record: &mut ExceptionRecord,
        context: &mut Context,
    ) -> Result<bool, Error> {
        let mut limits = self.environment.stack_limits();
        let mut history = HistoryTable::new();
        let mut frame_context = context.clone();
        let mut control_pc = record.address;
        let mut flags = record.flags & ExceptionFlags::NONCONTINUABLE;
        let mut nested_frame = 0;
        let mut stalled = 0;

        log::debug!("dispatching {:?} at 0x{:x}", record.code, control_pc);

        loop {
            let previous_position = (control_pc, frame_context.rsp());

            match self
                .directory
                .lookup_function_entry(control_pc, Some(&mut history))
            {
                Some(entry) => {
                    let unwind = self.virtual_unwind(
                        UnwindInfoFlags::EXCEPTION_HANDLER,
                        control_pc,
                        &entry,
                        &mut frame_context,
                        None,
                    )?;
                    let mut establisher_frame = unwind.establisher_frame;
                    if !limits.contains_frame(establisher_frame) {
                        log::warn!("establisher frame 0x{:x} is out of bounds", establisher_frame);
                        flags |= ExceptionFlags::STACK_INVALID;
                        break;
                    }

                    if let Some(handler) = unwind.handler {
                        let mut dc = DispatcherContext {
                            control_pc,
                            function_entry: entry,
                            establisher_frame,
                            target_ip: None,
                            context_record: frame_context.clone(),
                            language_handler: handler.address,
                            handler_data: handler.data,
                            history_table: history.clone(),
                            scope_index: 0,
                        };
                        loop {
                            record.flags = flags;
                            let disposition =
                                self.call_logged_handler(record, establisher_frame, context, &mut dc)?;
                            // Only the noncontinuable bit survives a handler.
                            flags |= record.flags & ExceptionFlags::NONCONTINUABLE;

                            if nested_frame == establisher_frame {
                                flags.remove(ExceptionFlags::NESTED_CALL);
                                nested_frame = 0;
                            }

                            match disposition {
                                ExceptionDisposition::ContinueExecution => {
                                    if flags.contains(ExceptionFlags::NONCONTINUABLE) {
                                        return Err(Error::NonContinuableException);
                                    }
                                    return Ok(true);
                                }
                                ExceptionDisposition::ContinueSearch => break,
                                ExceptionDisposition::NestedException => {
                                    flags |= ExceptionFlags::NESTED_CALL;
                                    nested_frame = nested_frame.max(dc.establisher_frame);
                                    break;
                                }
                                ExceptionDisposition::CollidedUnwind => {
                                    // Resume from the frame the colliding unwind
                                    // had reached.
                                    control_pc = dc.control_pc;
                                    establisher_frame = dc.establisher_frame;
                                    frame_context.clone_from(&dc.context_record);
                                    history.clone_from(&dc.history_table);
                                    self.virtual_unwind(
                                        UnwindInfoFlags::empty(),
                                        control_pc,
                                        &dc.function_entry,
                                        &mut frame_context,
                                        None,
                                    )?;
                                    dc.context_record.clone_from(&frame_context);
                                    log::debug!(
                                        "collided with an unwind at frame 0x{:x}",
                                        establisher_frame
                                    );
                                }
                                ExceptionDisposition::Other(raw) => {
                                    return Err(Error::InvalidDisposition(raw));
                                }
                            }
                        }
                    }
                }
                None => {
                    // A leaf: its return address is on top of the stack.
                    let rsp = frame_context.rsp();
                    if self.read_stack(rsp)? == control_pc {
                        break;
                    }
                    self.unwind_leaf(&mut frame_context)?;
                }
            }

            control_pc = frame_context.rip();
            if (control_pc, frame_context.rsp()) == previous_position {
                stalled += 1;
                if stalled == MAX_STALLED_FRAMES {
                    return Err(Error::BadFunctionTable);
                }
            } else {
                stalled = 0;
            }

            if !limits.contains_frame(frame_context.rsp()) {
                break;
            }
        }

        record.flags = flags;
        Ok(false)
    }

    /// Calls the frame's handler, recording the call in the exception log
    /// when logging is on. Only search-phase calls are logged.
    pub(crate) fn call_logged_handler(
        &self,
        record: &mut ExceptionRecord,
        establisher_frame: u64,
        context: &mut Context,
        dc: &mut DispatcherContext,
    ) -> Result<ExceptionDisposition, Error> {
        let sequence = self.log_handler(record, dc.control_pc, dc.function_entry, dc.language_handler, establisher_frame);
        let disposition = self.call_handler(record, establisher_frame, context, dc)?;
        if let (Some(log), Some(sequence)) = (self.exception_log, sequence) {
            log.log_disposition(sequence, disposition);
        }
        Ok(disposition)
    }

    fn log_handler(
        &self,
        record: &ExceptionRecord,
        control_pc: u64,
        function: FunctionEntry,
        handler: u64,
        establisher_frame: u64,
    ) -> Option<usize> {
        if !self.config.exception_logging || record.flags.contains(ExceptionFlags::UNWINDING) {
            return None;
        }
        self.exception_log?
            .log_handler(record, control_pc, function, handler, establisher_frame)
    }
}

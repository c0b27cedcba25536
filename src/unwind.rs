use std::ops::Deref;

use crate::context::{Context, Reg};
use crate::display_utils::HexNum;
use crate::error::Error;
use crate::exception::{
    DispatcherContext, ExceptionCode, ExceptionDisposition, ExceptionFlags, ExceptionRecord,
};
use crate::history::HistoryTable;
use crate::runtime::{SehRuntime, MAX_STALLED_FRAMES};
use crate::x86_64::UnwindInfoFlags;

/// How an unwind ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnwindOutcome {
    /// The target frame was reached. The context passed to
    /// [`SehRuntime::unwind`] holds the state to resume with.
    Resume,
    /// The unwind left the stack without reaching its target. The thread
    /// environment's last-chance hook has seen the record.
    LastChance(ExceptionRecord),
}

/// The two register states an unwind alternates between: the frame being
/// left and its caller.
struct SnapshotPair {
    current: Context,
    previous: Context,
}

impl SnapshotPair {
    fn new(context: &Context) -> Self {
        Self {
            current: context.clone(),
            previous: Context::default(),
        }
    }

    /// Steps out one frame: the caller's state becomes current.
    fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.previous);
    }
}

impl<D: Deref<Target = [u8]>> SehRuntime<'_, D> {
    /// Unwinds the stack from `context` up to `target_frame`, calling the
    /// termination handler of every frame on the way.
    ///
    /// Without a target frame this is an exit unwind, which runs until it
    /// leaves the stack. Once the target frame is reached, `context` is set
    /// to that frame's state with `return_value` in RAX and, if given,
    /// `target_ip` as the instruction pointer.
    ///
    /// `history` is the table recorded by the dispatch that led here; the
    /// unwind searches it before the function tables.
    pub fn unwind(
        &self,
        target_frame: Option<u64>,
        target_ip: Option<u64>,
        record: Option<ExceptionRecord>,
        return_value: u64,
        context: &mut Context,
        history: Option<&HistoryTable>,
    ) -> Result<UnwindOutcome, Error> {
        let mut limits = self.environment.stack_limits();
        let mut history = match history {
            Some(history) => {
                let mut history = history.clone();
                history.set_search();
                history
            }
            None => HistoryTable::new(),
        };
        let mut record =
            record.unwrap_or_else(|| ExceptionRecord::new(ExceptionCode::UNWIND, context.rip()));
        let mut flags = ExceptionFlags::UNWINDING;
        if target_frame.is_none() {
            flags |= ExceptionFlags::EXIT_UNWIND;
        }
        let reached_target = |frame: Option<u64>| frame.is_some() && frame == target_frame;

        log::debug!(
            "unwinding to frame {:?} from 0x{:x}",
            target_frame.map(HexNum),
            context.rip()
        );

        let mut snapshots = SnapshotPair::new(context);
        // Only frames with a function entry establish one.
        let mut establisher_frame = None;
        let mut control_pc;
        let mut stalled = 0;

        loop {
            control_pc = snapshots.current.rip();
            let frame_rsp = snapshots.current.rsp();
            let Some(entry) = self
                .directory
                .lookup_function_entry(control_pc, Some(&mut history))
            else {
                self.unwind_leaf(&mut snapshots.current)?;
                if !limits.contains_frame(snapshots.current.rsp()) {
                    break;
                }
                continue;
            };

            snapshots.previous.copy_nonvolatile_from(&snapshots.current);
            let unwind = self.virtual_unwind(
                UnwindInfoFlags::TERMINATION_HANDLER,
                control_pc,
                &entry,
                &mut snapshots.previous,
                None,
            )?;
            let mut frame = unwind.establisher_frame;
            establisher_frame = Some(frame);

            if !limits.contains_frame(frame) {
                if target_frame.is_none() {
                    // An exit unwind ends where the stack does.
                    snapshots.swap();
                    break;
                }
                return Err(Error::BadStack(frame));
            }
            if matches!(target_frame, Some(target) if target < frame) {
                return Err(Error::BadStack(frame));
            }

            if let Some(handler) = unwind.handler {
                let mut dc = DispatcherContext {
                    control_pc,
                    function_entry: entry,
                    establisher_frame: frame,
                    target_ip,
                    context_record: snapshots.current.clone(),
                    language_handler: handler.address,
                    handler_data: handler.data,
                    history_table: history.clone(),
                    scope_index: 0,
                };
                loop {
                    if reached_target(Some(frame)) {
                        flags |= ExceptionFlags::TARGET_UNWIND;
                    }
                    record.flags = flags;
                    snapshots.current.set(Reg::RAX, return_value);
                    dc.context_record.set(Reg::RAX, return_value);

                    let disposition = self.call_logged_handler(
                        &mut record,
                        frame,
                        &mut snapshots.current,
                        &mut dc,
                    )?;
                    flags.remove(ExceptionFlags::COLLIDED_UNWIND | ExceptionFlags::TARGET_UNWIND);

                    match disposition {
                        ExceptionDisposition::ContinueSearch => break,
                        ExceptionDisposition::CollidedUnwind => {
                            // Take over the walk of the unwind we collided
                            // with, at the frame it had reached.
                            control_pc = dc.control_pc;
                            snapshots.current.clone_from(&dc.context_record);
                            snapshots.previous.clone_from(&snapshots.current);
                            self.virtual_unwind(
                                UnwindInfoFlags::empty(),
                                control_pc,
                                &dc.function_entry,
                                &mut snapshots.previous,
                                None,
                            )?;
                            frame = dc.establisher_frame;
                            establisher_frame = Some(frame);
                            history.clone_from(&dc.history_table);
                            dc.target_ip = target_ip;
                            flags |= ExceptionFlags::COLLIDED_UNWIND;
                            log::debug!("collided with an unwind at frame 0x{:x}", frame);
                        }
                        other => {
                            return Err(Error::InvalidDisposition(other.into_raw()));
                        }
                    }
                }
            }

            if reached_target(establisher_frame) {
                break;
            }
            snapshots.swap();
            if !limits.contains_frame(snapshots.current.rsp()) {
                break;
            }
            if snapshots.current.rip() == control_pc && snapshots.current.rsp() == frame_rsp {
                stalled += 1;
                if stalled == MAX_STALLED_FRAMES {
                    return Err(Error::BadFunctionTable);
                }
            } else {
                stalled = 0;
            }
        }

        if reached_target(establisher_frame) {
            let current = &mut snapshots.current;
            current.set(Reg::RAX, return_value);
            if let Some(ip) = target_ip {
                if record.code != ExceptionCode::UNWIND_CONSOLIDATE {
                    current.set_rip(ip);
                }
            }
            context.clone_from(current);
            log::debug!(
                "unwind reached frame {:?}, resuming at 0x{:x}",
                establisher_frame.map(HexNum),
                context.rip()
            );
            return Ok(UnwindOutcome::Resume);
        }

        if control_pc == snapshots.current.rip() {
            return Err(Error::BadFunctionTable);
        }
        record.flags = flags;
        log::warn!("unwind left the stack without reaching its target");
        self.environment.last_chance(&record, &snapshots.current);
        Ok(UnwindOutcome::LastChance(record))
    }
}

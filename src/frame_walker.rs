use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};

use fallible_iterator::FallibleIterator;

use crate::context::Context;
use crate::error::Error;
use crate::memory::StackLimits;
use crate::runtime::SehRuntime;
use crate::x86_64::UnwindInfoFlags;

/// A captured call stack, innermost frame first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackTrace {
    pub frames: Vec<u64>,
    /// The wrapping sum of the frame addresses, used to bucket traces.
    pub hash: u32,
}

impl BackTrace {
    pub fn new(frames: Vec<u64>) -> Self {
        let hash = frames
            .iter()
            .fold(0u32, |hash, &address| hash.wrapping_add(address as u32));
        Self { frames, hash }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Walks the stack from a context, yielding the instruction pointer of each
/// frame. No handlers run and the walked context is a private copy.
///
/// The walk ends at a zero instruction pointer, when the stack pointer or
/// an establisher frame leaves the stack limits, or after the runtime's
/// frame limit.
pub struct FrameWalk<'r, 'a, D: Deref<Target = [u8]>> {
    runtime: &'r SehRuntime<'a, D>,
    context: Context,
    limits: StackLimits,
    remaining: usize,
    done: bool,
    pending: Option<Error>,
}

impl<'r, 'a, D: Deref<Target = [u8]>> FrameWalk<'r, 'a, D> {
    fn step(&mut self) -> Result<bool, Error> {
        let pc = self.context.rip();
        match self.runtime.directory.lookup_function_entry(pc, None) {
            Some(entry) => {
                let unwind = self.runtime.virtual_unwind(
                    UnwindInfoFlags::empty(),
                    pc,
                    &entry,
                    &mut self.context,
                    None,
                )?;
                if !self.limits.contains_frame(unwind.establisher_frame) {
                    return Ok(false);
                }
            }
            None => self.runtime.unwind_leaf(&mut self.context)?,
        }
        Ok(self.context.rip() != 0 && self.limits.contains_frame(self.context.rsp()))
    }
}

impl<'r, 'a, D: Deref<Target = [u8]>> FallibleIterator for FrameWalk<'r, 'a, D> {
    type Item = u64;
    type Error = Error;

    fn next(&mut self) -> Result<Option<u64>, Error> {
        if let Some(err) = self.pending.take() {
            return Err(err);
        }
        if self.done || self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let pc = self.context.rip();
        // The frame is yielded before a failure to step past it is reported.
        match self.step() {
            Ok(more) => self.done = !more,
            Err(err) => {
                self.done = true;
                self.pending = Some(err);
            }
        }
        Ok(Some(pc))
    }
}

impl<'a, D: Deref<Target = [u8]>> SehRuntime<'a, D> {
    /// Starts a frame walk at `context`.
    pub fn walk_frames(&self, context: &Context) -> FrameWalk<'_, 'a, D> {
        let mut limits = self.environment.stack_limits();
        let done = context.rip() == 0 || !limits.contains_frame(context.rsp());
        FrameWalk {
            runtime: self,
            context: context.clone(),
            limits,
            remaining: self.config.max_walk_frames,
            done,
            pending: None,
        }
    }

    /// Captures up to `max_frames` return addresses starting at `context`,
    /// after skipping the innermost `frames_to_skip`.
    ///
    /// Never fails: if the stack can't be walked right now, or the walk
    /// faults, the trace is empty.
    pub fn capture_back_trace(
        &self,
        context: &Context,
        frames_to_skip: usize,
        max_frames: usize,
    ) -> BackTrace {
        if !self.environment.can_walk_stack() {
            return BackTrace::default();
        }
        let walk = catch_unwind(AssertUnwindSafe(|| {
            let mut frames = Vec::new();
            let mut walk = self.walk_frames(context).skip(frames_to_skip).take(max_frames);
            loop {
                match walk.next() {
                    Ok(Some(pc)) => frames.push(pc),
                    Ok(None) => break,
                    Err(err) => {
                        log::debug!("back trace capture failed: {}", err);
                        return Vec::new();
                    }
                }
            }
            frames
        }));
        match walk {
            Ok(frames) => BackTrace::new(frames),
            Err(_) => {
                log::warn!("back trace capture panicked");
                BackTrace::default()
            }
        }
    }
}

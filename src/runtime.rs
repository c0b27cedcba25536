use std::ops::Deref;

use crate::context::Context;
use crate::error::Error;
use crate::exception::{
    DispatcherContext, ExceptionCode, ExceptionDisposition, ExceptionRecord,
};
use crate::exception_log::ExceptionLog;
use crate::function_table::FunctionTableDirectory;
use crate::handler::HandlerRegistry;
use crate::instruction_analysis::InstructionDecoder;
use crate::memory::{StackLimits, StackMemory};
use crate::x86_64::Amd64EpilogueDecoder;

/// Consecutive frames without progress after which the tables are declared
/// malformed.
pub(crate) const MAX_STALLED_FRAMES: usize = 2;

/// Tunables for a [`SehRuntime`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Record every handler invocation in the runtime's [`ExceptionLog`].
    pub exception_logging: bool,
    /// Upper bound on the frames a stack walk visits.
    pub max_walk_frames: usize,
    /// How many times a failed dispatch is escalated into a new exception
    /// before [`SehRuntime::raise_exception`] gives up.
    pub max_nested_raises: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exception_logging: false,
            max_walk_frames: 256,
            max_nested_raises: 8,
        }
    }
}

/// What the runtime needs to know about the thread it runs on.
pub trait ThreadEnvironment {
    /// The bounds every establisher frame must lie in.
    fn stack_limits(&self) -> StackLimits;

    /// Whether module memory may be touched right now. Stack walks for
    /// diagnostics bail out when this is false.
    fn can_walk_stack(&self) -> bool {
        true
    }

    /// Called when an unwind runs off the stack without reaching its target.
    fn last_chance(&self, _record: &ExceptionRecord, _context: &Context) {}
}

/// A [`ThreadEnvironment`] with fixed stack limits.
#[derive(Clone, Copy, Debug)]
pub struct FixedEnvironment {
    limits: StackLimits,
}

impl FixedEnvironment {
    pub fn new(limits: StackLimits) -> Self {
        Self { limits }
    }
}

impl ThreadEnvironment for FixedEnvironment {
    fn stack_limits(&self) -> StackLimits {
        self.limits
    }
}

/// The result of [`SehRuntime::raise_exception`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RaiseOutcome {
    /// A handler continued execution; the context holds where to resume.
    Handled,
    /// No handler claimed the exception. The record is the last one
    /// dispatched, with any escalations chained through `previous`.
    Unhandled(ExceptionRecord),
}

/// Exception dispatch and unwinding for one thread.
///
/// Everything the runtime reads is borrowed: the function tables, the
/// thread's stack memory, the handler implementations and the thread
/// environment. The runtime itself keeps no state between calls.
pub struct SehRuntime<'a, D: Deref<Target = [u8]>> {
    pub(crate) directory: &'a FunctionTableDirectory<D>,
    pub(crate) memory: &'a dyn StackMemory,
    pub(crate) handlers: &'a HandlerRegistry<D>,
    pub(crate) environment: &'a dyn ThreadEnvironment,
    pub(crate) decoder: &'a dyn InstructionDecoder,
    pub(crate) exception_log: Option<&'a ExceptionLog>,
    pub(crate) config: RuntimeConfig,
}

impl<'a, D: Deref<Target = [u8]>> SehRuntime<'a, D> {
    pub fn new(
        directory: &'a FunctionTableDirectory<D>,
        memory: &'a dyn StackMemory,
        handlers: &'a HandlerRegistry<D>,
        environment: &'a dyn ThreadEnvironment,
    ) -> Self {
        Self {
            directory,
            memory,
            handlers,
            environment,
            decoder: &Amd64EpilogueDecoder,
            exception_log: None,
            config: RuntimeConfig::default(),
        }
    }

    pub fn with_decoder(mut self, decoder: &'a dyn InstructionDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_exception_log(mut self, log: &'a ExceptionLog) -> Self {
        self.exception_log = Some(log);
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn directory(&self) -> &'a FunctionTableDirectory<D> {
        self.directory
    }

    pub(crate) fn read_stack(&self, address: u64) -> Result<u64, Error> {
        self.memory
            .read_u64(address)
            .map_err(|()| Error::CouldNotReadStack(address))
    }

    pub(crate) fn read_stack_u128(&self, address: u64) -> Result<u128, Error> {
        self.memory
            .read_u128(address)
            .map_err(|()| Error::CouldNotReadStack(address))
    }

    /// Pops the return address off the stack of a function without a
    /// function entry, which is assumed to be a leaf.
    pub(crate) fn unwind_leaf(&self, context: &mut Context) -> Result<(), Error> {
        let rsp = context.rsp();
        let return_address = self.read_stack(rsp)?;
        context.set_rip(return_address);
        context.set_rsp(rsp.checked_add(8).ok_or(Error::IntegerOverflow)?);
        Ok(())
    }

    pub(crate) fn call_handler(
        &self,
        record: &mut ExceptionRecord,
        establisher_frame: u64,
        context: &mut Context,
        dispatcher: &mut DispatcherContext,
    ) -> Result<ExceptionDisposition, Error> {
        let address = dispatcher.language_handler;
        let handler = self
            .handlers
            .get(address)
            .ok_or(Error::UnknownHandler(address))?;
        let disposition = handler.handle(self, record, establisher_frame, context, dispatcher);
        log::debug!(
            "handler 0x{:x} for frame 0x{:x} returned {:?}",
            address,
            establisher_frame,
            disposition
        );
        Ok(disposition)
    }

    /// Dispatches `record`, escalating failures.
    ///
    /// When dispatch itself fails (bad stack, invalid disposition, corrupt
    /// tables), a new noncontinuable exception carrying the matching status
    /// code is raised from the original context, with `record` chained as
    /// its predecessor.
    pub fn raise_exception(&self, mut record: ExceptionRecord, context: &mut Context) -> RaiseOutcome {
        let original = context.clone();
        for _ in 0..=self.config.max_nested_raises {
            match self.dispatch_exception(&mut record, context) {
                Ok(true) => return RaiseOutcome::Handled,
                Ok(false) => return RaiseOutcome::Unhandled(record),
                Err(err) => {
                    log::warn!("exception dispatch for {:?} failed: {}", record.code, err);
                    let mut escalated =
                        ExceptionRecord::new(err.exception_code(), original.rip()).noncontinuable();
                    if escalated.code == ExceptionCode::ACCESS_VIOLATION {
                        if let Some(address) = err.fault_address() {
                            escalated = escalated.with_parameter(0).with_parameter(address);
                        }
                    }
                    record = escalated.with_previous(record);
                    context.clone_from(&original);
                }
            }
        }
        log::warn!(
            "giving up on {:?} after {} nested raises",
            record.code,
            self.config.max_nested_raises
        );
        RaiseOutcome::Unhandled(record)
    }
}

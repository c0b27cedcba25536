use std::collections::BTreeMap;
use std::ops::Deref;

use crate::context::Context;
use crate::exception::{DispatcherContext, ExceptionDisposition, ExceptionRecord};
use crate::runtime::SehRuntime;

/// A language-specific exception or termination handler.
///
/// Handlers are found through the handler address in a function's unwind
/// info. During dispatch `context` is the faulting context, which a handler
/// may repair before returning
/// [`ContinueExecution`](ExceptionDisposition::ContinueExecution). During an
/// unwind it is the frame's own context.
///
/// A handler gets the runtime so it can start an unwind of its own.
pub trait LanguageHandler<D: Deref<Target = [u8]>> {
    fn handle(
        &self,
        runtime: &SehRuntime<'_, D>,
        record: &mut ExceptionRecord,
        establisher_frame: u64,
        context: &mut Context,
        dispatcher: &mut DispatcherContext,
    ) -> ExceptionDisposition;
}

impl<D, F> LanguageHandler<D> for F
where
    D: Deref<Target = [u8]>,
    F: Fn(
        &SehRuntime<'_, D>,
        &mut ExceptionRecord,
        u64,
        &mut Context,
        &mut DispatcherContext,
    ) -> ExceptionDisposition,
{
    fn handle(
        &self,
        runtime: &SehRuntime<'_, D>,
        record: &mut ExceptionRecord,
        establisher_frame: u64,
        context: &mut Context,
        dispatcher: &mut DispatcherContext,
    ) -> ExceptionDisposition {
        self(runtime, record, establisher_frame, context, dispatcher)
    }
}

/// Maps absolute handler addresses to handler implementations.
pub struct HandlerRegistry<D: Deref<Target = [u8]>> {
    handlers: BTreeMap<u64, Box<dyn LanguageHandler<D>>>,
}

impl<D: Deref<Target = [u8]>> Default for HandlerRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Deref<Target = [u8]>> HandlerRegistry<D> {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, address: u64, handler: Box<dyn LanguageHandler<D>>) {
        if self.handlers.insert(address, handler).is_some() {
            log::warn!("replaced the language handler at 0x{:x}", address);
        }
    }

    /// Registers a closure as the handler at `address`.
    pub fn register_fn<F>(&mut self, address: u64, handler: F)
    where
        F: Fn(
                &SehRuntime<'_, D>,
                &mut ExceptionRecord,
                u64,
                &mut Context,
                &mut DispatcherContext,
            ) -> ExceptionDisposition
            + 'static,
    {
        self.register(address, Box::new(handler));
    }

    pub fn get(&self, address: u64) -> Option<&dyn LanguageHandler<D>> {
        self.handlers.get(&address).map(|handler| handler.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

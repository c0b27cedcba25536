//! Structured exception dispatch and stack unwinding driven by amd64 unwind
//! tables.
//!
//! Code is described by per-module function tables: sorted
//! `RUNTIME_FUNCTION` entries pointing at `UNWIND_INFO` blobs, the format
//! compilers emit into the `.pdata` and `.xdata` sections of an image. From
//! these tables alone this crate can:
//!
//!  - step a register context from a function to its caller
//!    ([`SehRuntime::virtual_unwind`]), including from inside a prologue
//!    or an epilogue,
//!  - find the frame whose language handler claims an exception
//!    ([`SehRuntime::dispatch_exception`]),
//!  - unwind to a target frame, running termination handlers on the way
//!    ([`SehRuntime::unwind`]),
//!  - capture diagnostic back traces ([`SehRuntime::capture_back_trace`]) and
//!    store them deduplicated in a [`StackTraceDatabase`].
//!
//! Nothing here touches the real machine. The thread's stack is read through
//! [`StackMemory`], handlers are Rust closures registered by address in a
//! [`HandlerRegistry`], and "resuming" means handing back a [`Context`].
//!
//! ```
//! use sehunwind::{
//!     Context, FixedEnvironment, FunctionTableDirectory, HandlerRegistry, Module, SehRuntime,
//!     SliceStack, StackLimits,
//! };
//!
//! let mut directory = FunctionTableDirectory::new();
//! directory.add_module(Module::new("empty".into(), 0x10000, vec![0u8; 0x100], 0..0));
//!
//! let stack = SliceStack::new(0x8000, vec![0; 16]);
//! let handlers = HandlerRegistry::new();
//! let environment = FixedEnvironment::new(StackLimits::new(0x8000, 0x8080));
//! let runtime = SehRuntime::new(&directory, &stack, &handlers, &environment);
//!
//! // No table entry covers 0x10010, so the walk treats it as a leaf and stops
//! // when the return address on the stack is zero.
//! let trace = runtime.capture_back_trace(&Context::new(0x10010, 0x8000), 0, 8);
//! assert_eq!(trace.frames, vec![0x10010]);
//! ```

mod context;
mod dispatcher;
mod display_utils;
mod error;
mod exception;
mod exception_log;
mod frame_walker;
mod function_table;
mod handler;
mod history;
mod image;
mod instruction_analysis;
mod memory;
mod runtime;
mod runtime_function;
#[cfg(feature = "trace-database")]
mod trace_db;
mod unwind;
mod virtual_unwind;

pub mod x86_64;

pub use context::{Context, ContextPointers, Reg};
pub use error::Error;
pub use exception::{
    DispatcherContext, ExceptionCode, ExceptionDisposition, ExceptionFlags, ExceptionRecord,
    EXCEPTION_MAXIMUM_PARAMETERS,
};
pub use exception_log::{ExceptionLog, ExceptionLogEntry, DEFAULT_EXCEPTION_LOG_CAPACITY};
pub use frame_walker::{BackTrace, FrameWalk};
pub use function_table::{FunctionTableCallback, FunctionTableDirectory};
pub use handler::{HandlerRegistry, LanguageHandler};
pub use history::{HistoryMode, HistoryTable, UNWIND_HISTORY_TABLE_SIZE};
pub use image::{ImageError, ImageView, Module};
pub use instruction_analysis::{Epilogue, EpilogueExit, InstructionDecoder, StackAdjustment};
pub use memory::{SliceStack, StackLimits, StackMemory};
pub use runtime::{FixedEnvironment, RaiseOutcome, RuntimeConfig, SehRuntime, ThreadEnvironment};
pub use runtime_function::{FunctionEntry, RuntimeFunction};
#[cfg(feature = "trace-database")]
pub use trace_db::{StackTraceDatabase, StackTraceEntry, MAX_STACK_DEPTH};
pub use unwind::UnwindOutcome;
pub use virtual_unwind::{HandlerRef, VirtualUnwind};

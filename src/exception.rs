use std::fmt::Debug;

use arrayvec::ArrayVec;
use bitflags::bitflags;

use crate::context::Context;
use crate::display_utils::HexNum;
use crate::history::HistoryTable;
use crate::runtime_function::FunctionEntry;

/// The most parameters an exception record carries.
pub const EXCEPTION_MAXIMUM_PARAMETERS: usize = 15;

/// An NT status code identifying an exception.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExceptionCode(pub u32);

impl ExceptionCode {
    pub const ACCESS_VIOLATION: Self = Self(0xC000_0005);
    pub const NONCONTINUABLE_EXCEPTION: Self = Self(0xC000_0025);
    pub const INVALID_DISPOSITION: Self = Self(0xC000_0026);
    pub const UNWIND: Self = Self(0xC000_0027);
    pub const BAD_STACK: Self = Self(0xC000_0028);
    pub const BAD_FUNCTION_TABLE: Self = Self(0xC000_00FF);
    pub const UNWIND_CONSOLIDATE: Self = Self(0x8000_0029);
    pub const BREAKPOINT: Self = Self(0x8000_0003);
    pub const INTEGER_DIVIDE_BY_ZERO: Self = Self(0xC000_0094);
}

impl Debug for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExceptionCode({:#010x})", self.0)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ExceptionFlags: u32 {
        const NONCONTINUABLE = 0x01;
        const UNWINDING = 0x02;
        const EXIT_UNWIND = 0x04;
        const STACK_INVALID = 0x08;
        const NESTED_CALL = 0x10;
        const TARGET_UNWIND = 0x20;
        const COLLIDED_UNWIND = 0x40;
    }
}

/// Describes one exception. Exceptions raised while handling another chain
/// the earlier record through `previous`.
#[derive(Clone, PartialEq, Eq)]
pub struct ExceptionRecord {
    pub code: ExceptionCode,
    pub flags: ExceptionFlags,
    pub previous: Option<Box<ExceptionRecord>>,
    /// Where the exception happened.
    pub address: u64,
    pub parameters: ArrayVec<u64, EXCEPTION_MAXIMUM_PARAMETERS>,
}

impl ExceptionRecord {
    pub fn new(code: ExceptionCode, address: u64) -> Self {
        Self {
            code,
            flags: ExceptionFlags::empty(),
            previous: None,
            address,
            parameters: ArrayVec::new(),
        }
    }

    pub fn noncontinuable(mut self) -> Self {
        self.flags |= ExceptionFlags::NONCONTINUABLE;
        self
    }

    /// Adds a parameter, ignoring it once the record is full.
    pub fn with_parameter(mut self, parameter: u64) -> Self {
        let _ = self.parameters.try_push(parameter);
        self
    }

    pub fn with_previous(mut self, previous: ExceptionRecord) -> Self {
        self.previous = Some(Box::new(previous));
        self
    }

    pub fn is_noncontinuable(&self) -> bool {
        self.flags.contains(ExceptionFlags::NONCONTINUABLE)
    }

    /// The chain of records from this one to the oldest.
    pub fn chain(&self) -> impl Iterator<Item = &ExceptionRecord> {
        std::iter::successors(Some(self), |record| record.previous.as_deref())
    }
}

impl Debug for ExceptionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionRecord")
            .field("code", &self.code)
            .field("flags", &self.flags)
            .field("address", &HexNum(self.address))
            .field("parameters", &self.parameters)
            .field("previous", &self.previous)
            .finish()
    }
}

/// What a language handler tells the dispatcher or unwinder to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExceptionDisposition {
    ContinueExecution,
    ContinueSearch,
    NestedException,
    CollidedUnwind,
    /// A raw value outside the defined set. Always rejected.
    Other(u32),
}

impl ExceptionDisposition {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::ContinueExecution,
            1 => Self::ContinueSearch,
            2 => Self::NestedException,
            3 => Self::CollidedUnwind,
            other => Self::Other(other),
        }
    }

    pub fn into_raw(self) -> u32 {
        match self {
            Self::ContinueExecution => 0,
            Self::ContinueSearch => 1,
            Self::NestedException => 2,
            Self::CollidedUnwind => 3,
            Self::Other(raw) => raw,
        }
    }
}

/// The per-frame state handed to a language handler.
///
/// A handler that detects a collision with an earlier dispatch or unwind
/// overwrites this with the state saved by that walk and returns
/// [`ExceptionDisposition::CollidedUnwind`]; the walk then resumes from it.
#[derive(Clone)]
pub struct DispatcherContext {
    pub control_pc: u64,
    pub function_entry: FunctionEntry,
    pub establisher_frame: u64,
    /// Only set during an unwind.
    pub target_ip: Option<u64>,
    /// While dispatching, the caller's state after this frame was unwound.
    /// While unwinding, the frame's own state before it is unwound.
    pub context_record: Context,
    /// Absolute address of the language handler.
    pub language_handler: u64,
    /// Absolute address of the handler data in the image.
    pub handler_data: u64,
    pub history_table: HistoryTable,
    /// Handler-private progress marker, starting at 0 for each frame.
    pub scope_index: u32,
}

impl DispatcherContext {
    pub fn image_base(&self) -> u64 {
        self.function_entry.image_base
    }
}

impl Debug for DispatcherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherContext")
            .field("control_pc", &HexNum(self.control_pc))
            .field("function_entry", &self.function_entry)
            .field("establisher_frame", &HexNum(self.establisher_frame))
            .field("target_ip", &self.target_ip.map(HexNum))
            .field("language_handler", &HexNum(self.language_handler))
            .field("handler_data", &HexNum(self.handler_data))
            .field("scope_index", &self.scope_index)
            .finish()
    }
}

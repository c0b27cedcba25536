use crate::exception::ExceptionCode;
use crate::image::ImageError;
use crate::x86_64::UnwindInfoError;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Could not read stack memory at 0x{0:x}")]
    CouldNotReadStack(u64),

    #[error("Unwinding caused integer overflow")]
    IntegerOverflow,

    #[error("Bad unwind info: {0}")]
    UnwindInfo(#[from] UnwindInfoError),

    #[error("Bad image memory access: {0}")]
    Image(#[from] ImageError),

    #[error("Establisher frame 0x{0:x} is unaligned, outside the stack limits, or above the unwind target")]
    BadStack(u64),

    #[error("Unwinding made no progress, the function tables are malformed")]
    BadFunctionTable,

    #[error("Handler returned invalid disposition {0}")]
    InvalidDisposition(u32),

    #[error("Handler continued execution of a noncontinuable exception")]
    NonContinuableException,

    #[error("No language handler is registered at 0x{0:x}")]
    UnknownHandler(u64),
}

impl Error {
    /// The status code raised as a new exception when this error escalates.
    pub fn exception_code(&self) -> ExceptionCode {
        match self {
            Error::BadStack(_) => ExceptionCode::BAD_STACK,
            Error::BadFunctionTable | Error::UnwindInfo(_) => ExceptionCode::BAD_FUNCTION_TABLE,
            Error::InvalidDisposition(_) => ExceptionCode::INVALID_DISPOSITION,
            Error::NonContinuableException => ExceptionCode::NONCONTINUABLE_EXCEPTION,
            Error::CouldNotReadStack(_)
            | Error::IntegerOverflow
            | Error::Image(_)
            | Error::UnknownHandler(_) => ExceptionCode::ACCESS_VIOLATION,
        }
    }

    /// The faulting address to report in the escalated record, if any.
    pub(crate) fn fault_address(&self) -> Option<u64> {
        match *self {
            Error::CouldNotReadStack(address)
            | Error::BadStack(address)
            | Error::UnknownHandler(address) => Some(address),
            _ => None,
        }
    }
}

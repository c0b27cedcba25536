mod builder;
mod epilogue;
mod unwind_info;

pub use builder::*;
pub use epilogue::*;
pub use unwind_info::*;

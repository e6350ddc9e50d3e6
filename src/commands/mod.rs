//! The application modes.

pub mod addr2line;
pub mod compile;

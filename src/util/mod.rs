//! Helper functions, macros and diagnostics rendering

#[macro_use]
pub mod misc;
pub mod diag;

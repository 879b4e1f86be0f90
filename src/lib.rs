//! Streaming Thumb-2 machine-code writer.
//!
//! Emits ARM Thumb/Thumb-2 instructions into a caller-supplied buffer the
//! way code patchers and trampoline generators need them: in program order,
//! at a cursor tracking the runtime program counter, with forward branches
//! and 32-bit literal loads resolved by a final
//! [`flush`](writer::ThumbWriter::flush) pass that back-patches
//! displacements and lays down a deduplicated literal pool.
//!
//! Selectors pick the narrow (16-bit) encoding whenever the operands allow
//! it and fall back to the wide (32-bit) form otherwise; operands outside
//! every encodable range are reported as errors, never emitted.

#[macro_use]
pub mod util;

pub mod reg;
pub mod thumb;
pub mod writer;

//! Label handles and pending fixup records.

use std::fmt;
use std::panic;

/// Opaque label identity.
///
/// Labels are identified by value, not by name: the caller picks any stable
/// token and uses the same token for [`put_label`] and for the branches
/// that target it.
///
/// [`put_label`]: crate::writer::ThumbWriter::put_label
#[derive(Eq, Ord, Hash, Copy, Clone, Debug, PartialEq, PartialOrd)]
pub struct LabelId(pub u64);

impl fmt::Display for LabelId {
    #[inline(always)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A branch emitted before its target was known.
#[derive(Copy, Clone, Debug)]
pub(crate) struct LabelRef {
    pub(crate) id: LabelId,
    /// Byte offset of the placeholder halfword.
    pub(crate) insn_offset: usize,
    /// PC the processor uses for the displacement (emission pc + 4).
    pub(crate) pc: u64,
    /// Where the reference was emitted, for flush diagnostics.
    pub(crate) site: &'static panic::Location<'static>,
}

/// A pending `ldr Rt, =imm32` expansion, materialized by the literal pool.
#[derive(Copy, Clone, Debug)]
pub(crate) struct LiteralRef {
    pub(crate) val: u32,
    /// Byte offset of the placeholder's first halfword.
    pub(crate) insn_offset: usize,
    /// PC the processor uses for the displacement (emission pc + 4).
    pub(crate) pc: u64,
}

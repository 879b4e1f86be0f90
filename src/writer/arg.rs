//! Call-argument model for the AAPCS marshaller.

use crate::reg::Reg;

/// One argument of a synthesized call.
#[derive(Eq, Copy, Clone, Debug, PartialEq)]
pub enum Argument {
    /// An immediate value, materialized through the literal pool. Truncated
    /// to 32 bits: Thumb is a 32-bit execution state.
    Address(u64),
    /// A value already held in a register.
    Register(Reg),
}

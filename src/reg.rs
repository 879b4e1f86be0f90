//! Architectural registers visible from Thumb state.

/// An ARM core register.
///
/// SP, LR and PC take part in ordinary encodings as registers 13 to 15;
/// which forms accept them is decided by the individual selectors.
#[repr(u16)]
#[derive(Eq, Hash, Copy, Clone, Debug, PartialEq)]
pub enum Reg {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp = 13,
    Lr = 14,
    Pc = 15,
}

impl Reg {
    /// Registers carrying the first four AAPCS arguments.
    pub(crate) const ARGUMENT: [Reg; 4] = [Reg::R0, Reg::R1, Reg::R2, Reg::R3];

    /// The 4-bit register number used in encodings.
    #[inline(always)]
    pub const fn index(self) -> u16 {
        self as u16
    }

    /// Whether this is a low register (R0 to R7), reachable by narrow forms
    /// without a high-register flag.
    #[inline(always)]
    pub const fn is_low(self) -> bool {
        self.index() <= 7
    }

    /// Register number with the high bias removed, for encodings that split
    /// the number into a 3-bit field plus a separate "high" flag bit.
    #[inline(always)]
    pub const fn index_low3(self) -> u16 {
        self.index() & 7
    }
}

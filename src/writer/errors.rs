//! Error types for emission and flush.

use crate::util::diag;
use crate::writer::label::LabelId;

use std::error;
use std::fmt;
use std::panic;

/// The fixed-capacity table that overflowed.
#[derive(Eq, Copy, Clone, Debug, PartialEq)]
pub enum FixupTable {
    Labels,
    LabelRefs,
    LiteralRefs,
}

impl fmt::Display for FixupTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixupTable::Labels => write!(f, "label"),
            FixupTable::LabelRefs => write!(f, "label reference"),
            FixupTable::LiteralRefs => write!(f, "literal reference"),
        }
    }
}

/// Failure of a single emit call.
///
/// A failed emit leaves the buffer and the writer state untouched; every
/// variant is a programming error in the calling code.
#[derive(Eq, Copy, Clone, Debug, PartialEq)]
pub enum EmitError {
    /// Immediate or offset exceeds every encodable range.
    ImmediateOutOfRange {
        /// The offending value.
        value: i64,
        /// Smallest encodable value.
        min: i64,
        /// Largest encodable value.
        max: i64,
    },

    /// Value violates an alignment constraint.
    Misaligned {
        /// The offending value.
        value: i64,
        /// Required alignment in bytes.
        align: u32,
    },

    /// Byte sequences must be a whole number of halfwords.
    OddByteCount {
        /// Length of the rejected sequence.
        len: usize,
    },

    /// A fixed-capacity table is full.
    TableExhausted {
        /// Which table overflowed.
        table: FixupTable,
        /// Its capacity.
        capacity: usize,
    },

    /// The label id is already bound; labels are single assignment.
    LabelRedefined {
        /// The duplicated id.
        id: LabelId,
    },

    /// Push/pop needs at least one register.
    EmptyRegisterList,
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::ImmediateOutOfRange { value, min, max } => {
                write!(f, "immediate value {} out of range [{}..{}]", value, min, max)
            }
            EmitError::Misaligned { value, align } => {
                write!(f, "value {} is not a multiple of {}", value, align)
            }
            EmitError::OddByteCount { len } => {
                write!(f, "byte sequence length {} is not halfword aligned", len)
            }
            EmitError::TableExhausted { table, capacity } => {
                write!(f, "{} table exhausted (capacity {})", table, capacity)
            }
            EmitError::LabelRedefined { id } => {
                write!(f, "label {} is already defined", id)
            }
            EmitError::EmptyRegisterList => {
                write!(f, "register list is empty")
            }
        }
    }
}

impl error::Error for EmitError {}

/// Why a flush failed.
#[derive(Eq, Copy, Clone, Debug, PartialEq)]
pub enum FlushErrorKind {
    /// A referenced label was never defined.
    UnresolvedLabel {
        /// The undefined label.
        id: LabelId,
    },

    /// The resolved displacement exceeds the placeholder's field width.
    BranchOutOfRange {
        /// The target label.
        id: LabelId,
        /// Actual displacement in halfwords.
        distance: i64,
        /// Smallest encodable displacement.
        min: i64,
        /// Largest encodable displacement.
        max: i64,
    },
}

/// Flush failure, pointing at the emit call that created the offending
/// reference. Both pending tables are cleared before this is returned; the
/// buffer is left defined but incomplete and should be discarded.
#[derive(Copy, Clone)]
pub struct FlushError {
    /// What went wrong.
    pub kind: FlushErrorKind,
    site: &'static panic::Location<'static>,
}

impl FlushError {
    pub(crate) fn new(kind: FlushErrorKind, site: &'static panic::Location<'static>) -> Self {
        Self { kind, site }
    }

    /// Source location of the emit call behind the failing reference.
    #[inline(always)]
    pub fn site(&self) -> &'static panic::Location<'static> {
        self.site
    }
}

debug_from_display!(FlushError, newline);

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headline = match self.kind {
            FlushErrorKind::UnresolvedLabel { id } => {
                format!("unresolved label {}", id)
            }
            FlushErrorKind::BranchOutOfRange { id, distance, min, max } => {
                format!(
                    "branch to label {} out of range (displacement {} halfwords, allowed [{}..{}])",
                    id, distance, min, max
                )
            }
        };

        write!(f, "{}", diag::render_ref_site(&headline, self.site))
    }
}

impl error::Error for FlushError {}

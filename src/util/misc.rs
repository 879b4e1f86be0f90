//! Helper functions and macros

use num_traits::ToPrimitive;

/// Mask for the 5-bit `imm5` field of compare-and-branch patches.
pub const INT5_MASK: u16 = 0x001f;

/// Mask for the signed 8-bit displacement of conditional branches.
pub const INT8_MASK: u16 = 0x00ff;

/// Mask for the `imm10` field of 32-bit long branches.
pub const INT10_MASK: u32 = 0x03ff;

/// Mask for the signed 11-bit displacement of unconditional branches.
pub const INT11_MASK: u16 = 0x07ff;

/// Check if `v` fits a signed 8-bit displacement field.
///
/// # Examples
///
/// ```
/// use thumbwriter::util::misc::fits_into_int8;
///
/// assert!(fits_into_int8(-128));
/// assert!(fits_into_int8(127));
/// assert!(!fits_into_int8(128));
/// ```
#[inline(always)]
pub fn fits_into_int8<T: ToPrimitive>(v: T) -> bool {
    matches!(v.to_i64(), Some(v) if (-0x80..=0x7f).contains(&v))
}

/// Check if `v` fits a signed 11-bit displacement field.
#[inline(always)]
pub fn fits_into_int11<T: ToPrimitive>(v: T) -> bool {
    matches!(v.to_i64(), Some(v) if (-0x400..=0x3ff).contains(&v))
}

/// Check if `v` fits an unsigned 7-bit field.
#[inline(always)]
pub fn fits_into_uint7<T: ToPrimitive>(v: T) -> bool {
    matches!(v.to_u64(), Some(v) if v <= 0x7f)
}

/// Check if `v` fits an unsigned 8-bit field.
#[inline(always)]
pub fn fits_into_uint8<T: ToPrimitive>(v: T) -> bool {
    matches!(v.to_u64(), Some(v) if v <= 0xff)
}

/// Check if `v` fits an unsigned 12-bit field.
#[inline(always)]
pub fn fits_into_uint12<T: ToPrimitive>(v: T) -> bool {
    matches!(v.to_u64(), Some(v) if v <= 0xfff)
}

#[doc(hidden)]
macro_rules! debug_from_display {
    ($type: ty, newline) => {
        const _: fn() = || {
            fn assert_impl_display<T: std::fmt::Display>() {}
            assert_impl_display::<$type>();
        };

        impl std::fmt::Debug for $type {
            #[inline(always)]
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                writeln!(f)?;
                std::fmt::Display::fmt(self, f)
            }
        }
    };

    ($type: ty) => {
        const _: fn() = || {
            fn assert_impl_display<T: std::fmt::Display>() {}
            assert_impl_display::<$type>();
        };

        impl std::fmt::Debug for $type {
            #[inline(always)]
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(self, f)
            }
        }
    };
}

macro_rules! with_zero_offset {
    (
        $no_offset_name:ident,
        $(#[$meta:meta])*
        pub fn $name:ident(
            &mut $self:ident,
            $a:ident: $a_ty:ty,
            $b:ident: $b_ty:ty,
            $offset:ident: $offset_ty:ty $(,)?
        ) -> $ret:ty $body:block
    ) => {
        $(#[$meta])*
        pub fn $name(&mut $self, $a: $a_ty, $b: $b_ty, $offset: $offset_ty) -> $ret $body

        #[inline(always)]
        pub fn $no_offset_name(&mut $self, $a: $a_ty, $b: $b_ty) -> $ret {
            $self.$name($a, $b, 0)
        }
    };
}

macro_rules! cond_branch_aliases {
    ($($suffix:ident => $cond:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!(
                    "Emit a `b", stringify!($suffix),
                    "` to `id`, patched at flush time."
                )]
                #[track_caller]
                #[inline(always)]
                pub fn [<put_b $suffix _label>](
                    &mut self,
                    id: LabelId
                ) -> Result<(), EmitError> {
                    self.put_b_cond_label(Cond::$cond, id)
                }
            )*
        }
    };
}

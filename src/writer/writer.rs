//! Streaming Thumb-2 instruction writer

use crate::reg::Reg;
use crate::thumb::{self, Cond};
use crate::util::misc;
use crate::writer::arg::Argument;
use crate::writer::errors::{EmitError, FixupTable, FlushError, FlushErrorKind};
use crate::writer::label::{LabelId, LabelRef, LiteralRef};

use std::mem;
use std::panic;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Operating system the emitted code will run under. Selects the
/// breakpoint encoding; everything else is OS independent.
#[derive(Eq, Hash, Copy, Clone, Debug, PartialEq)]
pub enum TargetOs {
    Linux,
    Android,
    Other,
}

impl Default for TargetOs {
    #[inline]
    fn default() -> Self {
        if cfg!(target_os = "android") {
            TargetOs::Android
        } else if cfg!(target_os = "linux") {
            TargetOs::Linux
        } else {
            TargetOs::Other
        }
    }
}

/// Memory transfer direction, shared by the load/store selectors.
#[derive(Eq, Copy, Clone, Debug, PartialEq)]
enum MemoryOperation {
    Load,
    Store,
}

/// Streaming Thumb-2 instruction writer.
///
/// Emits instructions into a caller-supplied buffer at a cursor, tracking
/// the program-counter value the processor will see at that cursor (the
/// buffer may be written at a different address than it will execute at;
/// pass the runtime address as `pc`). Forward branches and 32-bit literal
/// loads are emitted as placeholders and resolved by [`flush`], which also
/// lays down a deduplicated literal pool after the last instruction.
///
/// The buffer must be large enough for everything emitted into it,
/// including the literal pool; running out of space is a caller bug and
/// panics. A writer is strictly sequential and single threaded; independent
/// writers over disjoint buffers do not interfere.
///
/// [`flush`]: Self::flush
///
/// # Examples
///
/// ```
/// use thumbwriter::reg::Reg;
/// use thumbwriter::writer::ThumbWriter;
///
/// let mut code = [0u8; 16];
/// let mut w = ThumbWriter::new(&mut code, 0x1000);
/// w.put_push_regs(&[Reg::R4, Reg::R5, Reg::Lr])?;
/// w.put_nop();
/// w.put_pop_regs(&[Reg::R4, Reg::R5, Reg::Pc])?;
/// w.flush()?;
/// assert_eq!(&code[..6], &[0x30, 0xb5, 0xc0, 0x46, 0x30, 0xbd]);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct ThumbWriter<'a> {
    buf: &'a mut [u8],

    target_os: TargetOs,

    base_pc: u64,
    cursor: usize,
    pc: u64,

    labels: FxHashMap<LabelId, u64>,
    label_refs: Vec<LabelRef>,
    literal_refs: Vec<LiteralRef>,
}

impl<'a> ThumbWriter<'a> {
    /// Resolved labels the writer can hold between resets.
    pub const MAX_LABEL_COUNT: usize = 100;

    /// Pending forward branches the writer can hold between flushes.
    pub const MAX_LABEL_REF_COUNT: usize = 3 * Self::MAX_LABEL_COUNT;

    /// Pending literal loads the writer can hold between flushes.
    pub const MAX_LITERAL_REF_COUNT: usize = 100;

    /// Create a writer over `buf`, executing at address `pc`.
    pub fn new(buf: &'a mut [u8], pc: u64) -> Self {
        Self {
            buf,
            target_os: TargetOs::default(),
            base_pc: pc,
            cursor: 0,
            pc,
            labels: FxHashMap::default(),
            label_refs: Vec::with_capacity(Self::MAX_LABEL_REF_COUNT),
            literal_refs: Vec::with_capacity(Self::MAX_LITERAL_REF_COUNT),
        }
    }

    /// Rebind to a fresh buffer and runtime address, dropping any resolved
    /// labels and pending fixups. The target OS reverts to the host
    /// default.
    pub fn reset(&mut self, buf: &'a mut [u8], pc: u64) {
        self.buf = buf;
        self.target_os = TargetOs::default();
        self.base_pc = pc;
        self.cursor = 0;
        self.pc = pc;
        self.labels.clear();
        self.label_refs.clear();
        self.literal_refs.clear();
    }

    #[inline(always)]
    pub fn set_target_os(&mut self, os: TargetOs) {
        self.target_os = os;
    }

    #[inline(always)]
    pub const fn target_os(&self) -> TargetOs {
        self.target_os
    }

    /// Bytes emitted since the start of the buffer.
    #[inline(always)]
    pub const fn offset(&self) -> usize {
        self.cursor
    }

    /// Program-counter value at the current cursor.
    #[inline(always)]
    pub const fn pc(&self) -> u64 {
        self.pc
    }

    /// Runtime address of the start of the buffer.
    #[inline(always)]
    pub const fn base_pc(&self) -> u64 {
        self.base_pc
    }

    /// Advance cursor and pc by `n_bytes` without writing, leaving room the
    /// caller fills in by other means.
    #[inline]
    pub fn skip(&mut self, n_bytes: usize) {
        self.cursor += n_bytes;
        self.pc += n_bytes as u64;
    }

    // ----- RAW EMISSION -----

    /// Append one halfword, little-endian.
    pub fn put_instruction(&mut self, insn: u16) {
        assert!(
            self.cursor + 2 <= self.buf.len(),
            "output buffer exhausted at offset {}",
            self.cursor
        );
        self.buf[self.cursor..self.cursor + 2].copy_from_slice(&insn.to_le_bytes());
        self.cursor += 2;
        self.pc += 2;
    }

    /// Append raw bytes; the length must be a whole number of halfwords.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<(), EmitError> {
        if bytes.len() % 2 != 0 {
            return Err(EmitError::OddByteCount { len: bytes.len() });
        }

        assert!(
            self.cursor + bytes.len() <= self.buf.len(),
            "output buffer exhausted at offset {}",
            self.cursor
        );
        self.buf[self.cursor..self.cursor + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len();
        self.pc += bytes.len() as u64;

        Ok(())
    }

    #[inline(always)]
    fn read_insn(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.buf[offset], self.buf[offset + 1]])
    }

    #[inline(always)]
    fn patch_insn(&mut self, offset: usize, insn: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&insn.to_le_bytes());
    }

    // ----- LABELS -----

    /// Bind `id` to the current pc. Labels are single assignment; binding
    /// the same id twice is a hard error.
    pub fn put_label(&mut self, id: LabelId) -> Result<(), EmitError> {
        if self.labels.contains_key(&id) {
            return Err(EmitError::LabelRedefined { id });
        }
        if self.labels.len() == Self::MAX_LABEL_COUNT {
            return Err(EmitError::TableExhausted {
                table: FixupTable::Labels,
                capacity: Self::MAX_LABEL_COUNT,
            });
        }

        self.labels.insert(id, self.pc);
        Ok(())
    }

    #[track_caller]
    fn add_label_reference_here(&mut self, id: LabelId) -> Result<(), EmitError> {
        if self.label_refs.len() == Self::MAX_LABEL_REF_COUNT {
            return Err(EmitError::TableExhausted {
                table: FixupTable::LabelRefs,
                capacity: Self::MAX_LABEL_REF_COUNT,
            });
        }

        self.label_refs.push(LabelRef {
            id,
            insn_offset: self.cursor,
            pc: self.pc + 4,
            site: panic::Location::caller(),
        });
        Ok(())
    }

    fn add_literal_reference_here(&mut self, val: u32) -> Result<(), EmitError> {
        if self.literal_refs.len() == Self::MAX_LITERAL_REF_COUNT {
            return Err(EmitError::TableExhausted {
                table: FixupTable::LiteralRefs,
                capacity: Self::MAX_LITERAL_REF_COUNT,
            });
        }

        self.literal_refs.push(LiteralRef {
            val,
            insn_offset: self.cursor,
            pc: self.pc + 4,
        });
        Ok(())
    }

    // ----- BRANCHES AND CALLS -----

    /// `b.w` to an absolute Thumb target.
    #[inline(always)]
    pub fn put_b_imm(&mut self, target: u64) {
        self.put_branch_imm(target, false, true);
    }

    /// `bl` to an absolute Thumb target.
    #[inline(always)]
    pub fn put_bl_imm(&mut self, target: u64) {
        self.put_branch_imm(target, true, true);
    }

    /// `blx` to an absolute ARM-state target.
    #[inline(always)]
    pub fn put_blx_imm(&mut self, target: u64) {
        self.put_branch_imm(target, true, false);
    }

    fn put_branch_imm(&mut self, target: u64, link: bool, to_thumb: bool) {
        let distance = ((target & !1) as i32).wrapping_sub((self.pc + 4) as i32) / 2;

        let [first, second] = thumb::branch_long(distance, link, to_thumb);
        self.put_instruction(first);
        self.put_instruction(second);
    }

    /// `bx Rm`
    #[inline(always)]
    pub fn put_bx_reg(&mut self, reg: Reg) {
        self.put_instruction(thumb::bx(reg));
    }

    /// `blx Rm`
    #[inline(always)]
    pub fn put_blx_reg(&mut self, reg: Reg) {
        self.put_instruction(thumb::blx(reg));
    }

    /// `b` to `id`, patched at flush time. Reaches targets within
    /// [-1024..1023] halfwords of the reference pc.
    #[track_caller]
    pub fn put_b_label(&mut self, id: LabelId) -> Result<(), EmitError> {
        self.add_label_reference_here(id)?;
        self.put_instruction(thumb::B_T2);
        Ok(())
    }

    /// `b<c>` to `id`, patched at flush time. Reaches targets within
    /// [-128..127] halfwords of the reference pc.
    #[track_caller]
    pub fn put_b_cond_label(&mut self, cc: Cond, id: LabelId) -> Result<(), EmitError> {
        self.add_label_reference_here(id)?;
        self.put_instruction(thumb::b_cond(cc));
        Ok(())
    }

    cond_branch_aliases! {
        eq => Eq,
        ne => Ne,
    }

    /// `cbz Rn, id`, patched at flush time. Rn must be a low register; the
    /// target must lie forward of the reference pc.
    #[track_caller]
    pub fn put_cbz_reg_label(&mut self, reg: Reg, id: LabelId) -> Result<(), EmitError> {
        debug_assert!(reg.is_low(), "cbz only encodes low registers");

        self.add_label_reference_here(id)?;
        self.put_instruction(thumb::cbz(reg));
        Ok(())
    }

    /// `cbnz Rn, id`, patched at flush time. Same constraints as
    /// [`put_cbz_reg_label`](Self::put_cbz_reg_label).
    #[track_caller]
    pub fn put_cbnz_reg_label(&mut self, reg: Reg, id: LabelId) -> Result<(), EmitError> {
        debug_assert!(reg.is_low(), "cbnz only encodes low registers");

        self.add_label_reference_here(id)?;
        self.put_instruction(thumb::cbnz(reg));
        Ok(())
    }

    // ----- DATA PROCESSING -----

    /// `cmp Rn, #imm8`; Rn must be a low register.
    pub fn put_cmp_reg_imm(&mut self, reg: Reg, imm: u8) {
        debug_assert!(reg.is_low(), "cmp #imm8 only encodes low registers");

        self.put_instruction(thumb::cmp_imm8(reg, imm));
    }

    /// Register move. Low-to-low moves use the narrow form (encoded as
    /// `adds Rd, Rm, #0`); anything involving a high register uses the
    /// 4-bit-field form.
    pub fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        let insn = if dst.is_low() && src.is_low() {
            thumb::mov_narrow(dst, src)
        } else {
            thumb::mov_any(dst, src)
        };

        self.put_instruction(insn);
    }

    /// `movs Rd, #imm8`; Rd must be a low register.
    pub fn put_mov_reg_u8(&mut self, dst: Reg, imm: u8) {
        debug_assert!(dst.is_low(), "mov #imm8 only encodes low registers");

        self.put_instruction(thumb::mov_imm8(dst, imm));
    }

    /// In-place add of a signed immediate. SP takes the word-scaled adjust
    /// form (magnitude up to 508, multiple of 4); other destinations the
    /// 8-bit form (magnitude up to 255).
    pub fn put_add_reg_imm(&mut self, dst: Reg, imm: i32) -> Result<(), EmitError> {
        let magnitude = imm.unsigned_abs();

        let insn = if dst == Reg::Sp {
            if imm % 4 != 0 {
                return Err(EmitError::Misaligned {
                    value: imm as i64,
                    align: 4,
                });
            }
            if !misc::fits_into_uint7(magnitude / 4) {
                return Err(EmitError::ImmediateOutOfRange {
                    value: imm as i64,
                    min: -508,
                    max: 508,
                });
            }
            thumb::add_sp_imm7(imm < 0, (magnitude / 4) as u16)
        } else {
            debug_assert!(dst.is_low(), "add #imm8 only encodes low registers");

            if !misc::fits_into_uint8(magnitude) {
                return Err(EmitError::ImmediateOutOfRange {
                    value: imm as i64,
                    min: -255,
                    max: 255,
                });
            }
            thumb::add_imm8(imm < 0, dst, magnitude as u16)
        };

        self.put_instruction(insn);
        Ok(())
    }

    /// In-place subtract of a signed immediate; the negated
    /// [`put_add_reg_imm`](Self::put_add_reg_imm).
    #[inline(always)]
    pub fn put_sub_reg_imm(&mut self, dst: Reg, imm: i32) -> Result<(), EmitError> {
        self.put_add_reg_imm(dst, imm.wrapping_neg())
    }

    /// `add Rd, Rm` in place.
    #[inline(always)]
    pub fn put_add_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.put_add_reg_reg_reg(dst, dst, src);
    }

    /// Three-register add. When the destination equals the left operand the
    /// in-place form is used, which also encodes high registers; otherwise
    /// all three must be low.
    pub fn put_add_reg_reg_reg(&mut self, dst: Reg, left: Reg, right: Reg) {
        let insn = if left == dst {
            thumb::add_inplace(dst, right)
        } else {
            debug_assert!(
                dst.is_low() && left.is_low() && right.is_low(),
                "three-register add only encodes low registers"
            );
            thumb::add_regs(dst, left, right)
        };

        self.put_instruction(insn);
    }

    /// Three-operand add with immediate. SP/PC bases take the word-scaled
    /// address-generation form (non-negative, up to 1020); general bases
    /// the 3-bit form (magnitude up to 7).
    pub fn put_add_reg_reg_imm(&mut self, dst: Reg, left: Reg, imm: i32) -> Result<(), EmitError> {
        if left == dst {
            return self.put_add_reg_imm(dst, imm);
        }

        let insn = if left == Reg::Sp || left == Reg::Pc {
            if imm % 4 != 0 {
                return Err(EmitError::Misaligned {
                    value: imm as i64,
                    align: 4,
                });
            }
            if imm < 0 || !misc::fits_into_uint8(imm / 4) {
                return Err(EmitError::ImmediateOutOfRange {
                    value: imm as i64,
                    min: 0,
                    max: 1020,
                });
            }
            thumb::add_sp_pc_imm8(left == Reg::Sp, dst, (imm / 4) as u16)
        } else {
            if imm.unsigned_abs() > 7 {
                return Err(EmitError::ImmediateOutOfRange {
                    value: imm as i64,
                    min: -7,
                    max: 7,
                });
            }
            thumb::add_imm3(imm < 0, dst, left, imm.unsigned_abs() as u16)
        };

        self.put_instruction(insn);
        Ok(())
    }

    /// `sub Rd, Rm` in place.
    #[inline(always)]
    pub fn put_sub_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.put_sub_reg_reg_reg(dst, dst, src);
    }

    /// Three-register subtract; all registers must be low.
    pub fn put_sub_reg_reg_reg(&mut self, dst: Reg, left: Reg, right: Reg) {
        debug_assert!(
            dst.is_low() && left.is_low() && right.is_low(),
            "three-register sub only encodes low registers"
        );

        self.put_instruction(thumb::sub_regs(dst, left, right));
    }

    /// Three-operand subtract with immediate; the negated
    /// [`put_add_reg_reg_imm`](Self::put_add_reg_reg_imm).
    #[inline(always)]
    pub fn put_sub_reg_reg_imm(&mut self, dst: Reg, left: Reg, imm: i32) -> Result<(), EmitError> {
        self.put_add_reg_reg_imm(dst, left, imm.wrapping_neg())
    }

    // ----- PUSH / POP -----

    /// Push registers, lowest numbered at the lowest address. The narrow
    /// encoding is used when every register is low or LR.
    pub fn put_push_regs(&mut self, regs: &[Reg]) -> Result<(), EmitError> {
        self.put_push_or_pop_regs(thumb::PUSH_T1, thumb::PUSH_W, Reg::Lr, regs)
    }

    /// Pop registers. The narrow encoding is used when every register is
    /// low or PC.
    pub fn put_pop_regs(&mut self, regs: &[Reg]) -> Result<(), EmitError> {
        self.put_push_or_pop_regs(thumb::POP_T1, thumb::POP_W, Reg::Pc, regs)
    }

    fn put_push_or_pop_regs(
        &mut self,
        narrow_opcode: u16,
        wide_opcode: u16,
        special: Reg,
        regs: &[Reg],
    ) -> Result<(), EmitError> {
        if regs.is_empty() {
            return Err(EmitError::EmptyRegisterList);
        }

        let need_wide = regs.iter().any(|&r| !r.is_low() && r != special);

        if need_wide {
            let mut mask: u16 = 0;
            for r in regs {
                mask |= 1 << r.index();
            }

            self.put_instruction(wide_opcode);
            self.put_instruction(mask);
        } else {
            let mut insn = narrow_opcode;
            for &r in regs {
                if r == special {
                    insn |= 0x0100;
                } else {
                    insn |= 1 << r.index();
                }
            }

            self.put_instruction(insn);
        }

        Ok(())
    }

    // ----- LOADS / STORES -----

    /// Load an absolute address via the literal pool.
    #[inline(always)]
    pub fn put_ldr_reg_address(&mut self, reg: Reg, address: u64) -> Result<(), EmitError> {
        self.put_ldr_reg_u32(reg, address as u32)
    }

    /// Load a 32-bit constant via the literal pool. Emits a placeholder
    /// `ldr Rt, [pc, #0]` (narrow for low destinations, wide otherwise)
    /// whose displacement is patched when [`flush`](Self::flush) lays the
    /// pool down.
    pub fn put_ldr_reg_u32(&mut self, reg: Reg, val: u32) -> Result<(), EmitError> {
        self.add_literal_reference_here(val)?;

        if reg.is_low() {
            self.put_instruction(thumb::ldr_lit_t1(reg, 0));
        } else {
            let [first, second] = thumb::ldr_lit_w(reg);
            self.put_instruction(first);
            self.put_instruction(second);
        }

        Ok(())
    }

    with_zero_offset! {
        put_ldr_reg_reg,
        /// Load a word from `[base, #offset]`, choosing the narrowest
        /// encoding the operands allow. Offsets beyond 4095 are not
        /// encodable.
        pub fn put_ldr_reg_reg_offset(
            &mut self,
            dst: Reg,
            base: Reg,
            offset: u32,
        ) -> Result<(), EmitError> {
            self.put_transfer_reg_reg_offset(MemoryOperation::Load, dst, base, offset)
        }
    }

    with_zero_offset! {
        put_str_reg_reg,
        /// Store a word to `[base, #offset]`. Same encoding selection as
        /// [`put_ldr_reg_reg_offset`](Self::put_ldr_reg_reg_offset).
        pub fn put_str_reg_reg_offset(
            &mut self,
            src: Reg,
            base: Reg,
            offset: u32,
        ) -> Result<(), EmitError> {
            self.put_transfer_reg_reg_offset(MemoryOperation::Store, src, base, offset)
        }
    }

    fn put_transfer_reg_reg_offset(
        &mut self,
        operation: MemoryOperation,
        reg: Reg,
        base: Reg,
        offset: u32,
    ) -> Result<(), EmitError> {
        let load = operation == MemoryOperation::Load;

        let narrow_limit = if base == Reg::Sp { 1020 } else { 124 };
        let narrow = reg.is_low()
            && (base.is_low() || base == Reg::Sp)
            && offset <= narrow_limit
            && offset % 4 == 0;

        if narrow {
            let words = (offset / 4) as u16;
            let insn = if base == Reg::Sp {
                thumb::xfer_sp_imm8(load, reg, words)
            } else {
                thumb::xfer_imm5(load, reg, base, words)
            };
            self.put_instruction(insn);
        } else {
            if !misc::fits_into_uint12(offset) {
                return Err(EmitError::ImmediateOutOfRange {
                    value: offset as i64,
                    min: 0,
                    max: 4095,
                });
            }

            let [first, second] = thumb::xfer_w_imm12(load, reg, base, offset as u16);
            self.put_instruction(first);
            self.put_instruction(second);
        }

        Ok(())
    }

    // ----- MISCELLANEOUS -----

    /// `nop`
    #[inline(always)]
    pub fn put_nop(&mut self) {
        self.put_instruction(thumb::NOP);
    }

    /// `bkpt #imm8`
    #[inline(always)]
    pub fn put_bkpt_imm(&mut self, imm: u8) {
        self.put_instruction(thumb::bkpt(imm));
    }

    /// OS-appropriate breakpoint: the undefined-instruction trap the kernel
    /// turns into a signal on Linux and Android, `bkpt #0; bx lr`
    /// elsewhere.
    pub fn put_breakpoint(&mut self) {
        match self.target_os {
            TargetOs::Linux | TargetOs::Android => self.put_instruction(thumb::UDF_TRAP),
            TargetOs::Other => {
                self.put_bkpt_imm(0);
                self.put_bx_reg(Reg::Lr);
            }
        }
    }

    // ----- CALLS WITH MARSHALLED ARGUMENTS -----

    /// Call an absolute address, marshalling `args` per AAPCS. The target
    /// goes through LR, which the call clobbers anyway.
    pub fn put_call_address_with_arguments<I>(
        &mut self,
        func: u64,
        args: I,
    ) -> Result<(), EmitError>
    where
        I: IntoIterator<Item = Argument>,
    {
        let args: SmallVec<[Argument; 8]> = args.into_iter().collect();
        self.put_call_address_with_arguments_array(func, &args)
    }

    /// Slice form of
    /// [`put_call_address_with_arguments`](Self::put_call_address_with_arguments).
    pub fn put_call_address_with_arguments_array(
        &mut self,
        func: u64,
        args: &[Argument],
    ) -> Result<(), EmitError> {
        self.put_argument_list_setup(args)?;

        self.put_ldr_reg_address(Reg::Lr, func)?;
        self.put_blx_reg(Reg::Lr);

        Ok(())
    }

    /// Call through `reg`, marshalling `args` per AAPCS.
    pub fn put_call_reg_with_arguments<I>(&mut self, reg: Reg, args: I) -> Result<(), EmitError>
    where
        I: IntoIterator<Item = Argument>,
    {
        let args: SmallVec<[Argument; 8]> = args.into_iter().collect();
        self.put_call_reg_with_arguments_array(reg, &args)
    }

    /// Slice form of
    /// [`put_call_reg_with_arguments`](Self::put_call_reg_with_arguments).
    pub fn put_call_reg_with_arguments_array(
        &mut self,
        reg: Reg,
        args: &[Argument],
    ) -> Result<(), EmitError> {
        self.put_argument_list_setup(args)?;

        self.put_blx_reg(reg);

        Ok(())
    }

    /// Lower an argument list: the first four into R0 to R3, the rest
    /// pushed in reverse order so the first stack argument ends up at the
    /// lowest address.
    fn put_argument_list_setup(&mut self, args: &[Argument]) -> Result<(), EmitError> {
        for (index, arg) in args.iter().enumerate().rev() {
            if index < Reg::ARGUMENT.len() {
                let target = Reg::ARGUMENT[index];
                match *arg {
                    Argument::Address(address) => {
                        self.put_ldr_reg_address(target, address)?;
                    }
                    Argument::Register(reg) if reg != target => {
                        self.put_mov_reg_reg(target, reg);
                    }
                    Argument::Register(_) => {}
                }
            } else {
                match *arg {
                    Argument::Address(address) => {
                        self.put_ldr_reg_address(Reg::R0, address)?;
                        self.put_push_regs(&[Reg::R0])?;
                    }
                    Argument::Register(reg) => {
                        self.put_push_regs(&[reg])?;
                    }
                }
            }
        }

        Ok(())
    }

    // ----- FLUSH -----

    /// Resolve every pending fixup: back-patch label references, then lay
    /// down the literal pool and patch the literal loads.
    ///
    /// On failure both pending tables are cleared and the buffer is left in
    /// a defined but incomplete state; treat it as a programming error and
    /// discard the buffer. After a successful flush both tables are empty
    /// and a second flush is a no-op.
    pub fn flush(&mut self) -> Result<(), FlushError> {
        if let Err(err) = self.patch_label_references() {
            self.label_refs.clear();
            self.literal_refs.clear();
            return Err(err);
        }

        self.commit_literal_pool();
        Ok(())
    }

    fn patch_label_references(&mut self) -> Result<(), FlushError> {
        let refs = mem::take(&mut self.label_refs);

        for r in &refs {
            let Some(&target) = self.labels.get(&r.id) else {
                return Err(FlushError::new(
                    FlushErrorKind::UnresolvedLabel { id: r.id },
                    r.site,
                ));
            };

            let distance = (target as i64 - r.pc as i64) / 2;
            let insn = self.read_insn(r.insn_offset);

            let patched = if insn & 0xf000 == 0xd000 {
                // conditional branch, signed 8-bit displacement
                if !misc::fits_into_int8(distance) {
                    return Err(FlushError::new(
                        FlushErrorKind::BranchOutOfRange {
                            id: r.id,
                            distance,
                            min: -0x80,
                            max: 0x7f,
                        },
                        r.site,
                    ));
                }
                insn | (distance as u16 & misc::INT8_MASK)
            } else if insn & 0xf800 == 0xe000 {
                // unconditional branch, signed 11-bit displacement
                if !misc::fits_into_int11(distance) {
                    return Err(FlushError::new(
                        FlushErrorKind::BranchOutOfRange {
                            id: r.id,
                            distance,
                            min: -0x400,
                            max: 0x3ff,
                        },
                        r.site,
                    ));
                }
                insn | (distance as u16 & misc::INT11_MASK)
            } else {
                // cbz/cbnz, forward-only displacement split into i:imm5
                if !misc::fits_into_uint7(distance) {
                    return Err(FlushError::new(
                        FlushErrorKind::BranchOutOfRange {
                            id: r.id,
                            distance,
                            min: 0,
                            max: 0x7f,
                        },
                        r.site,
                    ));
                }
                let i = (distance >> 5) as u16 & 1;
                let imm5 = distance as u16 & misc::INT5_MASK;
                insn | i << 9 | imm5 << 3
            };

            self.patch_insn(r.insn_offset, patched);
        }

        Ok(())
    }

    fn commit_literal_pool(&mut self) {
        if self.literal_refs.is_empty() {
            return;
        }

        let refs = mem::take(&mut self.literal_refs);

        // T1 loads take a word-scaled displacement from a word-aligned
        // base; give them a word-aligned pool.
        let need_aligned_slots = refs
            .iter()
            .any(|r| thumb::is_t1_literal_load(self.read_insn(r.insn_offset)));
        if need_aligned_slots && self.pc & 3 != 0 {
            self.put_nop();
        }

        let pool_pc = self.pc;
        let mut slots: SmallVec<[u32; 16]> = SmallVec::new();

        for r in &refs {
            let slot = match slots.iter().position(|&v| v == r.val) {
                Some(slot) => slot,
                None => {
                    slots.push(r.val);
                    // low halfword first: little-endian word
                    self.put_instruction(r.val as u16);
                    self.put_instruction((r.val >> 16) as u16);
                    slots.len() - 1
                }
            };

            let slot_pc = pool_pc + 4 * slot as u64;
            let distance = slot_pc - (r.pc & !3);

            let insn = self.read_insn(r.insn_offset);
            if thumb::is_t1_literal_load(insn) {
                debug_assert!(distance / 4 <= 0xff, "T1 literal displacement overflow");
                self.patch_insn(r.insn_offset, insn | (distance / 4) as u16);
            } else {
                debug_assert!(distance <= 0xfff, "wide literal displacement overflow");
                let second = self.read_insn(r.insn_offset + 2);
                self.patch_insn(r.insn_offset + 2, second | distance as u16);
            }
        }
    }
}

//! The code buffer and the emission of the machine code for each tape operation.
//!
//! Register usage of the generated function:
//!   rbp -> pointer to the current cell
//!   bl  -> cached value of the current cell, the rest of rbx is always zero
//!   r12 -> address of the out of bounds trap (checked mode only)
//!   r13 -> start of the tape (checked mode only)
//!   r14 -> end of the tape (checked mode only)
//!   r15 -> address of the output hook
//!   rax -> used for intermediate values

use log::debug;

use crate::{
    runtime::{
        tapejit_input_minus_one, tapejit_input_unchanged, tapejit_input_zero,
        tapejit_out_of_bounds, tapejit_output,
    },
    EofPolicy, Error,
};

use self::asm::{JmpPred, Reg, RegMem};

mod asm;
mod mul;

/// Length of the test and conditional jump guarding the entry of a loop.
const LOOP_GUARD_LEN: usize = 8;

/// Finished machine code of one program. The code implements a function taking
/// a pointer to the start and one past the end of the tape.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CompiledCode {
    pub(crate) code: Vec<u8>,
    pub(crate) bounds_checked: bool,
}

/// Relation between the cached value in `bl` and the current memory cell.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CacheState {
    /// Register and memory hold the same value.
    Clean,
    /// The register is stale and must be loaded before use.
    PendingLoad,
    /// The memory is stale and must be written before the pointer moves.
    PendingStore,
}

/// An open loop. `patch` is the offset of the loop body, which for guarded loops
/// directly follows the displacement of the guarding jump.
#[derive(Clone, Copy, Debug)]
struct LoopMark {
    patch: usize,
    guarded: bool,
}

/// Struct implementing the machine code emission.
pub(crate) struct CodeGen {
    code: Vec<u8>,
    bounds_checking: bool,
    eof: EofPolicy,
    loops: Vec<LoopMark>,
    copy_guard: Option<usize>,
    cache: CacheState,
}

impl Reg {
    /// Returns the register holding the pointer to the current cell.
    fn tape() -> Self {
        Reg::Rbp
    }

    /// Returns the register whose low byte caches the current cell.
    fn cache() -> Self {
        Reg::Rbx
    }

    /// Returns a register that can be used as a scratch register.
    fn scratch() -> Self {
        Reg::Rax
    }

    fn trap() -> Self {
        Reg::R12
    }

    fn start() -> Self {
        Reg::R13
    }

    fn end() -> Self {
        Reg::R14
    }

    fn output() -> Self {
        Reg::R15
    }
}

/// Memory operand for the cell at `offset` from the current one.
fn cell(offset: i32) -> RegMem {
    RegMem::Mem(Some(Reg::tape()), None, 1, offset)
}

/// Convert a displacement into a 32 bit value, failing if it does not fit.
fn rel32(distance: isize) -> Result<i32, Error> {
    i32::try_from(distance).map_err(|_| Error::JumpTooLarge { distance })
}

/// Convert a displacement into a 8 bit value, failing if it does not fit.
fn rel8(distance: isize) -> Result<i8, Error> {
    i8::try_from(distance).map_err(|_| Error::JumpTooLarge { distance })
}

impl CodeGen {
    /// Create a code buffer without emitting anything into it.
    fn empty(bounds_checking: bool, eof: EofPolicy) -> Self {
        CodeGen {
            code: Vec::new(),
            bounds_checking,
            eof,
            loops: Vec::new(),
            copy_guard: None,
            cache: CacheState::Clean,
        }
    }

    /// Create a new code buffer and emit the function prologue.
    pub fn new(bounds_checking: bool, eof: EofPolicy) -> Self {
        let mut gen = Self::empty(bounds_checking, eof);
        gen.emit_prologue();
        gen
    }

    fn emit_prologue(&mut self) {
        if self.bounds_checking {
            self.emit_push_r64(Reg::trap());
            self.emit_push_r64(Reg::start());
            self.emit_push_r64(Reg::end());
            self.emit_mov_r64_i64(Reg::trap(), tapejit_out_of_bounds as *const () as i64);
            self.emit_mov_r64_rm64(Reg::start(), RegMem::Reg(Reg::Rdi));
            self.emit_mov_r64_rm64(Reg::end(), RegMem::Reg(Reg::Rsi));
        }
        self.emit_push_r64(Reg::output());
        self.emit_mov_r64_i64(Reg::output(), tapejit_output as *const () as i64);
        self.emit_push_r64(Reg::cache());
        self.emit_xor_rm32_r32(RegMem::Reg(Reg::cache()), Reg::cache());
        self.emit_push_r64(Reg::tape());
        self.emit_mov_r64_rm64(Reg::tape(), RegMem::Reg(Reg::Rdi));
        if self.bounds_checking {
            // Three more pushes than in unchecked mode, realign for calls.
            self.emit_sub_rm64_i32(RegMem::Reg(Reg::Rsp), 8);
        }
    }

    fn emit_epilogue(&mut self) {
        if self.bounds_checking {
            self.emit_add_rm64_i32(RegMem::Reg(Reg::Rsp), 8);
        }
        self.emit_pop_r64(Reg::tape());
        self.emit_pop_r64(Reg::cache());
        self.emit_pop_r64(Reg::output());
        if self.bounds_checking {
            self.emit_pop_r64(Reg::end());
            self.emit_pop_r64(Reg::start());
            self.emit_pop_r64(Reg::trap());
        }
        self.emit_ret();
    }

    /// Write back the cached value, emit the epilogue and hand out the code.
    pub fn finish(mut self) -> Result<CompiledCode, Error> {
        if !self.loops.is_empty() {
            return Err(Error::NoOpenLoop);
        }
        self.store();
        self.emit_epilogue();
        debug!(
            "emitted {} bytes of machine code (bounds checks {})",
            self.code.len(),
            if self.bounds_checking { "on" } else { "off" }
        );
        Ok(CompiledCode {
            code: self.code,
            bounds_checked: self.bounds_checking,
        })
    }

    fn load(&mut self) {
        if self.cache == CacheState::PendingLoad {
            self.emit_mov_r8_rm8(Reg::cache(), cell(0));
            self.cache = CacheState::Clean;
        }
    }

    fn store(&mut self) {
        if self.cache == CacheState::PendingStore {
            self.emit_mov_rm8_r8(cell(0), Reg::cache());
            self.cache = CacheState::Clean;
        }
    }

    /// Patch the 8 bit displacement ending at `at` to jump to the current end.
    fn patch_forward_rel8(&mut self, at: usize) -> Result<(), Error> {
        let distance = rel8((self.code.len() - at) as isize)?;
        self.code[at - 1] = distance as u8;
        Ok(())
    }

    /// Patch the 32 bit displacement ending at `at` to jump to the current end.
    fn patch_forward_rel32(&mut self, at: usize) -> Result<(), Error> {
        let distance = rel32((self.code.len() - at) as isize)?;
        self.code[at - 4..at].copy_from_slice(&distance.to_le_bytes());
        Ok(())
    }

    /// Emit a check that the cell at `offset` from the current one is inside the
    /// tape. Calls the trap otherwise. Nothing is emitted in unchecked mode.
    pub fn bounds_check(&mut self, offset: i32) {
        if !self.bounds_checking || offset == 0 {
            return;
        }
        self.emit_lea_r64(Reg::scratch(), cell(offset));
        if offset < 0 {
            self.emit_cmp_r64_rm64(Reg::scratch(), RegMem::Reg(Reg::start()));
            self.emit_jcc_rel8(JmpPred::GreaterEqual, 3);
        } else {
            self.emit_cmp_r64_rm64(Reg::scratch(), RegMem::Reg(Reg::end()));
            self.emit_jcc_rel8(JmpPred::Less, 3);
        }
        self.emit_call_ind(RegMem::Reg(Reg::trap()));
    }

    /// Move the pointer by `count` cells without checking the destination.
    pub fn move_pointer_unchecked(&mut self, count: i32) {
        if count == 0 {
            return;
        }
        self.store();
        self.emit_add_rm64_i32(RegMem::Reg(Reg::tape()), count);
        self.cache = CacheState::PendingLoad;
    }

    /// Move the pointer by `count` cells.
    pub fn move_pointer(&mut self, count: i32) {
        self.bounds_check(count);
        self.move_pointer_unchecked(count);
    }

    /// Add `count` to the current cell.
    pub fn add(&mut self, count: u8) {
        if count == 0 {
            return;
        }
        self.load();
        self.emit_add_rm8_i8(RegMem::Reg(Reg::cache()), count as i8);
        self.cache = CacheState::PendingStore;
    }

    /// Add `count` to the cell at `offset` directly in memory. The access is not
    /// checked, the caller must have covered `offset` by a bounds check.
    pub fn add_at_offset(&mut self, count: u8, offset: i32) {
        debug_assert!(offset != 0);
        if count != 0 {
            self.emit_add_rm8_i8(cell(offset), count as i8);
        }
    }

    /// Set the current cell to `value`.
    pub fn set(&mut self, value: u8) {
        if value == 0 {
            self.emit_xor_rm32_r32(RegMem::Reg(Reg::cache()), Reg::cache());
        } else {
            self.emit_mov_r8_i8(Reg::cache(), value);
        }
        self.cache = CacheState::PendingStore;
    }

    /// Pass the current cell to the output hook.
    pub fn output(&mut self) {
        self.load();
        self.emit_movzx_r32_rm8(Reg::Rdi, RegMem::Reg(Reg::cache()));
        self.emit_call_ind(RegMem::Reg(Reg::output()));
    }

    /// Read a byte into the current cell using the hook of the end-of-file policy.
    pub fn input(&mut self) {
        let hook = match self.eof {
            EofPolicy::Zero => tapejit_input_zero as *const () as usize,
            EofPolicy::MinusOne => tapejit_input_minus_one as *const () as usize,
            EofPolicy::Unchanged => {
                self.load();
                self.emit_movzx_r32_rm8(Reg::Rdi, RegMem::Reg(Reg::cache()));
                tapejit_input_unchanged as *const () as usize
            }
        };
        self.emit_mov_r64_i64(Reg::scratch(), hook as i64);
        self.emit_call_ind(RegMem::Reg(Reg::scratch()));
        self.emit_mov_rm8_r8(RegMem::Reg(Reg::cache()), Reg::scratch());
        self.cache = CacheState::PendingStore;
    }

    /// Start a sequence of [`Self::multiply_add`] operations that is skipped if
    /// the current cell is zero.
    pub fn start_copy_seq(&mut self) {
        self.load();
        self.emit_test_rm8_r8(RegMem::Reg(Reg::cache()), Reg::cache());
        self.emit_jcc_rel8(JmpPred::Equal, 0);
        self.copy_guard = Some(self.code.len());
    }

    /// Add the current cell times `multiplier` to the cell at `offset`. The access
    /// is not checked, the caller must have covered `offset` by a bounds check.
    pub fn multiply_add(&mut self, offset: i32, multiplier: u8) {
        debug_assert!(offset != 0);
        if multiplier == 0 {
            return;
        }
        self.load();
        let (negate, factor) = if multiplier <= 128 {
            (false, multiplier)
        } else {
            (true, multiplier.wrapping_neg())
        };
        let src = if factor == 1 {
            Reg::cache()
        } else {
            for &op in mul::plan(factor) {
                self.emit_mul_op(op);
            }
            Reg::scratch()
        };
        if negate {
            self.emit_sub_rm8_r8(cell(offset), src);
        } else {
            self.emit_add_rm8_r8(cell(offset), src);
        }
    }

    /// Resolve the guard of the sequence started by [`Self::start_copy_seq`]. If
    /// the sequence is too long for a short jump, the guard is widened in place.
    pub fn finish_copy_seq(&mut self) -> Result<(), Error> {
        let Some(start) = self.copy_guard.take() else {
            return Ok(());
        };
        let distance = self.code.len() - start;
        if distance <= i8::MAX as usize {
            return self.patch_forward_rel8(start);
        }
        let mut near = vec![0x0f, 0x80 + JmpPred::Equal as u8];
        near.extend_from_slice(&rel32(distance as isize)?.to_le_bytes());
        self.code.splice(start - 2..start, near);
        Ok(())
    }

    /// Start a loop that is skipped if the current cell is zero.
    pub fn loop_start(&mut self) {
        self.load();
        self.store();
        self.emit_test_rm8_r8(RegMem::Reg(Reg::cache()), Reg::cache());
        self.emit_jcc_rel32(JmpPred::Equal, 0);
        self.loops.push(LoopMark {
            patch: self.code.len(),
            guarded: true,
        });
    }

    /// Start a loop whose body is known to be executed at least once.
    pub fn loop_start_optimized(&mut self) {
        self.loops.push(LoopMark {
            patch: self.code.len(),
            guarded: false,
        });
    }

    /// End the innermost loop, jumping back to its body if the cell is nonzero.
    pub fn loop_end(&mut self) -> Result<(), Error> {
        let mark = self.loops.pop().ok_or(Error::NoOpenLoop)?;
        self.load();
        self.store();
        self.emit_test_rm8_r8(RegMem::Reg(Reg::cache()), Reg::cache());
        let back = rel32(mark.patch as isize - (self.code.len() + 6) as isize)?;
        self.emit_jcc_rel32(JmpPred::NotEqual, back);
        if mark.guarded {
            self.patch_forward_rel32(mark.patch)?;
        }
        Ok(())
    }

    /// End the innermost loop whose exit condition is known to hold, so that the
    /// body is never repeated.
    pub fn loop_end_optimized(&mut self) -> Result<(), Error> {
        let mark = self.loops.pop().ok_or(Error::NoOpenLoop)?;
        if mark.guarded {
            self.patch_forward_rel32(mark.patch)?;
        }
        Ok(())
    }

    /// Forget the innermost loop, removing its guard if one was emitted. Must only
    /// be used while the loop body is still empty.
    pub fn pop_started_loop(&mut self) -> Result<(), Error> {
        let mark = self.loops.pop().ok_or(Error::NoOpenLoop)?;
        debug_assert_eq!(mark.patch, self.code.len());
        if mark.guarded {
            self.code.truncate(mark.patch - LOOP_GUARD_LEN);
        }
        Ok(())
    }

    /// Number of bytes emitted since the start of the innermost loop body.
    pub fn current_loop_size(&self) -> Option<usize> {
        self.loops.last().map(|mark| self.code.len() - mark.patch)
    }

    pub fn is_in_loop(&self) -> bool {
        !self.loops.is_empty()
    }

    /// Emit a loop moving the pointer by `stride` until it reaches a zero cell.
    /// If `skip_init` is set, the current cell is known to be nonzero.
    pub fn scan_loop(&mut self, stride: i32, skip_init: bool) -> Result<(), Error> {
        debug_assert!(stride != 0);
        self.load();
        self.store();
        let mut exit = None;
        if !skip_init {
            self.emit_test_rm8_r8(RegMem::Reg(Reg::cache()), Reg::cache());
            self.emit_jcc_rel8(JmpPred::Equal, 0);
            exit = Some(self.code.len());
        }
        let head = self.code.len();
        self.bounds_check(stride);
        self.emit_add_rm64_i32(RegMem::Reg(Reg::tape()), stride);
        self.emit_cmp_rm8_i8(cell(0), 0);
        let back = rel8(head as isize - (self.code.len() + 2) as isize)?;
        self.emit_jcc_rel8(JmpPred::NotEqual, back);
        self.cache = CacheState::PendingLoad;
        if let Some(exit) = exit {
            self.patch_forward_rel8(exit)?;
        }
        Ok(())
    }
}

//! Encoder for the handful of x86_64 instruction forms the code generator uses.
//! Operands are limited to what the register plan needs.

use super::CodeGen;

/// x86_64 general purpose registers, numbered by their hardware encoding.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Reg {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

/// Operand addressed through ModR/M: a register, or memory as base, index,
/// scale and displacement.
#[derive(Clone, Copy, Debug)]
pub enum RegMem {
    Reg(Reg),
    Mem(Option<Reg>, Option<Reg>, u8, i32),
}

/// Condition codes of `jcc`, as the low nibble of the opcode.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum JmpPred {
    Equal = 0x04,
    NotEqual = 0x05,
    Less = 0x0c,
    GreaterEqual = 0x0d,
}

impl Reg {
    /// Low three bits of the encoding, as placed in ModR/M and SIB fields.
    fn enc(self) -> u8 {
        self as u8 & 7
    }

    /// Byte registers that can only be addressed with a REX prefix present.
    fn needs_rex_as_byte(self) -> bool {
        matches!(self, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi)
    }
}

impl CodeGen {
    /// Emit a REX prefix when one is needed. `wide` selects 64 bit operand size.
    /// With `isb` the opcode works on byte registers, where `spl`, `bpl`, `sil`
    /// and `dil` are only reachable through an empty REX prefix.
    fn emit_rex(&mut self, wide: bool, isb: bool, reg: Option<Reg>, rm: RegMem) {
        let byte_reg = isb
            && (reg.is_some_and(Reg::needs_rex_as_byte)
                || matches!(rm, RegMem::Reg(r) if r.needs_rex_as_byte()));
        self.emit_rex_forced(wide, byte_reg, reg, rm);
    }

    /// Emit the REX prefix if any of its bits are set, or `force` is given.
    fn emit_rex_forced(&mut self, wide: bool, force: bool, reg: Option<Reg>, rm: RegMem) {
        let byte = 0x40
            + (wide as u8) * 0x8
            + ((reg.unwrap_or(Reg::Rax) as u8 >> 3) << 2)
            + match rm {
                RegMem::Reg(r) => r as u8 >> 3,
                RegMem::Mem(base, idx, _, _) => {
                    ((idx.unwrap_or(Reg::Rax) as u8 >> 3) << 1)
                        + (base.unwrap_or(Reg::Rax) as u8 >> 3)
                }
            };
        if byte != 0x40 || force {
            self.code.push(byte);
        }
    }

    /// Emit ModR/M, plus SIB and displacement for memory operands. Without a
    /// `reg` operand, `op` fills the opcode extension field.
    fn emit_modrm(&mut self, reg: Option<Reg>, op: u8, rm: RegMem) {
        match rm {
            RegMem::Reg(r) => {
                self.code
                    .push(0xc0 + (op << 3) + (reg.unwrap_or(Reg::Rax).enc() << 3) + r.enc());
            }
            RegMem::Mem(base, idx, mul, disp) => {
                let is_small = (-128..=127).contains(&disp) && base.is_some();
                let is_zero = disp == 0 && base.is_some_and(|b| b.enc() != 5);
                let mode = ((!is_zero && base.is_some()) as u8) << (6 + !is_small as u32);
                let modrm = mode + (op << 3) + (reg.unwrap_or(Reg::Rax).enc() << 3);
                match (base, idx) {
                    (Some(base), None) if base.enc() != 4 => {
                        self.code.push(modrm + base.enc());
                    }
                    _ => {
                        self.code.push(modrm + 4);
                        self.code.push(
                            ((mul.ilog2() as u8) << 6)
                                + (idx.unwrap_or(Reg::Rsp).enc() << 3)
                                + base.unwrap_or(Reg::Rbp).enc(),
                        );
                    }
                }
                if !is_zero {
                    if is_small {
                        self.code.push(disp as u8);
                    } else {
                        self.code.extend_from_slice(&disp.to_le_bytes());
                    }
                }
            }
        }
    }

    pub fn emit_push_r64(&mut self, reg: Reg) {
        self.emit_rex(false, false, None, RegMem::Reg(reg));
        self.code.push(0x50 + reg.enc());
    }

    pub fn emit_pop_r64(&mut self, reg: Reg) {
        self.emit_rex(false, false, None, RegMem::Reg(reg));
        self.code.push(0x58 + reg.enc());
    }

    /// Uses the sign extended imm8 form when the value fits.
    pub fn emit_add_rm64_i32(&mut self, rm: RegMem, imm: i32) {
        if imm == -1 {
            self.emit_dec_rm64(rm);
        } else if imm == 1 {
            self.emit_inc_rm64(rm);
        } else {
            let is_small = (-128..=127).contains(&imm);
            self.emit_rex(true, false, None, rm);
            self.code.push(if is_small { 0x83 } else { 0x81 });
            self.emit_modrm(None, 0, rm);
            if is_small {
                self.code.push(imm as u8);
            } else {
                self.code.extend_from_slice(&imm.to_le_bytes());
            }
        }
    }

    /// Uses the sign extended imm8 form when the value fits.
    pub fn emit_sub_rm64_i32(&mut self, rm: RegMem, imm: i32) {
        let is_small = (-128..=127).contains(&imm);
        self.emit_rex(true, false, None, rm);
        self.code.push(if is_small { 0x83 } else { 0x81 });
        self.emit_modrm(None, 5, rm);
        if is_small {
            self.code.push(imm as u8);
        } else {
            self.code.extend_from_slice(&imm.to_le_bytes());
        }
    }

    pub fn emit_add_rm8_i8(&mut self, rm: RegMem, imm: i8) {
        if imm == -1 {
            self.emit_dec_rm8(rm);
        } else if imm == 1 {
            self.emit_inc_rm8(rm);
        } else {
            self.emit_rex(false, true, None, rm);
            self.code.push(0x80);
            self.emit_modrm(None, 0, rm);
            self.code.push(imm as u8);
        }
    }

    pub fn emit_add_rm32_r32(&mut self, dst: RegMem, src: Reg) {
        self.emit_rex(false, false, Some(src), dst);
        self.code.push(0x01);
        self.emit_modrm(Some(src), 0, dst);
    }

    pub fn emit_add_rm8_r8(&mut self, dst: RegMem, src: Reg) {
        self.emit_rex(false, true, Some(src), dst);
        self.code.push(0x00);
        self.emit_modrm(Some(src), 0, dst);
    }

    pub fn emit_sub_rm32_r32(&mut self, dst: RegMem, src: Reg) {
        self.emit_rex(false, false, Some(src), dst);
        self.code.push(0x29);
        self.emit_modrm(Some(src), 0, dst);
    }

    pub fn emit_sub_rm8_r8(&mut self, dst: RegMem, src: Reg) {
        self.emit_rex(false, true, Some(src), dst);
        self.code.push(0x28);
        self.emit_modrm(Some(src), 0, dst);
    }

    /// Uses the sign extended imm8 form when the value fits.
    pub fn emit_mul_r32_rm32_i32(&mut self, dst: Reg, rm: RegMem, imm: i32) {
        let is_small = (-128..=127).contains(&imm);
        self.emit_rex(false, false, Some(dst), rm);
        self.code.push(if is_small { 0x6b } else { 0x69 });
        self.emit_modrm(Some(dst), 0, rm);
        if is_small {
            self.code.push(imm as u8);
        } else {
            self.code.extend_from_slice(&imm.to_le_bytes());
        }
    }

    pub fn emit_inc_rm64(&mut self, dst: RegMem) {
        self.emit_rex(true, false, None, dst);
        self.code.push(0xff);
        self.emit_modrm(None, 0, dst);
    }

    pub fn emit_inc_rm8(&mut self, dst: RegMem) {
        self.emit_rex(false, true, None, dst);
        self.code.push(0xfe);
        self.emit_modrm(None, 0, dst);
    }

    pub fn emit_dec_rm64(&mut self, dst: RegMem) {
        self.emit_rex(true, false, None, dst);
        self.code.push(0xff);
        self.emit_modrm(None, 1, dst);
    }

    pub fn emit_dec_rm8(&mut self, dst: RegMem) {
        self.emit_rex(false, true, None, dst);
        self.code.push(0xfe);
        self.emit_modrm(None, 1, dst);
    }

    pub fn emit_xor_rm32_r32(&mut self, dst: RegMem, src: Reg) {
        self.emit_rex(false, false, Some(src), dst);
        self.code.push(0x31);
        self.emit_modrm(Some(src), 0, dst);
    }

    /// Picks the shortest of `mov r32, imm32`, sign extended `mov r64, imm32` and `movabs`.
    pub fn emit_mov_r64_i64(&mut self, reg: Reg, imm: i64) {
        let is_small = imm <= i32::MAX as i64 && imm >= i32::MIN as i64;
        let is_small_uns = imm >= 0 && imm <= u32::MAX as i64;
        self.emit_rex(!is_small_uns, false, None, RegMem::Reg(reg));
        if is_small_uns {
            self.code.push(0xb8 + reg.enc());
            self.code.extend_from_slice(&(imm as u32).to_le_bytes());
        } else if is_small {
            self.code.push(0xc7);
            self.emit_modrm(None, 0, RegMem::Reg(reg));
            self.code.extend_from_slice(&(imm as i32).to_le_bytes());
        } else {
            self.code.push(0xb8 + reg.enc());
            self.code.extend_from_slice(&imm.to_le_bytes());
        }
    }

    pub fn emit_mov_r8_i8(&mut self, reg: Reg, imm: u8) {
        self.emit_rex(false, true, None, RegMem::Reg(reg));
        self.code.push(0xb0 + reg.enc());
        self.code.push(imm);
    }

    pub fn emit_mov_r64_rm64(&mut self, dst: Reg, src: RegMem) {
        self.emit_rex(true, false, Some(dst), src);
        self.code.push(0x8b);
        self.emit_modrm(Some(dst), 0, src);
    }

    pub fn emit_mov_rm32_r32(&mut self, dst: RegMem, src: Reg) {
        self.emit_rex(false, false, Some(src), dst);
        self.code.push(0x89);
        self.emit_modrm(Some(src), 0, dst);
    }

    /// Zero extended load of a 8 bit register or memory location into a 32 bit
    /// register. This also clears the upper half of the 64 bit register.
    pub fn emit_movzx_r32_rm8(&mut self, dst: Reg, src: RegMem) {
        let byte_src = matches!(src, RegMem::Reg(r) if r.needs_rex_as_byte());
        self.emit_rex_forced(false, byte_src, Some(dst), src);
        self.code.push(0x0f);
        self.code.push(0xb6);
        self.emit_modrm(Some(dst), 0, src);
    }

    pub fn emit_mov_r8_rm8(&mut self, dst: Reg, src: RegMem) {
        self.emit_rex(false, true, Some(dst), src);
        self.code.push(0x8a);
        self.emit_modrm(Some(dst), 0, src);
    }

    pub fn emit_mov_rm8_r8(&mut self, dst: RegMem, src: Reg) {
        self.emit_rex(false, true, Some(src), dst);
        self.code.push(0x88);
        self.emit_modrm(Some(src), 0, dst);
    }

    pub fn emit_lea_r64(&mut self, dst: Reg, addr: RegMem) {
        self.emit_rex(true, false, Some(dst), addr);
        self.code.push(0x8d);
        self.emit_modrm(Some(dst), 0, addr);
    }

    pub fn emit_lea_r32(&mut self, dst: Reg, addr: RegMem) {
        self.emit_rex(false, false, Some(dst), addr);
        self.code.push(0x8d);
        self.emit_modrm(Some(dst), 0, addr);
    }

    pub fn emit_cmp_r64_rm64(&mut self, fst: Reg, snd: RegMem) {
        self.emit_rex(true, false, Some(fst), snd);
        self.code.push(0x3b);
        self.emit_modrm(Some(fst), 0, snd);
    }

    pub fn emit_cmp_rm8_i8(&mut self, rm: RegMem, imm: i8) {
        self.emit_rex(false, true, None, rm);
        self.code.push(0x80);
        self.emit_modrm(None, 7, rm);
        self.code.push(imm as u8);
    }

    pub fn emit_test_rm8_r8(&mut self, fst: RegMem, snd: Reg) {
        self.emit_rex(false, true, Some(snd), fst);
        self.code.push(0x84);
        self.emit_modrm(Some(snd), 0, fst);
    }

    pub fn emit_jcc_rel8(&mut self, pred: JmpPred, off: i8) {
        self.code.push(0x70 + pred as u8);
        self.code.push(off as u8);
    }

    pub fn emit_jcc_rel32(&mut self, pred: JmpPred, off: i32) {
        self.code.push(0x0f);
        self.code.push(0x80 + pred as u8);
        self.code.extend_from_slice(&off.to_le_bytes());
    }

    /// Logical left shift by the specified constant.
    pub fn emit_shl_rm32_i8(&mut self, dst: RegMem, shift: u8) {
        self.emit_rex(false, false, None, dst);
        self.code.push(0xc1);
        self.emit_modrm(None, 4, dst);
        self.code.push(shift);
    }

    pub fn emit_ret(&mut self) {
        self.code.push(0xc3);
    }

    pub fn emit_call_ind(&mut self, target: RegMem) {
        self.emit_rex(false, false, None, target);
        self.code.push(0xff);
        self.emit_modrm(None, 2, target);
    }
}

#[cfg(test)]
mod tests {
    use super::{JmpPred, Reg, RegMem};
    use crate::{codegen::CodeGen, EofPolicy};

    fn encode(f: impl FnOnce(&mut CodeGen)) -> Vec<u8> {
        let mut gen = CodeGen::empty(true, EofPolicy::Zero);
        f(&mut gen);
        gen.code
    }

    #[test]
    fn cached_cell_load_and_store() {
        let cell = RegMem::Mem(Some(Reg::Rbp), None, 1, 0);
        assert_eq!(
            encode(|g| g.emit_mov_r8_rm8(Reg::Rbx, cell)),
            [0x8a, 0x5d, 0x00]
        );
        assert_eq!(
            encode(|g| g.emit_mov_rm8_r8(cell, Reg::Rbx)),
            [0x88, 0x5d, 0x00]
        );
    }

    #[test]
    fn pointer_moves_select_shortest_form() {
        let ptr = RegMem::Reg(Reg::Rbp);
        assert_eq!(encode(|g| g.emit_add_rm64_i32(ptr, 1)), [0x48, 0xff, 0xc5]);
        assert_eq!(encode(|g| g.emit_add_rm64_i32(ptr, -1)), [0x48, 0xff, 0xcd]);
        assert_eq!(
            encode(|g| g.emit_add_rm64_i32(ptr, 5)),
            [0x48, 0x83, 0xc5, 0x05]
        );
        assert_eq!(
            encode(|g| g.emit_add_rm64_i32(ptr, 1000)),
            [0x48, 0x81, 0xc5, 0xe8, 0x03, 0x00, 0x00]
        );
    }

    #[test]
    fn extended_registers_get_rex_prefix() {
        assert_eq!(encode(|g| g.emit_push_r64(Reg::R12)), [0x41, 0x54]);
        assert_eq!(encode(|g| g.emit_pop_r64(Reg::R15)), [0x41, 0x5f]);
        assert_eq!(
            encode(|g| g.emit_call_ind(RegMem::Reg(Reg::R12))),
            [0x41, 0xff, 0xd4]
        );
        assert_eq!(
            encode(|g| g.emit_call_ind(RegMem::Reg(Reg::Rax))),
            [0xff, 0xd0]
        );
        assert_eq!(
            encode(|g| g.emit_cmp_r64_rm64(Reg::Rax, RegMem::Reg(Reg::R13))),
            [0x49, 0x3b, 0xc5]
        );
    }

    #[test]
    fn byte_registers_requiring_rex() {
        assert_eq!(
            encode(|g| g.emit_mov_rm8_r8(RegMem::Reg(Reg::Rdi), Reg::Rbx)),
            [0x40, 0x88, 0xdf]
        );
        assert_eq!(
            encode(|g| g.emit_mov_rm8_r8(RegMem::Reg(Reg::Rax), Reg::Rbx)),
            [0x88, 0xd8]
        );
        assert_eq!(encode(|g| g.emit_mov_r8_i8(Reg::Rbx, 42)), [0xb3, 42]);
        assert_eq!(encode(|g| g.emit_mov_r8_i8(Reg::Rsi, 42)), [0x40, 0xb6, 42]);
        assert_eq!(
            encode(|g| g.emit_movzx_r32_rm8(Reg::Rdi, RegMem::Reg(Reg::Rbx))),
            [0x0f, 0xb6, 0xfb]
        );
    }

    #[test]
    fn scaled_index_addressing() {
        assert_eq!(
            encode(|g| g.emit_lea_r32(Reg::Rax, RegMem::Mem(Some(Reg::Rbx), Some(Reg::Rbx), 2, 0))),
            [0x8d, 0x04, 0x5b]
        );
        assert_eq!(
            encode(|g| g.emit_lea_r32(Reg::Rax, RegMem::Mem(None, Some(Reg::Rbx), 4, 0))),
            [0x8d, 0x04, 0x9d, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            encode(|g| g.emit_lea_r64(Reg::Rax, RegMem::Mem(Some(Reg::Rbp), None, 1, -3))),
            [0x48, 0x8d, 0x45, 0xfd]
        );
    }

    #[test]
    fn memory_operands_with_offsets() {
        assert_eq!(
            encode(|g| g.emit_add_rm8_r8(RegMem::Mem(Some(Reg::Rbp), None, 1, 3), Reg::Rbx)),
            [0x00, 0x5d, 0x03]
        );
        assert_eq!(
            encode(|g| g.emit_sub_rm8_r8(RegMem::Mem(Some(Reg::Rbp), None, 1, 300), Reg::Rax)),
            [0x28, 0x85, 0x2c, 0x01, 0x00, 0x00]
        );
        assert_eq!(
            encode(|g| g.emit_add_rm8_i8(RegMem::Mem(Some(Reg::Rbp), None, 1, -2), 7)),
            [0x80, 0x45, 0xfe, 0x07]
        );
        assert_eq!(
            encode(|g| g.emit_cmp_rm8_i8(RegMem::Mem(Some(Reg::Rbp), None, 1, 0), 0)),
            [0x80, 0x7d, 0x00, 0x00]
        );
    }

    #[test]
    fn branches_and_immediates() {
        assert_eq!(encode(|g| g.emit_jcc_rel8(JmpPred::Less, 3)), [0x7c, 0x03]);
        assert_eq!(
            encode(|g| g.emit_jcc_rel32(JmpPred::NotEqual, -6)),
            [0x0f, 0x85, 0xfa, 0xff, 0xff, 0xff]
        );
        assert_eq!(
            encode(|g| g.emit_mov_r64_i64(Reg::R12, 0x1122_3344_5566)),
            [0x49, 0xbc, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x00, 0x00]
        );
        assert_eq!(
            encode(|g| g.emit_xor_rm32_r32(RegMem::Reg(Reg::Rbx), Reg::Rbx)),
            [0x31, 0xdb]
        );
    }
}

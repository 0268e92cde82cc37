//! Multiplication of the cached cell value by small constants.
//!
//! Every multiplier is mapped to a short sequence of [`MulOp`]s computing
//! `eax = ebx * m`. The candidate sequences are listed in a table and the
//! cheapest one according to [`cost`] is selected once per multiplier. Only
//! [`CodeGen::emit_mul_op`] knows how an operation is encoded.

use std::sync::OnceLock;

use super::{
    asm::{Reg, RegMem},
    CodeGen,
};

/// A single step in computing `acc = src * m`, where `src` is the cached cell
/// value (which is never modified) and `acc` the scratch register.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MulOp {
    /// `acc = src * scale`, or `acc = src + src * scale` if `add_src` is set.
    Lea { scale: u8, add_src: bool },
    /// `acc = src + acc * scale`
    LeaAcc { scale: u8 },
    /// `acc = acc + acc`
    Double,
    /// `acc = acc - src`
    SubSrc,
    /// `acc = acc << n`
    Shl(u8),
    /// `acc = src`
    Mov,
    /// `acc = src * imm`
    Imul(u8),
}

use MulOp::*;

/// Hand-picked sequences for the multipliers produced most often by unrolled
/// loops. A multiplier may have more than one candidate.
const CANDIDATES: &[(u8, &[MulOp])] = &[
    (2, &[Lea { scale: 1, add_src: true }]),
    (3, &[Lea { scale: 2, add_src: true }]),
    (4, &[Lea { scale: 4, add_src: false }]),
    (5, &[Lea { scale: 4, add_src: true }]),
    (6, &[Lea { scale: 2, add_src: true }, Double]),
    (6, &[Lea { scale: 2, add_src: true }, Shl(1)]),
    (7, &[Lea { scale: 8, add_src: false }, SubSrc]),
    (8, &[Lea { scale: 8, add_src: false }]),
    (9, &[Lea { scale: 8, add_src: true }]),
    (10, &[Lea { scale: 4, add_src: true }, Double]),
    (11, &[Lea { scale: 4, add_src: true }, LeaAcc { scale: 2 }]),
    (12, &[Lea { scale: 2, add_src: true }, Shl(2)]),
];

/// Estimated latency of a single operation, in cycles.
fn latency(op: MulOp) -> u32 {
    match op {
        Imul(_) => 3,
        _ => 1,
    }
}

/// Number of bytes the operation will be encoded into.
fn size(op: MulOp) -> u32 {
    match op {
        Lea { add_src: false, .. } => 7,
        Lea { .. } | LeaAcc { .. } => 3,
        Double | SubSrc | Mov => 2,
        Shl(_) => 3,
        Imul(m) if m < 128 => 3,
        Imul(_) => 6,
    }
}

/// Cost of a sequence. Latency is minimized first, code size second.
fn cost(ops: &[MulOp]) -> (u32, u32) {
    (
        ops.iter().map(|&op| latency(op)).sum(),
        ops.iter().map(|&op| size(op)).sum(),
    )
}

/// Select the cheapest sequence for computing the product with `multiplier`.
fn select(multiplier: u8) -> Vec<MulOp> {
    let mut best = vec![Imul(multiplier)];
    let mut consider = |ops: &[MulOp]| {
        if cost(ops) < cost(&best) {
            best = ops.to_vec();
        }
    };
    if multiplier.is_power_of_two() {
        consider(&[Mov, Shl(multiplier.trailing_zeros() as u8)]);
    }
    for (_, ops) in CANDIDATES.iter().filter(|(m, _)| *m == multiplier) {
        consider(ops);
    }
    best
}

/// Return the sequence used for the given multiplier. The selection happens
/// only once for every multiplier.
pub fn plan(multiplier: u8) -> &'static [MulOp] {
    static PLANS: OnceLock<Vec<Vec<MulOp>>> = OnceLock::new();
    &PLANS.get_or_init(|| (0..=u8::MAX).map(select).collect())[multiplier as usize]
}

/// Compute what the given sequence leaves in the low byte of the accumulator.
#[cfg(test)]
pub fn evaluate(ops: &[MulOp], src: u8) -> u8 {
    let src = src as u32;
    let mut acc = 0u32;
    for &op in ops {
        acc = match op {
            Lea { scale, add_src } => src * scale as u32 + if add_src { src } else { 0 },
            LeaAcc { scale } => src.wrapping_add(acc.wrapping_mul(scale as u32)),
            Double => acc.wrapping_add(acc),
            SubSrc => acc.wrapping_sub(src),
            Shl(n) => acc << n,
            Mov => src,
            Imul(m) => src * m as u32,
        };
    }
    acc as u8
}

impl CodeGen {
    /// Emit a single step of a multiplication sequence.
    pub(super) fn emit_mul_op(&mut self, op: MulOp) {
        let src = Reg::cache();
        let acc = Reg::scratch();
        match op {
            Lea { scale, add_src } => {
                let base = if add_src { Some(src) } else { None };
                self.emit_lea_r32(acc, RegMem::Mem(base, Some(src), scale, 0));
            }
            LeaAcc { scale } => {
                self.emit_lea_r32(acc, RegMem::Mem(Some(src), Some(acc), scale, 0));
            }
            Double => self.emit_add_rm32_r32(RegMem::Reg(acc), acc),
            SubSrc => self.emit_sub_rm32_r32(RegMem::Reg(acc), src),
            Shl(n) => self.emit_shl_rm32_i8(RegMem::Reg(acc), n),
            Mov => self.emit_mov_rm32_r32(RegMem::Reg(acc), src),
            Imul(m) => self.emit_mul_r32_rm32_i32(acc, RegMem::Reg(src), m as i32),
        }
    }
}

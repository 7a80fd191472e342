//! aarch64 decode backend, built on capstone.

use capstone::arch::arm64::{Arm64Insn, Arm64Operand, Arm64OperandType, Arm64Reg};
use capstone::arch::ArchOperand;
use capstone::prelude::*;

use super::{Insn, Mn};
use crate::error::Result;

pub(super) fn decode(code: &[u8], addr: u64, max: usize) -> Result<Vec<Insn>> {
    let cs = Capstone::new()
        .arm64()
        .mode(arch::arm64::ArchMode::Arm)
        .detail(true)
        .build()?;

    let decoded = cs.disasm_all(code, addr)?;

    let mut out = Vec::with_capacity(decoded.len().min(max));
    for insn in decoded.iter().take(max) {
        out.push(classify(&cs, insn)?);
    }

    Ok(out)
}

/// Wide-immediate move encodings; bits 30..23 select the opcode.
const WIDE_MOVE_MASK: u32 = 0x7f80_0000;
const MOVN_BITS: u32 = 0x1280_0000;
const MOVK_BITS: u32 = 0x7280_0000;

fn classify(cs: &Capstone, insn: &capstone::Insn<'_>) -> Result<Insn> {
    // capstone reports movn under its mov alias with the immediate operand
    // already negated and shifted, so the wide-immediate moves are
    // classified straight from the encoding to keep the raw imm16/shift
    // fields.
    let word = raw_word(insn);
    if word & WIDE_MOVE_MASK == MOVN_BITS || word & WIDE_MOVE_MASK == MOVK_BITS {
        let mut decoded = Insn::other();
        decoded.mn = if word & WIDE_MOVE_MASK == MOVN_BITS {
            Mn::MovInvImm
        } else {
            Mn::MovKeepImm
        };
        decoded.imm = (word >> 5) as u64 & 0xffff;
        decoded.shift = ((word >> 21) & 3) * 16;
        return Ok(decoded);
    }

    let detail = cs.insn_detail(insn)?;
    let ops: Vec<Arm64Operand> = detail
        .arch_detail()
        .operands()
        .into_iter()
        .filter_map(|op| match op {
            ArchOperand::Arm64Operand(op) => Some(op),
            _ => None,
        })
        .collect();

    let id = insn.id().0;

    let mut decoded = Insn::other();

    if id == Arm64Insn::ARM64_INS_LDR as u32 || id == Arm64Insn::ARM64_INS_LDUR as u32 {
        // Displacement form covers both scaled and unscaled loads; the
        // literal form shows up as a bare immediate holding the pool
        // address.
        if let Some(mem) = ops.iter().find_map(|op| match op.op_type {
            Arm64OperandType::Mem(mem) => Some(mem),
            _ => None,
        }) {
            decoded.mn = Mn::Load;
            decoded.probe = mem.disp() as i64;
            decoded.base_arg0 = mem.base() == RegId(Arm64Reg::ARM64_REG_X0 as u16);
        } else if let Some(imm) = last_imm(&ops) {
            decoded.mn = Mn::LoadLiteral;
            decoded.probe = imm;
        }
    } else if id == Arm64Insn::ARM64_INS_CMP as u32 {
        if let Some(imm) = last_imm(&ops) {
            decoded.mn = Mn::CmpImm;
            decoded.probe = imm;
        }
    } else if id == Arm64Insn::ARM64_INS_CBZ as u32 {
        decoded.mn = Mn::BranchZero;
    } else if id == Arm64Insn::ARM64_INS_CBNZ as u32 {
        decoded.mn = Mn::BranchNonZero;
    } else if id == Arm64Insn::ARM64_INS_MOV as u32 || id == Arm64Insn::ARM64_INS_MOVZ as u32 {
        let into_x3 = matches!(
            ops.first().map(|op| &op.op_type),
            Some(Arm64OperandType::Reg(reg)) if *reg == RegId(Arm64Reg::ARM64_REG_X3 as u16)
        );
        if into_x3 {
            if let Some(imm) = last_imm(&ops) {
                decoded.mn = Mn::MovScratchImm;
                decoded.imm = imm as u64;
            }
        }
    } else if id == Arm64Insn::ARM64_INS_ADR as u32 || id == Arm64Insn::ARM64_INS_ADRP as u32 {
        decoded.mn = Mn::Adr;
    }

    Ok(decoded)
}

fn raw_word(insn: &capstone::Insn<'_>) -> u32 {
    match insn.bytes() {
        &[a, b, c, d] => u32::from_le_bytes([a, b, c, d]),
        _ => 0,
    }
}

fn last_imm(ops: &[Arm64Operand]) -> Option<i64> {
    ops.iter().rev().find_map(|op| match op.op_type {
        Arm64OperandType::Imm(imm) => Some(imm),
        _ => None,
    })
}

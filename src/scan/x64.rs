//! x86-64 decode backend, built on iced-x86.

use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

use super::{Insn, Mn};

pub(super) fn decode(code: &[u8], addr: u64, max: usize) -> Vec<Insn> {
    let mut decoder = Decoder::new(64, code, DecoderOptions::NONE);
    decoder.set_ip(addr);

    let mut out = Vec::new();

    for instr in decoder.into_iter() {
        if instr.is_invalid() || out.len() >= max {
            break;
        }
        out.push(classify(&instr));
    }

    out
}

fn classify(instr: &Instruction) -> Insn {
    let mut decoded = Insn::other();

    match instr.mnemonic() {
        // The unload path compares the init/exit pointers in memory
        // against zero; the displacement is the field offset.
        Mnemonic::Cmp if instr.op0_kind() == OpKind::Memory => {
            decoded.mn = Mn::CmpImm;
            decoded.probe = instr.memory_displacement64() as i64;
        }
        Mnemonic::Je => {
            decoded.mn = Mn::BranchEq;
        }
        Mnemonic::Mov
            if instr.op0_kind() == OpKind::Register
                && instr.op0_register() == Register::ECX
                && is_immediate(instr.op1_kind()) =>
        {
            decoded.mn = Mn::MovScratchImm;
            decoded.imm = instr.immediate(1);
        }
        _ => {}
    }

    decoded
}

fn is_immediate(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64
    )
}

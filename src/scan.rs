//! Instruction pattern scanning.
//!
//! Compiled kernels touch the struct fields we hunt in instruction
//! sequences that are structurally stable across builds even though the
//! exact offsets vary. Each architecture backend decodes a routine into a
//! normalized instruction stream; the scanners below match fixed mnemonic
//! windows against it and pull the offsets out of the matched probes.

use log::*;

use crate::error::{Error, Result};
use crate::Arch;

mod arm64;
mod x64;

/// Decode cap per routine; the fingerprints all sit near the entry point.
pub const MAX_INSNS: usize = 256;

/// Normalized mnemonic classes. Only the shapes the fingerprints care
/// about get their own class; everything else is `Other`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mn {
    /// Memory load with a displacement.
    Load,
    /// PC-relative literal load; probe is the literal's address.
    LoadLiteral,
    /// Compare against an immediate (or x86 compare of a memory operand).
    CmpImm,
    BranchZero,
    BranchNonZero,
    BranchEq,
    /// Immediate moved into the per-arch scratch register (X3 / ECX).
    MovScratchImm,
    /// Move-negated-shifted immediate (MOVN).
    MovInvImm,
    /// Or-in-shifted immediate (MOVK).
    MovKeepImm,
    Adr,
    Other,
}

/// One decoded instruction in normalized form.
#[derive(Clone, Copy, Debug)]
pub struct Insn {
    pub mn: Mn,
    /// Memory displacement for loads, immediate for compares, else 0.
    pub probe: i64,
    /// Raw immediate operand where one exists.
    pub imm: u64,
    /// Shift amount attached to the immediate.
    pub shift: u32,
    /// Memory base register is the first-argument register.
    pub base_arg0: bool,
}

impl Insn {
    fn other() -> Self {
        Self {
            mn: Mn::Other,
            probe: 0,
            imm: 0,
            shift: 0,
            base_arg0: false,
        }
    }
}

/// Decodes up to `max` instructions starting at `code`, which sits at
/// runtime address `addr`.
pub fn decode(
    arch: Arch,
    code: &[u8],
    addr: u64,
    max: usize,
    routine: &'static str,
) -> Result<Vec<Insn>> {
    let insns = match arch {
        Arch::Aarch64 => arm64::decode(code, addr, max)?,
        Arch::X86_64 => x64::decode(code, addr, max),
    };
    if insns.is_empty() {
        return Err(Error::Decode { routine });
    }
    trace!("{}: decoded {} instructions", routine, insns.len());
    Ok(insns)
}

/// Recovers the `init` and `exit` field offsets of the kernel's module
/// struct from the module-unload entry point.
///
/// The unload path always checks both function pointers back to back:
/// `ldr; cbz; ldr; cbnz` on arm64, `cmp; je; cmp; je` against memory on
/// x86. The displacements at window positions 0 and 2 are the offsets.
pub fn module_field_offsets(arch: Arch, code: &[u8]) -> Result<(i64, i64)> {
    let insns = decode(arch, code, 0, MAX_INSNS, "module unload entry")?;

    let window = match arch {
        Arch::Aarch64 => [Mn::Load, Mn::BranchZero, Mn::Load, Mn::BranchNonZero],
        Arch::X86_64 => [Mn::CmpImm, Mn::BranchEq, Mn::CmpImm, Mn::BranchEq],
    };

    let mns: Vec<Mn> = insns.iter().map(|i| i.mn).collect();
    let pos = mns
        .windows(window.len())
        .position(|w| w == window)
        .ok_or(Error::PatternNotFound("module init/exit field access"))?;

    let mut init_offset = insns[pos].probe;
    let mut exit_offset = insns[pos + 2].probe;

    if arch == Arch::Aarch64 {
        // Later releases inserted a member ahead of init/exit; its
        // signature is a load at -8 compared against MODULE_STATE_UNFORMED.
        for w in insns[..pos].windows(2) {
            if w[0].mn == Mn::Load
                && w[1].mn == Mn::CmpImm
                && w[0].probe == -8
                && w[1].probe == 3
            {
                init_offset += 8;
                exit_offset += 8;
            }
        }
    }

    debug!(
        "module init offset 0x{:x} exit offset 0x{:x}",
        init_offset, exit_offset
    );

    Ok((init_offset, exit_offset))
}

/// Size of one exported-symbol record, read from the immediate the
/// kallsyms iteration routine loads into its scratch register. Returns 0
/// when the instruction is absent; the caller treats that as fatal.
pub fn symbol_record_size(arch: Arch, code: &[u8]) -> Result<u64> {
    let insns = decode(arch, code, 0, MAX_INSNS, "symbol record size scan")?;
    Ok(insns
        .iter()
        .find(|i| i.mn == Mn::MovScratchImm)
        .map(|i| i.imm)
        .unwrap_or(0))
}

/// Reconstructs a 64-bit literal from the move-negated-shifted idiom:
/// one MOVN optionally followed by up to two MOVKs. Returns `None` when
/// the leading instruction is not a MOVN.
pub fn split_immediate(window: &[Insn]) -> Option<u64> {
    let first = window.first()?;
    if first.mn != Mn::MovInvImm {
        return None;
    }

    let mut val = (!first.imm) << first.shift;

    for insn in window.iter().skip(1).take(2) {
        if insn.mn != Mn::MovKeepImm {
            break;
        }
        val |= insn.imm << insn.shift;
    }

    Some(val)
}

/// Offset of the page-table pointer inside the kernel's mm struct: the
/// displacement of the first load off the first-argument register in
/// the pgd mapping routine.
pub fn mm_pgd_field_offset(arch: Arch, code: &[u8]) -> Result<i64> {
    if arch != Arch::Aarch64 {
        return Err(Error::UnsupportedArchitecture("page-table field scan", arch));
    }

    let insns = decode(arch, code, 0, MAX_INSNS, "pgd mapping entry")?;
    insns
        .iter()
        .find(|i| i.mn == Mn::Load && i.base_arg0)
        .map(|i| i.probe)
        .ok_or(Error::PatternNotFound("mm->pgd field access"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    const NOP: u32 = 0xd503_201f;
    const RET: u32 = 0xd65f_03c0;
    // ldur x8, [x23, #-8]
    const LDUR_X8_X23_M8: u32 = 0xf85f_82e8;
    // cmp x8, #3
    const CMP_X8_3: u32 = 0xf100_0d1f;
    // ldr x8, [x23, #0x150]
    const LDR_X8_X23_150: u32 = 0xf940_aae8;
    // ldr x8, [x23, #0x2f8]
    const LDR_X8_X23_2F8: u32 = 0xf941_7ee8;
    // cbz x8, #+8 / cbnz x8, #+8
    const CBZ_X8: u32 = 0xb400_0048;
    const CBNZ_X8: u32 = 0xb500_0048;

    #[test]
    fn arm64_field_window() {
        let code = words(&[
            NOP,
            LDR_X8_X23_150,
            CBZ_X8,
            LDR_X8_X23_2F8,
            CBNZ_X8,
            RET,
        ]);
        let (init, exit) = module_field_offsets(Arch::Aarch64, &code).unwrap();
        assert_eq!(init, 0x150);
        assert_eq!(exit, 0x2f8);
    }

    #[test]
    fn arm64_state_member_shifts_offsets() {
        let code = words(&[
            NOP,
            LDUR_X8_X23_M8,
            CMP_X8_3,
            NOP,
            LDR_X8_X23_150,
            CBZ_X8,
            LDR_X8_X23_2F8,
            CBNZ_X8,
            RET,
        ]);
        let (init, exit) = module_field_offsets(Arch::Aarch64, &code).unwrap();
        assert_eq!(init, 0x158);
        assert_eq!(exit, 0x300);
    }

    #[test]
    fn arm64_missing_window_is_pattern_not_found() {
        let code = words(&[NOP, NOP, RET]);
        assert!(matches!(
            module_field_offsets(Arch::Aarch64, &code),
            Err(Error::PatternNotFound(_))
        ));
    }

    #[test]
    fn x64_field_window() {
        #[rustfmt::skip]
        let code: Vec<u8> = vec![
            0x90,                                            // nop
            0x48, 0x83, 0xbb, 0x38, 0x01, 0x00, 0x00, 0x00,  // cmp qword [rbx+0x138], 0
            0x74, 0x0e,                                      // je +0x0e
            0x48, 0x83, 0xbb, 0x38, 0x03, 0x00, 0x00, 0x00,  // cmp qword [rbx+0x338], 0
            0x74, 0x06,                                      // je +0x06
            0xc3,                                            // ret
        ];
        let (init, exit) = module_field_offsets(Arch::X86_64, &code).unwrap();
        assert_eq!(init, 0x138);
        assert_eq!(exit, 0x338);
    }

    #[test]
    fn arm64_record_size() {
        // mov x3, #0x18
        let code = words(&[NOP, 0xd280_0303, RET]);
        assert_eq!(symbol_record_size(Arch::Aarch64, &code).unwrap(), 0x18);
    }

    #[test]
    fn arm64_record_size_absent_is_zero() {
        let code = words(&[NOP, RET]);
        assert_eq!(symbol_record_size(Arch::Aarch64, &code).unwrap(), 0);
    }

    #[test]
    fn x64_record_size() {
        // mov ecx, 0x18; ret
        let code = vec![0xb9, 0x18, 0x00, 0x00, 0x00, 0xc3];
        assert_eq!(symbol_record_size(Arch::X86_64, &code).unwrap(), 0x18);
    }

    #[test]
    fn split_immediate_roundtrip() {
        // Encodes v in the movn/movk layout the relocation prologue uses:
        // bits 48..63 must come out as all ones from the negated move.
        fn encode(v: u64) -> Vec<u8> {
            let movn = 0x9280_0000u32
                | 2 << 21
                | ((!(v >> 32) as u32) & 0xffff) << 5
                | 11;
            let movk16 = 0xf280_0000u32 | 1 << 21 | ((v >> 16) as u32 & 0xffff) << 5 | 11;
            let movk0 = 0xf280_0000u32 | (v as u32 & 0xffff) << 5 | 11;
            words(&[movn, movk16, movk0])
        }

        for &v in &[
            0xffff_ff80_0800_0000u64,
            0xffff_ffc0_1000_0000,
            0xffff_0000_0000_0000,
            0xffff_1234_5678_9abc,
        ] {
            let insns = decode(Arch::Aarch64, &encode(v), 0, MAX_INSNS, "test").unwrap();
            assert_eq!(split_immediate(&insns), Some(v), "value 0x{:x}", v);
        }
    }

    #[test]
    fn wide_move_fields_come_from_the_encoding() {
        // The disassembler shows movn as a mov with the immediate already
        // negated; the scanner must still see the raw imm16 and shift.
        let insns = decode(
            Arch::Aarch64,
            &words(&[0x92c0_0feb, 0xf2a1_000b]),
            0,
            MAX_INSNS,
            "test",
        )
        .unwrap();
        assert_eq!(insns[0].mn, Mn::MovInvImm);
        assert_eq!((insns[0].imm, insns[0].shift), (0x7f, 32));
        assert_eq!(insns[1].mn, Mn::MovKeepImm);
        assert_eq!((insns[1].imm, insns[1].shift), (0x800, 16));
    }

    #[test]
    fn split_immediate_requires_leading_movn() {
        let insns = decode(Arch::Aarch64, &words(&[NOP, RET]), 0, MAX_INSNS, "test").unwrap();
        assert_eq!(split_immediate(&insns), None);
    }

    #[test]
    fn pgd_offset_from_first_arg_load() {
        // ldr x8, [x1, #0x10] (wrong base), ldr x8, [x0, #0x48]
        let code = words(&[NOP, 0xf940_0828, 0xf940_2408, RET]);
        assert_eq!(mm_pgd_field_offset(Arch::Aarch64, &code).unwrap(), 0x48);
    }

    #[test]
    fn pgd_offset_unsupported_on_x86() {
        assert!(matches!(
            mm_pgd_field_offset(Arch::X86_64, &[0x90]),
            Err(Error::UnsupportedArchitecture(..))
        ));
    }
}

//! Kernel self-relocation processing.
//!
//! Relocatable arm64 kernels ship a tiny helper that applies their own
//! RELATIVE relocations at boot. Its prologue loads the relocation table
//! bounds from a literal pool and materializes the link-time base address
//! with a movn/movk pair, which is everything needed to replay the pass
//! against the image buffer and derive the runtime slide.

use dataview::DataView;
use log::*;

use crate::error::{Error, Result};
use crate::image::KernelImage;
use crate::scan::{self, Mn};
use crate::Arch;

/// The only relocation type the kernel self-relocator emits.
pub const R_AARCH64_RELATIVE: u64 = 1027;

const RELA_ENTRY_SIZE: usize = 24;

/// The prologue idioms sit within the first few instructions.
const MAX_PROLOGUE_INSNS: usize = 10;

/// ELF64 Rela record as laid out in the image.
#[repr(C)]
#[derive(Clone, Copy)]
struct Rela {
    offset: u64,
    info: u64,
    addend: u64,
}

unsafe impl dataview::Pod for Rela {}

/// Replays the kernel's self-relocation pass against the image buffer.
///
/// `helper` is the runtime address of the kernel's relocation routine.
/// On success the image carries `default_base`, `slide` and the
/// relocated-checksum flag. The pass runs exactly once per image; applying
/// it again is not supported.
pub fn relocate(image: &mut KernelImage, helper: u64) -> Result<()> {
    if image.arch != Arch::Aarch64 {
        return Err(Error::UnsupportedRelocationIdiom("non-aarch64 image"));
    }

    let insns = scan::decode(
        image.arch,
        image.code_at(helper)?,
        helper,
        MAX_PROLOGUE_INSNS,
        "self-relocation prologue",
    )?;

    match insns[0].mn {
        Mn::LoadLiteral => {}
        // Newer kernels address a RELR table relative to the routine
        // itself; that variant is intentionally not handled.
        Mn::Adr => {
            return Err(Error::UnsupportedRelocationIdiom(
                "address-register-relative relocation table",
            ))
        }
        _ => return Err(Error::UnsupportedRelocationIdiom("unrecognized prologue")),
    }

    if insns.len() < 5 || insns[1].mn != Mn::LoadLiteral {
        return Err(Error::PatternNotFound("relocation table bounds literals"));
    }

    // The first literal stores the table position relative to the image
    // load address, the second its byte size.
    let raw_offset = image.read_u32(image.offset_of(insns[0].probe as u64)?)? as u64;
    let rela_offset = raw_offset
        .checked_sub(image.load_offset)
        .ok_or(Error::OutOfBounds { addr: raw_offset })?;
    let rela_size = image.read_u32(image.offset_of(insns[1].probe as u64)?)? as u64;

    let default_base = scan::split_immediate(&insns[2..])
        .ok_or(Error::PatternNotFound("default base immediate"))?;

    let slide = image
        .anchor()
        .wrapping_sub(image.load_offset)
        .wrapping_sub(default_base);

    debug!("kernel load offset 0x{:x}", image.load_offset);
    debug!("kernel rela offset 0x{:x} size 0x{:x}", rela_offset, rela_size);
    debug!("kernel default base 0x{:x}", default_base);
    debug!("kernel slide 0x{:x}", slide);

    let start = rela_offset as usize;
    let entries = rela_size as usize / RELA_ENTRY_SIZE;
    if start + entries * RELA_ENTRY_SIZE > image.bytes().len() {
        return Err(Error::OutOfBounds {
            addr: image.anchor() + (start + entries * RELA_ENTRY_SIZE) as u64,
        });
    }

    let mut applied = 0usize;
    let mut skipped = 0usize;

    for i in 0..entries {
        let entry: Rela = DataView::from(image.bytes())
            .try_read(start + i * RELA_ENTRY_SIZE)
            .ok_or(Error::OutOfBounds {
                addr: image.anchor() + (start + i * RELA_ENTRY_SIZE) as u64,
            })?;

        if entry.info != R_AARCH64_RELATIVE {
            warn!("unsupported relocation type {}", entry.info);
            skipped += 1;
            continue;
        }

        let target = image.offset_of(slide.wrapping_add(entry.offset))?;
        image.write_u64(target, slide.wrapping_add(entry.addend))?;
        applied += 1;
    }

    image.default_base = default_base;
    image.slide = slide;
    image.crctab_relocated = true;

    info!(
        "applied {} RELATIVE self-relocations, {} skipped",
        applied, skipped
    );

    Ok(())
}

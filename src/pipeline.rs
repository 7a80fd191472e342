//! End-to-end patch pipeline.
//!
//! Drives the whole run: fingerprint discovery against the kernel image,
//! then in-place module patching. Discovery failures abort; per-symbol
//! checksum misses do not, they come back in the report.

use log::*;

use crate::error::{Error, Result};
use crate::image::{KernelImage, KernelVersion, SymbolDirectory};
use crate::patch::{random_module_name, ModulePatcher};
use crate::symver::{self, RecordLayout};
use crate::{relocate, scan, Arch};

/// Candidate entry points for the module-unload scan, in probe order.
/// Compilers sometimes fold the syscall wrapper away and leave only a
/// constprop'd inner routine.
const DELETE_MODULE_SYMBOLS: [&str; 3] = [
    "sys_delete_module",
    "__do_sys_delete_module",
    "__do_sys_delete_module.constprop.0",
];

/// Pgd mapping routine used to fingerprint the mm struct.
const PGD_MAPPING_SYMBOL: &str = "create_pgd_mapping";

/// What a run discovered and what it could not.
#[derive(Debug)]
pub struct PatchReport {
    /// Fresh name the module was given.
    pub module_name: String,
    /// Target kernel's full vermagic string.
    pub vermagic: String,
    pub version: KernelVersion,
    /// Discovered module struct field offsets.
    pub init_offset: i64,
    pub exit_offset: i64,
    /// Symbol record generation the target kernel uses.
    pub layout: RecordLayout,
    /// Runtime slide; zero when the kernel was not self-relocated.
    pub slide: u64,
    /// Version table symbols no checksum was found for.
    pub missing: Vec<String>,
}

/// Patches `module` to load on the kernel described by `kernel` and
/// `dir`. Returns the patched module image and the discovery report.
pub fn patch_module(
    arch: Arch,
    kernel: Vec<u8>,
    dir: &SymbolDirectory,
    module: Vec<u8>,
) -> Result<(Vec<u8>, PatchReport)> {
    let mut image = KernelImage::new(arch, kernel, dir.get("_text")?)?;
    let mut patcher = ModulePatcher::new(module)?;

    info!(
        "kernel image: {} bytes at 0x{:x}, {} symbols",
        image.bytes().len(),
        image.anchor(),
        dir.len()
    );

    let unload = DELETE_MODULE_SYMBOLS
        .iter()
        .find_map(|name| dir.find(name))
        .ok_or_else(|| Error::SymbolNotFound(DELETE_MODULE_SYMBOLS[0].to_owned()))?;
    let (init_offset, exit_offset) = scan::module_field_offsets(arch, image.code_at(unload)?)?;

    let vermagic = image.vermagic(dir)?;
    let version = KernelVersion::parse(&vermagic)?;
    info!("target kernel {} ({})", version, vermagic);

    // The record size became dynamic with the namespace field; before
    // that every kernel shipped absolute pairs.
    let record_size = if version.older_than(4, 19, 0) {
        16
    } else {
        let kallsym = dir.get("module_get_kallsym")?;
        scan::symbol_record_size(arch, image.code_at(kallsym)?)?
    };
    if record_size == 0 {
        return Err(Error::PatternNotFound("symbol record size immediate"));
    }
    let layout = RecordLayout::from_record_size(record_size)?;
    image.layout = Some(layout);
    debug!("symbol record layout {:?}", layout);

    patcher.relocate_self_fields(init_offset, exit_offset)?;

    // Absolute name pointers are only usable after the kernel's own
    // relocation pass has been replayed.
    if layout.is_absolute() {
        match dir.find("__relocate_kernel") {
            Some(helper) => relocate::relocate(&mut image, helper)?,
            None => warn!("kernel is not self-relocatable, assuming fixed base"),
        }
    }

    let regions = symver::regions(dir, layout)?;
    let missing = patcher.patch_checksums(|name| {
        symver::resolve_checksum(&image, layout, name, &regions)
    })?;

    patcher.fill_runtime_info(|| {
        let mapping = dir.get(PGD_MAPPING_SYMBOL)?;
        scan::mm_pgd_field_offset(arch, image.code_at(mapping)?)
    })?;

    let module_name = random_module_name();
    patcher.rewrite_placeholders(vermagic.as_bytes(), &module_name)?;

    let report = PatchReport {
        module_name,
        vermagic,
        version,
        init_offset,
        exit_offset,
        layout,
        slide: image.slide,
        missing,
    };

    info!(
        "module patched as {}: init 0x{:x} exit 0x{:x} slide 0x{:x}, {} unresolved",
        report.module_name,
        report.init_offset,
        report.exit_offset,
        report.slide,
        report.missing.len()
    );

    Ok((patcher.into_bytes(), report))
}

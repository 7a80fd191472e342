//! Prebuilt module patching.
//!
//! Modules built against the portability contract carry placeholder
//! values everywhere the target kernel's identity leaks into the binary:
//! the self-description relocations point at fixed field offsets, the
//! version table holds stale checksums, and the info strings hold magic
//! markers. `ModulePatcher` rewrites all of them in place against one
//! discovered fingerprint set.

use goblin::elf::Elf;
use log::*;
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{Error, Result};

/// Contract field offsets of the module self-description struct as the
/// module was compiled, before patching.
pub const SELF_INIT_OFFSET: u64 = 8;
pub const SELF_EXIT_OFFSET: u64 = 16;

/// Self-description relocation section.
const THIS_MODULE_RELA: &str = ".rela.gnu.linkonce.this_module";
/// Symbol version table.
const VERSIONS: &str = "__versions";
/// Contract side-channel for runtime-discovered constants.
const RUNTIME_INFO: &str = ".kport.runtime.information";

const RELA_ENTRY_SIZE: usize = 24;

/// One version table record: checksum word plus NUL-padded symbol name.
const VERSION_RECORD_SIZE: usize = 64;
const VERSION_NAME_SIZE: usize = 56;

/// `{ mm_pgd_required: u64, mm_pgd_offset: u64 }`.
const RUNTIME_INFO_SIZE: usize = 16;

/// Marker the module's info strings carry in place of the real version
/// magic. Sized to hold any release's magic string.
fn vermagic_placeholder() -> Vec<u8> {
    let mut marker = b"VERMAGIC".repeat(16);
    marker.push(0);
    marker
}

/// Marker carried in place of the module name.
const NAME_PLACEHOLDER: &[u8] = b"RANDOMNAME\0";

/// Generates a fresh module name so repeated loads never collide.
pub fn random_module_name() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_PLACEHOLDER.len() - 1)
        .map(char::from)
        .collect()
}

pub struct ModulePatcher {
    buf: Vec<u8>,
}

impl ModulePatcher {
    /// Takes ownership of the module bytes; fails early when they do not
    /// parse as ELF.
    pub fn new(buf: Vec<u8>) -> Result<Self> {
        Elf::parse(&buf)?;
        Ok(Self { buf })
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn section_range(&self, name: &'static str) -> Result<Option<(usize, usize)>> {
        let elf = Elf::parse(&self.buf)?;
        for header in &elf.section_headers {
            if elf.shdr_strtab.get_at(header.sh_name) == Some(name) {
                let offset = header.sh_offset as usize;
                let size = header.sh_size as usize;
                if offset + size > self.buf.len() {
                    return Err(Error::Truncated {
                        expected: offset + size,
                        actual: self.buf.len(),
                    });
                }
                return Ok(Some((offset, size)));
            }
        }
        Ok(None)
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buf[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Points the self-description relocations at the discovered init and
    /// exit field offsets. The section is part of the contract; a module
    /// without it cannot be made loadable.
    pub fn relocate_self_fields(&mut self, init_offset: i64, exit_offset: i64) -> Result<()> {
        let (start, size) = self
            .section_range(THIS_MODULE_RELA)?
            .ok_or(Error::SectionNotFound(THIS_MODULE_RELA))?;

        let mut rewritten = 0usize;

        // Only full entries count; a ragged section keeps its tail.
        for i in 0..size / RELA_ENTRY_SIZE {
            let entry = start + i * RELA_ENTRY_SIZE;
            let r_offset = self.read_u64(entry);
            if r_offset == SELF_INIT_OFFSET {
                self.write_u64(entry, init_offset as u64);
                rewritten += 1;
            } else if r_offset == SELF_EXIT_OFFSET {
                self.write_u64(entry, exit_offset as u64);
                rewritten += 1;
            }
        }

        debug!("rewrote {} self-description relocations", rewritten);
        Ok(())
    }

    /// Replaces every version table checksum through `resolve`. Symbols
    /// the resolver cannot find are reported back, not fatal; the kernel
    /// decides at load time whether it tolerates them.
    pub fn patch_checksums<F>(&mut self, mut resolve: F) -> Result<Vec<String>>
    where
        F: FnMut(&str) -> Result<Option<u64>>,
    {
        let (start, size) = match self.section_range(VERSIONS)? {
            Some(range) => range,
            None => {
                warn!("module carries no version table");
                return Ok(Vec::new());
            }
        };

        let mut missing = Vec::new();

        for i in 0..size / VERSION_RECORD_SIZE {
            let record = start + i * VERSION_RECORD_SIZE;
            let name_bytes = &self.buf[record + 8..record + 8 + VERSION_NAME_SIZE];
            let len = name_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(VERSION_NAME_SIZE);
            if len == 0 {
                continue;
            }
            let name = String::from_utf8_lossy(&name_bytes[..len]).into_owned();

            match resolve(&name)? {
                Some(crc) => {
                    debug!("checksum for {} is 0x{:x}", name, crc);
                    self.write_u64(record, crc);
                }
                None => {
                    warn!("no checksum found for {}", name);
                    missing.push(name);
                }
            }
        }

        Ok(missing)
    }

    /// Fills the runtime information block. The page-table field offset is
    /// only discovered when the module declares it needs one.
    pub fn fill_runtime_info<F>(&mut self, pgd_offset: F) -> Result<()>
    where
        F: FnOnce() -> Result<i64>,
    {
        let (start, size) = match self.section_range(RUNTIME_INFO)? {
            Some(range) => range,
            None => {
                debug!("module carries no runtime information block");
                return Ok(());
            }
        };

        if size < RUNTIME_INFO_SIZE {
            return Err(Error::Truncated {
                expected: RUNTIME_INFO_SIZE,
                actual: size,
            });
        }

        if self.read_u64(start) != 0 {
            let offset = pgd_offset()?;
            debug!("mm pgd field offset 0x{:x}", offset);
            self.write_u64(start + 8, offset as u64);
        }

        Ok(())
    }

    /// Swaps every placeholder occurrence for the real value, preserving
    /// the placeholder's width and NUL padding.
    pub fn rewrite_placeholders(&mut self, vermagic: &[u8], name: &str) -> Result<()> {
        let magic_marker = vermagic_placeholder();
        let magics = self.replace_all(&magic_marker, vermagic);
        if magics == 0 {
            return Err(Error::PlaceholderNotFound("version magic"));
        }

        let names = self.replace_all(NAME_PLACEHOLDER, name.as_bytes());

        info!(
            "rewrote {} version magic and {} name placeholders",
            magics, names
        );
        Ok(())
    }

    fn replace_all(&mut self, marker: &[u8], value: &[u8]) -> usize {
        let positions: Vec<usize> = self
            .buf
            .windows(marker.len())
            .enumerate()
            .filter_map(|(i, w)| (w == marker).then(|| i))
            .collect();

        // Zero the full marker width first so the replacement always ends
        // up NUL terminated, then copy at most width - 1 bytes.
        let len = value.len().min(marker.len() - 1);
        for &pos in &positions {
            for b in &mut self.buf[pos..pos + marker.len()] {
                *b = 0;
            }
            self.buf[pos..pos + len].copy_from_slice(&value[..len]);
        }

        positions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], off: usize, v: u64) {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Builds a minimal relocatable ELF64 with the given sections. Enough
    /// structure for goblin to parse.
    fn build_module(sections: &[(&str, u32, Vec<u8>)]) -> Vec<u8> {
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, _, _) in sections {
            name_offsets.push(shstrtab.len());
            shstrtab.extend_from_slice(name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name = shstrtab.len();
        shstrtab.extend_from_slice(b".shstrtab\0");

        let mut buf = vec![0u8; 64];
        let mut data_offsets = Vec::new();
        for (_, _, data) in sections {
            data_offsets.push(buf.len());
            buf.extend_from_slice(data);
        }
        let shstrtab_offset = buf.len();
        buf.extend_from_slice(&shstrtab);
        while buf.len() % 8 != 0 {
            buf.push(0);
        }

        let shoff = buf.len();
        buf.extend_from_slice(&[0u8; 64]); // null section

        let mut push_header = |buf: &mut Vec<u8>, name: usize, typ: u32, off: usize, size: usize| {
            let mut sh = [0u8; 64];
            put_u32(&mut sh, 0, name as u32);
            put_u32(&mut sh, 4, typ);
            put_u64(&mut sh, 24, off as u64);
            put_u64(&mut sh, 32, size as u64);
            put_u64(&mut sh, 48, 8); // sh_addralign
            buf.extend_from_slice(&sh);
        };

        for (i, (_, typ, data)) in sections.iter().enumerate() {
            push_header(&mut buf, name_offsets[i], *typ, data_offsets[i], data.len());
        }
        push_header(&mut buf, shstrtab_name, 3, shstrtab_offset, shstrtab.len());

        // ELF header.
        buf[0..4].copy_from_slice(b"\x7fELF");
        buf[4] = 2; // 64-bit
        buf[5] = 1; // little endian
        buf[6] = 1; // ident version
        put_u16(&mut buf, 16, 1); // ET_REL
        put_u16(&mut buf, 18, 183); // EM_AARCH64
        put_u32(&mut buf, 20, 1); // e_version
        put_u64(&mut buf, 40, shoff as u64);
        put_u16(&mut buf, 52, 64); // e_ehsize
        put_u16(&mut buf, 58, 64); // e_shentsize
        put_u16(&mut buf, 60, (sections.len() + 2) as u16);
        put_u16(&mut buf, 62, (sections.len() + 1) as u16);

        buf
    }

    fn version_record(crc: u64, name: &str) -> Vec<u8> {
        let mut record = vec![0u8; VERSION_RECORD_SIZE];
        put_u64(&mut record, 0, crc);
        record[8..8 + name.len()].copy_from_slice(name.as_bytes());
        record
    }

    #[test]
    fn self_field_relocations_rewritten() {
        let mut rela = vec![0u8; 3 * RELA_ENTRY_SIZE];
        put_u64(&mut rela, 0, SELF_INIT_OFFSET);
        put_u64(&mut rela, 24, 0x1000); // unrelated entry
        put_u64(&mut rela, 48, SELF_EXIT_OFFSET);

        let module = build_module(&[(THIS_MODULE_RELA, 4, rela)]);
        let mut patcher = ModulePatcher::new(module).unwrap();
        patcher.relocate_self_fields(0x150, 0x2f8).unwrap();

        let out = patcher.into_bytes();
        let sh_off = 64usize;
        assert_eq!(&out[sh_off..sh_off + 8], &0x150u64.to_le_bytes());
        assert_eq!(&out[sh_off + 24..sh_off + 32], &0x1000u64.to_le_bytes());
        assert_eq!(&out[sh_off + 48..sh_off + 56], &0x2f8u64.to_le_bytes());
    }

    #[test]
    fn missing_self_description_is_fatal() {
        let module = build_module(&[(".text", 1, vec![0u8; 8])]);
        let mut patcher = ModulePatcher::new(module).unwrap();
        assert!(matches!(
            patcher.relocate_self_fields(0x150, 0x2f8),
            Err(Error::SectionNotFound(_))
        ));
    }

    #[test]
    fn checksums_patched_and_missing_reported() {
        let mut versions = version_record(0, "kmalloc");
        versions.extend(version_record(0, "no_such_symbol"));

        let module = build_module(&[(VERSIONS, 1, versions)]);
        let mut patcher = ModulePatcher::new(module).unwrap();

        let missing = patcher
            .patch_checksums(|name| {
                Ok(if name == "kmalloc" {
                    Some(0xabcd_ef01)
                } else {
                    None
                })
            })
            .unwrap();

        assert_eq!(missing, ["no_such_symbol"]);
        let out = patcher.into_bytes();
        assert_eq!(&out[64..72], &0xabcd_ef01u64.to_le_bytes());
        assert_eq!(&out[64 + 64..72 + 64], &0u64.to_le_bytes());
    }

    #[test]
    fn ragged_version_section_keeps_its_tail() {
        let mut versions = version_record(0, "kmalloc");
        // Partial trailing record, as a corrupted module would carry.
        versions.extend_from_slice(&[0xa5; 24]);

        let module = build_module(&[(VERSIONS, 1, versions)]);
        let mut patcher = ModulePatcher::new(module).unwrap();

        let mut seen = Vec::new();
        let missing = patcher
            .patch_checksums(|name| {
                seen.push(name.to_owned());
                Ok(Some(0x1))
            })
            .unwrap();

        assert!(missing.is_empty());
        assert_eq!(seen, ["kmalloc"]);

        let out = patcher.into_bytes();
        assert!(out[64 + 64..64 + 88].iter().all(|&b| b == 0xa5));
    }

    #[test]
    fn ragged_rela_section_keeps_its_tail() {
        let mut rela = vec![0u8; RELA_ENTRY_SIZE + 8];
        put_u64(&mut rela, 0, SELF_INIT_OFFSET);
        // First 8 bytes of a truncated second entry, same value as the
        // exit-field placeholder.
        put_u64(&mut rela, 24, SELF_EXIT_OFFSET);

        let module = build_module(&[(THIS_MODULE_RELA, 4, rela)]);
        let mut patcher = ModulePatcher::new(module).unwrap();
        patcher.relocate_self_fields(0x150, 0x2f8).unwrap();

        let out = patcher.into_bytes();
        assert_eq!(&out[64..72], &0x150u64.to_le_bytes());
        assert_eq!(&out[88..96], &SELF_EXIT_OFFSET.to_le_bytes());
    }

    #[test]
    fn placeholders_replaced_width_exact() {
        let marker = vermagic_placeholder();
        let mut data = b"<<".to_vec();
        data.extend_from_slice(&marker);
        data.extend_from_slice(b"||");
        data.extend_from_slice(NAME_PLACEHOLDER);
        data.extend_from_slice(NAME_PLACEHOLDER);
        data.extend_from_slice(b">>");

        let module = build_module(&[(".modinfo", 1, data)]);
        let mut patcher = ModulePatcher::new(module).unwrap();
        patcher
            .rewrite_placeholders(b"5.4.86 SMP mod_unload aarch64", "zq1x8p4n2k")
            .unwrap();

        let out = patcher.into_bytes();
        let base = 64usize;
        assert_eq!(&out[base..base + 2], b"<<");

        let magic = &out[base + 2..base + 2 + marker.len()];
        assert!(magic.starts_with(b"5.4.86 SMP mod_unload aarch64\0"));
        assert!(magic[29..].iter().all(|&b| b == 0));

        let after_magic = base + 2 + marker.len();
        assert_eq!(&out[after_magic..after_magic + 2], b"||");

        let name0 = after_magic + 2;
        assert_eq!(&out[name0..name0 + 11], b"zq1x8p4n2k\0");
        assert_eq!(&out[name0 + 11..name0 + 22], b"zq1x8p4n2k\0");
        assert_eq!(&out[name0 + 22..name0 + 24], b">>");
    }

    #[test]
    fn oversized_vermagic_is_truncated_with_nul() {
        let marker = vermagic_placeholder();
        let module = build_module(&[(".modinfo", 1, marker.clone())]);
        let mut patcher = ModulePatcher::new(module).unwrap();

        let long = vec![b'x'; 200];
        patcher.rewrite_placeholders(&long, "name").unwrap();

        let out = patcher.into_bytes();
        let magic = &out[64..64 + marker.len()];
        assert!(magic[..marker.len() - 1].iter().all(|&b| b == b'x'));
        assert_eq!(magic[marker.len() - 1], 0);
    }

    #[test]
    fn missing_vermagic_placeholder_is_fatal() {
        let module = build_module(&[(".modinfo", 1, b"nothing here".to_vec())]);
        let mut patcher = ModulePatcher::new(module).unwrap();
        assert!(matches!(
            patcher.rewrite_placeholders(b"5.4.86", "name"),
            Err(Error::PlaceholderNotFound(_))
        ));
    }

    #[test]
    fn runtime_info_filled_only_on_demand() {
        let mut info = vec![0u8; RUNTIME_INFO_SIZE];
        put_u64(&mut info, 0, 1);

        let module = build_module(&[(RUNTIME_INFO, 1, info)]);
        let mut patcher = ModulePatcher::new(module).unwrap();
        patcher.fill_runtime_info(|| Ok(0x48)).unwrap();

        let out = patcher.into_bytes();
        assert_eq!(&out[72..80], &0x48u64.to_le_bytes());
    }

    #[test]
    fn runtime_info_skips_discovery_when_not_required() {
        let info = vec![0u8; RUNTIME_INFO_SIZE];
        let module = build_module(&[(RUNTIME_INFO, 1, info)]);
        let mut patcher = ModulePatcher::new(module).unwrap();

        patcher
            .fill_runtime_info(|| panic!("should not be called"))
            .unwrap();

        let out = patcher.into_bytes();
        assert_eq!(&out[72..80], &0u64.to_le_bytes());
    }

    #[test]
    fn random_names_fit_the_placeholder() {
        let name = random_module_name();
        assert_eq!(name.len(), NAME_PLACEHOLDER.len() - 1);
        assert!(name.bytes().all(|b| b.is_ascii_alphanumeric()));
    }
}

//! Kernel image buffer and address bookkeeping.
//!
//! Every address the pipeline touches is a runtime virtual address taken
//! from the symbol directory. The image anchors that address space at one
//! point: the `_text` symbol corresponds to buffer offset 0. All
//! address-to-offset translation goes through [`KernelImage::offset_of`] so
//! malformed input surfaces as [`Error::OutOfBounds`] instead of wrapping.

use std::collections::HashMap;
use std::convert::TryInto;
use std::fmt;

use crate::error::{Error, Result};
use crate::symver::RecordLayout;
use crate::Arch;

/// aarch64 `Image` header: two code words, then `text_offset` and
/// `image_size` as LE u64.
const AARCH64_HEADER_LEN: usize = 24;

/// Window handed to the disassembler for one routine.
const CODE_WINDOW: usize = 0x1000;

/// Raw kernel image plus everything discovered about it during a run.
pub struct KernelImage {
    buf: Vec<u8>,
    pub arch: Arch,
    /// `text_offset` from the image header.
    pub load_offset: u64,
    /// `image_size` from the image header.
    pub load_size: u64,
    /// Pre-relocation base address baked into the kernel, recovered from
    /// the self-relocation prologue.
    pub default_base: u64,
    /// Runtime slide: `anchor - load_offset - default_base`. Valid once the
    /// relocator has run.
    pub slide: u64,
    /// Set when the self-relocation pass ran; checksum words then need
    /// slide correction.
    pub crctab_relocated: bool,
    /// Active symbol record layout, decided once per run.
    pub layout: Option<RecordLayout>,
    anchor: u64,
}

impl KernelImage {
    /// Wraps a raw (already decompressed) kernel image. `anchor` is the
    /// runtime address of the image start (`_text`), the single point used
    /// to translate every other address to a buffer offset.
    pub fn new(arch: Arch, buf: Vec<u8>, anchor: u64) -> Result<Self> {
        let (load_offset, load_size) = match arch {
            Arch::Aarch64 => {
                if buf.len() < AARCH64_HEADER_LEN {
                    return Err(Error::Truncated {
                        expected: AARCH64_HEADER_LEN,
                        actual: buf.len(),
                    });
                }
                (read_u64_at(&buf, 8), read_u64_at(&buf, 16))
            }
            // x86 images carry no equivalent fixed header; the relocation
            // path is unsupported there anyway.
            Arch::X86_64 => (0, 0),
        };

        Ok(Self {
            buf,
            arch,
            load_offset,
            load_size,
            default_base: 0,
            slide: 0,
            crctab_relocated: false,
            layout: None,
            anchor,
        })
    }

    pub fn anchor(&self) -> u64 {
        self.anchor
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Translates a runtime address to a buffer offset.
    pub fn offset_of(&self, addr: u64) -> Result<usize> {
        let off = addr
            .checked_sub(self.anchor)
            .ok_or(Error::OutOfBounds { addr })?;
        if off >= self.buf.len() as u64 {
            return Err(Error::OutOfBounds { addr });
        }
        Ok(off as usize)
    }

    /// A bounded code window starting at `addr`, for disassembly.
    pub fn code_at(&self, addr: u64) -> Result<&[u8]> {
        let off = self.offset_of(addr)?;
        let end = (off + CODE_WINDOW).min(self.buf.len());
        Ok(&self.buf[off..end])
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset, 4)?;
        Ok(u32::from_le_bytes(
            self.buf[offset..offset + 4].try_into().unwrap(),
        ))
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        self.check(offset, 8)?;
        Ok(read_u64_at(&self.buf, offset))
    }

    pub fn write_u64(&mut self, offset: usize, val: u64) -> Result<()> {
        self.check(offset, 8)?;
        self.buf[offset..offset + 8].copy_from_slice(&val.to_le_bytes());
        Ok(())
    }

    /// NUL-terminated byte string at a buffer offset.
    pub fn cstr_at(&self, offset: usize) -> Result<&[u8]> {
        if offset >= self.buf.len() {
            return Err(Error::OutOfBounds {
                addr: self.anchor + offset as u64,
            });
        }
        let tail = &self.buf[offset..];
        let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(&tail[..len])
    }

    /// The kernel's vermagic string, read through the symbol directory.
    pub fn vermagic(&self, dir: &SymbolDirectory) -> Result<String> {
        let off = self.offset_of(dir.get("vermagic")?)?;
        Ok(String::from_utf8_lossy(self.cstr_at(off)?).into_owned())
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |e| e > self.buf.len()) {
            return Err(Error::OutOfBounds {
                addr: self.anchor + offset as u64,
            });
        }
        Ok(())
    }
}

fn read_u64_at(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

/// Symbol name to runtime address mapping, supplied externally
/// (e.g. parsed from `/proc/kallsyms`). Read-only to the core.
#[derive(Default)]
pub struct SymbolDirectory {
    map: HashMap<String, u64>,
}

impl SymbolDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, addr: u64) {
        self.map.insert(name.into(), addr);
    }

    /// Soft lookup; absent symbols are a normal condition.
    pub fn find(&self, name: &str) -> Option<u64> {
        self.map.get(name).copied()
    }

    /// Lookup of a symbol the run cannot proceed without.
    pub fn get(&self, name: &str) -> Result<u64> {
        self.find(name)
            .ok_or_else(|| Error::SymbolNotFound(name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl std::iter::FromIterator<(String, u64)> for SymbolDirectory {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().collect(),
        }
    }
}

/// Kernel version parsed from the leading digits of the vermagic string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub point: u32,
}

impl KernelVersion {
    /// Accepts anything of the form `major.minor[.point][-suffix]`; at
    /// least major and minor must be present.
    pub fn parse(vermagic: &str) -> Result<Self> {
        let release = vermagic.split_whitespace().next().unwrap_or("");
        let mut nums = release.split('.').map(|part| {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse::<u32>().ok()
        });

        match (nums.next().flatten(), nums.next().flatten()) {
            (Some(major), Some(minor)) => Ok(Self {
                major,
                minor,
                point: nums.next().flatten().unwrap_or(0),
            }),
            _ => Err(Error::BadVermagic(vermagic.to_owned())),
        }
    }

    pub fn older_than(&self, major: u32, minor: u32, point: u32) -> bool {
        (self.major, self.minor, self.point) < (major, minor, point)
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.point)
    }
}

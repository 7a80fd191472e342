//! Versioned exported-symbol table resolution.
//!
//! Kernels export their symbols through up to three table regions
//! (public, GPL, GPL-future), each a parallel pair of symbol records and
//! checksum words. The record shape changed four times across release
//! lineages; the active generation is decided once per run from the record
//! size recovered by the scanner and dispatched at runtime.

use log::*;

use crate::error::{Error, Result};
use crate::image::{KernelImage, SymbolDirectory};

/// Width of one checksum word in the parallel crc array.
const CRC_WORD_SIZE: usize = 8;

/// The four known record generations, distinguished by how a record
/// reaches its symbol name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordLayout {
    /// `{ value: u64, name: ptr }` — absolute pointers.
    AbsPair,
    /// `{ value_off: i32, name_off: i32 }` — offsets relative to the
    /// field's own address.
    RelPair,
    /// `RelPair` plus a namespace offset.
    RelTriple,
    /// `AbsPair` plus a namespace pointer.
    AbsTriple,
}

impl RecordLayout {
    /// Maps the record size recovered from kernel code to a generation.
    pub fn from_record_size(size: u64) -> Result<Self> {
        match size {
            8 => Ok(RecordLayout::RelPair),
            16 => Ok(RecordLayout::AbsPair),
            12 => Ok(RecordLayout::RelTriple),
            24 => Ok(RecordLayout::AbsTriple),
            _ => Err(Error::UnsupportedSymbolLayout { record_size: size }),
        }
    }

    pub fn record_size(self) -> usize {
        match self {
            RecordLayout::RelPair => 8,
            RecordLayout::RelTriple => 12,
            RecordLayout::AbsPair => 16,
            RecordLayout::AbsTriple => 24,
        }
    }

    /// Absolute layouts carry pointers that the kernel self-relocates.
    pub fn is_absolute(self) -> bool {
        matches!(self, RecordLayout::AbsPair | RecordLayout::AbsTriple)
    }
}

/// One exported-symbol table region: parallel address ranges for symbol
/// records and checksum words.
#[derive(Clone, Copy, Debug)]
pub struct SymbolTableRegion {
    pub name: &'static str,
    pub sym_start: u64,
    pub sym_stop: u64,
    pub crc_start: u64,
    pub crc_stop: u64,
}

const REGION_SYMBOLS: [(&str, [&str; 4]); 3] = [
    (
        "ksymtab_gpl_future",
        [
            "__start___ksymtab_gpl_future",
            "__stop___ksymtab_gpl_future",
            "__start___kcrctab_gpl_future",
            "__stop___kcrctab_gpl_future",
        ],
    ),
    (
        "ksymtab_gpl",
        [
            "__start___ksymtab_gpl",
            "__stop___ksymtab_gpl",
            "__start___kcrctab_gpl",
            "__stop___kcrctab_gpl",
        ],
    ),
    (
        "ksymtab",
        [
            "__start___ksymtab",
            "__stop___ksymtab",
            "__start___kcrctab",
            "__stop___kcrctab",
        ],
    ),
];

/// Builds the region list from the symbol directory, in resolution
/// priority order. A region only participates when its checksum table is
/// present. Every participating region's range must hold whole records of
/// the active layout; a ragged one aborts before any lookup runs.
pub fn regions(dir: &SymbolDirectory, layout: RecordLayout) -> Result<Vec<SymbolTableRegion>> {
    let record_size = layout.record_size() as u64;
    let mut regions = Vec::new();

    for &(name, [sym_start, sym_stop, crc_start, crc_stop]) in REGION_SYMBOLS.iter() {
        let lookup = || {
            Some(SymbolTableRegion {
                name,
                crc_start: dir.find(crc_start)?,
                crc_stop: dir.find(crc_stop)?,
                sym_start: dir.find(sym_start)?,
                sym_stop: dir.find(sym_stop)?,
            })
        };
        let region = match lookup() {
            Some(region) => region,
            None => continue,
        };

        let len = region.sym_stop.wrapping_sub(region.sym_start);
        if len % record_size != 0 {
            return Err(Error::RegionNotAligned {
                region: region.name,
                len,
                record_size,
            });
        }

        debug!(
            "symbol table {} sym 0x{:x}-0x{:x} crc 0x{:x}-0x{:x}",
            region.name, region.sym_start, region.sym_stop, region.crc_start, region.crc_stop
        );
        regions.push(region);
    }

    Ok(regions)
}

/// Resolves one symbol name to its version checksum.
///
/// Scans each region in priority order with the given record layout;
/// the first exact name match wins. Returns `Ok(None)` when no region
/// holds the name; that is a per-symbol condition the caller handles.
pub fn resolve_checksum(
    image: &KernelImage,
    layout: RecordLayout,
    name: &str,
    regions: &[SymbolTableRegion],
) -> Result<Option<u64>> {
    let record_size = layout.record_size();

    for region in regions {
        let len = region.sym_stop.wrapping_sub(region.sym_start);
        if len % record_size as u64 != 0 {
            return Err(Error::RegionNotAligned {
                region: region.name,
                len,
                record_size: record_size as u64,
            });
        }

        let count = (len / record_size as u64) as usize;
        if count == 0 {
            continue;
        }

        let base = image.offset_of(region.sym_start)?;

        for index in 0..count {
            let record = base + index * record_size;

            let name_offset = match layout {
                RecordLayout::AbsPair | RecordLayout::AbsTriple => {
                    image.offset_of(image.read_u64(record + 8)?)?
                }
                RecordLayout::RelPair | RecordLayout::RelTriple => {
                    let rel = image.read_u32(record + 4)? as i32 as i64;
                    let off = record as i64 + 4 + rel;
                    if off < 0 {
                        return Err(Error::OutOfBounds {
                            addr: image.anchor().wrapping_add(off as u64),
                        });
                    }
                    off as usize
                }
            };

            if image.cstr_at(name_offset)? != name.as_bytes() {
                continue;
            }

            let crc_offset = image.offset_of(region.crc_start)? + index * CRC_WORD_SIZE;
            let mut crc = image.read_u64(crc_offset)?;

            if image.crctab_relocated {
                // The self-relocation pass did not touch the checksum
                // words; undo the slide the kernel would have applied.
                crc = crc.wrapping_sub(image.slide);
            }

            debug!("{} found in {} at index {}", name, region.name, index);
            return Ok(Some(crc));
        }
    }

    Ok(None)
}

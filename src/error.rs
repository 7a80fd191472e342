//! Error types for kport.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while fingerprinting a kernel image or patching a
/// module against it.
///
/// Everything here is terminal for output generation except where noted:
/// a checksum that cannot be resolved for a single imported symbol is not
/// an error at all, it is reported as `Ok(None)` by the resolver and
/// collected in the patch report.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no instructions decoded at {routine}")]
    Decode { routine: &'static str },

    #[error("instruction fingerprint '{0}' not found (unrecognized kernel build)")]
    PatternNotFound(&'static str),

    #[error("unsupported self-relocation idiom: {0}")]
    UnsupportedRelocationIdiom(&'static str),

    #[error("kernel symbol record size {record_size} maps to no known layout generation")]
    UnsupportedSymbolLayout { record_size: u64 },

    #[error("symbol table region '{region}' length {len} is not a multiple of record size {record_size}")]
    RegionNotAligned {
        region: &'static str,
        len: u64,
        record_size: u64,
    },

    #[error("{0} is not supported on {1}")]
    UnsupportedArchitecture(&'static str, crate::Arch),

    #[error("required symbol '{0}' missing from the symbol directory")]
    SymbolNotFound(String),

    #[error("section '{0}' not found in module")]
    SectionNotFound(&'static str),

    #[error("module carries no {0} placeholder")]
    PlaceholderNotFound(&'static str),

    #[error("address 0x{addr:X} falls outside the kernel image")]
    OutOfBounds { addr: u64 },

    #[error("kernel image too small: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("vermagic string '{0}' carries no parsable kernel version")]
    BadVermagic(String),

    #[error("emulation fault, stopped at pc 0x{pc:X}")]
    Emulation { pc: u64 },

    #[error("malformed module ELF: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("disassembler error: {0}")]
    Disasm(#[from] capstone::Error),
}

//! Kernel module portability patcher.
//!
//! Prebuilt kernel modules refuse to load on kernels they were not built
//! against: the module loader checks the vermagic string, per-symbol
//! version checksums, and pokes fixed offsets into the module struct. This
//! crate discovers all of those ABI fingerprints directly from a raw
//! kernel image (disassembly pattern scanning, symbol table walking, and a
//! replay of the kernel's own self-relocation pass) and rewrites a module
//! built against the portability contract so the target kernel accepts it.
//!
//! The main entry point is [`pipeline::patch_module`]; the individual
//! stages are public for callers that need finer control.

use std::fmt;

pub mod error;
pub mod image;
pub mod patch;
pub mod pipeline;
pub mod relocate;
pub mod scan;
pub mod symver;

#[cfg(feature = "emulation")]
pub mod emulate;

pub use crate::error::{Error, Result};
pub use crate::image::{KernelImage, KernelVersion, SymbolDirectory};
pub use crate::patch::ModulePatcher;
pub use crate::pipeline::{patch_module, PatchReport};
pub use crate::symver::RecordLayout;

/// Instruction set of the target kernel. Every component takes this
/// explicitly; nothing is inferred from the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => f.write_str("x86_64"),
            Arch::Aarch64 => f.write_str("aarch64"),
        }
    }
}

//! CPU emulation bridge for cross-checking static discovery.
//!
//! Instead of walking the export tables ourselves we can run the kernel's
//! own `find_symbol` under emulation and compare answers. Strictly a
//! verification aid; the static path never depends on it.

use log::*;
use unicorn_engine::unicorn_const::{Arch as UcArch, Mode, Permission};
use unicorn_engine::{RegisterARM64, Unicorn};

use crate::error::{Error, Result};
use crate::image::KernelImage;
use crate::Arch;

/// Scratch stack mapping, well below any kernel address.
const STACK_BASE: u64 = 0x20_0000;
const STACK_SIZE: usize = 0x10_0000;

/// Return address sentinel; emulation stops when the routine returns here.
const RETURN_TO: u64 = 1;

pub struct EmulationBridge {
    emu: Unicorn<'static, ()>,
}

impl EmulationBridge {
    /// Maps the kernel image at its anchor address (which must be page
    /// aligned) plus a scratch stack.
    pub fn new(image: &KernelImage) -> Result<Self> {
        if image.arch != Arch::Aarch64 {
            return Err(Error::UnsupportedArchitecture("emulation bridge", image.arch));
        }

        let mut emu = setup(Unicorn::new(UcArch::ARM64, Mode::LITTLE_ENDIAN))?;

        let mapped = (image.bytes().len() + 0xfff) & !0xfff;
        setup(emu.mem_map(image.anchor(), mapped, Permission::ALL))?;
        setup(emu.mem_write(image.anchor(), image.bytes()))?;
        setup(emu.mem_map(STACK_BASE, STACK_SIZE, Permission::READ | Permission::WRITE))?;

        debug!(
            "emulator mapped {} image bytes at 0x{:x}",
            mapped,
            image.anchor()
        );

        Ok(Self { emu })
    }

    /// Runs the kernel's self-relocation routine with the given slide, the
    /// same way boot code invokes it.
    pub fn run_relocation_routine(&mut self, helper: u64, slide: u64) -> Result<()> {
        setup(self.emu.reg_write(RegisterARM64::X23, slide))?;
        self.call(helper)
    }

    /// Asks the emulated kernel's `find_symbol` for a checksum.
    ///
    /// The raw word the kernel hands back is normalized by the value of
    /// the kernel's own `kimage_vaddr` variable (at address
    /// `kimage_vaddr`, read from emulated memory) minus `default_base`,
    /// undoing whatever slide the table carries.
    pub fn query_find_symbol(
        &mut self,
        routine: u64,
        name: &str,
        kimage_vaddr: u64,
        default_base: u64,
    ) -> Result<Option<u64>> {
        let owner_slot = STACK_BASE;
        let crc_slot = STACK_BASE + 8;
        let name_addr = STACK_BASE + 16;

        setup(self.emu.mem_write(owner_slot, &[0u8; 16]))?;
        let mut name_bytes = name.as_bytes().to_vec();
        name_bytes.push(0);
        setup(self.emu.mem_write(name_addr, &name_bytes))?;

        // find_symbol(name, &owner, &crc, gplok = true, warn = false)
        setup(self.emu.reg_write(RegisterARM64::X0, name_addr))?;
        setup(self.emu.reg_write(RegisterARM64::X1, owner_slot))?;
        setup(self.emu.reg_write(RegisterARM64::X2, crc_slot))?;
        setup(self.emu.reg_write(RegisterARM64::X3, 1))?;
        setup(self.emu.reg_write(RegisterARM64::X4, 0))?;

        self.call(routine)?;

        if setup(self.emu.reg_read(RegisterARM64::X0))? == 0 {
            return Ok(None);
        }

        let crc_ptr = self.read_u64(crc_slot)?;
        if crc_ptr == 0 {
            return Ok(None);
        }

        let crc = self.read_u64(crc_ptr)?;
        let correction = self.read_u64(kimage_vaddr)?.wrapping_sub(default_base);
        Ok(Some(crc.wrapping_sub(correction)))
    }

    /// Reads a word out of emulated memory, e.g. a kernel variable after a
    /// routine ran.
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = setup(self.emu.mem_read_as_vec(addr, 8))?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(word))
    }

    fn call(&mut self, entry: u64) -> Result<()> {
        setup(
            self.emu
                .reg_write(RegisterARM64::SP, STACK_BASE + STACK_SIZE as u64 - 0x100),
        )?;
        setup(self.emu.reg_write(RegisterARM64::LR, RETURN_TO))?;

        self.emu.emu_start(entry, RETURN_TO, 0, 0).map_err(|e| {
            let pc = self.emu.reg_read(RegisterARM64::PC).unwrap_or(0);
            warn!("emulation stopped at 0x{:x}: {:?}", pc, e);
            Error::Emulation { pc }
        })
    }
}

fn setup<T>(res: core::result::Result<T, unicorn_engine::unicorn_const::uc_error>) -> Result<T> {
    res.map_err(|e| {
        warn!("emulator fault: {:?}", e);
        Error::Emulation { pc: 0 }
    })
}

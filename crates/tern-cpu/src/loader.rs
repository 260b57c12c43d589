//! Entry-point hand-off from loaded guest images.

use goblin::elf::Elf;
use tracing::debug;

use crate::{CpuError, Result, TranslationCpu};

const UIMAGE_MAGIC: u32 = 0x2705_1956;
const UIMAGE_HEADER_LEN: usize = 64;
const UIMAGE_ENTRY_OFFSET: usize = 20;

impl TranslationCpu {
    /// Point the CPU at an ELF image's entry, redirected through the bus
    /// when a redirector covers the entry address. Returns the effective
    /// entry point.
    pub fn init_from_elf(&self, image: &[u8]) -> Result<u32> {
        let elf = Elf::parse(image).map_err(|e| CpuError::Image(e.to_string()))?;
        let entry = elf.header.e_entry as u32;
        Ok(self.hand_off(entry))
    }

    /// Point the CPU at a U-Boot legacy uImage's entry point.
    pub fn init_from_uimage(&self, image: &[u8]) -> Result<u32> {
        if image.len() < UIMAGE_HEADER_LEN {
            return Err(CpuError::Image(
                "uImage is shorter than its 64-byte header".into(),
            ));
        }
        let magic = u32::from_be_bytes(image[0..4].try_into().unwrap());
        if magic != UIMAGE_MAGIC {
            return Err(CpuError::Image(format!(
                "bad uImage magic {magic:#010x}"
            )));
        }
        let entry = u32::from_be_bytes(
            image[UIMAGE_ENTRY_OFFSET..UIMAGE_ENTRY_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        Ok(self.hand_off(entry))
    }

    fn hand_off(&self, entry: u32) -> u32 {
        let effective = self.inner.bus.redirect_entry_address(entry);
        if effective != entry {
            debug!(
                cpu = self.inner.slot,
                entry = format_args!("{entry:#x}"),
                effective = format_args!("{effective:#x}"),
                "entry point redirected"
            );
        }
        self.set_pc(effective);
        effective
    }
}

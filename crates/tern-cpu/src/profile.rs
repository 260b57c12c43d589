use tern_translator::native::LibrarySpec;

use crate::{CpuError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// A named register exposed by the translator for this architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDescriptor {
    /// Index the translator uses for this register.
    pub id: i32,
    pub name: &'static str,
    /// Width in bits.
    pub width: u8,
    /// Compound bank this register belongs to (e.g. a GPR file), if any.
    pub bank: Option<&'static str>,
}

/// Everything architecture-specific a [`TranslationCpu`] needs, declared up
/// front as data instead of through a subclass hierarchy: identity of the
/// translator library, the register table, interrupt line decoding.
///
/// [`TranslationCpu`]: crate::TranslationCpu
#[derive(Debug, Clone)]
pub struct CpuProfile {
    /// Human-readable model name (e.g. "cortex-a8").
    pub model: String,
    /// Architecture family, also the middle component of the translator
    /// library name (e.g. "arm").
    pub architecture: String,
    /// CPU type string passed to the translator's `init`.
    pub cpu_type: String,
    /// Guest word size in bits.
    pub word_size: u8,
    pub endianness: Endianness,
    /// Number of interrupt input lines. Architectures declare at least two
    /// (e.g. IRQ and FIQ).
    pub interrupt_lines: usize,
    pub registers: Vec<RegisterDescriptor>,
    /// Register id holding the program counter.
    pub pc_register: i32,
    /// Maps a GPIO line number to the translator's interrupt number.
    /// `None` entries reject the line. Defaults to the identity mapping
    /// when empty.
    pub interrupt_decode: Vec<Option<i32>>,
}

impl CpuProfile {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.interrupt_lines < 2 {
            return Err(CpuError::InvalidCpuType(format!(
                "{}: architectures declare at least two interrupt lines",
                self.cpu_type
            )));
        }
        Ok(())
    }

    pub(crate) fn decode_interrupt(&self, line: usize) -> Option<i32> {
        if line >= self.interrupt_lines {
            return None;
        }
        if self.interrupt_decode.is_empty() {
            return Some(line as i32);
        }
        self.interrupt_decode.get(line).copied().flatten()
    }

    pub fn library_spec(&self) -> LibrarySpec {
        LibrarySpec {
            word_size: self.word_size,
            architecture: self.architecture.clone(),
            big_endian: self.endianness == Endianness::Big,
        }
    }
}

//! Binding to the native dynamic binary translator.
//!
//! Each CPU architecture ships as a standalone shared object that translates
//! guest machine code into host blocks and executes them. The managed side
//! talks to it through two symmetric surfaces:
//!
//! - [`TranslationEngine`] — the functions the harness calls *into* the
//!   translator (execute, map ranges, deliver IRQs, manage breakpoints and
//!   the translation cache, import/export opaque state).
//! - [`TranslatorClient`] — the callbacks the translator makes *back into*
//!   the harness (bus I/O, block-begin notification, host allocation, abort
//!   and log reporting).
//!
//! [`native::NativeEngine`] implements [`TranslationEngine`] over a shared
//! object extracted to a temporary file; tests substitute scripted engines,
//! which is why both surfaces are object-safe traits.

mod error;
mod memory_manager;
pub mod native;

pub use error::{Result, TranslatorError};
pub use memory_manager::MemoryManager;

use std::ffi::c_void;

/// Sentinel returned by `execute` when the translator stopped on a
/// breakpoint at the current program counter.
pub const EXECUTE_BREAKPOINT: i32 = 0x10002;
/// Sentinel returned by `execute` when the guest entered a halted state.
pub const EXECUTE_HALTED: i32 = 0x10003;

/// Decoded outcome of a single `execute` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteResult {
    /// Ordinary yield: the translator finished a block (or was asked to
    /// stop via `set_paused`) with nothing special to report.
    Yield,
    /// Stopped on a breakpoint at the current program counter.
    Breakpoint,
    /// The guest reached a halted state.
    Halted,
}

impl ExecuteResult {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            EXECUTE_BREAKPOINT => ExecuteResult::Breakpoint,
            EXECUTE_HALTED => ExecuteResult::Halted,
            0 => ExecuteResult::Yield,
            other => {
                tracing::warn!(value = other, "unknown execute result, treating as yield");
                ExecuteResult::Yield
            }
        }
    }
}

/// One contiguous host-memory range backing mapped guest pages, in the
/// layout the translator consumes directly.
///
/// Tables are emitted sorted ascending by `host_pointer`;
/// `host_block_start` is the index of the first block sharing the same
/// pointer, which lets the translator resolve aliased mappings.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostMemoryBlock {
    pub start: u32,
    pub size: u32,
    pub host_pointer: *mut u8,
    pub host_block_start: i32,
}

// The pointers reference guest RAM owned by the memory-map registry, which
// outlives any table handed to the translator.
unsafe impl Send for HostMemoryBlock {}
unsafe impl Sync for HostMemoryBlock {}

/// The translator's imported surface: everything the harness calls into the
/// native library.
///
/// Only the CPU thread calls [`execute`](Self::execute); the remaining
/// operations are either issued under the machine's paused state or are
/// intrinsically safe against a running translator (IRQ delivery,
/// breakpoint management for untranslated code). Implementations therefore
/// take `&self` and synchronize internally where needed.
pub trait TranslationEngine: Send + Sync {
    /// Initialize for the given CPU type. Returns −1 when the type is
    /// unknown to this translator.
    fn init(&self, cpu_type: &str) -> i32;
    fn dispose(&self);
    fn reset(&self);

    /// Run translated code until the translator yields. May chain many
    /// blocks within a single call.
    fn execute(&self) -> ExecuteResult;

    /// Unwind out of the currently executing block and retranslate it
    /// bounded to a single instruction. Never returns normally; only valid
    /// while a bus-access callback issued by `execute` is on the stack.
    fn restart_translation_block(&self) -> !;

    /// Ask the translator to stop at the end of the current block.
    fn set_paused(&self);
    fn clear_paused(&self);

    fn is_wfi(&self) -> bool;
    fn page_size(&self) -> u32;

    fn map_range(&self, start: u32, size: u32);
    fn unmap_range(&self, start: u32, end: u32);
    fn is_range_mapped(&self, start: u32, end: u32) -> bool;
    fn invalidate_translation_blocks(&self, start: usize, end: usize);
    fn translate_to_physical(&self, address: u32) -> u32;

    /// Replace the host-blocks table. The previous table, if any, is
    /// released first.
    fn set_host_blocks(&self, blocks: &[HostMemoryBlock]);
    fn free_host_blocks(&self);

    fn set_count_threshold(&self, threshold: i32);

    fn set_irq(&self, irq: i32, level: bool);
    fn is_irq_set(&self) -> bool;

    fn add_breakpoint(&self, address: u32);
    fn remove_breakpoint(&self, address: u32);

    fn set_block_fetch_logging(&self, enabled: bool);
    fn set_block_translation_logging(&self, enabled: bool);

    fn set_translation_cache_size(&self, size: usize);
    fn invalidate_translation_cache(&self);

    /// Set the maximum translation-block size, returning the applied value.
    fn set_maximum_block_size(&self, size: u32) -> u32;
    fn maximum_block_size(&self) -> u32;

    /// Re-synchronize the translator's CPU context (e.g. the program
    /// counter) mid-block so register reads observe a precise state.
    fn restore_context(&self);

    fn register_value(&self, register: i32) -> u32;
    fn set_register_value(&self, register: i32, value: u32);

    /// Export the translator's opaque state blob.
    fn export_state(&self) -> Vec<u8>;
    /// Import a blob previously produced by [`export_state`](Self::export_state).
    fn import_state(&self, blob: &[u8]);
}

/// The translator's exported surface: everything the native library calls
/// back into the harness while executing or translating guest code.
///
/// All callbacks arrive on the CPU thread (the sole caller of `execute`)
/// except the allocator trio, which the translator may also use during
/// operations issued under the paused state.
pub trait TranslatorClient: Send + Sync {
    fn read_byte_from_bus(&self, address: u32) -> u32;
    fn read_word_from_bus(&self, address: u32) -> u32;
    fn read_dword_from_bus(&self, address: u32) -> u32;
    fn write_byte_to_bus(&self, address: u32, value: u32);
    fn write_word_to_bus(&self, address: u32, value: u32);
    fn write_dword_to_bus(&self, address: u32, value: u32);

    /// Entered at the beginning of every translated block, with the block's
    /// guest address and instruction count.
    fn on_block_begin(&self, address: u32, instructions: u32);

    /// The guest did something unrecoverable. The client records the
    /// message and arranges for `execute` to return; the translator must
    /// not run further blocks in this call.
    fn report_abort(&self, message: &str);

    fn is_io_accessed(&self, address: u32) -> bool;

    fn update_instruction_counter(&self, executed: i32);
    fn is_instruction_count_enabled(&self) -> bool;
    fn is_block_begin_event_enabled(&self) -> bool;

    fn touch_host_block(&self, offset: u32);
    fn invalidate_tb_in_other_cpus(&self, start: usize, end: usize);

    fn allocate(&self, size: usize) -> *mut c_void;
    fn reallocate(&self, pointer: *mut c_void, size: usize) -> *mut c_void;
    fn free(&self, pointer: *mut c_void);

    fn log_as_cpu(&self, level: i32, message: &str);
    fn log_disassembly(&self, address: u32, size: u32, flags: u32);
    fn on_block_fetch(&self, address: u32);

    fn cpu_index(&self) -> i32;
    fn on_translation_cache_size_change(&self, new_size: i64);
}

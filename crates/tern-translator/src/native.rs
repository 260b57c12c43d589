//! The libloading-backed [`TranslationEngine`] implementation.
//!
//! Translators ship one shared object per `(word size, architecture,
//! endianness)` triple, named `translate_<bits>-<arch>-<be|le>.so`. The
//! image bytes are extracted to a per-instance temporary directory (so two
//! CPUs of the same type get independent library states), loaded with
//! `dlopen`, and every `tbt_`-prefixed symbol is resolved eagerly so a
//! mismatched library fails at construction instead of mid-execution.
//!
//! Callbacks flow the other way through [`ClientVtable`], a `#[repr(C)]`
//! table of `extern "C"` trampolines handed to the library's
//! `tbt_set_callbacks` entry point. Each trampoline recovers the
//! `Arc<dyn TranslatorClient>` from the context pointer and forwards.

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use tempfile::TempDir;
use tracing::debug;

use crate::{
    ExecuteResult, HostMemoryBlock, Result, TranslationEngine, TranslatorClient, TranslatorError,
};

/// Identifies which translator shared object to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibrarySpec {
    /// Guest word size in bits (32 or 64).
    pub word_size: u8,
    pub architecture: String,
    pub big_endian: bool,
}

impl LibrarySpec {
    pub fn file_name(&self) -> String {
        format!(
            "translate_{}-{}-{}.so",
            self.word_size,
            self.architecture,
            if self.big_endian { "be" } else { "le" }
        )
    }
}

macro_rules! engine_symbols {
    ($($field:ident: fn($($arg:ty),*) $(-> $ret:ty)? = $sym:literal;)*) => {
        struct Symbols {
            $($field: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
        }

        impl Symbols {
            fn bind(library: &Library) -> std::result::Result<Self, libloading::Error> {
                // Symbols are resolved once and copied out as plain function
                // pointers; they stay valid for as long as the `Library`
                // stored alongside them.
                unsafe {
                    Ok(Self {
                        $($field: *library
                            .get::<unsafe extern "C" fn($($arg),*) $(-> $ret)?>($sym)?,)*
                    })
                }
            }
        }
    };
}

engine_symbols! {
    init: fn(*const c_char) -> i32 = b"tbt_init\0";
    dispose: fn() = b"tbt_dispose\0";
    reset: fn() = b"tbt_reset\0";
    execute: fn() -> i32 = b"tbt_execute\0";
    restart_translation_block: fn() = b"tbt_restart_translation_block\0";
    set_paused: fn() = b"tbt_set_paused\0";
    clear_paused: fn() = b"tbt_clear_paused\0";
    is_wfi: fn() -> u32 = b"tbt_is_wfi\0";
    get_page_size: fn() -> u32 = b"tbt_get_page_size\0";
    map_range: fn(u32, u32) = b"tbt_map_range\0";
    unmap_range: fn(u32, u32) = b"tbt_unmap_range\0";
    is_range_mapped: fn(u32, u32) -> u32 = b"tbt_is_range_mapped\0";
    invalidate_translation_blocks: fn(*mut c_void, *mut c_void) = b"tbt_invalidate_translation_blocks\0";
    translate_to_physical: fn(u32) -> u32 = b"tbt_translate_to_physical\0";
    set_host_blocks: fn(*const HostMemoryBlock, i32) = b"tbt_set_host_blocks\0";
    free_host_blocks: fn() = b"tbt_free_host_blocks\0";
    set_count_threshold: fn(i32) = b"tbt_set_count_threshold\0";
    set_irq: fn(i32, i32) = b"tbt_set_irq\0";
    is_irq_set: fn() -> u32 = b"tbt_is_irq_set\0";
    add_breakpoint: fn(u32) = b"tbt_add_breakpoint\0";
    remove_breakpoint: fn(u32) = b"tbt_remove_breakpoint\0";
    attach_log_block_fetch: fn(*const c_void) = b"tbt_attach_log_block_fetch\0";
    set_on_block_translation_enabled: fn(i32) = b"tbt_set_on_block_translation_enabled\0";
    set_translation_cache_size: fn(usize) = b"tbt_set_translation_cache_size\0";
    invalidate_translation_cache: fn() = b"tbt_invalidate_translation_cache\0";
    set_maximum_block_size: fn(u32) -> u32 = b"tbt_set_maximum_block_size\0";
    get_maximum_block_size: fn() -> u32 = b"tbt_get_maximum_block_size\0";
    restore_context: fn() = b"tbt_restore_context\0";
    export_state: fn() -> *mut c_void = b"tbt_export_state\0";
    get_state_size: fn() -> i32 = b"tbt_get_state_size\0";
    get_register_value: fn(i32) -> u32 = b"tbt_get_register_value\0";
    set_register_value: fn(i32, u32) = b"tbt_set_register_value\0";
    set_callbacks: fn(*const ClientVtable) = b"tbt_set_callbacks\0";
}

/// Callback table handed to the translator at load time.
#[repr(C)]
struct ClientVtable {
    ctx: *mut c_void,
    read_byte_from_bus: unsafe extern "C" fn(*mut c_void, u32) -> u32,
    read_word_from_bus: unsafe extern "C" fn(*mut c_void, u32) -> u32,
    read_dword_from_bus: unsafe extern "C" fn(*mut c_void, u32) -> u32,
    write_byte_to_bus: unsafe extern "C" fn(*mut c_void, u32, u32),
    write_word_to_bus: unsafe extern "C" fn(*mut c_void, u32, u32),
    write_dword_to_bus: unsafe extern "C" fn(*mut c_void, u32, u32),
    on_block_begin: unsafe extern "C" fn(*mut c_void, u32, u32),
    report_abort: unsafe extern "C" fn(*mut c_void, *const c_char),
    is_io_accessed: unsafe extern "C" fn(*mut c_void, u32) -> i32,
    update_instruction_counter: unsafe extern "C" fn(*mut c_void, i32),
    is_instruction_count_enabled: unsafe extern "C" fn(*mut c_void) -> u32,
    is_block_begin_event_enabled: unsafe extern "C" fn(*mut c_void) -> u32,
    touch_host_block: unsafe extern "C" fn(*mut c_void, u32),
    invalidate_tb_in_other_cpus: unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void),
    allocate: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void,
    reallocate: unsafe extern "C" fn(*mut c_void, *mut c_void, usize) -> *mut c_void,
    free: unsafe extern "C" fn(*mut c_void, *mut c_void),
    log_as_cpu: unsafe extern "C" fn(*mut c_void, i32, *const c_char),
    log_disassembly: unsafe extern "C" fn(*mut c_void, u32, u32, u32),
    get_cpu_index: unsafe extern "C" fn(*mut c_void) -> i32,
    on_translation_cache_size_change: unsafe extern "C" fn(*mut c_void, i64),
    on_block_fetch: unsafe extern "C" fn(*mut c_void, u32),
}

mod trampolines {
    use super::*;

    unsafe fn client<'a>(ctx: *mut c_void) -> &'a Arc<dyn TranslatorClient> {
        &*(ctx as *const Arc<dyn TranslatorClient>)
    }

    fn message<'a>(raw: *const c_char) -> std::borrow::Cow<'a, str> {
        if raw.is_null() {
            return "".into();
        }
        unsafe { CStr::from_ptr(raw) }.to_string_lossy()
    }

    pub(super) unsafe extern "C" fn read_byte_from_bus(ctx: *mut c_void, address: u32) -> u32 {
        client(ctx).read_byte_from_bus(address)
    }

    pub(super) unsafe extern "C" fn read_word_from_bus(ctx: *mut c_void, address: u32) -> u32 {
        client(ctx).read_word_from_bus(address)
    }

    pub(super) unsafe extern "C" fn read_dword_from_bus(ctx: *mut c_void, address: u32) -> u32 {
        client(ctx).read_dword_from_bus(address)
    }

    pub(super) unsafe extern "C" fn write_byte_to_bus(ctx: *mut c_void, address: u32, value: u32) {
        client(ctx).write_byte_to_bus(address, value)
    }

    pub(super) unsafe extern "C" fn write_word_to_bus(ctx: *mut c_void, address: u32, value: u32) {
        client(ctx).write_word_to_bus(address, value)
    }

    pub(super) unsafe extern "C" fn write_dword_to_bus(ctx: *mut c_void, address: u32, value: u32) {
        client(ctx).write_dword_to_bus(address, value)
    }

    pub(super) unsafe extern "C" fn on_block_begin(ctx: *mut c_void, address: u32, instructions: u32) {
        client(ctx).on_block_begin(address, instructions)
    }

    pub(super) unsafe extern "C" fn report_abort(ctx: *mut c_void, raw: *const c_char) {
        client(ctx).report_abort(&message(raw))
    }

    pub(super) unsafe extern "C" fn is_io_accessed(ctx: *mut c_void, address: u32) -> i32 {
        client(ctx).is_io_accessed(address) as i32
    }

    pub(super) unsafe extern "C" fn update_instruction_counter(ctx: *mut c_void, executed: i32) {
        client(ctx).update_instruction_counter(executed)
    }

    pub(super) unsafe extern "C" fn is_instruction_count_enabled(ctx: *mut c_void) -> u32 {
        client(ctx).is_instruction_count_enabled() as u32
    }

    pub(super) unsafe extern "C" fn is_block_begin_event_enabled(ctx: *mut c_void) -> u32 {
        client(ctx).is_block_begin_event_enabled() as u32
    }

    pub(super) unsafe extern "C" fn touch_host_block(ctx: *mut c_void, offset: u32) {
        client(ctx).touch_host_block(offset)
    }

    pub(super) unsafe extern "C" fn invalidate_tb_in_other_cpus(
        ctx: *mut c_void,
        start: *mut c_void,
        end: *mut c_void,
    ) {
        client(ctx).invalidate_tb_in_other_cpus(start as usize, end as usize)
    }

    pub(super) unsafe extern "C" fn allocate(ctx: *mut c_void, size: usize) -> *mut c_void {
        client(ctx).allocate(size)
    }

    pub(super) unsafe extern "C" fn reallocate(
        ctx: *mut c_void,
        pointer: *mut c_void,
        size: usize,
    ) -> *mut c_void {
        client(ctx).reallocate(pointer, size)
    }

    pub(super) unsafe extern "C" fn free(ctx: *mut c_void, pointer: *mut c_void) {
        client(ctx).free(pointer)
    }

    pub(super) unsafe extern "C" fn log_as_cpu(ctx: *mut c_void, level: i32, raw: *const c_char) {
        client(ctx).log_as_cpu(level, &message(raw))
    }

    pub(super) unsafe extern "C" fn log_disassembly(
        ctx: *mut c_void,
        address: u32,
        size: u32,
        flags: u32,
    ) {
        client(ctx).log_disassembly(address, size, flags)
    }

    pub(super) unsafe extern "C" fn get_cpu_index(ctx: *mut c_void) -> i32 {
        client(ctx).cpu_index()
    }

    pub(super) unsafe extern "C" fn on_translation_cache_size_change(
        ctx: *mut c_void,
        new_size: i64,
    ) {
        client(ctx).on_translation_cache_size_change(new_size)
    }

    pub(super) unsafe extern "C" fn on_block_fetch(ctx: *mut c_void, address: u32) {
        client(ctx).on_block_fetch(address)
    }
}

/// A translator shared object loaded into this process.
pub struct NativeEngine {
    symbols: Symbols,
    // Field order matters for teardown: the vtable and client context must
    // outlive the library, and the library must be closed before the
    // extracted file is deleted.
    _vtable: Box<ClientVtable>,
    client_ctx: *mut Arc<dyn TranslatorClient>,
    _library: Library,
    library_path: PathBuf,
    _extracted: TempDir,
}

// The translator contract makes concurrent use safe: `execute` is only ever
// called from the CPU thread, and every other entry point is either issued
// under the machine's paused state or is safe against a running translator.
unsafe impl Send for NativeEngine {}
unsafe impl Sync for NativeEngine {}

impl NativeEngine {
    /// Extract `image` to a temporary file and bind every translator symbol.
    ///
    /// The library receives its callback table before this returns, so the
    /// engine is ready for `init` immediately.
    pub fn load(
        spec: &LibrarySpec,
        image: &[u8],
        client: Arc<dyn TranslatorClient>,
    ) -> Result<Arc<Self>> {
        let extracted = tempfile::Builder::new()
            .prefix("tern-translator-")
            .tempdir()
            .map_err(TranslatorError::Extract)?;
        let library_path = extracted.path().join(spec.file_name());
        std::fs::write(&library_path, image).map_err(TranslatorError::Extract)?;

        let library = unsafe { Library::new(&library_path)? };
        let symbols = Symbols::bind(&library)?;

        let client_ctx = Box::into_raw(Box::new(client));
        let vtable = Box::new(ClientVtable {
            ctx: client_ctx as *mut c_void,
            read_byte_from_bus: trampolines::read_byte_from_bus,
            read_word_from_bus: trampolines::read_word_from_bus,
            read_dword_from_bus: trampolines::read_dword_from_bus,
            write_byte_to_bus: trampolines::write_byte_to_bus,
            write_word_to_bus: trampolines::write_word_to_bus,
            write_dword_to_bus: trampolines::write_dword_to_bus,
            on_block_begin: trampolines::on_block_begin,
            report_abort: trampolines::report_abort,
            is_io_accessed: trampolines::is_io_accessed,
            update_instruction_counter: trampolines::update_instruction_counter,
            is_instruction_count_enabled: trampolines::is_instruction_count_enabled,
            is_block_begin_event_enabled: trampolines::is_block_begin_event_enabled,
            touch_host_block: trampolines::touch_host_block,
            invalidate_tb_in_other_cpus: trampolines::invalidate_tb_in_other_cpus,
            allocate: trampolines::allocate,
            reallocate: trampolines::reallocate,
            free: trampolines::free,
            log_as_cpu: trampolines::log_as_cpu,
            log_disassembly: trampolines::log_disassembly,
            get_cpu_index: trampolines::get_cpu_index,
            on_translation_cache_size_change: trampolines::on_translation_cache_size_change,
            on_block_fetch: trampolines::on_block_fetch,
        });
        unsafe { (symbols.set_callbacks)(&*vtable) };

        debug!(path = %library_path.display(), "loaded translator library");
        Ok(Arc::new(Self {
            symbols,
            _vtable: vtable,
            client_ctx,
            _library: library,
            library_path,
            _extracted: extracted,
        }))
    }

    pub fn library_path(&self) -> &Path {
        &self.library_path
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        // Reclaim the leaked client handle; the library is closed right
        // after, so no trampoline can observe the dangling context.
        drop(unsafe { Box::from_raw(self.client_ctx) });
    }
}

impl TranslationEngine for NativeEngine {
    fn init(&self, cpu_type: &str) -> i32 {
        let cpu_type = CString::new(cpu_type).expect("cpu type contains a NUL byte");
        unsafe { (self.symbols.init)(cpu_type.as_ptr()) }
    }

    fn dispose(&self) {
        unsafe { (self.symbols.dispose)() }
    }

    fn reset(&self) {
        unsafe { (self.symbols.reset)() }
    }

    fn execute(&self) -> ExecuteResult {
        ExecuteResult::from_raw(unsafe { (self.symbols.execute)() })
    }

    fn restart_translation_block(&self) -> ! {
        // The translator longjmps back into the `execute` frame that issued
        // the current bus access; control never comes back here.
        unsafe { (self.symbols.restart_translation_block)() };
        unreachable!("restart_translation_block returned")
    }

    fn set_paused(&self) {
        unsafe { (self.symbols.set_paused)() }
    }

    fn clear_paused(&self) {
        unsafe { (self.symbols.clear_paused)() }
    }

    fn is_wfi(&self) -> bool {
        unsafe { (self.symbols.is_wfi)() != 0 }
    }

    fn page_size(&self) -> u32 {
        unsafe { (self.symbols.get_page_size)() }
    }

    fn map_range(&self, start: u32, size: u32) {
        unsafe { (self.symbols.map_range)(start, size) }
    }

    fn unmap_range(&self, start: u32, end: u32) {
        unsafe { (self.symbols.unmap_range)(start, end) }
    }

    fn is_range_mapped(&self, start: u32, end: u32) -> bool {
        unsafe { (self.symbols.is_range_mapped)(start, end) != 0 }
    }

    fn invalidate_translation_blocks(&self, start: usize, end: usize) {
        unsafe {
            (self.symbols.invalidate_translation_blocks)(start as *mut c_void, end as *mut c_void)
        }
    }

    fn translate_to_physical(&self, address: u32) -> u32 {
        unsafe { (self.symbols.translate_to_physical)(address) }
    }

    fn set_host_blocks(&self, blocks: &[HostMemoryBlock]) {
        unsafe { (self.symbols.set_host_blocks)(blocks.as_ptr(), blocks.len() as i32) }
    }

    fn free_host_blocks(&self) {
        unsafe { (self.symbols.free_host_blocks)() }
    }

    fn set_count_threshold(&self, threshold: i32) {
        unsafe { (self.symbols.set_count_threshold)(threshold) }
    }

    fn set_irq(&self, irq: i32, level: bool) {
        unsafe { (self.symbols.set_irq)(irq, level as i32) }
    }

    fn is_irq_set(&self) -> bool {
        unsafe { (self.symbols.is_irq_set)() != 0 }
    }

    fn add_breakpoint(&self, address: u32) {
        unsafe { (self.symbols.add_breakpoint)(address) }
    }

    fn remove_breakpoint(&self, address: u32) {
        unsafe { (self.symbols.remove_breakpoint)(address) }
    }

    fn set_block_fetch_logging(&self, enabled: bool) {
        // The translator only checks the pointer for null before routing
        // fetch notifications through the callback table.
        let marker = if enabled {
            let fetch: unsafe extern "C" fn(*mut c_void, u32) = trampolines::on_block_fetch;
            fetch as *const c_void
        } else {
            std::ptr::null()
        };
        unsafe { (self.symbols.attach_log_block_fetch)(marker) }
    }

    fn set_block_translation_logging(&self, enabled: bool) {
        unsafe { (self.symbols.set_on_block_translation_enabled)(enabled as i32) }
    }

    fn set_translation_cache_size(&self, size: usize) {
        unsafe { (self.symbols.set_translation_cache_size)(size) }
    }

    fn invalidate_translation_cache(&self) {
        unsafe { (self.symbols.invalidate_translation_cache)() }
    }

    fn set_maximum_block_size(&self, size: u32) -> u32 {
        unsafe { (self.symbols.set_maximum_block_size)(size) }
    }

    fn maximum_block_size(&self) -> u32 {
        unsafe { (self.symbols.get_maximum_block_size)() }
    }

    fn restore_context(&self) {
        unsafe { (self.symbols.restore_context)() }
    }

    fn register_value(&self, register: i32) -> u32 {
        unsafe { (self.symbols.get_register_value)(register) }
    }

    fn set_register_value(&self, register: i32, value: u32) {
        unsafe { (self.symbols.set_register_value)(register, value) }
    }

    fn export_state(&self) -> Vec<u8> {
        unsafe {
            let size = (self.symbols.get_state_size)();
            let pointer = (self.symbols.export_state)() as *const u8;
            if pointer.is_null() || size <= 0 {
                return Vec::new();
            }
            std::slice::from_raw_parts(pointer, size as usize).to_vec()
        }
    }

    fn import_state(&self, blob: &[u8]) {
        unsafe {
            let size = (self.symbols.get_state_size)() as usize;
            let pointer = (self.symbols.export_state)() as *mut u8;
            if pointer.is_null() {
                return;
            }
            let length = blob.len().min(size);
            std::ptr::copy_nonoverlapping(blob.as_ptr(), pointer, length);
        }
    }
}

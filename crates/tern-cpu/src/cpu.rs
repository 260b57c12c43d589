use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};

use tern_bus::{MappedRange, MappedSegment, SystemBus};
use tern_time::{ClockEntry, ClockEntryId, ClockHandler, ClockSource, TickConverter};
use tern_translator::{MemoryManager, TranslationEngine, TranslatorClient};
use tracing::{debug, warn};

use crate::disasm::DisassemblerRegistry;
use crate::hooks::{HookCallback, HookTable};
use crate::memmap::MemoryMapRegistry;
use crate::pause_guard::PauseGuard;
use crate::sync::Signals;
use crate::{CpuError, CpuProfile, Disassembler, Result};

/// Default translation cache size: 32 MiB.
pub const DEFAULT_TRANSLATION_CACHE_SIZE: usize = 32 * 1024 * 1024;
/// Default maximum translation-block size in instructions.
pub const DEFAULT_MAXIMUM_BLOCK_SIZE: u32 = 0x7FF;
/// Default instruction-counter reporting threshold.
pub const DEFAULT_COUNT_THRESHOLD: i32 = 5000;
/// Default performance in MIPS (retired instructions per microsecond).
pub const DEFAULT_PERFORMANCE_IN_MIPS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Continuous,
    SingleStep,
}

/// Why the CPU stopped executing guest instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    Pause,
    Step,
    Abort,
    Breakpoint,
    Watchpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaltArguments {
    pub reason: HaltReason,
    pub cpu_slot: i32,
    /// Program counter at the halt, when it could be sampled.
    pub address: Option<u32>,
}

/// Creates the translation engine for a CPU: called at construction and
/// again on snapshot restore, when the library is reloaded from scratch.
pub type EngineFactory = Arc<
    dyn Fn(Arc<dyn TranslatorClient>) -> tern_translator::Result<Arc<dyn TranslationEngine>>
        + Send
        + Sync,
>;

pub type BlockBeginHook = Arc<dyn Fn(u32, u32) + Send + Sync>;
/// Hook run right before serialization or right after restore.
pub type LifecycleHook = Box<dyn Fn() + Send>;
type HaltedHandler = Box<dyn Fn(&HaltArguments) + Send>;
type IsHaltedChangedHandler = Box<dyn Fn(bool) + Send>;

/// A CPU whose execution is delegated to a native binary translator.
///
/// The harness owns the CPU execution thread and mediates every transition
/// between the emulator and the translator: precise pause and single-step,
/// breakpoints and watchpoints, memory registration, IRQ delivery, clock
/// advancement, and snapshotting of the translator's opaque state.
///
/// `TranslationCpu` is a cheap handle; control calls may arrive on any
/// thread.
#[derive(Clone)]
pub struct TranslationCpu {
    pub(crate) inner: Arc<CpuInner>,
}

pub(crate) struct CpuInner {
    pub(crate) profile: CpuProfile,
    pub(crate) slot: i32,
    pub(crate) bus: Arc<dyn SystemBus>,
    pub(crate) factory: EngineFactory,
    pub(crate) engine: Mutex<Option<Arc<dyn TranslationEngine>>>,
    pub(crate) page_size: AtomicU32,

    pub(crate) memory_manager: MemoryManager,
    pub(crate) signals: Signals,
    pub(crate) clock: ClockSource,
    pub(crate) converter: Mutex<TickConverter>,
    pub(crate) registry: MemoryMapRegistry,
    pub(crate) hooks: HookTable,
    pub(crate) block_begin_hook: Mutex<Option<BlockBeginHook>>,
    pub(crate) pause_guard: PauseGuard,
    pub(crate) disassemblers: DisassemblerRegistry,

    pub(crate) thread: Mutex<Option<JoinHandle<()>>>,
    pub(crate) cpu_thread_id: Mutex<Option<ThreadId>>,
    pub(crate) pause_lock: Mutex<()>,
    pub(crate) gpio_lock: Mutex<()>,

    pub(crate) halted: Mutex<bool>,
    pub(crate) started: AtomicBool,
    pub(crate) aborted: AtomicBool,
    pub(crate) disposed: AtomicBool,

    pub(crate) mode: Mutex<ExecutionMode>,
    pub(crate) block_size_needs_adjustment: AtomicBool,
    pub(crate) saved_maximum_block_size: Mutex<Option<u32>>,
    pub(crate) skip_next_stepping: AtomicBool,
    pub(crate) advance_should_be_restarted: AtomicBool,
    pub(crate) pending_cancellation: AtomicBool,
    pub(crate) abort_message: Mutex<Option<String>>,
    pub(crate) single_step_after_watchpoint: AtomicBool,

    pub(crate) executed_instructions: AtomicU64,
    pub(crate) performance_in_mips: AtomicU64,
    pub(crate) count_threshold: AtomicI32,
    pub(crate) translation_cache_size: AtomicUsize,
    pub(crate) advance_immediately: AtomicBool,
    pub(crate) thread_sentinel_enabled: AtomicBool,
    pub(crate) disable_interrupts_while_stepping: AtomicBool,
    pub(crate) update_context_on_load_and_store: AtomicBool,
    pub(crate) log_block_fetch: AtomicBool,
    pub(crate) log_translated_blocks: AtomicBool,
    pub(crate) log_file: Mutex<Option<PathBuf>>,

    pub(crate) halted_handlers: Mutex<Vec<HaltedHandler>>,
    pub(crate) is_halted_changed_handlers: Mutex<Vec<IsHaltedChangedHandler>>,
    pub(crate) before_save: Mutex<Option<LifecycleHook>>,
    pub(crate) after_load: Mutex<Option<LifecycleHook>>,
    pub(crate) warned_threads: Mutex<HashSet<ThreadId>>,
}

impl TranslationCpu {
    /// Construct an idle CPU (pause event set, no execution thread).
    ///
    /// `factory` loads and wires the translation engine; it is kept for
    /// snapshot restore, which reloads the library. Fails with
    /// [`CpuError::InvalidCpuType`] when the translator rejects the
    /// profile's CPU type.
    pub fn new(
        profile: CpuProfile,
        slot: i32,
        bus: Arc<dyn SystemBus>,
        factory: EngineFactory,
    ) -> Result<Self> {
        profile.validate()?;
        let cpu_type = profile.cpu_type.clone();
        let mips = DEFAULT_PERFORMANCE_IN_MIPS;
        let inner = Arc::new(CpuInner {
            signals: Signals::new(profile.interrupt_lines),
            profile,
            slot,
            bus,
            factory: factory.clone(),
            engine: Mutex::new(None),
            page_size: AtomicU32::new(0),
            memory_manager: MemoryManager::new(),
            clock: ClockSource::new(),
            converter: Mutex::new(TickConverter::new(mips)),
            registry: MemoryMapRegistry::new(),
            hooks: HookTable::new(),
            block_begin_hook: Mutex::new(None),
            pause_guard: PauseGuard::new(),
            disassemblers: DisassemblerRegistry::new(),
            thread: Mutex::new(None),
            cpu_thread_id: Mutex::new(None),
            pause_lock: Mutex::new(()),
            gpio_lock: Mutex::new(()),
            halted: Mutex::new(false),
            started: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            mode: Mutex::new(ExecutionMode::Continuous),
            block_size_needs_adjustment: AtomicBool::new(false),
            saved_maximum_block_size: Mutex::new(None),
            skip_next_stepping: AtomicBool::new(false),
            advance_should_be_restarted: AtomicBool::new(false),
            pending_cancellation: AtomicBool::new(false),
            abort_message: Mutex::new(None),
            single_step_after_watchpoint: AtomicBool::new(false),
            executed_instructions: AtomicU64::new(0),
            performance_in_mips: AtomicU64::new(mips),
            count_threshold: AtomicI32::new(DEFAULT_COUNT_THRESHOLD),
            translation_cache_size: AtomicUsize::new(DEFAULT_TRANSLATION_CACHE_SIZE),
            advance_immediately: AtomicBool::new(false),
            thread_sentinel_enabled: AtomicBool::new(true),
            disable_interrupts_while_stepping: AtomicBool::new(false),
            update_context_on_load_and_store: AtomicBool::new(false),
            log_block_fetch: AtomicBool::new(false),
            log_translated_blocks: AtomicBool::new(false),
            log_file: Mutex::new(None),
            halted_handlers: Mutex::new(Vec::new()),
            is_halted_changed_handlers: Mutex::new(Vec::new()),
            before_save: Mutex::new(None),
            after_load: Mutex::new(None),
            warned_threads: Mutex::new(HashSet::new()),
        });

        let client: Arc<dyn TranslatorClient> = inner.clone();
        let engine = (factory)(client)?;
        if engine.init(&cpu_type) < 0 {
            return Err(CpuError::InvalidCpuType(cpu_type));
        }
        inner.page_size.store(engine.page_size(), Ordering::SeqCst);
        engine.set_translation_cache_size(DEFAULT_TRANSLATION_CACHE_SIZE);
        engine.set_maximum_block_size(DEFAULT_MAXIMUM_BLOCK_SIZE);
        engine.set_count_threshold(DEFAULT_COUNT_THRESHOLD);
        *inner.engine.lock().unwrap() = Some(engine);

        Ok(Self { inner })
    }

    /// Equivalent to [`resume`](Self::resume).
    pub fn start(&self) -> Result<()> {
        self.resume()
    }

    /// Spawn the execution thread and let the translator run.
    ///
    /// No-op when the CPU is already running. Fails after a guest abort
    /// until the CPU is reset.
    pub fn resume(&self) -> Result<()> {
        if self.inner.aborted.load(Ordering::SeqCst) {
            return Err(CpuError::Aborted);
        }
        self.inner.resume_inner();
        Ok(())
    }

    /// Stop executing guest instructions, precisely.
    ///
    /// When called from outside the CPU thread this joins the execution
    /// thread: on return the thread is gone and the `Halted` event has
    /// fired. When called from the CPU thread (a watchpoint or hook
    /// context) it orders the pause through the pause guard and the loop
    /// exits at the end of the current (single-instruction) block.
    pub fn pause(&self) {
        self.inner.pause_with_reason(HaltReason::Pause);
    }

    /// Pause ordered by a watchpoint hook; must run on the CPU thread
    /// inside a guarded bus access.
    pub fn pause_from_watchpoint(&self) {
        debug_assert!(
            self.inner.on_possessed_thread(),
            "watchpoint pause must be ordered from the cpu thread"
        );
        self.inner.pause_with_reason(HaltReason::Watchpoint);
    }

    /// Ask the loop to switch to single-step mode and resume instead of
    /// staying paused after the pending watchpoint pause completes.
    pub fn request_single_step_after_watchpoint(&self) {
        self.inner
            .single_step_after_watchpoint
            .store(true, Ordering::SeqCst);
    }

    /// Pause, reset the translator's CPU state and re-register all mapped
    /// memory. Clears a previous guest abort.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.paused_scope(|| {
            inner.aborted.store(false, Ordering::SeqCst);
            inner.advance_should_be_restarted.store(false, Ordering::SeqCst);
            inner.pending_cancellation.store(false, Ordering::SeqCst);
            inner.executed_instructions.store(0, Ordering::SeqCst);
            let engine = inner.engine();
            engine.reset();
            inner.reregister_memory(&*engine);
        });
    }

    /// Tear the CPU down: pause, drop all hooks, dispose the translator,
    /// unload the library and delete its temporary file.
    ///
    /// # Panics
    ///
    /// Panics when the translator leaked host allocations.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if inner.started.load(Ordering::SeqCst) && !inner.signals.pause_requested() {
            inner.pause_with_reason(HaltReason::Pause);
        }
        let engine = inner.engine();
        for address in inner.hooks.clear() {
            engine.remove_breakpoint(address);
        }
        engine.dispose();
        engine.free_host_blocks();
        drop(engine);
        // Dropping the last engine reference unloads the library and
        // deletes the extracted file.
        *inner.engine.lock().unwrap() = None;
        inner.memory_manager.assert_no_leaks();
    }

    /// Execute `count` single instructions. The CPU must be in
    /// [`ExecutionMode::SingleStep`]; blocks until all `count` instructions
    /// retired.
    pub fn step(&self, count: usize) -> Result<()> {
        if self.execution_mode() != ExecutionMode::SingleStep {
            return Err(CpuError::NotInSingleStepMode);
        }
        let inner = &self.inner;
        let _guard = inner.pause_lock.lock().unwrap();
        inner.signals.reset_step_done(count);
        inner.signals.release_step(count);
        inner.signals.wait_step_done();
        Ok(())
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.inner.execution_mode()
    }

    pub fn set_execution_mode(&self, mode: ExecutionMode) {
        self.inner.set_execution_mode(mode);
    }

    /// Register a page-aligned guest memory segment with the translator.
    ///
    /// Runs under the paused state; the translation cache is resized to a
    /// quarter of the total mapped size.
    pub fn map_memory(&self, segment: Box<dyn MappedSegment>) -> Result<()> {
        let inner = &self.inner;
        inner.paused_scope(|| {
            let engine = inner.engine();
            let range = inner.registry.insert(segment, inner.guest_page_size())?;
            engine.map_range(range.start, range.size);
            let cache_size = (inner.registry.total_size() / 4) as usize;
            inner
                .translation_cache_size
                .store(cache_size, Ordering::SeqCst);
            engine.set_translation_cache_size(cache_size);
            debug!(
                cpu = inner.slot,
                start = format_args!("{:#x}", range.start),
                size = format_args!("{:#x}", range.size),
                "mapped memory segment"
            );
            Ok(())
        })
    }

    /// Withdraw a guest address range from the translator. The affected
    /// pages fall back to I/O access; segments the translator no longer
    /// reports as mapped are dropped from the registry.
    pub fn unmap_memory(&self, range: MappedRange) -> Result<()> {
        let inner = &self.inner;
        inner.paused_scope(|| {
            let page_size = inner.guest_page_size();
            if range.start % page_size != 0 || range.size % page_size != 0 {
                return Err(CpuError::Segment(tern_bus::SegmentError::NotPageAligned {
                    what: "unmap range",
                    value: if range.start % page_size != 0 {
                        range.start
                    } else {
                        range.size
                    },
                    page_size,
                }));
            }
            let engine = inner.engine();
            engine.unmap_range(range.start, range.end());
            let mut page = range.start;
            while page <= range.end() {
                inner.registry.set_io_page(page, page_size);
                match page.checked_add(page_size) {
                    Some(next) => page = next,
                    None => break,
                }
            }
            inner
                .registry
                .retain_mapped(|start, end| engine.is_range_mapped(start, end));
            Ok(())
        })
    }

    /// Force guest accesses to the page containing `address` through the
    /// bus instead of fast-path host memory.
    pub fn set_page_accessed_via_io(&self, address: u32) {
        self.inner
            .registry
            .set_io_page(address, self.inner.guest_page_size());
    }

    pub fn clear_page_accessed_via_io(&self, address: u32) {
        self.inner
            .registry
            .clear_io_page(address, self.inner.guest_page_size());
    }

    /// Register a breakpoint callback. The translator gains a breakpoint
    /// at `address` when this is its first callback; the trap takes effect
    /// once the current block completes.
    pub fn add_hook(&self, address: u32, callback: HookCallback) {
        if self.inner.hooks.add(address, callback) {
            self.inner.engine().add_breakpoint(address);
        }
    }

    /// Remove one callback (by identity). The translator breakpoint goes
    /// with the last callback, though a trap already scheduled for the
    /// currently executing block may still fire.
    pub fn remove_hook(&self, address: u32, callback: &HookCallback) {
        if self.inner.hooks.remove(address, callback) {
            self.inner.engine().remove_breakpoint(address);
        }
    }

    pub fn remove_all_hooks_at(&self, address: u32) {
        if self.inner.hooks.remove_all_at(address) {
            self.inner.engine().remove_breakpoint(address);
        }
    }

    /// Install or clear the per-CPU block-begin hook. Transitioning
    /// between unset and set invalidates the translation cache, because
    /// already-translated blocks baked in the opposite answer of
    /// `is_block_begin_event_enabled`.
    pub fn set_block_begin_hook(&self, hook: Option<BlockBeginHook>) {
        let transition = {
            let mut slot = self.inner.block_begin_hook.lock().unwrap();
            let transition = slot.is_some() != hook.is_some();
            *slot = hook;
            transition
        };
        if transition {
            self.inner.engine().invalidate_translation_cache();
        }
    }

    /// Drive an interrupt input line.
    pub fn on_gpio(&self, line: usize, level: bool) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.gpio_lock.lock().unwrap();
        if line >= inner.profile.interrupt_lines {
            return Err(CpuError::UnknownGpioLine {
                line,
                line_count: inner.profile.interrupt_lines,
            });
        }
        let Some(irq) = inner.profile.decode_interrupt(line) else {
            warn!(cpu = inner.slot, line, "gpio line is not connected to an interrupt");
            return Ok(());
        };
        inner.warn_on_foreign_thread();
        let stepping_masked = inner.disable_interrupts_while_stepping.load(Ordering::SeqCst)
            && inner.execution_mode() == ExecutionMode::SingleStep;
        if inner.started.load(Ordering::SeqCst) && !stepping_masked {
            inner.engine().set_irq(irq, level);
        }
        inner.signals.set_irq_latch(line, level);
        Ok(())
    }

    /// Current level of an interrupt latch.
    pub fn is_set_event(&self, line: usize) -> bool {
        self.inner.signals.irq_latch(line)
    }

    /// Add a clock entry driven by this CPU's retired instructions. The
    /// first entry invalidates the translation cache: translated blocks
    /// must start reporting the instruction counter.
    pub fn add_clock_entry(&self, entry: ClockEntry, handler: ClockHandler) -> ClockEntryId {
        let was_empty = !self.inner.clock.has_entries();
        let id = self.inner.clock.add(entry, handler);
        if was_empty {
            self.inner.engine().invalidate_translation_cache();
        }
        id
    }

    pub fn remove_clock_entry(&self, id: ClockEntryId) -> bool {
        self.inner.clock.remove(id)
    }

    pub fn clock_source(&self) -> &ClockSource {
        &self.inner.clock
    }

    pub fn subscribe_halted(&self, handler: impl Fn(&HaltArguments) + Send + 'static) {
        self.inner
            .halted_handlers
            .lock()
            .unwrap()
            .push(Box::new(handler));
    }

    pub fn subscribe_is_halted_changed(&self, handler: impl Fn(bool) + Send + 'static) {
        self.inner
            .is_halted_changed_handlers
            .lock()
            .unwrap()
            .push(Box::new(handler));
    }

    pub fn set_before_save_hook(&self, hook: Option<LifecycleHook>) {
        *self.inner.before_save.lock().unwrap() = hook;
    }

    pub fn set_after_load_hook(&self, hook: Option<LifecycleHook>) {
        *self.inner.after_load.lock().unwrap() = hook;
    }

    pub fn register_disassembler(&self, disassembler: Arc<dyn Disassembler>) {
        self.inner.disassemblers.register(disassembler);
    }

    pub fn available_disassemblers(&self) -> Vec<String> {
        self.inner.disassemblers.names()
    }

    pub fn disassembler(&self) -> Option<String> {
        self.inner.disassemblers.active_name()
    }

    pub fn set_disassembler(&self, name: &str) -> Result<()> {
        match self.inner.disassemblers.activate(name) {
            Some(_) => Ok(()),
            None => {
                warn!(cpu = self.inner.slot, name, "disassembler is not registered");
                Err(CpuError::UnknownDisassembler(name.to_owned()))
            }
        }
    }
}

// Property accessors.
impl TranslationCpu {
    pub fn model(&self) -> &str {
        &self.inner.profile.model
    }

    pub fn architecture(&self) -> &str {
        &self.inner.profile.architecture
    }

    pub fn endianness(&self) -> crate::Endianness {
        self.inner.profile.endianness
    }

    pub fn slot(&self) -> i32 {
        self.inner.slot
    }

    pub fn pc(&self) -> u32 {
        self.inner
            .engine()
            .register_value(self.inner.profile.pc_register)
    }

    pub fn set_pc(&self, value: u32) {
        self.inner
            .engine()
            .set_register_value(self.inner.profile.pc_register, value);
    }

    /// Whether the translator currently observes a pending interrupt.
    pub fn irq(&self) -> bool {
        self.inner.engine().is_irq_set()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.signals.pause_requested()
    }

    pub fn is_halted(&self) -> bool {
        *self.inner.halted.lock().unwrap()
    }

    /// Set the halted latch. Halting fires `Halted`; un-halting signals the
    /// wake event so a sleeping execution loop re-enters the translator.
    pub fn set_is_halted(&self, value: bool) {
        let changed = {
            let mut halted = self.inner.halted.lock().unwrap();
            if *halted == value {
                false
            } else {
                *halted = value;
                true
            }
        };
        if !changed {
            return;
        }
        self.inner.fire_is_halted_changed(value);
        if value {
            self.inner.fire_halted(HaltReason::Pause);
        } else {
            self.inner.signals.pulse_halted_cleared();
        }
    }

    pub fn executed_instructions(&self) -> u64 {
        self.inner.executed_instructions.load(Ordering::SeqCst)
    }

    pub fn performance_in_mips(&self) -> u64 {
        self.inner.performance_in_mips.load(Ordering::SeqCst)
    }

    pub fn set_performance_in_mips(&self, mips: u64) {
        self.inner.performance_in_mips.store(mips, Ordering::SeqCst);
        self.inner.converter.lock().unwrap().set_ticks_per_us(mips);
    }

    pub fn translation_cache_size(&self) -> usize {
        self.inner.translation_cache_size.load(Ordering::SeqCst)
    }

    pub fn set_translation_cache_size(&self, size: usize) {
        let inner = &self.inner;
        inner.paused_scope(|| {
            inner.translation_cache_size.store(size, Ordering::SeqCst);
            inner.engine().set_translation_cache_size(size);
        });
    }

    pub fn maximum_block_size(&self) -> u32 {
        self.inner.engine().maximum_block_size()
    }

    pub fn set_maximum_block_size(&self, size: u32) -> u32 {
        let inner = &self.inner;
        inner.paused_scope(|| inner.engine().set_maximum_block_size(size))
    }

    pub fn count_threshold(&self) -> i32 {
        self.inner.count_threshold.load(Ordering::SeqCst)
    }

    pub fn set_count_threshold(&self, threshold: i32) {
        self.inner.count_threshold.store(threshold, Ordering::SeqCst);
        self.inner.engine().set_count_threshold(threshold);
    }

    pub fn advance_immediately(&self) -> bool {
        self.inner.advance_immediately.load(Ordering::SeqCst)
    }

    /// When set, a halted CPU advances the clock source straight to its
    /// nearest limit instead of sleeping the equivalent wall-clock time.
    pub fn set_advance_immediately(&self, value: bool) {
        self.inner.advance_immediately.store(value, Ordering::SeqCst);
    }

    pub fn thread_sentinel_enabled(&self) -> bool {
        self.inner.thread_sentinel_enabled.load(Ordering::SeqCst)
    }

    pub fn set_thread_sentinel_enabled(&self, value: bool) {
        self.inner
            .thread_sentinel_enabled
            .store(value, Ordering::SeqCst);
    }

    pub fn disable_interrupts_while_stepping(&self) -> bool {
        self.inner
            .disable_interrupts_while_stepping
            .load(Ordering::SeqCst)
    }

    pub fn set_disable_interrupts_while_stepping(&self, value: bool) {
        self.inner
            .disable_interrupts_while_stepping
            .store(value, Ordering::SeqCst);
    }

    pub fn update_context_on_load_and_store(&self) -> bool {
        self.inner
            .update_context_on_load_and_store
            .load(Ordering::SeqCst)
    }

    pub fn set_update_context_on_load_and_store(&self, value: bool) {
        self.inner
            .update_context_on_load_and_store
            .store(value, Ordering::SeqCst);
    }

    pub fn log_translation_block_fetch(&self) -> bool {
        self.inner.log_block_fetch.load(Ordering::SeqCst)
    }

    pub fn set_log_translation_block_fetch(&self, value: bool) {
        self.inner.log_block_fetch.store(value, Ordering::SeqCst);
        self.inner.engine().set_block_fetch_logging(value);
    }

    pub fn log_translated_blocks(&self) -> bool {
        self.inner.log_translated_blocks.load(Ordering::SeqCst)
    }

    pub fn set_log_translated_blocks(&self, value: bool) {
        self.inner.log_translated_blocks.store(value, Ordering::SeqCst);
        self.inner.engine().set_block_translation_logging(value);
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.inner.log_file.lock().unwrap().clone()
    }

    pub fn set_log_file(&self, path: Option<PathBuf>) {
        *self.inner.log_file.lock().unwrap() = path;
    }

    pub fn register_value(&self, id: i32) -> u32 {
        self.inner.engine().register_value(id)
    }

    pub fn set_register_value(&self, id: i32, value: u32) {
        self.inner.engine().set_register_value(id, value);
    }

    /// Resolve a guest virtual address through the translator's MMU.
    pub fn translate_to_physical(&self, address: u32) -> u32 {
        self.inner.engine().translate_to_physical(address)
    }

    /// Drop translated blocks covering the given host code range. Called by
    /// the bus when a sibling CPU broadcasts an invalidation for shared
    /// pages.
    pub fn invalidate_translated_blocks(&self, start: usize, end: usize) {
        self.inner.engine().invalidate_translation_blocks(start, end);
    }

    /// Values of every register declared in the profile's table.
    pub fn registers_values(&self) -> Vec<(&'static str, u32)> {
        let engine = self.inner.engine();
        self.inner
            .profile
            .registers
            .iter()
            .map(|r| (r.name, engine.register_value(r.id)))
            .collect()
    }
}

impl CpuInner {
    pub(crate) fn engine(&self) -> Arc<dyn TranslationEngine> {
        self.engine
            .lock()
            .unwrap()
            .clone()
            .expect("translation engine used after dispose")
    }

    pub(crate) fn guest_page_size(&self) -> u32 {
        self.page_size.load(Ordering::SeqCst)
    }

    pub(crate) fn execution_mode(&self) -> ExecutionMode {
        *self.mode.lock().unwrap()
    }

    pub(crate) fn set_execution_mode(&self, mode: ExecutionMode) {
        let mut current = self.mode.lock().unwrap();
        if *current == mode {
            return;
        }
        *current = mode;
        self.block_size_needs_adjustment.store(true, Ordering::SeqCst);
    }

    pub(crate) fn on_possessed_thread(&self) -> bool {
        *self.cpu_thread_id.lock().unwrap() == Some(thread::current().id())
    }

    /// One warning per foreign thread that drives GPIO unsynchronized.
    fn warn_on_foreign_thread(&self) {
        if !self.thread_sentinel_enabled.load(Ordering::SeqCst) || self.on_possessed_thread() {
            return;
        }
        let id = thread::current().id();
        if self.warned_threads.lock().unwrap().insert(id) {
            warn!(
                cpu = self.slot,
                "gpio driven from an unsynchronized thread {id:?}"
            );
        }
    }

    pub(crate) fn pause_with_reason(&self, reason: HaltReason) {
        if self.signals.pause_requested() {
            return;
        }
        if self.on_possessed_thread() {
            // A pause ordered by the running guest itself: only legal from
            // inside a guarded bus access (watchpoint path). The loop exits
            // at the end of the current block.
            self.pause_guard.order_pause();
            self.signals.request_pause();
            self.engine().set_paused();
            self.fire_halted(reason);
            return;
        }

        let _guard = self.pause_lock.lock().unwrap();
        if self.signals.pause_requested() {
            return;
        }
        self.signals.request_pause();
        let engine = self.engine();
        engine.set_paused();
        // Unblock a HandleStepping sleeper so the loop can observe the
        // pause event; the spare token is drained below if nothing took it.
        self.signals.reset_step_done(1);
        self.signals.release_step(1);
        self.signals.wait_pause_finished();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            handle.join().expect("cpu thread panicked");
        }
        *self.cpu_thread_id.lock().unwrap() = None;
        engine.clear_paused();
        self.signals.try_drain_step_token();
        self.fire_halted(reason);
    }

    pub(crate) fn resume_inner(self: &Arc<Self>) {
        let _guard = self.pause_lock.lock().unwrap();
        if !self.signals.pause_requested() {
            return;
        }
        self.started.store(true, Ordering::SeqCst);
        self.signals.clear_pause_request();
        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("tern-cpu-{}", self.slot))
            .spawn(move || {
                // Recorded by the thread itself, so possessed-thread checks
                // hold from the very first guest instruction.
                *inner.cpu_thread_id.lock().unwrap() = Some(thread::current().id());
                crate::exec::cpu_loop(&inner);
            })
            .expect("failed to spawn cpu thread");
        *self.thread.lock().unwrap() = Some(handle);
        self.engine().clear_paused();
    }

    /// Run `f` with the CPU paused, restoring the previous run state.
    pub(crate) fn paused_scope<T>(self: &Arc<Self>, f: impl FnOnce() -> T) -> T {
        let was_running = self.started.load(Ordering::SeqCst) && !self.signals.pause_requested();
        if was_running {
            self.pause_with_reason(HaltReason::Pause);
        }
        let result = f();
        if was_running {
            self.resume_inner();
        }
        result
    }

    pub(crate) fn reregister_memory(&self, engine: &dyn TranslationEngine) {
        for range in self.registry.ranges() {
            engine.map_range(range.start, range.size);
        }
        if self.registry.any_touched() {
            engine.set_host_blocks(&self.registry.host_blocks());
        }
        engine.set_translation_cache_size(self.translation_cache_size.load(Ordering::SeqCst));
    }

    pub(crate) fn fire_halted(&self, reason: HaltReason) {
        let arguments = HaltArguments {
            reason,
            cpu_slot: self.slot,
            address: self.try_pc(),
        };
        debug!(cpu = self.slot, ?reason, "halted");
        for handler in self.halted_handlers.lock().unwrap().iter() {
            handler(&arguments);
        }
    }

    pub(crate) fn fire_is_halted_changed(&self, value: bool) {
        for handler in self.is_halted_changed_handlers.lock().unwrap().iter() {
            handler(value);
        }
    }

    fn try_pc(&self) -> Option<u32> {
        let engine = self.engine.lock().unwrap().clone()?;
        Some(engine.register_value(self.profile.pc_register))
    }

    /// Symbol name at `address` when the image carries one, the hex
    /// address otherwise.
    pub(crate) fn describe_address(&self, address: u32) -> String {
        self.bus
            .find_symbol(address)
            .unwrap_or_else(|| format!("{address:#x}"))
    }
}

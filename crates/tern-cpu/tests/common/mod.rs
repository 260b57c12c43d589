//! Test doubles: a scripted translation engine and an in-process bus.
//!
//! The scripted engine interprets a tiny op stream (4 bytes per op, like a
//! fixed-width ISA) and talks to the harness through the same
//! `TranslatorClient` surface the native translator uses: block-begin
//! notifications, guarded bus accesses, instruction-counter reports, host
//! allocation. Block chaining, breakpoint traps, WFI parking and the
//! restart-translation-block protocol are all modelled, which lets the
//! integration tests drive every execution-loop scenario without a native
//! library.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::ffi::c_void;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tern_bus::{Access, SystemBus};
use tern_cpu::EngineFactory;
use tern_translator::{ExecuteResult, HostMemoryBlock, TranslationEngine, TranslatorClient};

pub const PAGE: u32 = 0x1000;
pub const OP_BYTES: u32 = 4;

/// One guest instruction of the scripted ISA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Nop,
    /// Read a dword from the bus.
    Load(u32),
    /// Write a dword to the bus.
    Store(u32, u32),
    /// Park the CPU until an interrupt arrives.
    Wfi,
    /// First access to a lazily-backed page.
    TouchPage(u32),
    /// Unrecoverable guest failure.
    Abort(&'static str),
}

/// Interesting engine interactions, recorded in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init(String),
    Reset,
    Dispose,
    /// Carries whether an IRQ was pending when execution began.
    ExecuteStart { irq_set: bool },
    ExecuteEnd,
    SetIrq(i32, bool),
    AddBreakpoint(u32),
    RemoveBreakpoint(u32),
    InvalidateCache,
    MapRange(u32, u32),
    UnmapRange(u32, u32),
    SetCacheSize(usize),
    SetHostBlocks(usize),
    SetMaxBlockSize(u32),
    Restart,
}

struct EngineState {
    pc: u32,
    paused: bool,
    wfi: bool,
    irqs: HashSet<i32>,
    breakpoints: HashSet<u32>,
    pending_breakpoint: Option<u32>,
    maximum_block_size: u32,
    restart_block_len: Option<u32>,
    mapped: Vec<(u32, u32)>,
    scratch: usize,
    disposed: bool,
}

/// Panic payload for the restart-translation-block unwind; mirrors the
/// native translator's longjmp back into `execute`.
struct BlockRestart;

pub struct ScriptedEngine {
    program: Vec<Op>,
    client: Arc<dyn TranslatorClient>,
    reject_cpu_type: Option<String>,
    state: Mutex<EngineState>,
    calls: Arc<Mutex<Vec<Call>>>,
    pub restarts: AtomicUsize,
}

impl ScriptedEngine {
    fn st(&self) -> MutexGuard<'_, EngineState> {
        // A restart unwind may have crossed a locked section; the state is
        // still consistent, so poisoning is ignored.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn mapped(&self) -> Vec<(u32, u32)> {
        self.st().mapped.clone()
    }

    pub fn breakpoints(&self) -> Vec<u32> {
        let mut bps: Vec<u32> = self.st().breakpoints.iter().copied().collect();
        bps.sort_unstable();
        bps
    }

    pub fn irq_pending(&self) -> bool {
        !self.st().irqs.is_empty()
    }

    fn op_at(&self, pc: u32) -> Option<Op> {
        self.program.get((pc / OP_BYTES) as usize).copied()
    }

    fn run(&self) -> ExecuteResult {
        loop {
            // Chain boundary: decide whether to keep running.
            {
                let mut st = self.st();
                if st.paused {
                    return ExecuteResult::Yield;
                }
                if st.wfi {
                    if st.irqs.is_empty() {
                        return ExecuteResult::Halted;
                    }
                    st.wfi = false;
                }
                if st.pc / OP_BYTES >= self.program.len() as u32 {
                    st.wfi = true;
                    return ExecuteResult::Halted;
                }
                match st.pending_breakpoint.take() {
                    Some(pending) if pending == st.pc => {
                        // Trap already reported here; run through it.
                    }
                    _ => {
                        if st.breakpoints.contains(&st.pc) {
                            st.pending_breakpoint = Some(st.pc);
                            return ExecuteResult::Breakpoint;
                        }
                    }
                }
            }

            // Translate one block: bounded by the maximum block size, the
            // next breakpoint, the program end, and control-flow ops.
            let (block_pc, block_len) = {
                let mut st = self.st();
                let limit = st.restart_block_len.take().unwrap_or(st.maximum_block_size).max(1);
                let start = st.pc;
                let mut len = 0u32;
                while len < limit {
                    let address = start + len * OP_BYTES;
                    if address / OP_BYTES >= self.program.len() as u32 {
                        break;
                    }
                    if len > 0 && st.breakpoints.contains(&address) {
                        break;
                    }
                    len += 1;
                    if matches!(
                        self.op_at(address),
                        Some(Op::Wfi) | Some(Op::Abort(_))
                    ) {
                        break;
                    }
                }
                (start, len)
            };

            self.client.on_block_begin(block_pc, block_len);
            if self.st().paused {
                // A pause arrived while this block waited at the stepping
                // barrier; the block body must not run.
                return ExecuteResult::Yield;
            }

            let mut executed = 0i32;
            let mut aborted = false;
            for i in 0..block_len {
                let op = self
                    .op_at(block_pc + i * OP_BYTES)
                    .expect("block formed past program end");
                let outcome = catch_unwind(AssertUnwindSafe(|| match op {
                    Op::Nop => {}
                    Op::Load(address) => {
                        self.client.read_dword_from_bus(address);
                    }
                    Op::Store(address, value) => {
                        self.client.write_dword_to_bus(address, value);
                    }
                    Op::Wfi => {
                        self.st().wfi = true;
                    }
                    Op::TouchPage(address) => {
                        self.client.touch_host_block(address);
                    }
                    Op::Abort(message) => {
                        self.client.report_abort(message);
                    }
                }));
                match outcome {
                    Ok(()) => {
                        self.st().pc += OP_BYTES;
                        executed += 1;
                        if matches!(op, Op::Abort(_)) {
                            aborted = true;
                            break;
                        }
                    }
                    Err(payload) => {
                        if payload.is::<BlockRestart>() {
                            // Unwound out of the block mid-instruction; the
                            // retranslated block is a single instruction at
                            // the unchanged pc.
                            self.restarts.fetch_add(1, Ordering::SeqCst);
                            self.record(Call::Restart);
                            self.st().restart_block_len = Some(1);
                            break;
                        }
                        resume_unwind(payload);
                    }
                }
            }
            if executed > 0 {
                self.client.update_instruction_counter(executed);
            }
            if aborted {
                return ExecuteResult::Yield;
            }
        }
    }
}

impl TranslationEngine for ScriptedEngine {
    fn init(&self, cpu_type: &str) -> i32 {
        self.record(Call::Init(cpu_type.to_owned()));
        if self.reject_cpu_type.as_deref() == Some(cpu_type) {
            return -1;
        }
        // Borrow some working memory through the client, like the real
        // translator does for its caches.
        let scratch = self.client.allocate(0x100) as usize;
        self.st().scratch = scratch;
        0
    }

    fn dispose(&self) {
        self.record(Call::Dispose);
        let scratch = {
            let mut st = self.st();
            st.disposed = true;
            std::mem::take(&mut st.scratch)
        };
        if scratch != 0 {
            self.client.free(scratch as *mut c_void);
        }
    }

    fn reset(&self) {
        self.record(Call::Reset);
        let mut st = self.st();
        st.pc = 0;
        st.wfi = false;
        st.irqs.clear();
        st.pending_breakpoint = None;
        st.restart_block_len = None;
    }

    fn execute(&self) -> ExecuteResult {
        self.record(Call::ExecuteStart {
            irq_set: !self.st().irqs.is_empty(),
        });
        let result = self.run();
        self.record(Call::ExecuteEnd);
        result
    }

    fn restart_translation_block(&self) -> ! {
        std::panic::panic_any(BlockRestart)
    }

    fn set_paused(&self) {
        self.st().paused = true;
    }

    fn clear_paused(&self) {
        self.st().paused = false;
    }

    fn is_wfi(&self) -> bool {
        self.st().wfi
    }

    fn page_size(&self) -> u32 {
        PAGE
    }

    fn map_range(&self, start: u32, size: u32) {
        self.record(Call::MapRange(start, size));
        self.st().mapped.push((start, start + (size - 1)));
    }

    fn unmap_range(&self, start: u32, end: u32) {
        self.record(Call::UnmapRange(start, end));
        self.st()
            .mapped
            .retain(|&(s, e)| !(s >= start && e <= end));
    }

    fn is_range_mapped(&self, start: u32, end: u32) -> bool {
        self.st().mapped.iter().any(|&(s, e)| s <= start && end <= e)
    }

    fn invalidate_translation_blocks(&self, _start: usize, _end: usize) {}

    fn translate_to_physical(&self, address: u32) -> u32 {
        address
    }

    fn set_host_blocks(&self, blocks: &[HostMemoryBlock]) {
        self.record(Call::SetHostBlocks(blocks.len()));
    }

    fn free_host_blocks(&self) {}

    fn set_count_threshold(&self, _threshold: i32) {}

    fn set_irq(&self, irq: i32, level: bool) {
        self.record(Call::SetIrq(irq, level));
        let mut st = self.st();
        if level {
            st.irqs.insert(irq);
        } else {
            st.irqs.remove(&irq);
        }
    }

    fn is_irq_set(&self) -> bool {
        !self.st().irqs.is_empty()
    }

    fn add_breakpoint(&self, address: u32) {
        self.record(Call::AddBreakpoint(address));
        self.st().breakpoints.insert(address);
    }

    fn remove_breakpoint(&self, address: u32) {
        self.record(Call::RemoveBreakpoint(address));
        self.st().breakpoints.remove(&address);
    }

    fn set_block_fetch_logging(&self, _enabled: bool) {}

    fn set_block_translation_logging(&self, _enabled: bool) {}

    fn set_translation_cache_size(&self, size: usize) {
        self.record(Call::SetCacheSize(size));
    }

    fn invalidate_translation_cache(&self) {
        self.record(Call::InvalidateCache);
    }

    fn set_maximum_block_size(&self, size: u32) -> u32 {
        self.record(Call::SetMaxBlockSize(size));
        self.st().maximum_block_size = size;
        size
    }

    fn maximum_block_size(&self) -> u32 {
        self.st().maximum_block_size
    }

    fn restore_context(&self) {}

    fn register_value(&self, register: i32) -> u32 {
        match register {
            0 => self.st().pc,
            _ => 0,
        }
    }

    fn set_register_value(&self, register: i32, value: u32) {
        if register == 0 {
            self.st().pc = value;
        }
    }

    fn export_state(&self) -> Vec<u8> {
        let st = self.st();
        let mut blob = st.pc.to_le_bytes().to_vec();
        blob.push(st.wfi as u8);
        blob
    }

    fn import_state(&self, blob: &[u8]) {
        if blob.len() < 5 {
            return;
        }
        let mut st = self.st();
        st.pc = u32::from_le_bytes(blob[0..4].try_into().unwrap());
        st.wfi = blob[4] != 0;
    }
}

/// Handles the tests keep on the engines a factory produced.
#[derive(Clone)]
pub struct EngineHarness {
    pub calls: Arc<Mutex<Vec<Call>>>,
    pub engines: Arc<Mutex<Vec<Arc<ScriptedEngine>>>>,
}

impl EngineHarness {
    pub fn engine(&self) -> Arc<ScriptedEngine> {
        self.engines.lock().unwrap().last().expect("no engine created").clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn restarts(&self) -> usize {
        self.engine().restarts.load(Ordering::SeqCst)
    }
}

/// Build an engine factory running `program`. Every engine the factory
/// creates (one per init/restore) shares the harness's call log.
pub fn scripted_factory(program: Vec<Op>) -> (EngineFactory, EngineHarness) {
    scripted_factory_rejecting(program, None)
}

pub fn scripted_factory_rejecting(
    program: Vec<Op>,
    reject_cpu_type: Option<String>,
) -> (EngineFactory, EngineHarness) {
    let harness = EngineHarness {
        calls: Arc::new(Mutex::new(Vec::new())),
        engines: Arc::new(Mutex::new(Vec::new())),
    };
    let factory_harness = harness.clone();
    let factory: EngineFactory = Arc::new(move |client| {
        let engine = Arc::new(ScriptedEngine {
            program: program.clone(),
            client,
            reject_cpu_type: reject_cpu_type.clone(),
            state: Mutex::new(EngineState {
                pc: 0,
                paused: false,
                wfi: false,
                irqs: HashSet::new(),
                breakpoints: HashSet::new(),
                pending_breakpoint: None,
                maximum_block_size: tern_cpu::DEFAULT_MAXIMUM_BLOCK_SIZE,
                restart_block_len: None,
                mapped: Vec::new(),
                scratch: 0,
                disposed: false,
            }),
            calls: factory_harness.calls.clone(),
            restarts: AtomicUsize::new(0),
        });
        factory_harness.engines.lock().unwrap().push(engine.clone());
        Ok(engine as Arc<dyn TranslationEngine>)
    });
    (factory, harness)
}

type WatchpointHook = Box<dyn Fn(u32, Access) + Send + Sync>;

/// An in-process flat bus with dword-granular backing storage, read/write
/// watchpoints and a hook invoked on watchpointed accesses.
#[derive(Default)]
pub struct FakeBus {
    memory: Mutex<HashMap<u32, u32>>,
    read_watchpoints: Mutex<HashSet<u32>>,
    write_watchpoints: Mutex<HashSet<u32>>,
    watchpoint_hook: Mutex<Option<WatchpointHook>>,
    symbols: Mutex<HashMap<u32, String>>,
}

impl FakeBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn poke(&self, address: u32, value: u32) {
        self.memory.lock().unwrap().insert(address, value);
    }

    pub fn peek(&self, address: u32) -> u32 {
        self.memory.lock().unwrap().get(&address).copied().unwrap_or(0)
    }

    pub fn add_watchpoint(&self, address: u32, access: Access) {
        match access {
            Access::Read => self.read_watchpoints.lock().unwrap().insert(address),
            Access::Write => self.write_watchpoints.lock().unwrap().insert(address),
        };
    }

    pub fn set_watchpoint_hook(&self, hook: WatchpointHook) {
        *self.watchpoint_hook.lock().unwrap() = Some(hook);
    }

    pub fn add_symbol(&self, address: u32, name: &str) {
        self.symbols.lock().unwrap().insert(address, name.to_owned());
    }

    fn dispatch_watchpoint(&self, address: u32, access: Access) {
        if self.is_watchpoint_at(address, access) {
            let hook = self.watchpoint_hook.lock().unwrap();
            if let Some(hook) = &*hook {
                hook(address, access);
            }
        }
    }
}

impl SystemBus for FakeBus {
    fn read_byte(&self, address: u32) -> u8 {
        self.read_dword(address) as u8
    }

    fn read_word(&self, address: u32) -> u16 {
        self.read_dword(address) as u16
    }

    fn read_dword(&self, address: u32) -> u32 {
        self.dispatch_watchpoint(address, Access::Read);
        self.peek(address)
    }

    fn write_byte(&self, address: u32, value: u8) {
        self.write_dword(address, u32::from(value));
    }

    fn write_word(&self, address: u32, value: u16) {
        self.write_dword(address, u32::from(value));
    }

    fn write_dword(&self, address: u32, value: u32) {
        self.dispatch_watchpoint(address, Access::Write);
        self.poke(address, value);
    }

    fn is_watchpoint_at(&self, address: u32, access: Access) -> bool {
        match access {
            Access::Read => self.read_watchpoints.lock().unwrap().contains(&address),
            Access::Write => self.write_watchpoints.lock().unwrap().contains(&address),
        }
    }

    fn find_symbol(&self, address: u32) -> Option<String> {
        self.symbols.lock().unwrap().get(&address).cloned()
    }
}

pub fn test_profile() -> tern_cpu::CpuProfile {
    tern_cpu::CpuProfile {
        model: "scripted".into(),
        architecture: "test".into(),
        cpu_type: "scripted-v1".into(),
        word_size: 32,
        endianness: tern_cpu::Endianness::Little,
        interrupt_lines: 2,
        registers: vec![tern_cpu::RegisterDescriptor {
            id: 0,
            name: "pc",
            width: 32,
            bank: None,
        }],
        pc_register: 0,
        interrupt_decode: vec![],
    }
}

/// Poll `predicate` until it holds or five seconds elapse.
pub fn wait_until(predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

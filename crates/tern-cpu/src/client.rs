//! The callbacks the translator makes back into the harness.
//!
//! Every bus access is bracketed by the pause guard so watchpoints pause
//! with instruction precision; see `pause_guard.rs` for the restart
//! protocol. Two callbacks cannot unwind through the native frames the way
//! the loop needs (`report_abort`, and a clock cancellation raised inside
//! `update_instruction_counter`): they record the condition, ask the
//! translator to stop at the current block, and the loop re-raises it once
//! `execute` returns.

use std::ffi::c_void;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::sync::atomic::Ordering;

use tern_bus::Access;
use tern_translator::TranslatorClient;
use tracing::{debug, error, info, trace, warn};

use crate::cpu::CpuInner;
use crate::ExecutionMode;

impl CpuInner {
    fn guarded_access<T>(&self, access: Access, address: u32, op: impl FnOnce() -> T) -> T {
        let engine = self.engine();
        if self.update_context_on_load_and_store.load(Ordering::SeqCst) {
            engine.restore_context();
        }
        let watchpointed = self.bus.is_watchpoint_at(address, access);
        if watchpointed {
            debug_assert!(
                self.on_possessed_thread(),
                "watchpoint handling must run on the cpu thread"
            );
        }
        self.pause_guard.initialize(watchpointed, &*engine);
        let value = op();
        self.pause_guard.dispose();
        value
    }
}

impl TranslatorClient for CpuInner {
    fn read_byte_from_bus(&self, address: u32) -> u32 {
        self.guarded_access(Access::Read, address, || u32::from(self.bus.read_byte(address)))
    }

    fn read_word_from_bus(&self, address: u32) -> u32 {
        self.guarded_access(Access::Read, address, || u32::from(self.bus.read_word(address)))
    }

    fn read_dword_from_bus(&self, address: u32) -> u32 {
        self.guarded_access(Access::Read, address, || self.bus.read_dword(address))
    }

    fn write_byte_to_bus(&self, address: u32, value: u32) {
        self.guarded_access(Access::Write, address, || {
            self.bus.write_byte(address, value as u8)
        })
    }

    fn write_word_to_bus(&self, address: u32, value: u32) {
        self.guarded_access(Access::Write, address, || {
            self.bus.write_word(address, value as u16)
        })
    }

    fn write_dword_to_bus(&self, address: u32, value: u32) {
        self.guarded_access(Access::Write, address, || self.bus.write_dword(address, value))
    }

    fn on_block_begin(&self, address: u32, instructions: u32) {
        self.handle_stepping();
        self.skip_next_stepping.store(false, Ordering::SeqCst);
        let hook = self.block_begin_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(address, instructions);
        }
    }

    fn report_abort(&self, message: &str) {
        *self.abort_message.lock().unwrap() = Some(message.to_owned());
        self.engine().set_paused();
    }

    fn is_io_accessed(&self, address: u32) -> bool {
        self.registry.is_io_page(address, self.guest_page_size())
    }

    fn update_instruction_counter(&self, executed: i32) {
        if executed <= 0 {
            return;
        }
        self.executed_instructions
            .fetch_add(executed as u64, Ordering::SeqCst);
        if !self.clock.has_entries() {
            return;
        }
        if self.clock.advance(executed as u64, false).is_err() {
            self.pending_cancellation.store(true, Ordering::SeqCst);
            self.engine().set_paused();
        }
    }

    fn is_instruction_count_enabled(&self) -> bool {
        self.clock.has_entries()
    }

    fn is_block_begin_event_enabled(&self) -> bool {
        self.execution_mode() == ExecutionMode::SingleStep
            || self.block_begin_hook.lock().unwrap().is_some()
    }

    fn touch_host_block(&self, offset: u32) {
        if let Some(blocks) = self.registry.touch_at(offset) {
            self.engine().set_host_blocks(&blocks);
        }
    }

    fn invalidate_tb_in_other_cpus(&self, start: usize, end: usize) {
        self.bus.broadcast_tb_invalidation(self.slot, start, end);
    }

    fn allocate(&self, size: usize) -> *mut c_void {
        self.memory_manager.allocate(size)
    }

    fn reallocate(&self, pointer: *mut c_void, size: usize) -> *mut c_void {
        self.memory_manager.reallocate(pointer, size)
    }

    fn free(&self, pointer: *mut c_void) {
        self.memory_manager.free(pointer)
    }

    fn log_as_cpu(&self, level: i32, message: &str) {
        match level {
            0 => trace!(cpu = self.slot, "{message}"),
            1 => debug!(cpu = self.slot, "{message}"),
            2 => info!(cpu = self.slot, "{message}"),
            3 => warn!(cpu = self.slot, "{message}"),
            _ => error!(cpu = self.slot, "{message}"),
        }
    }

    fn log_disassembly(&self, address: u32, size: u32, flags: u32) {
        if !self.log_translated_blocks.load(Ordering::SeqCst) {
            return;
        }
        let Some(disassembler) = self.disassemblers.active() else {
            warn!(cpu = self.slot, "translated-block logging without a disassembler");
            return;
        };
        // Cap pathological sizes; a translated block never comes close.
        let size = size.min(0x10000);
        let code: Vec<u8> = (0..size).map(|i| self.bus.read_byte(address + i)).collect();
        let Some(listing) = disassembler.disassemble(address, &code) else {
            debug!(
                cpu = self.slot,
                "could not disassemble block at {}", self.describe_address(address)
            );
            return;
        };
        let header = format!(
            "-- block at {} ({size} bytes, flags {flags:#x}) --\n",
            self.describe_address(address)
        );
        match &*self.log_file.lock().unwrap() {
            Some(path) => {
                let result = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .and_then(|mut f| f.write_all(header.as_bytes()).and_then(|_| {
                        f.write_all(listing.as_bytes()).and_then(|_| f.write_all(b"\n"))
                    }));
                if let Err(error) = result {
                    warn!(cpu = self.slot, %error, "failed to write block log");
                }
            }
            None => debug!(cpu = self.slot, "{header}{listing}"),
        }
    }

    fn on_block_fetch(&self, address: u32) {
        if self.log_block_fetch.load(Ordering::SeqCst) {
            debug!(
                cpu = self.slot,
                "fetching block at {}", self.describe_address(address)
            );
        }
    }

    fn cpu_index(&self) -> i32 {
        self.slot
    }

    fn on_translation_cache_size_change(&self, new_size: i64) {
        debug!(cpu = self.slot, new_size, "translation cache resized");
    }
}

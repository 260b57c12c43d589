//! CPU snapshot save/restore.
//!
//! The on-disk state is a little-endian section stream: the public
//! properties, the IRQ latch levels, integrity descriptors for the mapped
//! segments and hook addresses, and the translator's opaque state blob.
//! Transient state (execution thread, wait plumbing, memory manager, the
//! loaded library itself) is never written; restore reconstructs it by
//! reloading the translator through the engine factory and re-registering
//! memory and breakpoints.

use std::io::{Read, Write};
use std::sync::atomic::Ordering;

use thiserror::Error;
use tracing::debug;

use crate::cpu::ExecutionMode;
use crate::TranslationCpu;

pub const SNAPSHOT_MAGIC: u32 = u32::from_le_bytes(*b"TCPU");
pub const SNAPSHOT_VERSION: u32 = 1;

const MAX_STRING_LEN: u32 = 4096;
const MAX_TABLE_LEN: usize = 0x10000;
const MAX_BLOB_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("snapshot does not match this cpu: {0}")]
    Mismatch(&'static str),

    #[error(transparent)]
    Translator(#[from] tern_translator::TranslatorError),

    #[error("translator rejected cpu type {0:?} during restore")]
    InvalidCpuType(String),
}

type Result<T> = std::result::Result<T, SnapshotError>;

trait WriteLeExt: Write {
    fn write_u8_raw(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_string_u32(&mut self, s: &str) -> Result<()> {
        let len: u32 = s
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("string does not fit in u32"))?;
        self.write_u32_le(len)?;
        self.write_all(s.as_bytes())?;
        Ok(())
    }
}

impl<W: Write + ?Sized> WriteLeExt for W {}

trait ReadLeExt: Read {
    fn read_u8_raw(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8_raw()? != 0)
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_string_u32(&mut self) -> Result<String> {
        let len = self.read_u32_le()?;
        if len > MAX_STRING_LEN {
            return Err(SnapshotError::Corrupt("string length exceeds limit"));
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| SnapshotError::Corrupt("string is not utf-8"))
    }
}

impl<R: Read + ?Sized> ReadLeExt for R {}

impl TranslationCpu {
    /// Serialize the CPU. Runs under the paused state; the `before_save`
    /// hook fires first, then the translator state blob is sampled.
    pub fn save_state<W: Write>(&self, writer: &mut W) -> Result<()> {
        let inner = &self.inner;
        inner.paused_scope(|| {
            if let Some(hook) = &*inner.before_save.lock().unwrap() {
                hook();
            }
            let engine = inner.engine();

            writer.write_u32_le(SNAPSHOT_MAGIC)?;
            writer.write_u32_le(SNAPSHOT_VERSION)?;
            writer.write_string_u32(&inner.profile.model)?;
            writer.write_string_u32(&inner.profile.architecture)?;

            writer.write_u64_le(inner.executed_instructions.load(Ordering::SeqCst))?;
            writer.write_u64_le(inner.performance_in_mips.load(Ordering::SeqCst))?;
            writer.write_u32_le(inner.count_threshold.load(Ordering::SeqCst) as u32)?;
            writer.write_u64_le(inner.translation_cache_size.load(Ordering::SeqCst) as u64)?;
            writer.write_u32_le(engine.maximum_block_size())?;
            writer.write_u8_raw(match inner.execution_mode() {
                ExecutionMode::Continuous => 0,
                ExecutionMode::SingleStep => 1,
            })?;
            writer.write_u8_raw(inner.advance_immediately.load(Ordering::SeqCst) as u8)?;
            writer.write_u8_raw(
                inner.disable_interrupts_while_stepping.load(Ordering::SeqCst) as u8,
            )?;
            writer.write_u8_raw(inner.thread_sentinel_enabled.load(Ordering::SeqCst) as u8)?;
            writer
                .write_u8_raw(inner.update_context_on_load_and_store.load(Ordering::SeqCst) as u8)?;
            writer.write_u8_raw(inner.log_block_fetch.load(Ordering::SeqCst) as u8)?;
            writer.write_u8_raw(inner.log_translated_blocks.load(Ordering::SeqCst) as u8)?;

            let latches = inner.signals.latch_snapshot();
            writer.write_u32_le(latches.len() as u32)?;
            for level in &latches {
                writer.write_u8_raw(*level as u8)?;
            }

            let ranges = inner.registry.ranges();
            writer.write_u32_le(ranges.len() as u32)?;
            for range in &ranges {
                writer.write_u32_le(range.start)?;
                writer.write_u32_le(range.size)?;
            }

            let addresses = inner.hooks.addresses();
            writer.write_u32_le(addresses.len() as u32)?;
            for address in &addresses {
                writer.write_u32_le(*address)?;
            }

            let blob = engine.export_state();
            writer.write_u32_le(blob.len() as u32)?;
            writer.write_all(&blob)?;
            debug!(cpu = inner.slot, blob = blob.len(), "cpu state saved");
            Ok(())
        })
    }

    /// Restore a snapshot produced by [`save_state`](Self::save_state).
    ///
    /// The translator library is reloaded from scratch through the engine
    /// factory, the state blob is imported, and all mapped memory and
    /// breakpoints are re-registered. The CPU is left paused.
    pub fn restore_state<R: Read>(&self, reader: &mut R) -> Result<()> {
        let inner = &self.inner;
        if inner.started.load(Ordering::SeqCst) && !inner.signals.pause_requested() {
            inner.pause_with_reason(crate::HaltReason::Pause);
        }

        if reader.read_u32_le()? != SNAPSHOT_MAGIC {
            return Err(SnapshotError::Corrupt("bad magic"));
        }
        let version = reader.read_u32_le()?;
        if version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        if reader.read_string_u32()? != inner.profile.model {
            return Err(SnapshotError::Mismatch("model differs"));
        }
        if reader.read_string_u32()? != inner.profile.architecture {
            return Err(SnapshotError::Mismatch("architecture differs"));
        }

        let executed = reader.read_u64_le()?;
        let mips = reader.read_u64_le()?;
        let count_threshold = reader.read_u32_le()? as i32;
        let cache_size = reader.read_u64_le()? as usize;
        let maximum_block_size = reader.read_u32_le()?;
        let mode = match reader.read_u8_raw()? {
            0 => ExecutionMode::Continuous,
            1 => ExecutionMode::SingleStep,
            _ => return Err(SnapshotError::Corrupt("unknown execution mode")),
        };
        let advance_immediately = reader.read_bool()?;
        let disable_irqs_stepping = reader.read_bool()?;
        let thread_sentinel = reader.read_bool()?;
        let update_context = reader.read_bool()?;
        let log_fetch = reader.read_bool()?;
        let log_translated = reader.read_bool()?;

        let latch_count = reader.read_u32_le()? as usize;
        if latch_count != inner.profile.interrupt_lines {
            return Err(SnapshotError::Mismatch("interrupt line count differs"));
        }
        let mut latches = Vec::with_capacity(latch_count);
        for _ in 0..latch_count {
            latches.push(reader.read_bool()?);
        }

        let range_count = reader.read_u32_le()? as usize;
        if range_count > MAX_TABLE_LEN {
            return Err(SnapshotError::Corrupt("segment table exceeds limit"));
        }
        let mut saved_ranges = Vec::with_capacity(range_count);
        for _ in 0..range_count {
            let start = reader.read_u32_le()?;
            let size = reader.read_u32_le()?;
            saved_ranges.push((start, size));
        }
        let live_ranges: Vec<(u32, u32)> = inner
            .registry
            .ranges()
            .iter()
            .map(|r| (r.start, r.size))
            .collect();
        if saved_ranges != live_ranges {
            return Err(SnapshotError::Mismatch("memory map differs"));
        }

        let hook_count = reader.read_u32_le()? as usize;
        if hook_count > MAX_TABLE_LEN {
            return Err(SnapshotError::Corrupt("hook table exceeds limit"));
        }
        let mut saved_hooks = Vec::with_capacity(hook_count);
        for _ in 0..hook_count {
            saved_hooks.push(reader.read_u32_le()?);
        }
        if saved_hooks != inner.hooks.addresses() {
            return Err(SnapshotError::Mismatch("hook set differs"));
        }

        let blob_len = reader.read_u32_le()?;
        if blob_len > MAX_BLOB_LEN {
            return Err(SnapshotError::Corrupt("state blob exceeds limit"));
        }
        let mut blob = vec![0u8; blob_len as usize];
        reader.read_exact(&mut blob)?;

        // Reload the translator library and rebuild everything transient.
        let old_engine = inner.engine();
        old_engine.dispose();
        drop(old_engine);
        let client: std::sync::Arc<dyn tern_translator::TranslatorClient> = inner.clone();
        let engine = (inner.factory)(client)?;
        if engine.init(&inner.profile.cpu_type) < 0 {
            return Err(SnapshotError::InvalidCpuType(inner.profile.cpu_type.clone()));
        }
        inner.page_size.store(engine.page_size(), Ordering::SeqCst);
        *inner.engine.lock().unwrap() = Some(engine.clone());

        inner.executed_instructions.store(executed, Ordering::SeqCst);
        inner.performance_in_mips.store(mips, Ordering::SeqCst);
        inner.converter.lock().unwrap().set_ticks_per_us(mips);
        inner.count_threshold.store(count_threshold, Ordering::SeqCst);
        inner.translation_cache_size.store(cache_size, Ordering::SeqCst);
        inner.set_execution_mode(mode);
        inner.advance_immediately.store(advance_immediately, Ordering::SeqCst);
        inner
            .disable_interrupts_while_stepping
            .store(disable_irqs_stepping, Ordering::SeqCst);
        inner.thread_sentinel_enabled.store(thread_sentinel, Ordering::SeqCst);
        inner
            .update_context_on_load_and_store
            .store(update_context, Ordering::SeqCst);
        inner.log_block_fetch.store(log_fetch, Ordering::SeqCst);
        inner.log_translated_blocks.store(log_translated, Ordering::SeqCst);
        inner.signals.restore_latches(&latches);

        engine.import_state(&blob);
        engine.set_count_threshold(count_threshold);
        engine.set_maximum_block_size(maximum_block_size);
        engine.set_block_fetch_logging(log_fetch);
        engine.set_block_translation_logging(log_translated);
        inner.reregister_memory(&*engine);
        for address in inner.hooks.addresses() {
            engine.add_breakpoint(address);
        }

        if let Some(hook) = &*inner.after_load.lock().unwrap() {
            hook();
        }
        debug!(cpu = inner.slot, "cpu state restored");
        Ok(())
    }
}

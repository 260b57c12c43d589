//! The translation CPU harness.
//!
//! A [`TranslationCpu`] is the managed control plane around a native binary
//! translator: it owns the CPU execution thread, drives the translator's
//! `execute`, and layers precise pause, single-step, breakpoint and
//! watchpoint semantics on top of a translator that chains instructions
//! into variable-size blocks. It also feeds the translator its view of
//! guest memory (mapped segments, host-block table, I/O pages), delivers
//! latched interrupts, advances the instruction-driven clock source, and
//! snapshots the translator's opaque state.
//!
//! The translator itself is abstracted behind
//! [`tern_translator::TranslationEngine`], so the harness runs identically
//! against the shared-object binding and against scripted engines in tests.

mod client;
mod cpu;
mod disasm;
mod error;
mod exec;
mod hooks;
mod loader;
mod memmap;
mod pause_guard;
mod profile;
mod snapshot;
mod sync;

pub use cpu::{
    BlockBeginHook, EngineFactory, ExecutionMode, HaltArguments, HaltReason, LifecycleHook,
    TranslationCpu, DEFAULT_COUNT_THRESHOLD, DEFAULT_MAXIMUM_BLOCK_SIZE,
    DEFAULT_PERFORMANCE_IN_MIPS, DEFAULT_TRANSLATION_CACHE_SIZE,
};
pub use disasm::Disassembler;
pub use error::{CpuError, Result};
pub use hooks::HookCallback;
pub use profile::{CpuProfile, Endianness, RegisterDescriptor};
pub use snapshot::{SnapshotError, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};

//! The CPU thread's execution loop and its stepping machinery.
//!
//! One invocation of [`cpu_loop`] spans one Resume..Pause window. The loop
//! drives the translator's `execute`, which may chain many blocks per call;
//! every per-step decision is therefore anchored at the `on_block_begin`
//! callback (the only reliable instruction-granular boundary), not at
//! `execute` boundaries. See [`CpuInner::handle_stepping`] for how the two
//! stepping barriers cooperate with breakpoint retranslation.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tern_time::AdvanceCancelled;
use tern_translator::ExecuteResult;
use tracing::{debug, error, trace};

use crate::cpu::{CpuInner, ExecutionMode, HaltReason};

enum LoopExit {
    Paused,
    Cancelled,
    Abort(String),
}

pub(crate) fn cpu_loop(inner: &Arc<CpuInner>) {
    trace!(cpu = inner.slot, "cpu loop entered");

    // A cancelled clock advance from the previous invocation is replayed
    // before any guest code runs.
    if inner.advance_should_be_restarted.swap(false, Ordering::SeqCst) && inner.clock.has_entries()
    {
        if inner.clock.advance(0, true).is_err() {
            inner.advance_should_be_restarted.store(true, Ordering::SeqCst);
            inner.signals.request_pause();
            return;
        }
    }

    inner.handle_stepping();
    // The step that authorized this invocation must not be counted again at
    // the first block begin.
    inner.skip_next_stepping.store(true, Ordering::SeqCst);

    let exit = 'run: loop {
        inner.adjust_block_size();

        let engine = inner.engine();
        if tracing::enabled!(tracing::Level::TRACE) {
            let pc = engine.register_value(inner.profile.pc_register);
            trace!(cpu = inner.slot, "executing at {}", inner.describe_address(pc));
        }

        inner.repush_irq_latches();

        let halted = *inner.halted.lock().unwrap();
        let mut result = None;
        if !halted {
            inner.pause_guard.enter();
            let outcome = engine.execute();
            inner.pause_guard.leave();
            inner.skip_next_stepping.store(false, Ordering::SeqCst);
            result = Some(outcome);
        }

        if result == Some(ExecuteResult::Breakpoint) {
            let pc = engine.register_value(inner.profile.pc_register);
            debug!(cpu = inner.slot, "breakpoint at {}", inner.describe_address(pc));
            inner.hooks.run_at(pc);
        }
        if let Some(message) = inner.abort_message.lock().unwrap().take() {
            break 'run LoopExit::Abort(message);
        }
        if inner.pending_cancellation.swap(false, Ordering::SeqCst) {
            break 'run LoopExit::Cancelled;
        }
        if inner.signals.pause_requested() {
            inner.signals.signal_pause_finished();
            break 'run LoopExit::Paused;
        }

        let halted_now = *inner.halted.lock().unwrap();
        if halted_now || engine.is_wfi() {
            if inner.clock.has_entries() {
                if inner.sleep_and_advance().is_err() {
                    break 'run LoopExit::Cancelled;
                }
            } else {
                inner.signals.wait_any(None);
            }
        }
    };

    // A mode change may have arrived while the loop was unwinding.
    inner.adjust_block_size();

    match exit {
        LoopExit::Paused => {
            trace!(cpu = inner.slot, "cpu loop paused");
        }
        LoopExit::Cancelled => {
            inner.advance_should_be_restarted.store(true, Ordering::SeqCst);
            inner.signals.request_pause();
            inner.signals.signal_pause_finished();
            trace!(cpu = inner.slot, "cpu loop unwound by clock cancellation");
        }
        LoopExit::Abort(message) => {
            error!(cpu = inner.slot, "guest abort: {message}");
            inner.aborted.store(true, Ordering::SeqCst);
            inner.signals.request_pause();
            inner.signals.signal_pause_finished();
            inner.fire_halted(HaltReason::Abort);
        }
    }

    if inner.single_step_after_watchpoint.swap(false, Ordering::SeqCst) {
        inner.set_execution_mode(ExecutionMode::SingleStep);
        inner.resume_inner();
    }
}

impl CpuInner {
    /// The step barrier, reached from two places: the top of the loop
    /// (before entering the translator, so a just-removed breakpoint's
    /// stale trap cannot consume a step token) and `on_block_begin`
    /// (ordinary stepping). `skip_next_stepping` separates the two: the
    /// first block of a stepped run was already authorized by `step` and
    /// must not halt again at its own block begin.
    pub(crate) fn handle_stepping(&self) {
        if self.execution_mode() != ExecutionMode::SingleStep {
            return;
        }
        if self.skip_next_stepping.load(Ordering::SeqCst) {
            return;
        }
        self.fire_halted(HaltReason::Step);
        self.signals.acquire_step();
        self.signals.signal_step_done();
    }

    /// Apply a pending execution-mode change to the translator's maximum
    /// block size, remembering the previous value across a single-step
    /// episode. Talks to the engine directly: this runs on the CPU thread,
    /// where the paused-scope wrapper would deadlock.
    pub(crate) fn adjust_block_size(&self) {
        if !self.block_size_needs_adjustment.swap(false, Ordering::SeqCst) {
            return;
        }
        let engine = self.engine();
        match self.execution_mode() {
            ExecutionMode::SingleStep => {
                let mut saved = self.saved_maximum_block_size.lock().unwrap();
                if saved.is_none() {
                    *saved = Some(engine.maximum_block_size());
                    engine.set_maximum_block_size(1);
                }
            }
            ExecutionMode::Continuous => {
                if let Some(size) = self.saved_maximum_block_size.lock().unwrap().take() {
                    engine.set_maximum_block_size(size);
                }
            }
        }
    }

    /// Re-push latched interrupt levels to the translator. Edges raised
    /// while the CPU was paused would otherwise be lost: the translator's
    /// own pending-irq state was cleared, but our latches still hold the
    /// line levels.
    pub(crate) fn repush_irq_latches(&self) {
        if self.disable_interrupts_while_stepping.load(Ordering::SeqCst)
            && self.execution_mode() == ExecutionMode::SingleStep
        {
            return;
        }
        let engine = self.engine();
        if engine.is_irq_set() || !self.signals.any_latch_set() {
            return;
        }
        for (line, level) in self.signals.latch_snapshot().into_iter().enumerate() {
            if let Some(irq) = self.profile.decode_interrupt(line) {
                engine.set_irq(irq, level);
            }
        }
    }

    /// Sleep through a halted/WFI window, then convert the waited time to
    /// virtual ticks and advance the clock source.
    pub(crate) fn sleep_and_advance(&self) -> Result<(), AdvanceCancelled> {
        let Some(nearest) = self.clock.nearest_limit_in() else {
            // Entries exist but none is enabled; only an external event can
            // make progress.
            self.signals.wait_any(None);
            return Ok(());
        };
        if nearest == 0 {
            return self.clock.advance(0, false);
        }
        if self.advance_immediately.load(Ordering::SeqCst) {
            // Jump virtual time straight to the limit, then wait for an
            // external event instead of burning host time.
            self.clock.advance(nearest, false)?;
            self.signals.wait_any(None);
            return Ok(());
        }

        let timeout = self.converter.lock().unwrap().ticks_to_wall_time(nearest);
        let started = Instant::now();
        let woke = self.signals.wait_any(Some(timeout));
        let ticks = if woke {
            let elapsed = self
                .converter
                .lock()
                .unwrap()
                .wall_time_to_ticks(started.elapsed());
            elapsed.min(nearest)
        } else {
            nearest
        };
        self.clock.advance(ticks, false)
    }
}

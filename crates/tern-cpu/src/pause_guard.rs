//! Precise watchpoint pause.
//!
//! The translator chains many instructions into a block, so by the time a
//! bus access reports a watchpoint hit the guest may be several
//! instructions past a precise stopping point. The guard fixes that with a
//! restart protocol: on the first watchpointed access of a block it asks
//! the translator to unwind and retranslate the block bounded to a single
//! instruction. The retranslated instruction re-issues the same access;
//! the `block_restart_reached` latch recognizes the second pass and lets
//! it proceed, so a pause ordered by the watchpoint lands exactly on the
//! instruction boundary after the access.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tern_translator::TranslationEngine;

#[derive(Debug, Default)]
pub(crate) struct PauseGuard {
    /// True while the CPU thread is inside `execute`.
    active: AtomicBool,
    /// Non-zero while a bus access is bracketed by `initialize`/`dispose`.
    token: AtomicU64,
    next_token: AtomicU64,
    block_restart_reached: AtomicBool,
}

impl PauseGuard {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enter(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub(crate) fn leave(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Bracket the start of a bus access issued by the translator.
    ///
    /// Diverges into `restart_translation_block` on the first watchpointed
    /// access of a block; returns normally on the re-executed access.
    pub(crate) fn initialize(&self, watchpointed: bool, engine: &dyn TranslationEngine) {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        self.token.store(token, Ordering::SeqCst);
        if !watchpointed {
            return;
        }
        if !self.block_restart_reached.swap(true, Ordering::SeqCst) {
            // First pass: unwind out of the current block. The translator
            // retranslates it bounded to one instruction and re-enters,
            // re-issuing this access with the latch set.
            engine.restart_translation_block();
        }
        self.block_restart_reached.store(false, Ordering::SeqCst);
    }

    /// Bracket the end of a bus access.
    pub(crate) fn dispose(&self) {
        self.token.store(0, Ordering::SeqCst);
    }

    /// Validate that a pause ordered from the CPU thread happens inside a
    /// guarded bus access.
    ///
    /// # Panics
    ///
    /// Panics when no guard is active or when the access did not come
    /// through the guarded bus path; both indicate a collaborator bug.
    pub(crate) fn order_pause(&self) {
        assert!(
            self.active.load(Ordering::SeqCst),
            "pause ordered on the cpu thread outside of execute"
        );
        assert!(
            self.token.load(Ordering::SeqCst) != 0,
            "pause ordered from a bus access that bypassed the guard"
        );
    }
}

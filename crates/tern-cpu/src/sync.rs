//! Wakeup plumbing shared between the CPU thread and external controllers.
//!
//! The execution loop needs wait-any semantics over three signal sources
//! (the pause event, the interrupt latches, the halted-cleared pulse), a
//! counting semaphore for step authorization, and a countdown so `step`
//! callers can block until the requested instructions retired. All of that
//! lives behind one state mutex with per-concern condvars; every mutation
//! that could satisfy a wait-any sleeper also notifies the `any` condvar.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct SignalState {
    pause_requested: bool,
    pause_finished: bool,
    halted_cleared: bool,
    irq_latches: Box<[bool]>,
    step_tokens: usize,
    step_done_remaining: usize,
}

#[derive(Debug)]
pub(crate) struct Signals {
    state: Mutex<SignalState>,
    any: Condvar,
    step: Condvar,
    step_done: Condvar,
}

impl Signals {
    /// A CPU is created idle, so the pause event starts set.
    pub(crate) fn new(irq_lines: usize) -> Self {
        Self {
            state: Mutex::new(SignalState {
                pause_requested: true,
                pause_finished: false,
                halted_cleared: false,
                irq_latches: vec![false; irq_lines].into_boxed_slice(),
                step_tokens: 0,
                step_done_remaining: 0,
            }),
            any: Condvar::new(),
            step: Condvar::new(),
            step_done: Condvar::new(),
        }
    }

    pub(crate) fn request_pause(&self) {
        let mut st = self.state.lock().unwrap();
        st.pause_requested = true;
        st.pause_finished = false;
        self.any.notify_all();
    }

    pub(crate) fn clear_pause_request(&self) {
        let mut st = self.state.lock().unwrap();
        st.pause_requested = false;
        st.pause_finished = false;
    }

    pub(crate) fn pause_requested(&self) -> bool {
        self.state.lock().unwrap().pause_requested
    }

    pub(crate) fn signal_pause_finished(&self) {
        let mut st = self.state.lock().unwrap();
        st.pause_finished = true;
        self.any.notify_all();
    }

    /// Block until the execution loop acknowledges the pause request.
    pub(crate) fn wait_pause_finished(&self) {
        let mut st = self.state.lock().unwrap();
        while !st.pause_finished {
            st = self.any.wait(st).unwrap();
        }
    }

    pub(crate) fn set_irq_latch(&self, line: usize, level: bool) {
        let mut st = self.state.lock().unwrap();
        st.irq_latches[line] = level;
        if level {
            self.any.notify_all();
        }
    }

    pub(crate) fn irq_latch(&self, line: usize) -> bool {
        self.state.lock().unwrap().irq_latches[line]
    }

    pub(crate) fn latch_snapshot(&self) -> Vec<bool> {
        self.state.lock().unwrap().irq_latches.to_vec()
    }

    pub(crate) fn restore_latches(&self, latches: &[bool]) {
        let mut st = self.state.lock().unwrap();
        for (slot, &level) in st.irq_latches.iter_mut().zip(latches) {
            *slot = level;
        }
    }

    pub(crate) fn any_latch_set(&self) -> bool {
        self.state.lock().unwrap().irq_latches.iter().any(|&l| l)
    }

    /// Signal that the halted latch transitioned back to false, waking a
    /// sleeping execution loop. Consumed by the next `wait_any`.
    pub(crate) fn pulse_halted_cleared(&self) {
        let mut st = self.state.lock().unwrap();
        st.halted_cleared = true;
        self.any.notify_all();
    }

    pub(crate) fn release_step(&self, count: usize) {
        let mut st = self.state.lock().unwrap();
        st.step_tokens += count;
        self.step.notify_all();
    }

    /// Block until a step token is available, then take it.
    pub(crate) fn acquire_step(&self) {
        let mut st = self.state.lock().unwrap();
        while st.step_tokens == 0 {
            st = self.step.wait(st).unwrap();
        }
        st.step_tokens -= 1;
    }

    /// Take a step token if one is available.
    pub(crate) fn try_drain_step_token(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.step_tokens > 0 {
            st.step_tokens -= 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_step_done(&self, count: usize) {
        self.state.lock().unwrap().step_done_remaining = count;
    }

    pub(crate) fn signal_step_done(&self) {
        let mut st = self.state.lock().unwrap();
        st.step_done_remaining = st.step_done_remaining.saturating_sub(1);
        if st.step_done_remaining == 0 {
            self.step_done.notify_all();
        }
    }

    pub(crate) fn wait_step_done(&self) {
        let mut st = self.state.lock().unwrap();
        while st.step_done_remaining > 0 {
            st = self.step_done.wait(st).unwrap();
        }
    }

    /// Block until any wake source fires: a pause request, a raised IRQ
    /// latch, or a halted-cleared pulse (which is consumed here).
    ///
    /// Returns `true` when woken by a signal, `false` on timeout. With no
    /// timeout the call only returns on a signal.
    pub(crate) fn wait_any(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = self.state.lock().unwrap();
        loop {
            if st.pause_requested || st.irq_latches.iter().any(|&l| l) || st.halted_cleared {
                st.halted_cleared = false;
                return true;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, result) =
                        self.any.wait_timeout(st, deadline - now).unwrap();
                    st = guard;
                    if result.timed_out() {
                        // Re-check the predicate once before reporting the
                        // timeout; a signal may have raced the deadline.
                        if st.pause_requested
                            || st.irq_latches.iter().any(|&l| l)
                            || st.halted_cleared
                        {
                            st.halted_cleared = false;
                            return true;
                        }
                        return false;
                    }
                }
                None => {
                    st = self.any.wait(st).unwrap();
                }
            }
        }
    }
}

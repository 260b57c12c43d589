mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{scripted_factory, test_profile, wait_until, FakeBus, Op};
use pretty_assertions::assert_eq;
use tern_cpu::TranslationCpu;
use tern_time::{ClockEntry, HandlerOutcome};

fn cancel_once_handler(
    fired: &Arc<AtomicUsize>,
) -> Box<dyn FnMut() -> HandlerOutcome + Send> {
    let fired = fired.clone();
    Box::new(move || {
        if fired.fetch_add(1, Ordering::SeqCst) == 0 {
            HandlerOutcome::Cancel
        } else {
            HandlerOutcome::Continue
        }
    })
}

#[test]
fn cancellation_during_halt_unwinds_and_resume_recovers() {
    let bus = FakeBus::new();
    let (factory, _harness) = scripted_factory(vec![Op::Wfi]);
    let cpu = TranslationCpu::new(test_profile(), 0, bus, factory).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    cpu.add_clock_entry(ClockEntry::periodic(50), cancel_once_handler(&fired));
    cpu.set_advance_immediately(true);

    cpu.resume().unwrap();
    // The cancelled advance unwinds the loop; the CPU parks as paused.
    assert!(wait_until(|| cpu.is_paused()));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(cpu.clock_source().current_value(), 50);

    // The next resume replays the advance and normal operation continues.
    cpu.resume().unwrap();
    assert!(wait_until(|| fired.load(Ordering::SeqCst) >= 2));
    cpu.pause();
}

#[test]
fn cancellation_raised_inside_execute_unwinds_after_the_block() {
    let bus = FakeBus::new();
    let (factory, harness) = scripted_factory(vec![Op::Nop; 6]);
    let cpu = TranslationCpu::new(test_profile(), 0, bus, factory).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    // Period 2 with a 6-instruction block: three firings fall due inside
    // the translator's instruction-counter report; the first cancels.
    cpu.add_clock_entry(ClockEntry::periodic(2), cancel_once_handler(&fired));

    cpu.resume().unwrap();
    assert!(wait_until(|| cpu.is_paused()));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(cpu.executed_instructions(), 6);

    // Replaying the advance on resume fires the two periods still due.
    cpu.resume().unwrap();
    assert!(wait_until(|| fired.load(Ordering::SeqCst) >= 3));
    cpu.pause();
    assert!(harness
        .calls()
        .iter()
        .any(|c| matches!(c, common::Call::ExecuteEnd)));
}

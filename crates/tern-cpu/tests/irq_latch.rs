mod common;

use common::{scripted_factory, test_profile, wait_until, Call, FakeBus, Op};
use pretty_assertions::assert_eq;
use tern_cpu::TranslationCpu;

fn execute_starts(calls: &[Call]) -> Vec<bool> {
    calls
        .iter()
        .filter_map(|c| match c {
            Call::ExecuteStart { irq_set } => Some(*irq_set),
            _ => None,
        })
        .collect()
}

#[test]
fn latch_raised_before_first_start_is_pushed_before_execute() {
    let bus = FakeBus::new();
    let (factory, harness) = scripted_factory(vec![Op::Wfi]);
    let cpu = TranslationCpu::new(test_profile(), 0, bus, factory).unwrap();

    // Not yet started: the edge only latches, nothing reaches the engine.
    cpu.on_gpio(0, true).unwrap();
    assert!(cpu.is_set_event(0));
    assert!(!harness.calls().iter().any(|c| matches!(c, Call::SetIrq(..))));

    cpu.resume().unwrap();
    assert!(wait_until(|| !execute_starts(&harness.calls()).is_empty()));
    cpu.pause();

    let calls = harness.calls();
    let set_irq_at = calls
        .iter()
        .position(|c| matches!(c, Call::SetIrq(0, true)))
        .expect("latch was re-pushed");
    let execute_at = calls
        .iter()
        .position(|c| matches!(c, Call::ExecuteStart { .. }))
        .unwrap();
    // The re-push lands before the translator runs its first block, and
    // every execute observes the pending interrupt.
    assert!(set_irq_at < execute_at);
    let starts = execute_starts(&calls);
    assert!(!starts.is_empty());
    assert!(starts.iter().all(|&irq_set| irq_set));
}

#[test]
fn latch_survives_a_pause_and_rearms_on_resume() {
    let bus = FakeBus::new();
    let (factory, harness) = scripted_factory(vec![Op::Wfi]);
    let cpu = TranslationCpu::new(test_profile(), 0, bus, factory).unwrap();

    cpu.resume().unwrap();
    assert!(wait_until(|| cpu.executed_instructions() == 1));
    cpu.pause();

    cpu.on_gpio(0, true).unwrap();
    assert!(cpu.is_set_event(0));

    let starts_before = execute_starts(&harness.calls()).len();
    cpu.resume().unwrap();
    assert!(wait_until(
        || execute_starts(&harness.calls()).len() > starts_before
    ));
    cpu.pause();

    // Every execute after the resume observed the pending interrupt.
    let starts = execute_starts(&harness.calls());
    assert!(starts[starts_before..].iter().all(|&irq_set| irq_set));
}

#[test]
fn lowering_the_line_before_resume_delivers_nothing() {
    let bus = FakeBus::new();
    let (factory, harness) = scripted_factory(vec![Op::Wfi]);
    let cpu = TranslationCpu::new(test_profile(), 0, bus, factory).unwrap();

    cpu.resume().unwrap();
    assert!(wait_until(|| cpu.executed_instructions() == 1));
    cpu.pause();

    cpu.on_gpio(0, true).unwrap();
    cpu.on_gpio(0, false).unwrap();
    assert!(!cpu.is_set_event(0));
    assert!(!harness.engine().irq_pending());

    let starts_before = execute_starts(&harness.calls()).len();
    cpu.resume().unwrap();
    assert!(wait_until(
        || execute_starts(&harness.calls()).len() > starts_before
    ));
    cpu.pause();

    let starts = execute_starts(&harness.calls());
    assert!(starts[starts_before..].iter().all(|&irq_set| !irq_set));
}

#[test]
fn unknown_gpio_line_is_a_recoverable_error() {
    let bus = FakeBus::new();
    let (factory, _harness) = scripted_factory(vec![Op::Wfi]);
    let cpu = TranslationCpu::new(test_profile(), 0, bus, factory).unwrap();
    assert!(matches!(
        cpu.on_gpio(5, true),
        Err(tern_cpu::CpuError::UnknownGpioLine { line: 5, .. })
    ));
}

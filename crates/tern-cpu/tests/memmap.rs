mod common;

use common::{scripted_factory, test_profile, wait_until, Call, FakeBus, Op, PAGE};
use pretty_assertions::assert_eq;
use tern_bus::{HostMemorySegment, MappedRange};
use tern_cpu::{CpuError, TranslationCpu};
use tern_translator::TranslationEngine;

#[test]
fn mapping_registers_ranges_and_sizes_the_cache() {
    let bus = FakeBus::new();
    let (factory, harness) = scripted_factory(vec![Op::Nop]);
    let cpu = TranslationCpu::new(test_profile(), 0, bus, factory).unwrap();

    cpu.map_memory(Box::new(HostMemorySegment::new(0, PAGE))).unwrap();
    cpu.map_memory(Box::new(HostMemorySegment::new(0x4000, 2 * PAGE)))
        .unwrap();

    let engine = harness.engine();
    assert!(engine.is_range_mapped(0, PAGE - 1));
    assert!(engine.is_range_mapped(0x4000, 0x4000 + 2 * PAGE - 1));

    // Cache follows total mapped size / 4.
    let expected = (3 * PAGE as usize) / 4;
    assert_eq!(cpu.translation_cache_size(), expected);
    assert!(harness.calls().contains(&Call::SetCacheSize(expected)));
}

#[test]
fn unaligned_segments_are_recoverable_errors() {
    let bus = FakeBus::new();
    let (factory, _harness) = scripted_factory(vec![Op::Nop]);
    let cpu = TranslationCpu::new(test_profile(), 0, bus, factory).unwrap();

    assert!(matches!(
        cpu.map_memory(Box::new(HostMemorySegment::new(0x10, PAGE))),
        Err(CpuError::Segment(_))
    ));
    assert!(matches!(
        cpu.unmap_memory(MappedRange::new(0, 0x80)),
        Err(CpuError::Segment(_))
    ));
    // The CPU stays usable.
    cpu.map_memory(Box::new(HostMemorySegment::new(0, PAGE))).unwrap();
}

#[test]
fn unmap_prunes_the_registry_to_what_the_translator_reports() {
    let bus = FakeBus::new();
    let (factory, harness) = scripted_factory(vec![Op::Nop]);
    let cpu = TranslationCpu::new(test_profile(), 0, bus, factory).unwrap();

    cpu.map_memory(Box::new(HostMemorySegment::new(0, PAGE))).unwrap();
    cpu.map_memory(Box::new(HostMemorySegment::new(0x4000, PAGE)))
        .unwrap();
    cpu.unmap_memory(MappedRange::new(0x4000, PAGE)).unwrap();

    let engine = harness.engine();
    assert!(engine.is_range_mapped(0, PAGE - 1));
    assert!(!engine.is_range_mapped(0x4000, 0x4000 + PAGE - 1));
    assert!(harness.calls().contains(&Call::UnmapRange(
        0x4000,
        0x4000 + PAGE - 1
    )));
}

#[test]
fn first_page_touch_pushes_the_host_block_table() {
    let bus = FakeBus::new();
    let (factory, harness) = scripted_factory(vec![Op::TouchPage(0), Op::Wfi]);
    let cpu = TranslationCpu::new(test_profile(), 0, bus, factory).unwrap();
    cpu.map_memory(Box::new(HostMemorySegment::new(0, PAGE))).unwrap();

    cpu.resume().unwrap();
    assert!(wait_until(|| harness
        .calls()
        .iter()
        .any(|c| matches!(c, Call::SetHostBlocks(1)))));
    cpu.pause();
}

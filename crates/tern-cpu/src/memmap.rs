//! Guest memory registration and the translator-visible host-blocks table.

use std::collections::HashSet;
use std::sync::Mutex;

use tern_bus::{MappedRange, MappedSegment, SegmentError};
use tern_translator::HostMemoryBlock;
use tracing::warn;

pub(crate) struct SegmentMapping {
    pub segment: Box<dyn MappedSegment>,
    pub touched: bool,
}

/// Tracks every mapped segment and which guest pages must go through I/O
/// instead of fast-path host memory.
#[derive(Default)]
pub(crate) struct MemoryMapRegistry {
    segments: Mutex<Vec<SegmentMapping>>,
    io_pages: Mutex<HashSet<u32>>,
}

fn page_key(address: u32, page_size: u32) -> u32 {
    address & !(page_size - 1)
}

impl MemoryMapRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Validate and record a segment. The segment starts untouched; its
    /// host backing is materialized lazily by [`touch_at`].
    ///
    /// [`touch_at`]: Self::touch_at
    pub(crate) fn insert(
        &self,
        segment: Box<dyn MappedSegment>,
        page_size: u32,
    ) -> Result<MappedRange, SegmentError> {
        let range = segment.range();
        if range.size == 0 {
            return Err(SegmentError::EmptySegment);
        }
        if range.start % page_size != 0 {
            return Err(SegmentError::NotPageAligned {
                what: "segment offset",
                value: range.start,
                page_size,
            });
        }
        if range.size % page_size != 0 {
            return Err(SegmentError::NotPageAligned {
                what: "segment size",
                value: range.size,
                page_size,
            });
        }
        let mut segments = self.segments.lock().unwrap();
        if let Some(existing) = segments.iter().find(|m| m.segment.range().overlaps(&range)) {
            let clash = existing.segment.range();
            return Err(SegmentError::Overlap {
                start: clash.start,
                end: clash.end(),
            });
        }
        segments.push(SegmentMapping {
            segment,
            touched: false,
        });
        Ok(range)
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.segments
            .lock()
            .unwrap()
            .iter()
            .map(|m| u64::from(m.segment.size()))
            .sum()
    }

    pub(crate) fn ranges(&self) -> Vec<MappedRange> {
        self.segments
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.segment.range())
            .collect()
    }

    /// Drop segments the translator no longer reports as mapped (after an
    /// unmap split whole segments away).
    pub(crate) fn retain_mapped(&self, is_mapped: impl Fn(u32, u32) -> bool) {
        self.segments.lock().unwrap().retain(|m| {
            let range = m.segment.range();
            is_mapped(range.start, range.end())
        });
    }

    /// Materialize the segment containing `offset` and, when this is its
    /// first touch, return the rebuilt host-blocks table to push to the
    /// translator. `None` means no rebuild is needed.
    pub(crate) fn touch_at(&self, offset: u32) -> Option<Vec<HostMemoryBlock>> {
        let mut segments = self.segments.lock().unwrap();
        let mapping = segments
            .iter_mut()
            .find(|m| m.segment.range().contains(offset));
        let Some(mapping) = mapping else {
            warn!(offset = format_args!("{offset:#x}"), "touch outside any mapped segment");
            return None;
        };
        if mapping.touched {
            return None;
        }
        mapping.segment.touch();
        mapping.touched = true;
        Some(Self::build_host_blocks(&segments))
    }

    /// The translator-facing table: every touched segment, sorted ascending
    /// by host pointer, with `host_block_start` pointing at the first entry
    /// sharing the same pointer so aliased mappings resolve.
    pub(crate) fn host_blocks(&self) -> Vec<HostMemoryBlock> {
        Self::build_host_blocks(&self.segments.lock().unwrap())
    }

    pub(crate) fn any_touched(&self) -> bool {
        self.segments.lock().unwrap().iter().any(|m| m.touched)
    }

    fn build_host_blocks(segments: &[SegmentMapping]) -> Vec<HostMemoryBlock> {
        let mut blocks: Vec<HostMemoryBlock> = segments
            .iter()
            .filter(|m| m.touched)
            .map(|m| HostMemoryBlock {
                start: m.segment.starting_offset(),
                size: m.segment.size(),
                host_pointer: m.segment.host_pointer(),
                host_block_start: 0,
            })
            .collect();
        blocks.sort_by_key(|b| b.host_pointer as usize);
        for i in 0..blocks.len() {
            let first = blocks[..i]
                .iter()
                .position(|b| b.host_pointer == blocks[i].host_pointer)
                .unwrap_or(i);
            blocks[i].host_block_start = first as i32;
        }
        blocks
    }

    pub(crate) fn set_io_page(&self, address: u32, page_size: u32) {
        self.io_pages
            .lock()
            .unwrap()
            .insert(page_key(address, page_size));
    }

    pub(crate) fn clear_io_page(&self, address: u32, page_size: u32) {
        self.io_pages
            .lock()
            .unwrap()
            .remove(&page_key(address, page_size));
    }

    pub(crate) fn is_io_page(&self, address: u32, page_size: u32) -> bool {
        self.io_pages
            .lock()
            .unwrap()
            .contains(&page_key(address, page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tern_bus::HostMemorySegment;

    const PAGE: u32 = 0x1000;

    #[test]
    fn rejects_unaligned_and_overlapping_segments() {
        let registry = MemoryMapRegistry::new();
        assert!(matches!(
            registry.insert(Box::new(HostMemorySegment::new(0x10, PAGE)), PAGE),
            Err(SegmentError::NotPageAligned { .. })
        ));
        assert!(matches!(
            registry.insert(Box::new(HostMemorySegment::new(0, 0x800)), PAGE),
            Err(SegmentError::NotPageAligned { .. })
        ));
        registry
            .insert(Box::new(HostMemorySegment::new(0, 2 * PAGE)), PAGE)
            .unwrap();
        assert!(matches!(
            registry.insert(Box::new(HostMemorySegment::new(PAGE, PAGE)), PAGE),
            Err(SegmentError::Overlap { .. })
        ));
        assert_eq!(registry.total_size(), u64::from(2 * PAGE));
    }

    #[test]
    fn first_touch_rebuilds_host_blocks() {
        let registry = MemoryMapRegistry::new();
        registry
            .insert(Box::new(HostMemorySegment::new(0, PAGE)), PAGE)
            .unwrap();
        registry
            .insert(Box::new(HostMemorySegment::new(0x4000, PAGE)), PAGE)
            .unwrap();

        let blocks = registry.touch_at(0x4000).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 0x4000);
        assert!(!blocks[0].host_pointer.is_null());

        // Second touch of the same segment: nothing to rebuild.
        assert!(registry.touch_at(0x4800).is_none());

        let blocks = registry.touch_at(0x0).unwrap();
        assert_eq!(blocks.len(), 2);
        // Sorted by host pointer, each block starts its own pointer group.
        assert!(blocks[0].host_pointer <= blocks[1].host_pointer);
        assert_eq!(blocks[0].host_block_start, 0);
        assert_eq!(blocks[1].host_block_start, 1);
    }

    #[test]
    fn io_pages_are_keyed_by_page() {
        let registry = MemoryMapRegistry::new();
        registry.set_io_page(0x2345, PAGE);
        assert!(registry.is_io_page(0x2000, PAGE));
        assert!(registry.is_io_page(0x2FFF, PAGE));
        assert!(!registry.is_io_page(0x3000, PAGE));
        registry.clear_io_page(0x2000, PAGE);
        assert!(!registry.is_io_page(0x2345, PAGE));
    }

    #[test]
    fn retain_mapped_drops_unmapped_segments() {
        let registry = MemoryMapRegistry::new();
        registry
            .insert(Box::new(HostMemorySegment::new(0, PAGE)), PAGE)
            .unwrap();
        registry
            .insert(Box::new(HostMemorySegment::new(0x4000, PAGE)), PAGE)
            .unwrap();
        registry.retain_mapped(|start, _| start != 0);
        let ranges = registry.ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 0x4000);
    }
}

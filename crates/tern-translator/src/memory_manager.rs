use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Ledger for every host allocation served to the translator.
///
/// The translator allocates all of its working memory (translation cache,
/// block descriptors, scratch buffers) through the client's allocate/
/// reallocate/free callbacks; this type backs those callbacks with the host
/// allocator and tracks each outstanding block so leaks are caught at
/// teardown. Registration inconsistencies (double insert, unknown free) are
/// translator bugs and fail fast.
#[derive(Debug, Default)]
pub struct MemoryManager {
    allocations: Mutex<HashMap<usize, usize>>,
    total_bytes: AtomicUsize,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, size: usize) -> *mut c_void {
        let pointer = unsafe { libc::malloc(size) };
        if pointer.is_null() {
            return pointer;
        }
        self.register(pointer as usize, size);
        pointer
    }

    pub fn reallocate(&self, pointer: *mut c_void, size: usize) -> *mut c_void {
        if pointer.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            self.free(pointer);
            return std::ptr::null_mut();
        }
        let old_size = self.unregister(pointer as usize);
        let new_pointer = unsafe { libc::realloc(pointer, size) };
        if new_pointer.is_null() {
            // The original block is untouched on realloc failure; keep
            // tracking it so the teardown ledger stays accurate.
            self.register(pointer as usize, old_size);
            return new_pointer;
        }
        self.register(new_pointer as usize, size);
        new_pointer
    }

    pub fn free(&self, pointer: *mut c_void) {
        self.unregister(pointer as usize);
        unsafe { libc::free(pointer) };
    }

    /// Number of blocks currently allocated.
    pub fn outstanding(&self) -> usize {
        self.allocations.lock().unwrap().len()
    }

    /// Total bytes currently allocated.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Assert that the translator returned everything it borrowed.
    ///
    /// # Panics
    ///
    /// Panics when any allocation is still outstanding.
    pub fn assert_no_leaks(&self) {
        let allocations = self.allocations.lock().unwrap();
        assert!(
            allocations.is_empty(),
            "translator leaked {} allocation(s) totalling {} byte(s)",
            allocations.len(),
            self.total_bytes.load(Ordering::Relaxed),
        );
    }

    fn register(&self, pointer: usize, size: usize) {
        let previous = self.allocations.lock().unwrap().insert(pointer, size);
        assert!(
            previous.is_none(),
            "translator double-registered allocation {pointer:#x}"
        );
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn unregister(&self, pointer: usize) -> usize {
        let size = self
            .allocations
            .lock()
            .unwrap()
            .remove(&pointer)
            .unwrap_or_else(|| panic!("translator freed unknown allocation {pointer:#x}"));
        self.total_bytes.fetch_sub(size, Ordering::Relaxed);
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn allocate_free_balances_ledger() {
        let mm = MemoryManager::new();
        let a = mm.allocate(64);
        let b = mm.allocate(128);
        assert_eq!(mm.outstanding(), 2);
        assert_eq!(mm.total_bytes(), 192);
        mm.free(a);
        mm.free(b);
        assert_eq!(mm.outstanding(), 0);
        assert_eq!(mm.total_bytes(), 0);
        mm.assert_no_leaks();
    }

    #[test]
    fn reallocate_adjusts_total_by_difference() {
        let mm = MemoryManager::new();
        let p = mm.allocate(100);
        let p = mm.reallocate(p, 250);
        assert_eq!(mm.outstanding(), 1);
        assert_eq!(mm.total_bytes(), 250);
        mm.free(p);
        mm.assert_no_leaks();
    }

    #[test]
    fn reallocate_null_allocates_and_zero_frees() {
        let mm = MemoryManager::new();
        let p = mm.reallocate(std::ptr::null_mut(), 32);
        assert!(!p.is_null());
        assert_eq!(mm.outstanding(), 1);
        let q = mm.reallocate(p, 0);
        assert!(q.is_null());
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "freed unknown allocation")]
    fn unknown_free_is_fatal() {
        let mm = MemoryManager::new();
        mm.free(0x1000 as *mut std::ffi::c_void);
    }

    #[test]
    #[should_panic(expected = "leaked 1 allocation")]
    fn leak_is_caught_at_teardown() {
        let mm = MemoryManager::new();
        let p = mm.allocate(16);
        let _ = p;
        mm.assert_no_leaks();
    }
}

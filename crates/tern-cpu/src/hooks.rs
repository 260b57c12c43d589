use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A breakpoint callback, invoked with the address it was registered at.
pub type HookCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Address-keyed sets of breakpoint callbacks.
///
/// The table itself is just bookkeeping; callers keep the translator in
/// sync by adding a breakpoint when an address gains its first callback and
/// removing it when the last one goes. Callback identity is `Arc` pointer
/// identity.
#[derive(Default)]
pub(crate) struct HookTable {
    entries: Mutex<HashMap<u32, Vec<HookCallback>>>,
}

impl HookTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a callback; returns true when `address` had no callbacks
    /// before (the translator needs a breakpoint added).
    pub(crate) fn add(&self, address: u32, callback: HookCallback) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let set = entries.entry(address).or_default();
        let was_empty = set.is_empty();
        set.push(callback);
        was_empty
    }

    /// Remove a callback by identity; returns true when the set at
    /// `address` became empty (the translator breakpoint must go).
    pub(crate) fn remove(&self, address: u32, callback: &HookCallback) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let Some(set) = entries.get_mut(&address) else {
            return false;
        };
        set.retain(|cb| !Arc::ptr_eq(cb, callback));
        if set.is_empty() {
            entries.remove(&address);
            true
        } else {
            false
        }
    }

    /// Drop every callback at `address`; returns true when any existed.
    pub(crate) fn remove_all_at(&self, address: u32) -> bool {
        self.entries.lock().unwrap().remove(&address).is_some()
    }

    /// Drop everything, returning the addresses that held callbacks.
    pub(crate) fn clear(&self) -> Vec<u32> {
        self.entries.lock().unwrap().drain().map(|(a, _)| a).collect()
    }

    pub(crate) fn addresses(&self) -> Vec<u32> {
        let mut addresses: Vec<u32> = self.entries.lock().unwrap().keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    pub(crate) fn has_any_at(&self, address: u32) -> bool {
        self.entries.lock().unwrap().contains_key(&address)
    }

    /// Invoke every callback registered at `address`.
    ///
    /// Callbacks run outside the table lock, so they may add or remove
    /// hooks; mutations only take translator-visible effect after the
    /// current block completes.
    pub(crate) fn run_at(&self, address: u32) {
        let callbacks: Vec<HookCallback> = {
            let entries = self.entries.lock().unwrap();
            match entries.get(&address) {
                Some(set) => set.clone(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(address);
        }
    }
}

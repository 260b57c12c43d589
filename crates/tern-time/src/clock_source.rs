use std::fmt;
use std::sync::Mutex;

/// A stable identifier for a clock entry registered with a [`ClockSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockEntryId(u64);

impl ClockEntryId {
    fn next(next_id: &mut u64) -> Self {
        let id = *next_id;
        *next_id = next_id.wrapping_add(1);
        ClockEntryId(id)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A periodic timer driven by virtual ticks.
///
/// `value` accumulates ticks while the entry is enabled; once it reaches
/// `period` the entry is *due* and its handler fires during
/// [`ClockSource::advance`], after which the overshoot is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockEntry {
    pub period: u64,
    pub value: u64,
    pub enabled: bool,
}

impl ClockEntry {
    pub fn periodic(period: u64) -> Self {
        Self {
            period,
            value: 0,
            enabled: true,
        }
    }

    /// Ticks until this entry next becomes due, 0 if already due.
    fn limit_in(&self) -> u64 {
        self.period.saturating_sub(self.value)
    }
}

/// What a clock handler asks the advancing thread to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Continue,
    /// Unwind out of the advance (and, transitively, the execution loop).
    /// This is control flow, not an error; see [`AdvanceCancelled`].
    Cancel,
}

pub type ClockHandler = Box<dyn FnMut() -> HandlerOutcome + Send>;

/// Raised out of [`ClockSource::advance`] when a handler cancels.
///
/// Cancellation is the designated mechanism for unwinding the CPU execution
/// loop so it can be re-entered later; callers record that the advance must
/// be restarted and replay it with `advance(0, true)` on the next resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceCancelled;

impl fmt::Display for AdvanceCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clock advance cancelled by a handler")
    }
}

impl std::error::Error for AdvanceCancelled {}

struct Slot {
    id: ClockEntryId,
    entry: ClockEntry,
    handler: ClockHandler,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    slots: Vec<Slot>,
    elapsed: u64,
}

/// Ordered collection of [`ClockEntry`]s sharing one virtual time base.
///
/// All operations take the internal lock; handlers fire with the lock
/// released so they may call back into the clock source.
#[derive(Default)]
pub struct ClockSource {
    inner: Mutex<Inner>,
}

impl ClockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, entry: ClockEntry, handler: ClockHandler) -> ClockEntryId {
        let mut inner = self.inner.lock().unwrap();
        let id = ClockEntryId::next(&mut inner.next_id);
        inner.slots.push(Slot { id, entry, handler });
        id
    }

    pub fn remove(&self, id: ClockEntryId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.slots.len();
        inner.slots.retain(|s| s.id != id);
        inner.slots.len() != before
    }

    /// Read a copy of the entry, if it is still registered.
    pub fn get(&self, id: ClockEntryId) -> Option<ClockEntry> {
        let inner = self.inner.lock().unwrap();
        inner.slots.iter().find(|s| s.id == id).map(|s| s.entry)
    }

    /// Mutate the entry in place under the internal lock.
    pub fn visit(&self, id: ClockEntryId, f: impl FnOnce(&mut ClockEntry)) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.slots.iter_mut().find(|s| s.id == id) {
            Some(slot) => {
                f(&mut slot.entry);
                true
            }
            None => false,
        }
    }

    /// Visit the entry if present, otherwise create it from `factory`.
    ///
    /// Returns the id of the visited or newly created entry.
    pub fn exchange(
        &self,
        id: Option<ClockEntryId>,
        visitor: impl FnOnce(&mut ClockEntry),
        factory: impl FnOnce() -> (ClockEntry, ClockHandler),
    ) -> ClockEntryId {
        let mut inner = self.inner.lock().unwrap();
        if let Some(id) = id {
            if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == id) {
                visitor(&mut slot.entry);
                return id;
            }
        }
        let (entry, handler) = factory();
        let id = ClockEntryId::next(&mut inner.next_id);
        inner.slots.push(Slot { id, entry, handler });
        id
    }

    /// Remove and return every entry, e.g. when handing them to another
    /// clock source.
    pub fn eject_all(&self) -> Vec<(ClockEntryId, ClockEntry, ClockHandler)> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .slots
            .drain(..)
            .map(|s| (s.id, s.entry, s.handler))
            .collect()
    }

    /// Adopt entries previously ejected from another clock source. Ids are
    /// reassigned; the new ids are returned in order.
    pub fn adopt_all(
        &self,
        entries: Vec<(ClockEntry, ClockHandler)>,
    ) -> Vec<ClockEntryId> {
        let mut inner = self.inner.lock().unwrap();
        entries
            .into_iter()
            .map(|(entry, handler)| {
                let id = ClockEntryId::next(&mut inner.next_id);
                inner.slots.push(Slot { id, entry, handler });
                id
            })
            .collect()
    }

    pub fn has_entries(&self) -> bool {
        !self.inner.lock().unwrap().slots.is_empty()
    }

    /// Total virtual ticks accumulated by this source.
    pub fn current_value(&self) -> u64 {
        self.inner.lock().unwrap().elapsed
    }

    /// Ticks until the nearest enabled entry becomes due, or `None` when no
    /// enabled entry exists. Returns 0 when an entry is already due.
    pub fn nearest_limit_in(&self) -> Option<u64> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .filter(|s| s.entry.enabled)
            .map(|s| s.entry.limit_in())
            .min()
    }

    /// Advance the time base by `ticks` and fire every entry that becomes
    /// due, in registration order.
    ///
    /// With `restart = true` no new ticks are accumulated; only entries left
    /// due by a previously cancelled advance are (re)fired. A handler
    /// returning [`HandlerOutcome::Cancel`] stops the advance immediately:
    /// remaining due entries stay due and the call returns
    /// `Err(AdvanceCancelled)` so the caller can unwind and replay later.
    pub fn advance(&self, ticks: u64, restart: bool) -> Result<(), AdvanceCancelled> {
        if !restart {
            let mut inner = self.inner.lock().unwrap();
            inner.elapsed = inner.elapsed.wrapping_add(ticks);
            for slot in inner.slots.iter_mut().filter(|s| s.entry.enabled) {
                slot.entry.value = slot.entry.value.saturating_add(ticks);
            }
        }

        // Fire due handlers one at a time with the lock released, so a
        // handler may inspect or reconfigure the clock source.
        loop {
            let (due, mut handler) = {
                let mut inner = self.inner.lock().unwrap();
                let Some(slot) = inner.slots.iter_mut().find(|s| {
                    s.entry.enabled && s.entry.period > 0 && s.entry.value >= s.entry.period
                }) else {
                    return Ok(());
                };
                slot.entry.value -= slot.entry.period;
                let handler = std::mem::replace(
                    &mut slot.handler,
                    Box::new(|| HandlerOutcome::Continue),
                );
                (slot.id, handler)
            };
            let outcome = handler();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(slot) = inner.slots.iter_mut().find(|s| s.id == due) {
                    slot.handler = handler;
                }
            }
            if outcome == HandlerOutcome::Cancel {
                return Err(AdvanceCancelled);
            }
        }
    }
}

impl fmt::Debug for ClockSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("ClockSource")
            .field("entries", &inner.slots.len())
            .field("elapsed", &inner.elapsed)
            .finish()
    }
}

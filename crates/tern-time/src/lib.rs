//! Virtual time for translation CPUs.
//!
//! The emulator measures guest time in **ticks**, where one tick corresponds
//! to one retired guest instruction. [`ClockSource`] holds the timer entries
//! driven by that time base and fires their handlers as entries reach their
//! periods; [`TickConverter`] turns host wall-clock durations into ticks
//! (used while the CPU sleeps in a halted or wait-for-interrupt state) using
//! the configured instructions-per-microsecond rate.

mod clock_source;
mod convert;

pub use clock_source::{
    AdvanceCancelled, ClockEntry, ClockEntryId, ClockHandler, ClockSource, HandlerOutcome,
};
pub use convert::TickConverter;

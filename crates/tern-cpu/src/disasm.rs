use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A pluggable disassembler for translated-block logging.
pub trait Disassembler: Send + Sync {
    fn name(&self) -> &str;

    /// Render the instructions in `code` (guest bytes starting at
    /// `address`), or `None` when the bytes cannot be decoded.
    fn disassemble(&self, address: u32, code: &[u8]) -> Option<String>;
}

/// Named disassemblers available to one CPU.
#[derive(Default)]
pub(crate) struct DisassemblerRegistry {
    available: Mutex<HashMap<String, Arc<dyn Disassembler>>>,
    active: Mutex<Option<Arc<dyn Disassembler>>>,
}

impl DisassemblerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, disassembler: Arc<dyn Disassembler>) {
        self.available
            .lock()
            .unwrap()
            .insert(disassembler.name().to_owned(), disassembler);
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.available.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn activate(&self, name: &str) -> Option<Arc<dyn Disassembler>> {
        let found = self.available.lock().unwrap().get(name).cloned()?;
        *self.active.lock().unwrap() = Some(found.clone());
        Some(found)
    }

    pub(crate) fn active(&self) -> Option<Arc<dyn Disassembler>> {
        self.active.lock().unwrap().clone()
    }

    pub(crate) fn active_name(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.name().to_owned())
    }
}

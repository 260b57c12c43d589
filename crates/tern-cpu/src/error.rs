use thiserror::Error;

pub type Result<T> = std::result::Result<T, CpuError>;

/// Recoverable configuration and control errors.
///
/// Everything here leaves the CPU usable; invariant violations (memory
/// ledger corruption, pause ordered outside a guarded bus access) panic
/// instead, since they indicate a bug in a collaborator.
#[derive(Debug, Error)]
pub enum CpuError {
    #[error("translator rejected cpu type {0:?}")]
    InvalidCpuType(String),

    #[error(transparent)]
    Segment(#[from] tern_bus::SegmentError),

    #[error("step requires single-step execution mode")]
    NotInSingleStepMode,

    #[error("gpio line {line} is not connected (cpu declares {line_count} lines)")]
    UnknownGpioLine { line: usize, line_count: usize },

    #[error("no disassembler named {0:?} is registered")]
    UnknownDisassembler(String),

    #[error("cpu aborted; reset it before resuming")]
    Aborted,

    #[error("failed to parse image: {0}")]
    Image(String),

    #[error(transparent)]
    Translator(#[from] tern_translator::TranslatorError),
}

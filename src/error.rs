//! Error types for the tracer

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, TraceError>;

/// Everything that can go wrong while classifying trace notifications
///
/// Variants for which [`TraceError::is_fatal`] returns true mean the tracer's
/// picture of the interpreter no longer matches reality. Hosts should stop
/// tracing when they see one.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TraceError {
    /// The pending-call stack was popped or inspected while empty.
    /// This happens when a frame-entry notification was missed.
    #[error("pending-call stack underflow during {during}")]
    PendingStackUnderflow { during: &'static str },

    /// The operand stack is shorter than the decoded call layout requires
    #[error("operand stack has {len} slots but slot {index} is required")]
    StackUnderflow { index: usize, len: usize },

    /// Neither of the first two stack slots holds a callable at a call site
    #[error("cannot locate the callee on an operand stack of {len} slots")]
    UnclassifiableStack { len: usize },

    /// An argument slot holds a value of the wrong shape
    #[error("malformed call arguments: {0}")]
    MalformedArguments(String),

    /// An instruction pointer outside the code block, or a truncated operand
    #[error("invalid instruction pointer {offset} for code of {len} bytes")]
    InvalidInstructionPointer { offset: usize, len: usize },

    /// Opcode byte outside the decoded instruction subset
    #[error("unknown opcode: 0x{0:02x}")]
    UnknownOpcode(u8),

    /// Wire-format decoding failure
    #[error("failed to decode program: {0}")]
    Decode(String),
}

impl TraceError {
    /// Whether the tracer's state can no longer be trusted after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TraceError::PendingStackUnderflow { .. }
                | TraceError::StackUnderflow { .. }
                | TraceError::UnclassifiableStack { .. }
        )
    }
}

use std::sync::Arc;

use crate::code::CodeBlock;
use crate::error::Result;
use crate::opcodes::Opcode;
use crate::value::Value;

/// Read-only view of an interpreter activation record
///
/// Implemented by the host runtime. The tracer calls these methods only
/// while a single notification is being classified and keeps nothing it
/// reads past that call.
pub trait Frame {
    /// Code block the frame is executing
    fn code(&self) -> Arc<CodeBlock>;

    /// Offset of the instruction about to execute
    fn last_instruction(&self) -> usize;

    /// The declared operand stack, bottom to top
    ///
    /// Hosts cannot tell where the live part of the stack ends, so the
    /// sequence may extend past the last value actually pushed.
    fn operand_stack(&self) -> Vec<Value>;

    /// Decode the instruction at the current offset
    fn current_opcode(&self) -> Result<Opcode> {
        self.code().opcode_at(self.last_instruction())
    }
}

/// A frame captured by value
///
/// Used by hosts that copy frame state out of the interpreter before handing
/// it to the tracer, and by the Python bindings.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub code: Arc<CodeBlock>,
    pub last_instruction: usize,
    pub stack: Vec<Value>,
}

impl FrameSnapshot {
    pub fn new(code: Arc<CodeBlock>, last_instruction: usize, stack: Vec<Value>) -> Self {
        FrameSnapshot {
            code,
            last_instruction,
            stack,
        }
    }

    /// Same frame, later in execution
    pub fn at(&self, last_instruction: usize, stack: Vec<Value>) -> Self {
        FrameSnapshot {
            code: self.code.clone(),
            last_instruction,
            stack,
        }
    }
}

impl Frame for FrameSnapshot {
    fn code(&self) -> Arc<CodeBlock> {
        self.code.clone()
    }

    fn last_instruction(&self) -> usize {
        self.last_instruction
    }

    fn operand_stack(&self) -> Vec<Value> {
        self.stack.clone()
    }
}

//! Decoding a frame's operand stack at a call instruction
//!
//! Right before a call the operand stack looks like this, bottom first:
//!
//! ```text
//! +----------------------------
//! | context value (optional)    loop iterator, `finally` sentinel
//! +----------------------------
//! | callee
//! +----------------------------
//! | positional arguments        one slot each
//! +----------------------------
//! | keyword arguments           two slots each: name, value
//! +----------------------------
//! | *args sequence              only for the VAR call opcodes
//! +----------------------------
//! | **kwargs mapping            only for the KW call opcodes
//! +----------------------------
//! | (stale slots)               the host exposes no top pointer
//! ```
//!
//! Since the top of the stack is unknown the layout is read from the
//! bottom. After a native call returns, its result replaces the callee and
//! everything above it, so it sits at the same offset the callee had.

use crate::error::{Result, TraceError};
use crate::frame::Frame;
use crate::opcodes::{self, Opcode};
use crate::value::{KeywordArgs, Value};

/// Argument layout of a call instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallDescriptor {
    pub opcode: Opcode,
    /// Positional arguments placed individually on the stack
    pub positional: usize,
    /// Keyword arguments placed on the stack as name/value pairs
    pub keyword: usize,
    /// A `*args` sequence follows the explicit arguments
    pub varargs: bool,
    /// A `**kwargs` mapping follows the explicit arguments
    pub varkwargs: bool,
}

impl CallDescriptor {
    /// Decode the call instruction at `offset`
    ///
    /// Returns `Ok(None)` when the instruction there is not a call, including
    /// opcodes outside the decoded subset.
    pub fn decode(code: &[u8], offset: usize) -> Result<Option<Self>> {
        let opcode = match opcodes::opcode_at(code, offset) {
            Ok(opcode) => opcode,
            Err(TraceError::UnknownOpcode(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some((varargs, varkwargs)) = opcode.variadic_flags() else {
            return Ok(None);
        };

        Ok(Some(CallDescriptor {
            opcode,
            positional: opcodes::read_u8(code, offset + 1)? as usize,
            keyword: opcodes::read_u8(code, offset + 2)? as usize,
            varargs,
            varkwargs,
        }))
    }

    /// Stack slots taken by the arguments, not counting the callee
    pub fn argument_slots(&self) -> usize {
        self.positional + 2 * self.keyword + usize::from(self.varargs) + usize::from(self.varkwargs)
    }
}

/// Locate the callee (or return value) at the bottom of an operand stack
///
/// Entering a `finally` block or a loop body leaves one context value under
/// everything the block stages, and the host gives no signal of whether one
/// is present. The callable test on slot 0 is the only evidence: a callable
/// there is the callee, anything else is context.
///
/// At a call site (`at_call`) the callee must be callable, so a layout with
/// no callable in slot 0 or slot 1 is rejected rather than guessed at.
pub fn resolve_skip_offset(stack: &[Value], at_call: bool) -> Result<usize> {
    match stack.first() {
        Some(bottom) if bottom.is_callable() => Ok(0),
        _ if !at_call => Ok(1),
        _ => match stack.get(1) {
            Some(callee) if callee.is_callable() => Ok(1),
            _ => Err(TraceError::UnclassifiableStack { len: stack.len() }),
        },
    }
}

/// A frame's operand stack, decoded against the instruction about to run
#[derive(Debug, Clone)]
pub struct OperandStackView {
    stack: Vec<Value>,
    descriptor: Option<CallDescriptor>,
    offset: usize,
}

impl OperandStackView {
    /// Read the operand stack of `frame` once and decode its layout
    ///
    /// Fails when the stack cannot hold what the call instruction says was
    /// pushed, or when argument slots hold values of the wrong shape.
    pub fn new<F: Frame + ?Sized>(frame: &F) -> Result<Self> {
        let code = frame.code();
        let descriptor = CallDescriptor::decode(&code.code, frame.last_instruction())?;
        Self::from_parts(frame.operand_stack(), descriptor)
    }

    /// Decode an already captured stack
    pub fn from_parts(stack: Vec<Value>, descriptor: Option<CallDescriptor>) -> Result<Self> {
        let offset = resolve_skip_offset(&stack, descriptor.is_some())?;
        let view = OperandStackView {
            stack,
            descriptor,
            offset,
        };
        view.validate()?;
        Ok(view)
    }

    fn validate(&self) -> Result<()> {
        let required = match &self.descriptor {
            Some(descriptor) => self.args_start() + descriptor.argument_slots(),
            None => self.offset + 1,
        };
        if self.stack.len() < required {
            return Err(TraceError::StackUnderflow {
                index: required - 1,
                len: self.stack.len(),
            });
        }

        let Some(descriptor) = self.descriptor else {
            return Ok(());
        };
        for pair in self.keyword_slots().chunks_exact(2) {
            if pair[0].as_str().is_none() {
                return Err(TraceError::MalformedArguments(format!(
                    "keyword name must be a string, found {}",
                    pair[0].type_name()
                )));
            }
        }
        if descriptor.varargs
            && !matches!(self.stack_above_args(0), Value::Tuple(_) | Value::List(_))
        {
            return Err(TraceError::MalformedArguments(format!(
                "*args must be a sequence, found {}",
                self.stack_above_args(0).type_name()
            )));
        }
        if descriptor.varkwargs {
            let slot = self.stack_above_args(usize::from(descriptor.varargs));
            if !matches!(slot, Value::Dict(_)) {
                return Err(TraceError::MalformedArguments(format!(
                    "**kwargs must be a mapping, found {}",
                    slot.type_name()
                )));
            }
        }
        Ok(())
    }

    /// The decoded call instruction, absent when the frame is not at a call
    pub fn descriptor(&self) -> Option<&CallDescriptor> {
        self.descriptor.as_ref()
    }

    /// Number of context values skipped at the bottom of the stack
    pub fn skip_offset(&self) -> usize {
        self.offset
    }

    /// The first object of interest on the stack
    ///
    /// The callee before a call instruction, the return value right after a
    /// call returns.
    pub fn bottom(&self) -> &Value {
        debug_assert!(self.offset < self.stack.len());
        &self.stack[self.offset]
    }

    fn args_start(&self) -> usize {
        self.offset + 1
    }

    fn counts(&self) -> (usize, usize) {
        debug_assert!(
            self.descriptor.is_some(),
            "argument access on a frame that is not at a call instruction"
        );
        self.descriptor
            .map(|d| (d.positional, d.keyword))
            .unwrap_or((0, 0))
    }

    fn keyword_slots(&self) -> &[Value] {
        let (positional, keyword) = self.counts();
        let start = self.args_start() + positional;
        debug_assert!(start + 2 * keyword <= self.stack.len());
        &self.stack[start..start + 2 * keyword]
    }

    /// Slot `extra` places above the explicit arguments
    fn stack_above_args(&self, extra: usize) -> &Value {
        let (positional, keyword) = self.counts();
        let index = self.args_start() + positional + 2 * keyword + extra;
        debug_assert!(index < self.stack.len());
        &self.stack[index]
    }

    /// Objects explicitly placed on the stack as positional arguments
    pub fn positional_args_from_stack(&self) -> &[Value] {
        let (positional, _) = self.counts();
        let start = self.args_start();
        debug_assert!(start + positional <= self.stack.len());
        &self.stack[start..start + positional]
    }

    /// Elements of the `*args` sequence, if one was passed
    pub fn varargs(&self) -> Option<&[Value]> {
        if !self.descriptor?.varargs {
            return None;
        }
        match self.stack_above_args(0) {
            Value::Tuple(items) | Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// The `**kwargs` mapping, if one was passed
    pub fn varkwargs(&self) -> Option<&KeywordArgs> {
        let descriptor = self.descriptor?;
        if !descriptor.varkwargs {
            return None;
        }
        match self.stack_above_args(usize::from(descriptor.varargs)) {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// All positional arguments passed to the callee
    pub fn positional_args(&self) -> Vec<Value> {
        let mut args = self.positional_args_from_stack().to_vec();
        if let Some(extra) = self.varargs() {
            args.extend_from_slice(extra);
        }
        args
    }

    /// Name/value pairs placed explicitly on the stack
    pub fn keyword_args_from_stack(&self) -> KeywordArgs {
        self.keyword_slots()
            .chunks_exact(2)
            .filter_map(|pair| Some((pair[0].as_str()?.to_string(), pair[1].clone())))
            .collect()
    }

    /// All keyword arguments passed to the callee
    ///
    /// Entries of a `**kwargs` mapping replace explicit ones of the same name.
    pub fn keyword_args(&self) -> KeywordArgs {
        let mut kwargs = self.keyword_args_from_stack();
        if let Some(extra) = self.varkwargs() {
            kwargs.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        kwargs
    }
}

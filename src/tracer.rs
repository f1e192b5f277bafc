//! Classifying raw trace notifications into native call events
//!
//! The host reports four kinds of notification: an instruction is about to
//! run, a frame was entered, a frame was left, an exception was raised.
//! Calls into native code produce none of these on their own. They become
//! visible as a call instruction whose callee decodes to a native function,
//! and their return as the first instruction that runs after it.
//!
//! | Notification | Condition | Event | Pending stack |
//! |--------------|-----------|-------|---------------|
//! | instruction | call, native callee | `NativeCall` | push `Native` |
//! | instruction | call, interpreted callee | none | callee instrumented |
//! | instruction | top is `Native` | `NativeReturn` | pop |
//! | instruction | output statement | `OutputStatement` | |
//! | frame entry | | none | push `Interpreted` |
//! | frame exit | | none | pop |
//! | exception | top is `Native` | none | pop |
//!
//! A native function that raises never reaches a return notification, so
//! its pending entry is retired at the exception instead. Interpreted frames
//! always report a frame exit, even while unwinding.

use log::{debug, trace};

use crate::error::{Result, TraceError};
use crate::frame::Frame;
use crate::instrument::{instrument_all, instrument_function};
use crate::opcodes::{Opcode, OutputKind};
use crate::stack_view::OperandStackView;
use crate::value::{KeywordArgs, Value};

/// Kind of notification delivered by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceKind {
    /// An instruction is about to execute
    Instruction,
    /// A new interpreted frame started executing
    FrameEntry,
    /// An interpreted frame finished, normally or by unwinding
    FrameExit,
    /// An exception was raised in the frame
    Exception,
}

impl TraceKind {
    /// Parse the event names used by line-oriented trace hooks
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "line" | "instruction" => Some(TraceKind::Instruction),
            "call" => Some(TraceKind::FrameEntry),
            "return" => Some(TraceKind::FrameExit),
            "exception" => Some(TraceKind::Exception),
            _ => None,
        }
    }
}

/// Event recovered from the notification stream
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// A native function is about to be called
    NativeCall {
        callee: Value,
        positional: Vec<Value>,
        keyword: KeywordArgs,
    },

    /// The most recent native call returned `value`
    NativeReturn { value: Value },

    /// An output statement is about to execute
    OutputStatement { kind: OutputKind },
}

/// Entry of the pending-call stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCall {
    /// An interpreted frame; its end is reported by a frame exit
    Interpreted,
    /// A native call in progress whose result will land in `return_slot`
    Native { return_slot: usize },
}

/// Tracer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracerOptions {
    /// Instrument interpreted functions passed as arguments to native calls
    pub instrument_arguments: bool,
    /// Instrument interpreted functions at their call site
    pub instrument_callees: bool,
}

impl Default for TracerOptions {
    fn default() -> Self {
        TracerOptions {
            instrument_arguments: true,
            instrument_callees: true,
        }
    }
}

impl TracerOptions {
    pub fn instrument_arguments(mut self, enabled: bool) -> Self {
        self.instrument_arguments = enabled;
        self
    }

    pub fn instrument_callees(mut self, enabled: bool) -> Self {
        self.instrument_callees = enabled;
        self
    }
}

/// State machine turning notifications into [`TraceEvent`]s
///
/// One tracer per interpreter thread. The pending-call stack has one entry
/// per interpreted frame and per native call in progress.
#[derive(Debug, Default)]
pub struct CallTracer {
    pending: Vec<PendingCall>,
    options: TracerOptions,
}

impl CallTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: TracerOptions) -> Self {
        CallTracer {
            pending: Vec::new(),
            options,
        }
    }

    pub fn options(&self) -> &TracerOptions {
        &self.options
    }

    /// Current nesting depth of interpreted frames and native calls
    pub fn depth(&self) -> usize {
        self.pending.len()
    }

    /// The pending-call stack, outermost first
    pub fn pending(&self) -> &[PendingCall] {
        &self.pending
    }

    /// Classify one notification
    ///
    /// Errors for which [`TraceError::is_fatal`] holds mean a notification
    /// was missed or a stack could not be decoded; the tracer should not be
    /// fed further notifications after one.
    pub fn trace<F: Frame + ?Sized>(
        &mut self,
        frame: &F,
        kind: TraceKind,
    ) -> Result<Option<TraceEvent>> {
        trace!("{:?} at offset {}", kind, frame.last_instruction());

        match kind {
            TraceKind::Instruction => self.on_instruction(frame),
            TraceKind::FrameEntry => {
                self.pending.push(PendingCall::Interpreted);
                Ok(None)
            }
            TraceKind::FrameExit => {
                self.pop("frame exit")?;
                Ok(None)
            }
            TraceKind::Exception => {
                if let PendingCall::Native { .. } = self.top("exception")? {
                    self.pending.pop();
                    debug!("native call abandoned by exception");
                }
                Ok(None)
            }
        }
    }

    fn on_instruction<F: Frame + ?Sized>(&mut self, frame: &F) -> Result<Option<TraceEvent>> {
        let opcode = match frame.current_opcode() {
            Ok(opcode) => Some(opcode),
            Err(TraceError::UnknownOpcode(_)) => None,
            Err(e) => return Err(e),
        };

        if opcode.is_some_and(Opcode::is_call) {
            return self.on_call(frame);
        }

        if let PendingCall::Native { return_slot } = self.top("instruction")? {
            let stack = frame.operand_stack();
            let value = stack
                .get(return_slot)
                .cloned()
                .ok_or(TraceError::StackUnderflow {
                    index: return_slot,
                    len: stack.len(),
                })?;
            self.pending.pop();
            debug!("native return: {}", value);
            return Ok(Some(TraceEvent::NativeReturn { value }));
        }

        Ok(opcode
            .and_then(Opcode::output_kind)
            .map(|kind| TraceEvent::OutputStatement { kind }))
    }

    fn on_call<F: Frame + ?Sized>(&mut self, frame: &F) -> Result<Option<TraceEvent>> {
        let view = OperandStackView::new(frame)?;
        let callee = view.bottom().clone();

        // Interpreted callees report their own frames; make sure the native
        // calls they make are visible too
        if let Some(function) = callee.as_function() {
            if self.options.instrument_callees {
                instrument_function(function);
            }
            return Ok(None);
        }

        self.pending.push(PendingCall::Native {
            return_slot: view.skip_offset(),
        });
        let positional = view.positional_args();
        let keyword = view.keyword_args();
        if self.options.instrument_arguments {
            instrument_all(positional.iter().chain(keyword.values()));
        }

        debug!(
            "native call: {} with {} positional and {} keyword arguments",
            callee,
            positional.len(),
            keyword.len()
        );
        Ok(Some(TraceEvent::NativeCall {
            callee,
            positional,
            keyword,
        }))
    }

    fn top(&self, during: &'static str) -> Result<PendingCall> {
        self.pending
            .last()
            .copied()
            .ok_or(TraceError::PendingStackUnderflow { during })
    }

    fn pop(&mut self, during: &'static str) -> Result<PendingCall> {
        self.pending
            .pop()
            .ok_or(TraceError::PendingStackUnderflow { during })
    }
}

//! NativeTrace
//!
//! Observes calls from a bytecode interpreter into native functions, which
//! the interpreter's own trace hook never reports. The tracer is fed the
//! host's per-instruction notifications and recovers three kinds of event
//! from them: a native call with its decoded arguments, the value that call
//! returned, and output statements.
//!
//! # Architecture
//!
//! - **Code blocks**: Immutable compiled code with a compressed line table
//! - **Instrumentation**: Line-table rewriting so the host stops before every instruction
//! - **Stack view**: Decodes callee and arguments from a frame's operand stack
//! - **Call tracer**: Pending-call state machine classifying notifications
//! - **Frame trait**: Host-specific access to the running frame
//!
//! # Example Usage
//!
//! ```ignore
//! use nativetrace::{CallTracer, FrameSnapshot, Program, TraceKind};
//!
//! // Deserialize the module being traced from protobuf bytes
//! let program = Program::from_proto_bytes(&program_bytes).unwrap();
//! let code = nativetrace::rewrite(&program.code).unwrap_or(program.code);
//!
//! let mut tracer = CallTracer::new();
//! let frame = FrameSnapshot::new(code, 0, stack);
//! if let Some(event) = tracer.trace(&frame, TraceKind::Instruction)? {
//!     println!("{:?}", event);
//! }
//! ```

// Core modules
pub mod code;
pub mod constant_pool;
pub mod error;
pub mod frame;
pub mod opcodes;
pub mod program;
pub mod value;

// Tracing
pub mod instrument;
pub mod stack_view;
pub mod tracer;

#[cfg(feature = "python")]
mod python_bindings;

// Re-export main types for convenience
pub use code::{CodeBlock, LineTable};
pub use constant_pool::{Constant, ConstantPool};
pub use error::{Result, TraceError};
pub use frame::{Frame, FrameSnapshot};
pub use instrument::{instrument_all, instrument_function, is_instrumented, rewrite};
pub use opcodes::{Opcode, OutputKind};
pub use program::Program;
pub use stack_view::{CallDescriptor, OperandStackView};
pub use tracer::{CallTracer, PendingCall, TraceEvent, TraceKind, TracerOptions};
pub use value::{Function, HostObject, KeywordArgs, NativeFunction, Value};

/// Current protobuf wire format version
pub const WIRE_FORMAT_VERSION: u32 = 1;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn module(code: Vec<u8>) -> Arc<CodeBlock> {
        Arc::new(CodeBlock::new("<module>", code))
    }

    /// A function body that looks up a global and calls it with no arguments
    fn calling_body(name: &str) -> Arc<CodeBlock> {
        let code = CodeBlock::new(
            name,
            vec![
                Opcode::LoadGlobal as u8,
                0,
                0,
                Opcode::CallFunction as u8,
                0,
                0,
                Opcode::ReturnValue as u8,
            ],
        )
        .with_lines(10, LineTable::from_pairs(&[(6, 1)]));
        Arc::new(code)
    }

    fn native(name: &str) -> Value {
        Value::Native(NativeFunction::new(name))
    }

    #[test]
    fn test_native_call_with_keywords() {
        // f(1, 2, x=3)
        let frame = FrameSnapshot::new(
            module(vec![Opcode::CallFunction as u8, 2, 1, Opcode::PopTop as u8]),
            0,
            vec![
                native("f"),
                Value::Int(1),
                Value::Int(2),
                Value::from("x"),
                Value::Int(3),
            ],
        );
        let mut tracer = CallTracer::new();

        tracer.trace(&frame, TraceKind::FrameEntry).unwrap();
        let mut keyword = KeywordArgs::new();
        keyword.insert("x".to_string(), Value::Int(3));
        assert_eq!(
            tracer.trace(&frame, TraceKind::Instruction),
            Ok(Some(TraceEvent::NativeCall {
                callee: frame.stack[0].clone(),
                positional: vec![Value::Int(1), Value::Int(2)],
                keyword,
            }))
        );
        assert_eq!(tracer.depth(), 2);

        assert_eq!(
            tracer.trace(&frame.at(3, vec![Value::Int(7)]), TraceKind::Instruction),
            Ok(Some(TraceEvent::NativeReturn {
                value: Value::Int(7)
            }))
        );
        assert_eq!(tracer.depth(), 1);

        tracer.trace(&frame.at(3, vec![]), TraceKind::FrameExit).unwrap();
        assert_eq!(tracer.depth(), 0);
    }

    #[test]
    fn test_native_call_that_raises() {
        let frame = FrameSnapshot::new(
            module(vec![Opcode::CallFunction as u8, 1, 0, Opcode::PopTop as u8]),
            0,
            vec![native("int"), Value::from("nope")],
        );
        let mut tracer = CallTracer::new();

        tracer.trace(&frame, TraceKind::FrameEntry).unwrap();
        assert!(matches!(
            tracer.trace(&frame, TraceKind::Instruction),
            Ok(Some(TraceEvent::NativeCall { .. }))
        ));
        assert_eq!(tracer.depth(), 2);

        // The exception retires the native call; no return is reported
        assert_eq!(tracer.trace(&frame, TraceKind::Exception), Ok(None));
        assert_eq!(tracer.pending(), &[PendingCall::Interpreted]);

        // Propagating through the interpreted frame leaves it in place
        assert_eq!(tracer.trace(&frame, TraceKind::Exception), Ok(None));
        assert_eq!(tracer.depth(), 1);

        tracer.trace(&frame, TraceKind::FrameExit).unwrap();
        assert_eq!(tracer.depth(), 0);
    }

    #[test]
    fn test_interpreted_function_calling_native() {
        // g() where g's body calls h()
        let g = Function::new("g", calling_body("g"));
        assert!(!is_instrumented(&g.code()));

        let outer = FrameSnapshot::new(
            module(vec![Opcode::CallFunction as u8, 0, 0, Opcode::PopTop as u8]),
            0,
            vec![Value::Function(g.clone())],
        );
        let mut tracer = CallTracer::new();

        tracer.trace(&outer, TraceKind::FrameEntry).unwrap();
        assert_eq!(tracer.trace(&outer, TraceKind::Instruction), Ok(None));
        assert!(is_instrumented(&g.code()));
        assert_eq!(tracer.depth(), 1);

        let inner = FrameSnapshot::new(g.code(), 0, vec![]);
        tracer.trace(&inner, TraceKind::FrameEntry).unwrap();
        assert_eq!(tracer.trace(&inner, TraceKind::Instruction), Ok(None));
        assert_eq!(tracer.depth(), 2);

        let h = native("h");
        assert_eq!(
            tracer.trace(&inner.at(3, vec![h.clone()]), TraceKind::Instruction),
            Ok(Some(TraceEvent::NativeCall {
                callee: h,
                positional: vec![],
                keyword: KeywordArgs::new(),
            }))
        );
        assert_eq!(tracer.depth(), 3);

        assert_eq!(
            tracer.trace(&inner.at(6, vec![Value::from("r")]), TraceKind::Instruction),
            Ok(Some(TraceEvent::NativeReturn {
                value: Value::from("r")
            }))
        );
        tracer.trace(&inner.at(6, vec![]), TraceKind::FrameExit).unwrap();
        assert_eq!(tracer.depth(), 1);

        // Back in the caller, the interpreted call produces no return event
        assert_eq!(
            tracer.trace(&outer.at(3, vec![Value::from("r")]), TraceKind::Instruction),
            Ok(None)
        );
        tracer.trace(&outer.at(3, vec![]), TraceKind::FrameExit).unwrap();
        assert_eq!(tracer.depth(), 0);
    }

    #[test]
    fn test_native_call_with_interpreted_callback() {
        // map(callback, (1, 2))
        let body = CodeBlock::new(
            "callback",
            vec![Opcode::LoadFast as u8, 0, 0, Opcode::ReturnValue as u8],
        )
        .with_lines(2, LineTable::from_pairs(&[(3, 1)]));
        let callback = Function::new("callback", Arc::new(body));
        let items = Value::Tuple(vec![Value::Int(1), Value::Int(2)]);

        let outer = FrameSnapshot::new(
            module(vec![Opcode::CallFunction as u8, 2, 0, Opcode::PopTop as u8]),
            0,
            vec![native("map"), Value::Function(callback.clone()), items.clone()],
        );
        let mut tracer = CallTracer::new();

        tracer.trace(&outer, TraceKind::FrameEntry).unwrap();
        let event = tracer.trace(&outer, TraceKind::Instruction).unwrap();
        assert!(matches!(event, Some(TraceEvent::NativeCall { .. })));
        assert!(is_instrumented(&callback.code()));
        assert_eq!(tracer.depth(), 2);

        // The native function calls back into the interpreter twice
        for item in [1, 2] {
            let frame = FrameSnapshot::new(callback.code(), 0, vec![]);
            tracer.trace(&frame, TraceKind::FrameEntry).unwrap();
            assert_eq!(tracer.depth(), 3);
            assert_eq!(tracer.trace(&frame, TraceKind::Instruction), Ok(None));
            assert_eq!(
                tracer.trace(&frame.at(3, vec![Value::Int(item)]), TraceKind::Instruction),
                Ok(None)
            );
            tracer.trace(&frame.at(3, vec![]), TraceKind::FrameExit).unwrap();
            assert_eq!(tracer.depth(), 2);
        }

        assert_eq!(
            tracer.trace(&outer.at(3, vec![items.clone()]), TraceKind::Instruction),
            Ok(Some(TraceEvent::NativeReturn { value: items }))
        );
        assert_eq!(tracer.depth(), 1);
    }

    #[test]
    fn test_callback_exception_unwinds_through_native_call() {
        // map(callback, (1,)) where callback raises and map lets it propagate
        let body = CodeBlock::new(
            "callback",
            vec![Opcode::LoadFast as u8, 0, 0, Opcode::ReturnValue as u8],
        )
        .with_lines(2, LineTable::from_pairs(&[(3, 1)]));
        let callback = Function::new("callback", Arc::new(body));

        let outer = FrameSnapshot::new(
            module(vec![Opcode::CallFunction as u8, 2, 0, Opcode::PopTop as u8]),
            0,
            vec![
                native("map"),
                Value::Function(callback.clone()),
                Value::Tuple(vec![Value::Int(1)]),
            ],
        );
        let mut tracer = CallTracer::new();

        tracer.trace(&outer, TraceKind::FrameEntry).unwrap();
        assert_eq!(tracer.depth(), 1);
        assert!(matches!(
            tracer.trace(&outer, TraceKind::Instruction),
            Ok(Some(TraceEvent::NativeCall { .. }))
        ));
        assert_eq!(tracer.depth(), 2);

        let frame = FrameSnapshot::new(callback.code(), 0, vec![]);
        tracer.trace(&frame, TraceKind::FrameEntry).unwrap();
        assert_eq!(tracer.depth(), 3);

        // Raised inside the callback: its own frame is still on top
        assert_eq!(tracer.trace(&frame, TraceKind::Exception), Ok(None));
        assert_eq!(tracer.depth(), 3);

        tracer.trace(&frame, TraceKind::FrameExit).unwrap();
        assert_eq!(tracer.depth(), 2);
        assert_eq!(
            tracer.pending().last(),
            Some(&PendingCall::Native { return_slot: 0 })
        );

        // Surfacing in the caller retires map without a return event
        assert_eq!(tracer.trace(&outer, TraceKind::Exception), Ok(None));
        assert_eq!(tracer.depth(), 1);
        assert_eq!(tracer.pending(), &[PendingCall::Interpreted]);

        tracer.trace(&outer, TraceKind::FrameExit).unwrap();
        assert_eq!(tracer.depth(), 0);
    }

    #[test]
    fn test_native_call_inside_loop_body() {
        // for x in it: len(x)
        let iterator = Value::object(vec![1u8, 2, 3]);
        let frame = FrameSnapshot::new(
            module(vec![Opcode::CallFunction as u8, 1, 0, Opcode::PopTop as u8]),
            0,
            vec![iterator.clone(), native("len"), Value::from("abc")],
        );
        let mut tracer = CallTracer::new();

        tracer.trace(&frame, TraceKind::FrameEntry).unwrap();
        match tracer.trace(&frame, TraceKind::Instruction).unwrap() {
            Some(TraceEvent::NativeCall { positional, .. }) => {
                assert_eq!(positional, vec![Value::from("abc")]);
            }
            other => panic!("expected a native call, got {:?}", other),
        }
        assert_eq!(
            tracer.pending().last(),
            Some(&PendingCall::Native { return_slot: 1 })
        );

        assert_eq!(
            tracer.trace(
                &frame.at(3, vec![iterator, Value::Int(3)]),
                TraceKind::Instruction
            ),
            Ok(Some(TraceEvent::NativeReturn {
                value: Value::Int(3)
            }))
        );
    }

    #[test]
    fn test_decoded_program_is_traced() {
        let mut pool = ConstantPool::new();
        pool.add(Constant::String("hello".to_string()));
        let code = CodeBlock::new(
            "<module>",
            vec![
                Opcode::LoadConst as u8,
                0,
                0,
                Opcode::PrintItem as u8,
                Opcode::PrintNewline as u8,
            ],
        )
        .with_constants(pool)
        .with_lines(1, LineTable::from_pairs(&[(3, 0)]));

        let bytes = Program::new(Arc::new(code)).to_proto_bytes();
        let program = Program::from_proto_bytes(&bytes).unwrap();
        let code = rewrite(&program.code).unwrap();
        assert_eq!(code.line_table.line_starts(code.first_line).len(), 5);

        let frame = FrameSnapshot::new(code, 0, vec![]);
        let mut tracer = CallTracer::new();
        tracer.trace(&frame, TraceKind::FrameEntry).unwrap();

        let events: Vec<_> = [0, 3, 4]
            .into_iter()
            .map(|offset| {
                tracer
                    .trace(&frame.at(offset, vec![]), TraceKind::Instruction)
                    .unwrap()
            })
            .collect();
        assert_eq!(
            events,
            vec![
                None,
                Some(TraceEvent::OutputStatement {
                    kind: OutputKind::Item
                }),
                Some(TraceEvent::OutputStatement {
                    kind: OutputKind::Newline
                }),
            ]
        );
    }
}

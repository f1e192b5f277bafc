#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use nativetrace::{CallTracer, CodeBlock, FrameSnapshot, NativeFunction, TraceKind, Value};

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 || data.len() > 4096 {
        return;
    }

    // The first half is the bytecode, each byte of the second half drives
    // one notification
    let (code, script) = data.split_at(data.len() / 2);
    let code = Arc::new(CodeBlock::new("<fuzz>", code.to_vec()));
    let native = Value::Native(NativeFunction::new("f"));

    let mut tracer = CallTracer::new();
    for &byte in script {
        let kind = match byte % 4 {
            0 => TraceKind::FrameEntry,
            1 => TraceKind::FrameExit,
            2 => TraceKind::Exception,
            _ => TraceKind::Instruction,
        };
        let offset = (byte as usize / 4) % code.code.len();
        let stack = vec![native.clone(); byte as usize % 5];
        let frame = FrameSnapshot::new(code.clone(), offset, stack);

        let depth = tracer.depth();
        match tracer.trace(&frame, kind) {
            // Property: each notification moves depth by at most one
            Ok(_) => assert!(tracer.depth().abs_diff(depth) <= 1),
            Err(e) if e.is_fatal() => return,
            Err(_) => {}
        }
    }
});

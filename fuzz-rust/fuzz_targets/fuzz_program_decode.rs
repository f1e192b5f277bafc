#![no_main]

use libfuzzer_sys::fuzz_target;
use nativetrace::{Program, is_instrumented, rewrite};

fuzz_target!(|data: &[u8]| {
    // Skip very large inputs to avoid timeouts
    if data.len() > 64 * 1024 {
        return;
    }

    // Decoding may fail with TraceError::Decode, but should never panic
    let Ok(program) = Program::from_proto_bytes(data) else {
        return;
    };

    // Property: re-encoding a decoded program is stable
    let bytes = program.to_proto_bytes();
    let again = Program::from_proto_bytes(&bytes).expect("re-encoded program must decode");
    assert_eq!(again.to_proto_bytes(), bytes);

    // Property: rewriting yields an instrumented tree, and only once
    match rewrite(&program.code) {
        Some(rewritten) => {
            assert!(is_instrumented(&rewritten));
            assert!(rewrite(&rewritten).is_none());
            assert_eq!(rewritten.code, program.code.code);
        }
        None => assert!(is_instrumented(&program.code)),
    }
});

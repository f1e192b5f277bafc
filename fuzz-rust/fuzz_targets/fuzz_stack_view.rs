#![no_main]

use libfuzzer_sys::fuzz_target;
use nativetrace::{CallDescriptor, KeywordArgs, NativeFunction, OperandStackView, Value};

/// Build a stack value from one input byte
fn value_from(byte: u8) -> Value {
    match byte % 7 {
        0 => Value::None,
        1 => Value::Int(byte as i64),
        2 => Value::from("key"),
        3 => Value::Tuple(vec![Value::Int(1)]),
        4 => Value::Dict(KeywordArgs::new()),
        5 => Value::List(vec![Value::None]),
        _ => Value::Native(NativeFunction::new("f")),
    }
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 3 || data.len() > 512 {
        return;
    }

    // First bytes form the instruction, the rest the operand stack
    let code = &data[..3];
    let stack: Vec<Value> = data[3..].iter().copied().map(value_from).collect();

    let Ok(descriptor) = CallDescriptor::decode(code, 0) else {
        return;
    };

    // Construction may fail with a TraceError, but should never panic
    if let Ok(view) = OperandStackView::from_parts(stack, descriptor) {
        // Property: the callee or return value is inside the stack
        let _ = view.bottom();

        if let Some(descriptor) = view.descriptor() {
            // Property: positional arguments match the instruction's count
            assert_eq!(view.positional_args_from_stack().len(), descriptor.positional);
            assert!(view.keyword_args_from_stack().len() <= descriptor.keyword);
            let _ = view.positional_args();
            let _ = view.keyword_args();
        }
    }
});

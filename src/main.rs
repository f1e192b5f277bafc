use std::sync::Arc;

use nativetrace::{
    CallTracer, CodeBlock, Constant, ConstantPool, FrameSnapshot, Function, KeywordArgs,
    LineTable, NativeFunction, Opcode, Program, TraceEvent, TraceKind, Value,
};

/// One notification as a host would deliver it
struct Step {
    frame: FrameSnapshot,
    kind: TraceKind,
}

impl Step {
    fn new(frame: FrameSnapshot, kind: TraceKind) -> Self {
        Step { frame, kind }
    }
}

fn print_separator() {
    println!("\n{}", "=".repeat(80));
}

fn print_header(title: &str) {
    println!("\n{}", "=".repeat(80));
    println!("  {}", title);
    println!("{}", "=".repeat(80));
}

/// Feed `steps` to `tracer`, printing every event and the depth after it
///
/// Stops at the first error.
fn replay(tracer: &mut CallTracer, steps: Vec<Step>) {
    for step in steps {
        let opcode = step
            .frame
            .code
            .opcode_at(step.frame.last_instruction)
            .map(|op| op.mnemonic())
            .unwrap_or("?");
        let label = format!(
            "{:<12} {:<10} @{:<3} {:<18}",
            format!("{:?}", step.kind),
            step.frame.code.name,
            step.frame.last_instruction,
            opcode
        );

        match tracer.trace(&step.frame, step.kind) {
            Ok(Some(event)) => {
                println!("  {} depth={} -> {}", label, tracer.depth(), describe(&event))
            }
            Ok(None) => println!("  {} depth={}", label, tracer.depth()),
            Err(e) => {
                println!("  {} ✗ {} (fatal: {})", label, e, e.is_fatal());
                return;
            }
        }
    }
}

fn describe(event: &TraceEvent) -> String {
    match event {
        TraceEvent::NativeCall {
            callee,
            positional,
            keyword,
        } => {
            let mut args: Vec<String> = positional.iter().map(|v| v.to_string()).collect();
            args.extend(keyword.iter().map(|(k, v)| format!("{}={}", k, v)));
            format!("native call {}({})", callee, args.join(", "))
        }
        TraceEvent::NativeReturn { value } => format!("native return {}", value),
        TraceEvent::OutputStatement { kind } => format!("output statement ({})", kind.as_str()),
    }
}

fn module(code: Vec<u8>) -> Arc<CodeBlock> {
    Arc::new(
        CodeBlock {
            filename: "demo.py".to_string(),
            ..CodeBlock::new("<module>", code)
        }
        .with_lines(1, LineTable::from_pairs(&[(3, 1)])),
    )
}

fn native(name: &str) -> Value {
    Value::Native(NativeFunction::new(name))
}

fn example_instrumentation() {
    print_header("Example 1: Line Table Instrumentation");

    let mut pool = ConstantPool::new();
    let greeting = pool.add(Constant::String("hello".to_string()));
    let body = CodeBlock::new(
        "greet",
        vec![
            Opcode::LoadConst as u8,
            (greeting & 0xFF) as u8,
            ((greeting >> 8) & 0xFF) as u8,
            Opcode::PrintItem as u8,
            Opcode::PrintNewline as u8,
            Opcode::LoadConst as u8,
            0,
            0,
            Opcode::ReturnValue as u8,
        ],
    )
    .with_constants(pool)
    .with_lines(2, LineTable::from_pairs(&[(5, 1)]));

    let mut module_pool = ConstantPool::new();
    module_pool.add(Constant::Code(Arc::new(body)));
    let code = CodeBlock::new(
        "<module>",
        vec![
            Opcode::LoadConst as u8,
            0,
            0,
            Opcode::MakeFunction as u8,
            0,
            0,
        ],
    )
    .with_constants(module_pool)
    .with_lines(1, LineTable::from_pairs(&[]));
    let program = Program::new(Arc::new(code));

    let bytes = program.to_proto_bytes();
    println!("\nSerialized program: {} bytes", bytes.len());
    let decoded = match Program::from_proto_bytes(&bytes) {
        Ok(program) => program,
        Err(e) => {
            println!("  ✗ Decode error: {}", e);
            return;
        }
    };

    for nested in decoded.code.constants.code_blocks() {
        println!("\nBefore: {}", nested.name);
        println!("  line table: [{}]", hex_dump(nested.line_table.as_bytes()));
        println!("  line starts: {:?}", nested.line_table.line_starts(nested.first_line));
    }

    let Some(rewritten) = nativetrace::rewrite(&decoded.code) else {
        println!("  already instrumented");
        return;
    };
    for nested in rewritten.constants.code_blocks() {
        println!("\nAfter: {}", nested.name);
        println!("  line table: [{}]", hex_dump(nested.line_table.as_bytes()));
        println!("  line starts: {:?}", nested.line_table.line_starts(nested.first_line));
    }
    println!(
        "\n  ✓ instrumented: {}, rewriting again is a no-op: {}",
        nativetrace::is_instrumented(&rewritten),
        nativetrace::rewrite(&rewritten).is_none()
    );
}

fn example_native_call() {
    print_header("Example 2: Native Call With Keyword Arguments");
    println!("\n  f(1, 2, x=3)\n");

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

    replay(
        &mut CallTracer::new(),
        vec![
            Step::new(frame.clone(), TraceKind::FrameEntry),
            Step::new(frame.clone(), TraceKind::Instruction),
            Step::new(frame.at(3, vec![Value::Int(6)]), TraceKind::Instruction),
            Step::new(frame.at(3, vec![]), TraceKind::FrameExit),
        ],
    );
}

fn example_variadic_call() {
    print_header("Example 3: Variadic Call Inside a Loop");
    println!("\n  for row in rows: write(row, *extra, **options)\n");

    let mut options = KeywordArgs::new();
    options.insert("sep".to_string(), Value::from(","));
    let iterator = Value::object(vec!["row"; 2]);
    let frame = FrameSnapshot::new(
        module(vec![Opcode::CallFunctionVarKw as u8, 1, 0, Opcode::PopTop as u8]),
        0,
        vec![
            iterator.clone(),
            native("write"),
            Value::from("row"),
            Value::Tuple(vec![Value::Int(1), Value::Int(2)]),
            Value::Dict(options),
        ],
    );

    replay(
        &mut CallTracer::new(),
        vec![
            Step::new(frame.clone(), TraceKind::FrameEntry),
            Step::new(frame.clone(), TraceKind::Instruction),
            Step::new(frame.at(3, vec![iterator, Value::None]), TraceKind::Instruction),
        ],
    );
}

fn example_interpreted_callee() {
    print_header("Example 4: Interpreted Function Calling Native Code");
    println!("\n  def g(): return h()\n  g()\n");

    let g_body = CodeBlock::new(
        "g",
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
    .with_lines(1, LineTable::from_pairs(&[(6, 1)]));
    let g = Function::new("g", Arc::new(g_body));
    let outer = FrameSnapshot::new(
        module(vec![Opcode::CallFunction as u8, 0, 0, Opcode::PopTop as u8]),
        0,
        vec![Value::Function(g.clone())],
    );

    let mut tracer = CallTracer::new();
    replay(
        &mut tracer,
        vec![
            Step::new(outer.clone(), TraceKind::FrameEntry),
            Step::new(outer.clone(), TraceKind::Instruction),
        ],
    );

    // g was instrumented at its call site; its frame runs the rewritten code
    println!(
        "  g instrumented: {}",
        nativetrace::is_instrumented(&g.code())
    );
    let inner = FrameSnapshot::new(g.code(), 0, vec![]);
    replay(
        &mut tracer,
        vec![
            Step::new(inner.clone(), TraceKind::FrameEntry),
            Step::new(inner.clone(), TraceKind::Instruction),
            Step::new(inner.at(3, vec![native("h")]), TraceKind::Instruction),
            Step::new(inner.at(6, vec![Value::from("done")]), TraceKind::Instruction),
            Step::new(inner.at(6, vec![]), TraceKind::FrameExit),
            Step::new(outer.at(3, vec![Value::from("done")]), TraceKind::Instruction),
            Step::new(outer.at(3, vec![]), TraceKind::FrameExit),
        ],
    );
}

fn example_exception() {
    print_header("Example 5: Native Call That Raises");
    println!("\n  int(\"nope\")\n");

    let frame = FrameSnapshot::new(
        module(vec![Opcode::CallFunction as u8, 1, 0, Opcode::PopTop as u8]),
        0,
        vec![native("int"), Value::from("nope")],
    );

    replay(
        &mut CallTracer::new(),
        vec![
            Step::new(frame.clone(), TraceKind::FrameEntry),
            Step::new(frame.clone(), TraceKind::Instruction),
            Step::new(frame.clone(), TraceKind::Exception),
            Step::new(frame.clone(), TraceKind::FrameExit),
        ],
    );

    println!("\n  A missed frame entry is reported as a fatal error:\n");
    replay(
        &mut CallTracer::new(),
        vec![Step::new(frame, TraceKind::FrameExit)],
    );
}

// Helper functions

fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() {
    env_logger::init();

    println!("{}", "━".repeat(80));
    println!("  NativeTrace - Native Call Tracing Walkthrough");
    println!("{}", "━".repeat(80));

    example_instrumentation();
    example_native_call();
    example_variadic_call();
    example_interpreted_callee();
    example_exception();

    print_separator();
    println!("\n✨ All examples completed!");
    println!("\nKey Features Demonstrated:");
    println!("  ✓ Protobuf serialization of nested code blocks");
    println!("  ✓ Per-instruction line table rewriting");
    println!("  ✓ Native call and return detection");
    println!("  ✓ Keyword, *args and **kwargs decoding");
    println!("  ✓ Instrumenting interpreted callees");
    println!("  ✓ Exception handling for native calls");
    println!("\n{}", "━".repeat(80));
}

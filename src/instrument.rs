//! Forcing per-instruction trace notifications
//!
//! A host only notifies the tracer when execution reaches the start of a
//! source line, which is too coarse to catch a call instruction in the middle
//! of a line. Rewriting a code block's line table so that every instruction
//! byte claims to start a new line makes the host stop before each one.

use std::sync::Arc;

use log::debug;

use crate::code::{CodeBlock, LineTable};
use crate::value::{Function, Value};

/// Whether `code` and every code block nested in it already report a line
/// boundary before each instruction
///
/// Blocks shorter than two bytes hold at most one instruction, which always
/// starts a line.
pub fn is_instrumented(code: &CodeBlock) -> bool {
    let marked = code.code.len() < 2 || code.line_table.is_every_instruction(code.code.len());
    marked && code.constants.code_blocks().all(|nested| is_instrumented(nested))
}

/// Build an instrumented copy of `code`
///
/// Returns `None` when `code` is already instrumented. Otherwise the copy
/// differs only in its line table, its first line (reset to 0) and its
/// nested code blocks, which are rewritten the same way.
pub fn rewrite(code: &Arc<CodeBlock>) -> Option<Arc<CodeBlock>> {
    if is_instrumented(code) {
        return None;
    }

    let constants = code.constants.map_code_blocks(rewrite);
    debug!(
        "instrumenting code block {} ({} bytes)",
        code.name,
        code.code.len()
    );

    Some(Arc::new(CodeBlock {
        constants,
        first_line: 0,
        line_table: LineTable::every_instruction(code.code.len()),
        ..CodeBlock::clone(code)
    }))
}

/// Point `function` at an instrumented copy of its code
///
/// Returns whether the function's code was replaced. Losing a race against
/// another thread instrumenting the same function is not an error: the
/// winner installed an equivalent block.
pub fn instrument_function(function: &Function) -> bool {
    let current = function.code();
    let Some(replacement) = rewrite(&current) else {
        return false;
    };
    let swapped = function.replace_code(&current, replacement);
    if swapped {
        debug!("instrumented function {}", function.name());
    }
    swapped
}

/// Instrument every interpreted function among `values`
///
/// Looks inside sequences and mappings as well, since a callback handed to a
/// native function may be wrapped in one. Returns how many functions were
/// instrumented.
pub fn instrument_all<'a, I>(values: I) -> usize
where
    I: IntoIterator<Item = &'a Value>,
{
    values
        .into_iter()
        .map(|value| match value {
            Value::Function(function) => usize::from(instrument_function(function)),
            Value::Tuple(items) | Value::List(items) => instrument_all(items),
            Value::Dict(entries) => instrument_all(entries.values()),
            _ => 0,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant_pool::{Constant, ConstantPool};
    use crate::opcodes::Opcode;
    use crate::value::{KeywordArgs, NativeFunction};
    use pretty_assertions::assert_eq;

    fn code_block(name: &str, nested: Option<Arc<CodeBlock>>) -> Arc<CodeBlock> {
        let mut constants = ConstantPool::new();
        constants.add(Constant::None);
        if let Some(nested) = nested {
            constants.add(Constant::Code(nested));
        }
        let code = CodeBlock {
            name: name.to_string(),
            filename: "demo.py".to_string(),
            arg_count: 1,
            varnames: vec!["x".to_string()],
            ..CodeBlock::new(
                name,
                vec![
                    Opcode::LoadFast as u8,
                    0,
                    0,
                    Opcode::ReturnValue as u8,
                ],
            )
        }
        .with_constants(constants)
        .with_lines(3, LineTable::from_pairs(&[(3, 1)]));
        Arc::new(code)
    }

    #[test]
    fn test_rewrite_replaces_line_table_only() {
        let original = code_block("f", None);
        let rewritten = rewrite(&original).unwrap();

        assert_eq!(rewritten.line_table, LineTable::every_instruction(4));
        assert_eq!(rewritten.first_line, 0);
        assert_eq!(rewritten.code, original.code);
        assert_eq!(rewritten.constants, original.constants);
        assert_eq!(rewritten.varnames, original.varnames);
        assert_eq!(rewritten.arg_count, original.arg_count);
        assert_eq!(rewritten.filename, original.filename);
        assert!(is_instrumented(&rewritten));
        assert!(!is_instrumented(&original));
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let rewritten = rewrite(&code_block("f", None)).unwrap();
        assert!(rewrite(&rewritten).is_none());
    }

    #[test]
    fn test_rewrite_recurses_into_nested_blocks() {
        let inner = code_block("inner", None);
        let outer = code_block("outer", Some(inner.clone()));

        let rewritten = rewrite(&outer).unwrap();
        let nested: Vec<_> = rewritten.constants.code_blocks().collect();
        assert_eq!(nested.len(), 1);
        assert_eq!(nested[0].name, "inner");
        assert!(nested[0].line_table.is_every_instruction(nested[0].code.len()));
        assert!(rewritten.line_table.is_every_instruction(rewritten.code.len()));

        // The original tree is left alone
        assert!(!is_instrumented(&inner));
    }

    #[test]
    fn test_outer_marked_but_nested_not() {
        let inner = code_block("inner", None);
        let outer = CodeBlock {
            line_table: LineTable::every_instruction(4),
            ..CodeBlock::clone(&code_block("outer", Some(inner)))
        };
        let outer = Arc::new(outer);
        assert!(!is_instrumented(&outer));

        let rewritten = rewrite(&outer).unwrap();
        assert!(is_instrumented(&rewritten));
    }

    #[test]
    fn test_partial_marker_run_is_rewritten() {
        let code = Arc::new(
            CodeBlock::new("f", vec![Opcode::PopTop as u8; 7])
                .with_lines(0, LineTable::from_pairs(&[(1, 1)])),
        );
        assert!(!is_instrumented(&code));

        let rewritten = rewrite(&code).unwrap();
        assert!(is_instrumented(&rewritten));
        assert_eq!(rewritten.line_table.line_starts(0).len(), 7);
    }

    #[test]
    fn test_single_instruction_block_counts_as_instrumented() {
        let code = Arc::new(CodeBlock::new("noop", vec![Opcode::ReturnValue as u8]));
        assert!(rewrite(&code).is_none());
    }

    #[test]
    fn test_instrument_function_swaps_code() {
        let function = Function::new("f", code_block("f", None));
        assert!(instrument_function(&function));
        assert!(is_instrumented(&function.code()));
        assert!(!instrument_function(&function));
    }

    #[test]
    fn test_instrument_all_finds_nested_functions() {
        let direct = Function::new("direct", code_block("direct", None));
        let in_tuple = Function::new("in_tuple", code_block("in_tuple", None));
        let in_dict = Function::new("in_dict", code_block("in_dict", None));
        let in_list = Function::new("in_list", code_block("in_list", None));

        let mut entries = KeywordArgs::new();
        entries.insert("key".to_string(), Value::Function(in_dict.clone()));
        let values = vec![
            Value::Function(direct.clone()),
            Value::Native(NativeFunction::new("len")),
            Value::Tuple(vec![Value::Int(1), Value::Function(in_tuple.clone())]),
            Value::List(vec![Value::Function(in_list.clone())]),
            Value::Dict(entries),
        ];

        assert_eq!(instrument_all(&values), 4);
        assert!(is_instrumented(&in_list.code()));
        assert!(is_instrumented(&direct.code()));
        assert!(is_instrumented(&in_tuple.code()));
        assert!(is_instrumented(&in_dict.code()));
        assert_eq!(instrument_all(&values), 0);
    }
}

//! Compiled code blocks and their line-number tables

use crate::constant_pool::ConstantPool;
use crate::error::Result;
use crate::opcodes::{self, Opcode};

/// Compressed mapping from instruction offsets to source lines
///
/// Stored as `(offset increment, line increment)` byte pairs, starting from
/// offset 0 at the code block's first line. A host delivers a per-line
/// notification whenever execution reaches an offset where a new line
/// starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTable {
    bytes: Vec<u8>,
}

impl LineTable {
    /// Wrap an already encoded table
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        LineTable { bytes }
    }

    pub fn from_pairs(pairs: &[(u8, u8)]) -> Self {
        let bytes = pairs.iter().flat_map(|&(addr, line)| [addr, line]).collect();
        LineTable { bytes }
    }

    /// A table claiming that each of `code_len` bytes starts a new line
    pub fn every_instruction(code_len: usize) -> Self {
        LineTable {
            bytes: [1u8, 1u8].repeat(code_len.saturating_sub(1)),
        }
    }

    /// Whether this table is the per-byte marker pattern for a block of
    /// `code_len` bytes
    ///
    /// A marker run that stops short of the end of the code does not count:
    /// the bytes past it would never be reported.
    pub fn is_every_instruction(&self, code_len: usize) -> bool {
        code_len >= 2
            && self.bytes.len() == 2 * (code_len - 1)
            && self.bytes.iter().all(|&b| b == 1)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn pairs(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.bytes
            .chunks_exact(2)
            .map(|pair| (pair[0] as usize, pair[1] as u32))
    }

    /// `(offset, line)` for every offset where a new line starts
    pub fn line_starts(&self, first_line: u32) -> Vec<(usize, u32)> {
        let mut starts = Vec::new();
        let mut last_line = None;
        let mut line = first_line;
        let mut addr = 0;

        for (addr_incr, line_incr) in self.pairs() {
            if addr_incr != 0 {
                if last_line != Some(line) {
                    starts.push((addr, line));
                    last_line = Some(line);
                }
                addr += addr_incr;
            }
            line = line.saturating_add(line_incr);
        }
        if last_line != Some(line) {
            starts.push((addr, line));
        }
        starts
    }

    /// Source line of the instruction at `offset`
    pub fn line_for(&self, first_line: u32, offset: usize) -> u32 {
        let mut line = first_line;
        let mut addr = 0;
        for (addr_incr, line_incr) in self.pairs() {
            addr += addr_incr;
            if addr > offset {
                break;
            }
            line = line.saturating_add(line_incr);
        }
        line
    }
}

/// Immutable compiled body of a function, module or class
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeBlock {
    pub name: String,
    pub filename: String,
    pub arg_count: u32,
    pub local_count: u32,
    pub stack_size: u32,
    pub flags: u32,

    /// Instruction bytes
    pub code: Vec<u8>,

    pub constants: ConstantPool,
    pub names: Vec<String>,
    pub varnames: Vec<String>,
    pub freevars: Vec<String>,
    pub cellvars: Vec<String>,

    pub first_line: u32,
    pub line_table: LineTable,
}

impl CodeBlock {
    pub fn new(name: impl Into<String>, code: Vec<u8>) -> Self {
        CodeBlock {
            name: name.into(),
            code,
            ..CodeBlock::default()
        }
    }

    pub fn with_constants(mut self, constants: ConstantPool) -> Self {
        self.constants = constants;
        self
    }

    pub fn with_lines(mut self, first_line: u32, line_table: LineTable) -> Self {
        self.first_line = first_line;
        self.line_table = line_table;
        self
    }

    /// Decode the opcode at `offset`
    pub fn opcode_at(&self, offset: usize) -> Result<Opcode> {
        opcodes::opcode_at(&self.code, offset)
    }

    /// Whether a host should deliver a per-line notification before the
    /// instruction at `offset`
    pub fn starts_line(&self, offset: usize) -> bool {
        self.line_table
            .line_starts(self.first_line)
            .iter()
            .any(|&(start, _)| start == offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_instruction_table() {
        let table = LineTable::every_instruction(4);
        assert_eq!(table.as_bytes(), &[1, 1, 1, 1, 1, 1]);
        assert!(table.is_every_instruction(4));
        assert_eq!(table.line_starts(0), vec![(0, 0), (1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn test_marker_pattern_rejects_ordinary_tables() {
        assert!(!LineTable::default().is_every_instruction(4));
        assert!(!LineTable::from_pairs(&[(3, 1), (6, 1)]).is_every_instruction(10));
        assert!(!LineTable::from_bytes(vec![1, 1, 1]).is_every_instruction(3));
        assert!(!LineTable::every_instruction(1).is_every_instruction(1));

        // A marker run covering only the start of the code
        assert!(!LineTable::from_pairs(&[(1, 1)]).is_every_instruction(7));
        assert!(!LineTable::every_instruction(8).is_every_instruction(7));
    }

    #[test]
    fn test_line_starts_for_statement_table() {
        // line 10: bytes 0..6, line 11: bytes 6..10, line 13: bytes 10..
        let table = LineTable::from_pairs(&[(6, 1), (4, 2)]);
        assert_eq!(table.line_starts(10), vec![(0, 10), (6, 11), (10, 13)]);

        assert_eq!(table.line_for(10, 0), 10);
        assert_eq!(table.line_for(10, 5), 10);
        assert_eq!(table.line_for(10, 6), 11);
        assert_eq!(table.line_for(10, 9), 11);
        assert_eq!(table.line_for(10, 12), 13);
    }

    #[test]
    fn test_line_numbers_saturate() {
        let table = LineTable::from_pairs(&[(1, 1), (1, 200)]);
        assert_eq!(table.line_starts(u32::MAX), vec![(0, u32::MAX)]);
        assert_eq!(table.line_for(u32::MAX - 1, 2), u32::MAX);
    }

    #[test]
    fn test_starts_line() {
        let code = CodeBlock::new("f", vec![Opcode::PopTop as u8; 8])
            .with_lines(1, LineTable::from_pairs(&[(4, 1)]));
        assert!(code.starts_line(0));
        assert!(!code.starts_line(2));
        assert!(code.starts_line(4));
    }

    #[test]
    fn test_opcode_at() {
        let code = CodeBlock::new("f", vec![Opcode::CallFunction as u8, 1, 0]);
        assert_eq!(code.opcode_at(0), Ok(Opcode::CallFunction));
        assert_eq!(code.opcode_at(1), Ok(Opcode::PopTop));
        assert!(code.opcode_at(2).is_err());
        assert!(code.opcode_at(3).is_err());
    }
}

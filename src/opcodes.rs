//! Instruction set of the traced VM, as far as the tracer needs to decode it
//!
//! Opcodes are single bytes. Opcodes numbered 90 and above are followed by a
//! two-byte operand; all others stand alone.
//! Only the call family and the output-statement family are interpreted by
//! the tracer, the rest exist so code blocks can be built and walked.

use crate::error::{Result, TraceError};

/// Opcodes are single bytes (u8) for compact representation
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Stack manipulation
    PopTop = 1,
    RotTwo = 2,
    DupTop = 4,

    BinaryAdd = 23,

    /// Replace TOS with an iterator over it; the iterator then sits below
    /// every value pushed inside the loop body
    GetIter = 68,

    // Output statements
    /// Stack: [value] -> []
    PrintItem = 71,
    /// No stack effect
    PrintNewline = 72,
    /// Stack: [value, stream] -> []
    PrintItemTo = 73,
    /// Stack: [stream] -> []
    PrintNewlineTo = 74,

    ReturnValue = 83,
    PopBlock = 87,
    EndFinally = 88,

    // Opcodes with a u16 operand
    StoreName = 90,
    ForIter = 93,
    LoadConst = 100,
    LoadName = 101,
    LoadAttr = 106,
    JumpAbsolute = 113,
    LoadGlobal = 116,
    SetupLoop = 120,
    SetupExcept = 121,
    /// Entering the matching `finally` block pushes a sentinel under
    /// every value the block stages
    SetupFinally = 122,
    LoadFast = 124,
    StoreFast = 125,

    // Call family
    /// Operand: u8 positional count, u8 keyword count
    /// Stack: [callee, positional..., (name, value)...] -> [result]
    CallFunction = 131,
    MakeFunction = 132,
    /// As CallFunction, followed by a `*args` sequence
    CallFunctionVar = 140,
    /// As CallFunction, followed by a `**kwargs` mapping
    CallFunctionKw = 141,
    /// As CallFunction, followed by `*args` and then `**kwargs`
    CallFunctionVarKw = 142,
}

/// The flavour of an output statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputKind {
    Item,
    Newline,
    ItemTo,
    NewlineTo,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputKind::Item => "item",
            OutputKind::Newline => "newline",
            OutputKind::ItemTo => "item_to",
            OutputKind::NewlineTo => "newline_to",
        }
    }
}

impl Opcode {
    /// Try to parse a u8 into an Opcode
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Opcode::PopTop),
            2 => Ok(Opcode::RotTwo),
            4 => Ok(Opcode::DupTop),
            23 => Ok(Opcode::BinaryAdd),
            68 => Ok(Opcode::GetIter),
            71 => Ok(Opcode::PrintItem),
            72 => Ok(Opcode::PrintNewline),
            73 => Ok(Opcode::PrintItemTo),
            74 => Ok(Opcode::PrintNewlineTo),
            83 => Ok(Opcode::ReturnValue),
            87 => Ok(Opcode::PopBlock),
            88 => Ok(Opcode::EndFinally),
            90 => Ok(Opcode::StoreName),
            93 => Ok(Opcode::ForIter),
            100 => Ok(Opcode::LoadConst),
            101 => Ok(Opcode::LoadName),
            106 => Ok(Opcode::LoadAttr),
            113 => Ok(Opcode::JumpAbsolute),
            116 => Ok(Opcode::LoadGlobal),
            120 => Ok(Opcode::SetupLoop),
            121 => Ok(Opcode::SetupExcept),
            122 => Ok(Opcode::SetupFinally),
            124 => Ok(Opcode::LoadFast),
            125 => Ok(Opcode::StoreFast),
            131 => Ok(Opcode::CallFunction),
            132 => Ok(Opcode::MakeFunction),
            140 => Ok(Opcode::CallFunctionVar),
            141 => Ok(Opcode::CallFunctionKw),
            142 => Ok(Opcode::CallFunctionVarKw),
            _ => Err(TraceError::UnknownOpcode(byte)),
        }
    }

    /// Mnemonic as it appears in disassembly
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::PopTop => "POP_TOP",
            Opcode::RotTwo => "ROT_TWO",
            Opcode::DupTop => "DUP_TOP",
            Opcode::BinaryAdd => "BINARY_ADD",
            Opcode::GetIter => "GET_ITER",
            Opcode::PrintItem => "PRINT_ITEM",
            Opcode::PrintNewline => "PRINT_NEWLINE",
            Opcode::PrintItemTo => "PRINT_ITEM_TO",
            Opcode::PrintNewlineTo => "PRINT_NEWLINE_TO",
            Opcode::ReturnValue => "RETURN_VALUE",
            Opcode::PopBlock => "POP_BLOCK",
            Opcode::EndFinally => "END_FINALLY",
            Opcode::StoreName => "STORE_NAME",
            Opcode::ForIter => "FOR_ITER",
            Opcode::LoadConst => "LOAD_CONST",
            Opcode::LoadName => "LOAD_NAME",
            Opcode::LoadAttr => "LOAD_ATTR",
            Opcode::JumpAbsolute => "JUMP_ABSOLUTE",
            Opcode::LoadGlobal => "LOAD_GLOBAL",
            Opcode::SetupLoop => "SETUP_LOOP",
            Opcode::SetupExcept => "SETUP_EXCEPT",
            Opcode::SetupFinally => "SETUP_FINALLY",
            Opcode::LoadFast => "LOAD_FAST",
            Opcode::StoreFast => "STORE_FAST",
            Opcode::CallFunction => "CALL_FUNCTION",
            Opcode::MakeFunction => "MAKE_FUNCTION",
            Opcode::CallFunctionVar => "CALL_FUNCTION_VAR",
            Opcode::CallFunctionKw => "CALL_FUNCTION_KW",
            Opcode::CallFunctionVarKw => "CALL_FUNCTION_VAR_KW",
        }
    }

    /// Whether this opcode invokes a callee
    pub fn is_call(self) -> bool {
        self.variadic_flags().is_some()
    }

    /// `(variadic positional, variadic keyword)` for call opcodes
    pub fn variadic_flags(self) -> Option<(bool, bool)> {
        match self {
            Opcode::CallFunction => Some((false, false)),
            Opcode::CallFunctionVar => Some((true, false)),
            Opcode::CallFunctionKw => Some((false, true)),
            Opcode::CallFunctionVarKw => Some((true, true)),
            _ => None,
        }
    }

    /// The output statement this opcode performs, if any
    pub fn output_kind(self) -> Option<OutputKind> {
        match self {
            Opcode::PrintItem => Some(OutputKind::Item),
            Opcode::PrintNewline => Some(OutputKind::Newline),
            Opcode::PrintItemTo => Some(OutputKind::ItemTo),
            Opcode::PrintNewlineTo => Some(OutputKind::NewlineTo),
            _ => None,
        }
    }
}

/// Decode the opcode at `offset`
pub fn opcode_at(bytecode: &[u8], offset: usize) -> Result<Opcode> {
    let byte = read_u8(bytecode, offset)?;
    Opcode::from_u8(byte)
}

/// Helper to read a u8 from bytecode
#[inline]
pub fn read_u8(bytecode: &[u8], offset: usize) -> Result<u8> {
    bytecode
        .get(offset)
        .copied()
        .ok_or(TraceError::InvalidInstructionPointer {
            offset,
            len: bytecode.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_opcode_roundtrip() {
        let opcodes = [
            Opcode::LoadConst,
            Opcode::CallFunction,
            Opcode::CallFunctionVarKw,
            Opcode::PrintItem,
        ];

        for opcode in opcodes {
            let byte = opcode as u8;
            let parsed = Opcode::from_u8(byte).unwrap();
            assert_eq!(opcode, parsed);
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::from_u8(0xFF), Err(TraceError::UnknownOpcode(0xFF)));
    }

    #[rstest]
    #[case(Opcode::CallFunction, Some((false, false)))]
    #[case(Opcode::CallFunctionVar, Some((true, false)))]
    #[case(Opcode::CallFunctionKw, Some((false, true)))]
    #[case(Opcode::CallFunctionVarKw, Some((true, true)))]
    #[case(Opcode::MakeFunction, None)]
    #[case(Opcode::PrintItem, None)]
    fn test_call_family(#[case] opcode: Opcode, #[case] flags: Option<(bool, bool)>) {
        assert_eq!(opcode.variadic_flags(), flags);
        assert_eq!(opcode.is_call(), flags.is_some());
        assert!(opcode.mnemonic().starts_with("CALL_FUNCTION") == flags.is_some());
    }

    #[rstest]
    #[case(Opcode::PrintItem, Some(OutputKind::Item))]
    #[case(Opcode::PrintNewline, Some(OutputKind::Newline))]
    #[case(Opcode::PrintItemTo, Some(OutputKind::ItemTo))]
    #[case(Opcode::PrintNewlineTo, Some(OutputKind::NewlineTo))]
    #[case(Opcode::ReturnValue, None)]
    fn test_output_family(#[case] opcode: Opcode, #[case] kind: Option<OutputKind>) {
        assert_eq!(opcode.output_kind(), kind);
    }

    #[test]
    fn test_truncated_reads() {
        let code = [Opcode::CallFunction as u8, 2];
        assert_eq!(read_u8(&code, 1), Ok(2));
        assert!(read_u8(&code, 2).is_err());
        assert_eq!(opcode_at(&code, 0), Ok(Opcode::CallFunction));
    }
}

use std::sync::Arc;

use crate::WIRE_FORMAT_VERSION;
use crate::code::{CodeBlock, LineTable};
use crate::constant_pool::{Constant, ConstantPool};
use crate::error::{Result, TraceError};

// Generated from proto/nativetrace.proto
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/nativetrace.wire.rs"));
}

/// A compiled program: the top-level code block and everything nested in it
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Wire format version
    pub version: u32,

    /// Top-level code block
    pub code: Arc<CodeBlock>,
}

impl Program {
    pub fn new(code: Arc<CodeBlock>) -> Self {
        Program {
            version: WIRE_FORMAT_VERSION,
            code,
        }
    }

    /// Deserialize a Program from protobuf bytes
    pub fn from_proto_bytes(bytes: &[u8]) -> Result<Self> {
        use prost::Message;

        let proto_program = proto::Program::decode(bytes)
            .map_err(|e| TraceError::Decode(format!("invalid protobuf: {}", e)))?;

        Self::from_proto(proto_program)
    }

    /// Convert from protobuf Program message
    pub fn from_proto(proto: proto::Program) -> Result<Self> {
        if proto.version != WIRE_FORMAT_VERSION {
            return Err(TraceError::Decode(format!(
                "unsupported wire format version {}",
                proto.version
            )));
        }

        let mut blocks: Vec<Arc<CodeBlock>> = Vec::with_capacity(proto.code_blocks.len());
        for proto_block in proto.code_blocks {
            let block = Self::convert_code_block(proto_block, &blocks)?;
            blocks.push(Arc::new(block));
        }

        let code = blocks
            .get(proto.entry as usize)
            .cloned()
            .ok_or_else(|| TraceError::Decode(format!("entry block {} missing", proto.entry)))?;

        Ok(Program {
            version: proto.version,
            code,
        })
    }

    /// Serialize this Program to protobuf bytes
    pub fn to_proto_bytes(&self) -> Vec<u8> {
        use prost::Message;

        self.to_proto().encode_to_vec()
    }

    /// Convert to protobuf Program message
    pub fn to_proto(&self) -> proto::Program {
        let mut code_blocks = Vec::new();
        let entry = Self::flatten(&self.code, &mut code_blocks);
        proto::Program {
            version: self.version,
            code_blocks,
            entry,
        }
    }

    /// Append `code` and everything nested in it to `table`, children first
    fn flatten(code: &CodeBlock, table: &mut Vec<proto::CodeBlock>) -> u32 {
        use proto::constant::Value as PV;

        let constants = code
            .constants
            .iter()
            .map(|constant| {
                let value = match constant {
                    Constant::None => PV::NoneValue(proto::NoneValue {}),
                    Constant::Bool(b) => PV::BoolValue(*b),
                    Constant::Int(i) => PV::IntValue(*i),
                    Constant::Float(f) => PV::FloatValue(*f),
                    Constant::String(s) => PV::StringValue(s.clone()),
                    Constant::Code(nested) => PV::CodeIndex(Self::flatten(nested, table)),
                };
                proto::Constant { value: Some(value) }
            })
            .collect();

        table.push(proto::CodeBlock {
            name: code.name.clone(),
            filename: code.filename.clone(),
            arg_count: code.arg_count,
            local_count: code.local_count,
            stack_size: code.stack_size,
            flags: code.flags,
            code: code.code.clone(),
            constants,
            names: code.names.clone(),
            varnames: code.varnames.clone(),
            freevars: code.freevars.clone(),
            cellvars: code.cellvars.clone(),
            first_line: code.first_line,
            line_table: code.line_table.as_bytes().to_vec(),
        });
        (table.len() - 1) as u32
    }

    /// Convert protobuf CodeBlock; code constants may only refer to blocks
    /// already decoded
    fn convert_code_block(
        proto_block: proto::CodeBlock,
        decoded: &[Arc<CodeBlock>],
    ) -> Result<CodeBlock> {
        use proto::constant::Value as PV;

        let mut constants = ConstantPool::new();
        for proto_const in proto_block.constants {
            let value = proto_const
                .value
                .ok_or_else(|| TraceError::Decode("constant has no value".to_string()))?;
            let constant = match value {
                PV::NoneValue(_) => Constant::None,
                PV::BoolValue(b) => Constant::Bool(b),
                PV::IntValue(i) => Constant::Int(i),
                PV::FloatValue(f) => Constant::Float(f),
                PV::StringValue(s) => Constant::String(s),
                PV::CodeIndex(index) => {
                    let nested = decoded.get(index as usize).ok_or_else(|| {
                        TraceError::Decode(format!(
                            "code block {} refers to undecoded block {}",
                            proto_block.name, index
                        ))
                    })?;
                    Constant::Code(nested.clone())
                }
            };
            constants.try_add(constant).ok_or_else(|| {
                TraceError::Decode(format!(
                    "code block {} has more than {} constants",
                    proto_block.name,
                    u16::MAX
                ))
            })?;
        }

        Ok(CodeBlock {
            name: proto_block.name,
            filename: proto_block.filename,
            arg_count: proto_block.arg_count,
            local_count: proto_block.local_count,
            stack_size: proto_block.stack_size,
            flags: proto_block.flags,
            code: proto_block.code,
            constants,
            names: proto_block.names,
            varnames: proto_block.varnames,
            freevars: proto_block.freevars,
            cellvars: proto_block.cellvars,
            first_line: proto_block.first_line,
            line_table: LineTable::from_bytes(proto_block.line_table),
        })
    }
}

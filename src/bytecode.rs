// File: src/bytecode.rs
//
// Compiled program model for the Spool VM.
// The message structs mirror the fixed wire schema emitted by the dialogue
// compiler. They are written out by hand against the published field
// numbers rather than generated at build time, so the crate builds with
// no protobuf toolchain installed.

use crate::errors::DialogueError;
use crate::value::Value;
use prost::Message;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// A complete compiled dialogue program.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Program {
    /// The name of the program.
    #[prost(string, tag = "1")]
    pub name: String,
    /// The collection of nodes in this program, keyed by node name.
    #[prost(map = "string, message", tag = "2")]
    pub nodes: HashMap<String, Node>,
    /// Variable values seeded into the store when the program is loaded.
    #[prost(map = "string, message", tag = "3")]
    pub initial_values: HashMap<String, Operand>,
}

/// A named unit of script: an instruction list plus a local label table.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Node {
    /// The name of this node.
    #[prost(string, tag = "1")]
    pub name: String,
    /// The ordered list of instructions in this node.
    #[prost(message, repeated, tag = "2")]
    pub instructions: Vec<Instruction>,
    /// A jump table, mapping label names to positions in the
    /// instructions list.
    #[prost(map = "string, int32", tag = "3")]
    pub labels: HashMap<String, i32>,
    /// The tags associated with this node. Opaque to the VM.
    #[prost(string, repeated, tag = "4")]
    pub tags: Vec<String>,
    /// The entry in the program's string table that contains the original
    /// text of this node; empty if not available.
    #[prost(string, tag = "5")]
    pub source_text_string_id: String,
    /// Raw headers from the source script. Opaque to the VM.
    #[prost(message, repeated, tag = "6")]
    pub headers: Vec<Header>,
}

/// A key/value header attached to a node.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// A single instruction: an opcode plus its compile-time operands.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Instruction {
    /// The operation that this instruction will perform.
    #[prost(enumeration = "OpCode", tag = "1")]
    pub opcode: i32,
    /// The list of operands, if any, that this instruction uses.
    #[prost(message, repeated, tag = "2")]
    pub operands: Vec<Operand>,
}

/// The fixed instruction set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum OpCode {
    /// Jumps to a named position in the node.
    /// opA = string: label name
    JumpTo = 0,
    /// Pops a string from the stack, and jumps to that named position in
    /// the node.
    /// No operands.
    Jump = 1,
    /// Delivers a line id to the client.
    /// opA = string: line id, opB = float: substitution count
    RunLine = 2,
    /// Delivers a command to the client.
    /// opA = string: command text
    RunCommand = 3,
    /// Adds an entry to the pending option list (see ShowOptions).
    /// opA = string: line id, opB = string: destination label,
    /// opC = float: substitution count (optional),
    /// opD = bool: whether the option carries a condition (optional)
    AddOption = 4,
    /// Presents the pending option list to the client and suspends until
    /// an option is selected.
    /// No operands.
    ShowOptions = 5,
    /// Pushes a string onto the stack.
    /// opA = string: the string to push
    PushString = 6,
    /// Pushes a floating point number onto the stack.
    /// opA = float: number to push
    PushFloat = 7,
    /// Pushes a boolean onto the stack.
    /// opA = bool: the bool to push
    PushBool = 8,
    /// Pushes a null value onto the stack.
    /// No operands.
    PushNull = 9,
    /// Jumps to the named position in the node if the top of the stack is
    /// null, zero or false. The top of the stack is not popped.
    /// opA = string: label name
    JumpIfFalse = 10,
    /// Discards the top of the stack.
    /// No operands.
    Pop = 11,
    /// Calls a registered function. The argument count is popped from the
    /// stack, the callee pops that many arguments, and the result is
    /// pushed.
    /// opA = string: name of the function
    CallFunc = 12,
    /// Pushes the contents of a variable onto the stack.
    /// opA = string: name of variable
    PushVariable = 13,
    /// Stores the contents of the top of the stack in the named variable
    /// without popping it.
    /// opA = string: name of variable
    StoreVariable = 14,
    /// Stops execution of the program.
    /// No operands.
    Stop = 15,
    /// Pops a node name from the stack and runs that node.
    /// No operands.
    RunNode = 16,
}

/// A value used by an Instruction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Operand {
    /// The payload of this operand.
    #[prost(oneof = "operand::Payload", tags = "1, 2, 3")]
    pub value: Option<operand::Payload>,
}

pub mod operand {
    /// The payload of an operand.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        /// A string.
        #[prost(string, tag = "1")]
        StringValue(String),
        /// A boolean (true or false).
        #[prost(bool, tag = "2")]
        BoolValue(bool),
        /// A floating point number.
        #[prost(float, tag = "3")]
        FloatValue(f32),
    }
}

impl Program {
    /// Read and decode a compiled program file.
    pub fn open(path: impl AsRef<Path>) -> Result<Program, DialogueError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| {
            DialogueError::io(format!("cannot read program {}: {}", path.display(), e))
        })?;
        Ok(Program::decode(bytes.as_slice())?)
    }
}

impl Node {
    /// Resolve a label to an instruction index.
    pub fn label(&self, name: &str) -> Option<usize> {
        self.labels.get(name).map(|index| *index as usize)
    }
}

impl Instruction {
    pub fn new(opcode: OpCode, operands: Vec<Operand>) -> Instruction {
        Instruction { opcode: opcode as i32, operands }
    }

    /// Decode the opcode field, rejecting values outside the instruction set.
    pub fn op(&self) -> Result<OpCode, DialogueError> {
        OpCode::try_from(self.opcode)
            .map_err(|_| DialogueError::malformed(format!("unknown opcode {}", self.opcode)))
    }

    fn operand(&self, index: usize) -> Result<&Operand, DialogueError> {
        self.operands.get(index).ok_or_else(|| {
            DialogueError::malformed(format!(
                "{:?} instruction is missing operand {}",
                self.op().unwrap_or(OpCode::Stop),
                index
            ))
        })
    }

    pub fn string_operand(&self, index: usize) -> Result<&str, DialogueError> {
        match &self.operand(index)?.value {
            Some(operand::Payload::StringValue(s)) => Ok(s),
            _ => Err(DialogueError::malformed(format!(
                "operand {} does not hold a string value",
                index
            ))),
        }
    }

    pub fn float_operand(&self, index: usize) -> Result<f32, DialogueError> {
        match &self.operand(index)?.value {
            Some(operand::Payload::FloatValue(n)) => Ok(*n),
            _ => Err(DialogueError::malformed(format!(
                "operand {} does not hold a float value",
                index
            ))),
        }
    }

    pub fn bool_operand(&self, index: usize) -> Result<bool, DialogueError> {
        match &self.operand(index)?.value {
            Some(operand::Payload::BoolValue(b)) => Ok(*b),
            _ => Err(DialogueError::malformed(format!(
                "operand {} does not hold a bool value",
                index
            ))),
        }
    }
}

impl Operand {
    pub fn string(s: impl Into<String>) -> Operand {
        Operand { value: Some(operand::Payload::StringValue(s.into())) }
    }

    pub fn number(n: f32) -> Operand {
        Operand { value: Some(operand::Payload::FloatValue(n)) }
    }

    pub fn boolean(b: bool) -> Operand {
        Operand { value: Some(operand::Payload::BoolValue(b)) }
    }

    /// Convert to a runtime value. A payload-less operand reads as null.
    pub fn to_value(&self) -> Value {
        match &self.value {
            Some(operand::Payload::StringValue(s)) => Value::String(s.clone()),
            Some(operand::Payload::BoolValue(b)) => Value::Bool(*b),
            Some(operand::Payload::FloatValue(n)) => Value::Number(*n),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Instruction, Node, OpCode, Operand, Program};
    use crate::value::Value;
    use prost::Message;
    use std::collections::HashMap;

    #[test]
    fn test_encode_decode_round_trip() {
        let node = Node {
            name: "Start".to_string(),
            instructions: vec![
                Instruction::new(OpCode::PushFloat, vec![Operand::number(3.0)]),
                Instruction::new(OpCode::Stop, vec![]),
            ],
            labels: HashMap::from([("end".to_string(), 1)]),
            tags: vec!["intro".to_string()],
            source_text_string_id: String::new(),
            headers: vec![],
        };
        let program = Program {
            name: "test".to_string(),
            nodes: HashMap::from([("Start".to_string(), node)]),
            initial_values: HashMap::from([("$gold".to_string(), Operand::number(10.0))]),
        };

        let bytes = program.encode_to_vec();
        let decoded = Program::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, program);
        assert_eq!(decoded.nodes["Start"].label("end"), Some(1));
    }

    #[test]
    fn test_operand_accessors_validate_type_and_arity() {
        let inst = Instruction::new(OpCode::RunLine, vec![Operand::string("line:1")]);
        assert_eq!(inst.string_operand(0).unwrap(), "line:1");
        assert!(inst.float_operand(0).is_err());
        assert!(inst.string_operand(1).is_err());
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        let inst = Instruction { opcode: 99, operands: vec![] };
        assert!(inst.op().is_err());
    }

    #[test]
    fn test_operand_value_conversion() {
        assert_eq!(Operand::string("s").to_value(), Value::String("s".to_string()));
        assert_eq!(Operand::number(1.5).to_value(), Value::Number(1.5));
        assert_eq!(Operand::boolean(true).to_value(), Value::Bool(true));
        assert_eq!(Operand { value: None }.to_value(), Value::Null);
    }
}

//! ISA metadata and the instruction decoder seam
//!
//! The generator only needs two things from an instruction set: a [`Decoder`]
//! that turns a byte window into an opcode id plus field values, and
//! [`OpcodeMetadata`] describing each opcode (size, name, format, control flow).
//!
//! [`Isa`] is a table-driven implementation of both, loaded from a JSON
//! [`IsaDescription`]: every instruction names a format, a byte size and the fixed
//! field values that identify it. The first instruction whose fixed fields match
//! the window wins.

use crate::{
    error::{ExprError, IsaError},
    expr::{Bindings, Expr, Scalar, PC_VARIABLE},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;

pub type OpcodeId = u32;

/// One decoded field, in format order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValue {
    pub name: Arc<str>,
    pub value: i64,
    pub signed: bool,
}

impl FieldValue {
    pub fn scalar(&self) -> Scalar {
        Scalar {
            value: self.value,
            signed: self.signed,
        }
    }
}

/// Decoder output for one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFields {
    pub opcode: OpcodeId,
    pub fields: Vec<FieldValue>,
}

/// The window does not start with any known instruction.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no instruction matches the byte window")]
pub struct InvalidInstruction;

/// Bit-field instruction decoder.
///
/// Must be a pure function of `window`, which starts at the instruction and runs
/// to the end of the image.
pub trait Decoder {
    fn decode(&self, window: &[u8]) -> Result<DecodedFields, InvalidInstruction>;
}

/// Read-only per-opcode tables.
///
/// Opcode ids passed in are always ones the paired [`Decoder`] produced.
pub trait OpcodeMetadata {
    fn size_of(&self, opcode: OpcodeId) -> u32;
    fn control_flow_of(&self, opcode: OpcodeId) -> Option<&ControlFlow>;
    fn name_of(&self, opcode: OpcodeId) -> &str;
    fn format_of(&self, opcode: OpcodeId) -> &str;
    /// Highest optimization level the control-flow information supports.
    fn control_info_level(&self) -> u8;
}

/// Control-flow behavior of a branch or jump, as written in the description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlowDescriptor {
    #[serde(default = "default_has_flow")]
    pub has_flow: bool,
    #[serde(default = "default_condition")]
    pub condition: String,
    pub target: String,
    #[serde(default)]
    pub delay_slot_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_slot_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_branch_action: Option<String>,
}

fn default_has_flow() -> bool {
    true
}

fn default_condition() -> String {
    "1".to_string()
}

impl ControlFlowDescriptor {
    /// Unconditional jump to `target` without delay slots.
    pub fn jump(target: impl Into<String>) -> Self {
        Self {
            has_flow: true,
            condition: default_condition(),
            target: target.into(),
            delay_slot_count: 0,
            delay_slot_condition: None,
            post_branch_action: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = condition.into();
        self
    }

    pub fn with_delay_slots(mut self, count: u32, condition: Option<String>) -> Self {
        self.delay_slot_count = count;
        self.delay_slot_condition = condition;
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.post_branch_action = Some(action.into());
        self
    }
}

/// A [`ControlFlowDescriptor`] with its expressions parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFlow {
    pub has_flow: bool,
    pub condition: Expr,
    pub target: Expr,
    pub delay_slot_count: u32,
    pub delay_slot_condition: Option<Expr>,
    pub post_branch_action: Vec<Expr>,
}

impl ControlFlow {
    pub fn compile(descriptor: &ControlFlowDescriptor) -> Result<Self, ExprError> {
        let delay_slot_condition = match &descriptor.delay_slot_condition {
            Some(text) if !text.trim().is_empty() => Some(Expr::parse(text)?),
            _ => None,
        };
        let post_branch_action = match &descriptor.post_branch_action {
            Some(text) => Expr::parse_statements(text)?,
            None => Vec::new(),
        };
        Ok(Self {
            has_flow: descriptor.has_flow,
            condition: Expr::parse(&descriptor.condition)?,
            target: Expr::parse(&descriptor.target)?,
            delay_slot_count: descriptor.delay_slot_count,
            delay_slot_condition,
            post_branch_action,
        })
    }
}

/// Binds field names and `ac_pc` for one decoded instruction.
///
/// Fields shadow `ac_pc`.
pub struct FieldBindings<'a> {
    fields: &'a [FieldValue],
    pc: u32,
}

impl<'a> FieldBindings<'a> {
    pub fn new(fields: &'a [FieldValue], pc: u32) -> Self {
        Self { fields, pc }
    }
}

impl Bindings for FieldBindings<'_> {
    fn lookup(&self, name: &str) -> Option<Scalar> {
        self.fields
            .iter()
            .find(|field| &*field.name == name)
            .map(FieldValue::scalar)
            .or_else(|| (name == PC_VARIABLE).then(|| Scalar::unsigned(self.pc as u64)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescription {
    pub name: String,
    /// Position of the least significant bit within the instruction word.
    pub lsb: u32,
    pub width: u32,
    #[serde(default)]
    pub signed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescription {
    pub name: String,
    pub fields: Vec<FieldDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionDescription {
    pub name: String,
    pub format: String,
    pub size: u32,
    /// Fixed field values identifying the instruction.
    #[serde(default)]
    pub decode: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_flow: Option<ControlFlowDescriptor>,
}

/// Serialized form of an instruction set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsaDescription {
    pub name: String,
    #[serde(default)]
    pub endianness: Endianness,
    #[serde(default)]
    pub control_info_level: u8,
    pub formats: Vec<FormatDescription>,
    pub instructions: Vec<InstructionDescription>,
}

struct Format {
    name: String,
    fields: Vec<Field>,
}

struct Field {
    name: Arc<str>,
    lsb: u32,
    width: u32,
    signed: bool,
}

impl Field {
    fn extract(&self, word: u64) -> u64 {
        let raw = word >> self.lsb;
        if self.width >= 64 {
            raw
        } else {
            raw & ((1u64 << self.width) - 1)
        }
    }

    fn value(&self, word: u64) -> i64 {
        let raw = self.extract(word);
        if self.signed && self.width < 64 {
            let shift = 64 - self.width;
            ((raw << shift) as i64) >> shift
        } else {
            raw as i64
        }
    }
}

struct Instruction {
    name: String,
    format: usize,
    size: u32,
    decode: Vec<(usize, u64)>,
    control_flow: Option<ControlFlow>,
}

/// Table-driven ISA loaded from an [`IsaDescription`].
pub struct Isa {
    name: String,
    endianness: Endianness,
    control_info_level: u8,
    formats: Vec<Format>,
    instructions: Vec<Instruction>,
}

impl Isa {
    pub fn from_json(text: &str) -> Result<Self, IsaError> {
        let description: IsaDescription = serde_json::from_str(text)?;
        Self::from_description(description)
    }

    /// Validates the description and parses every control-flow expression.
    pub fn from_description(description: IsaDescription) -> Result<Self, IsaError> {
        let formats: Vec<Format> = description
            .formats
            .into_iter()
            .map(|format| Format {
                name: format.name,
                fields: format
                    .fields
                    .into_iter()
                    .map(|field| Field {
                        name: Arc::from(field.name),
                        lsb: field.lsb,
                        width: field.width,
                        signed: field.signed,
                    })
                    .collect(),
            })
            .collect();

        let mut instructions = Vec::with_capacity(description.instructions.len());
        for instr in description.instructions {
            let format_idx = formats
                .iter()
                .position(|format| format.name == instr.format)
                .ok_or_else(|| IsaError::UnknownFormat {
                    instr: instr.name.clone(),
                    format: instr.format.clone(),
                })?;
            if instr.size == 0 {
                return Err(IsaError::ZeroSize { instr: instr.name });
            }
            if instr.size > 8 {
                return Err(IsaError::TooWide {
                    instr: instr.name,
                    size: instr.size,
                });
            }

            let format = &formats[format_idx];
            let bits = instr.size * 8;
            if let Some(field) = format
                .fields
                .iter()
                .find(|field| {
                    field.width == 0
                        || field.lsb >= 64
                        || field.lsb.checked_add(field.width).map_or(true, |end| end > bits)
                })
            {
                return Err(IsaError::FieldOutOfRange {
                    format: format.name.clone(),
                    field: field.name.to_string(),
                    bits,
                });
            }

            let mut decode = Vec::with_capacity(instr.decode.len());
            for (name, value) in &instr.decode {
                let idx = format
                    .fields
                    .iter()
                    .position(|field| &*field.name == name)
                    .ok_or_else(|| IsaError::UnknownDecodeField {
                        instr: instr.name.clone(),
                        field: name.clone(),
                    })?;
                decode.push((idx, *value));
            }

            let control_flow = instr
                .control_flow
                .as_ref()
                .map(ControlFlow::compile)
                .transpose()
                .map_err(|source| IsaError::Expression {
                    instr: instr.name.clone(),
                    source,
                })?;

            instructions.push(Instruction {
                name: instr.name,
                format: format_idx,
                size: instr.size,
                decode,
                control_flow,
            });
        }

        Ok(Self {
            name: description.name,
            endianness: description.endianness,
            control_info_level: description.control_info_level,
            formats,
            instructions,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    fn read_word(&self, bytes: &[u8]) -> u64 {
        match self.endianness {
            Endianness::Big => bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64),
            Endianness::Little => bytes
                .iter()
                .rev()
                .fold(0u64, |acc, b| (acc << 8) | *b as u64),
        }
    }

    fn instruction(&self, opcode: OpcodeId) -> Option<&Instruction> {
        self.instructions.get(opcode as usize)
    }
}

impl Decoder for Isa {
    fn decode(&self, window: &[u8]) -> Result<DecodedFields, InvalidInstruction> {
        for (id, instr) in self.instructions.iter().enumerate() {
            let Some(bytes) = window.get(..instr.size as usize) else {
                continue;
            };
            let word = self.read_word(bytes);
            let format = &self.formats[instr.format];
            let matches = instr
                .decode
                .iter()
                .all(|(idx, value)| format.fields[*idx].extract(word) == *value);
            if !matches {
                continue;
            }

            let fields = format
                .fields
                .iter()
                .map(|field| FieldValue {
                    name: field.name.clone(),
                    value: field.value(word),
                    signed: field.signed,
                })
                .collect();
            return Ok(DecodedFields {
                opcode: id as OpcodeId,
                fields,
            });
        }
        Err(InvalidInstruction)
    }
}

impl OpcodeMetadata for Isa {
    fn size_of(&self, opcode: OpcodeId) -> u32 {
        self.instruction(opcode).map_or(0, |instr| instr.size)
    }

    fn control_flow_of(&self, opcode: OpcodeId) -> Option<&ControlFlow> {
        self.instruction(opcode)?.control_flow.as_ref()
    }

    fn name_of(&self, opcode: OpcodeId) -> &str {
        self.instruction(opcode).map_or("", |instr| &instr.name)
    }

    fn format_of(&self, opcode: OpcodeId) -> &str {
        self.instruction(opcode)
            .map_or("", |instr| &self.formats[instr.format].name)
    }

    fn control_info_level(&self) -> u8 {
        self.control_info_level
    }
}

//! Error types for region generation

use std::path::PathBuf;
use thiserror::Error;

/// A malformed expression in a control-flow descriptor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot parse `{source_text}` at offset {offset}: {message}")]
pub struct ExprError {
    pub source_text: String,
    pub offset: usize,
    pub message: String,
}

/// Problems found while loading or validating an ISA description.
#[derive(Error, Debug)]
pub enum IsaError {
    #[error("instruction `{instr}` refers to unknown format `{format}`")]
    UnknownFormat { instr: String, format: String },

    #[error("instruction `{instr}` has zero size")]
    ZeroSize { instr: String },

    #[error("field `{field}` of format `{format}` does not fit in {bits} bits")]
    FieldOutOfRange {
        format: String,
        field: String,
        bits: u32,
    },

    #[error("instruction `{instr}` decodes on unknown field `{field}`")]
    UnknownDecodeField { instr: String, field: String },

    #[error("instruction `{instr}` is {size} bytes, wider than the 8-byte decode window")]
    TooWide { instr: String, size: u32 },

    #[error("control flow of `{instr}`: {source}")]
    Expression {
        instr: String,
        #[source]
        source: ExprError,
    },

    #[error("failed to parse ISA description: {0}")]
    Json(#[from] serde_json::Error),
}

/// Problems loading a program image.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to parse ELF: {0}")]
    Elf(#[from] elf::ParseError),

    #[error("ELF has no loadable segments")]
    NoLoadableSegments,

    #[error("segment at {vaddr:#x} with size {size:#x} exceeds the 32-bit address space")]
    SegmentOutOfRange { vaddr: u64, size: u64 },

    #[error("image is empty")]
    Empty,
}

/// Top-level generation error.
#[derive(Error, Debug)]
pub enum GenError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "delay slot of `{opcode}` at {branch:#x} is not decoded (slot address {slot:#x}); \
         the generated program would skip it"
    )]
    UndecodedDelaySlot {
        opcode: String,
        branch: u32,
        slot: u32,
    },

    #[error("control flow of `{opcode}` at {address:#x} runs past the 32-bit address space")]
    AddressOverflow { opcode: String, address: u32 },

    #[error("image of {0} bytes does not fit in the 32-bit address space")]
    ImageTooLarge(usize),

    #[error(transparent)]
    Isa(#[from] IsaError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("generated code for {unit} does not parse: {source}")]
    Syntax {
        unit: String,
        #[source]
        source: syn::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

impl GenError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = GenError> = std::result::Result<T, E>;

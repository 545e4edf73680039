//! Compiled Simulation Code Generation
//!
//! This crate turns a program image and an instruction-set description into
//! Rust crates that simulate the program ahead of time: one function per
//! address region, grouped into region block crates, plus a dispatcher crate.

pub mod compiler;
pub mod config;
pub mod constants;
pub mod decode_table;
pub mod emitter;
pub mod error;
pub mod expr;
pub mod image;
pub mod isa;
pub mod leaders;
pub mod region;
pub mod render;
pub mod report;

// Re-export key types for convenience
pub use compiler::{CompsimCompiler, GeneratedProgram, GeneratedUnit};
pub use config::{GenConfig, OptLevel};
pub use decode_table::{DecodeTable, DecodeTableBuilder, DecodedInstruction, GenerationContext};
pub use emitter::{EmitPolicy, InstructionEmitter, RegionCode};
pub use error::{GenError, Result};
pub use expr::{Expr, Scalar};
pub use image::{LoadedImage, ProgramImage};
pub use isa::{ControlFlow, ControlFlowDescriptor, Decoder, Isa, IsaDescription, OpcodeMetadata};
pub use leaders::{LeaderAnalyzer, LeaderOrigin, LeaderSet};
pub use region::RegionLayout;
pub use report::GenerationReport;

//! Decode table construction
//!
//! One forward pass over the image from address 0. A successful decode records
//! the instruction and advances by its size; a failed one is counted and the
//! scan moves on by the minimum instruction size. Control-flow instructions feed
//! the [`LeaderAnalyzer`] as soon as they are decoded.

use crate::{
    constants,
    error::{GenError, Result},
    image::ProgramImage,
    isa::{Decoder, FieldBindings, FieldValue, OpcodeId, OpcodeMetadata},
    leaders::{LeaderAnalyzer, LeaderOrigin, LeaderSet},
};
use log::{debug, info, warn};
use std::{collections::BTreeMap, ops::RangeBounds};

/// An instruction decoded at a fixed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub address: u32,
    pub opcode: OpcodeId,
    pub fields: Vec<FieldValue>,
    pub size: u32,
}

impl DecodedInstruction {
    /// Field values plus `ac_pc`, for evaluating control-flow expressions.
    pub fn bindings(&self) -> FieldBindings<'_> {
        FieldBindings::new(&self.fields, self.address)
    }

    /// Address `k` instructions of this size further on.
    pub fn offset(&self, k: u32) -> Option<u32> {
        k.checked_mul(self.size)
            .and_then(|delta| self.address.checked_add(delta))
    }

    /// Address execution continues at when a branch is not taken.
    pub fn fallthrough(&self, delay_slot_count: u32) -> Option<u32> {
        delay_slot_count
            .checked_add(1)
            .and_then(|k| self.offset(k))
    }

    /// Address right after this instruction.
    pub fn end(&self) -> Option<u32> {
        self.address.checked_add(self.size)
    }
}

/// Sparse, ordered map from address to decoded instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeTable {
    entries: BTreeMap<u32, DecodedInstruction>,
}

impl DecodeTable {
    /// Records `instr`. An address that already holds a record keeps it.
    pub(crate) fn insert(&mut self, instr: DecodedInstruction) -> bool {
        match self.entries.entry(instr.address) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(instr);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, address: u32) -> Option<&DecodedInstruction> {
        self.entries.get(&address)
    }

    pub fn contains(&self, address: u32) -> bool {
        self.entries.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DecodedInstruction> {
        self.entries.values()
    }

    pub fn addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    /// Instructions whose start address lies in `range`.
    pub fn range<R>(&self, range: R) -> impl Iterator<Item = &DecodedInstruction>
    where
        R: RangeBounds<u32>,
    {
        self.entries.range(range).map(|(_, instr)| instr)
    }
}

/// Everything one generation pass knows about the program.
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    table: DecodeTable,
    leaders: LeaderSet,
    invalid_count: usize,
    usage: BTreeMap<OpcodeId, usize>,
    image_size: u32,
}

impl GenerationContext {
    pub fn table(&self) -> &DecodeTable {
        &self.table
    }

    pub fn leaders(&self) -> &LeaderSet {
        &self.leaders
    }

    /// Leader set, for adding externally known leaders before emission.
    pub fn leaders_mut(&mut self) -> &mut LeaderSet {
        &mut self.leaders
    }

    pub fn invalid_count(&self) -> usize {
        self.invalid_count
    }

    /// How many times each opcode was decoded.
    pub fn usage(&self) -> &BTreeMap<OpcodeId, usize> {
        &self.usage
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Leader origin of `address`, if it is a leader.
    pub fn is_leader(&self, address: u32) -> Option<LeaderOrigin> {
        self.leaders.origin(address)
    }
}

/// Builds the [`GenerationContext`] for one image.
pub struct DecodeTableBuilder<'a, D: ?Sized, M: ?Sized> {
    decoder: &'a D,
    metadata: &'a M,
    min_instruction_size: u32,
}

impl<'a, D, M> DecodeTableBuilder<'a, D, M>
where
    D: Decoder + ?Sized,
    M: OpcodeMetadata + ?Sized,
{
    pub fn new(decoder: &'a D, metadata: &'a M, min_instruction_size: u32) -> Self {
        Self {
            decoder,
            metadata,
            min_instruction_size,
        }
    }

    pub fn build(&self, image: ProgramImage<'_>) -> Result<GenerationContext> {
        if self.min_instruction_size == 0 {
            return Err(GenError::InvalidConfig(
                "minimum instruction size must be at least 1".to_string(),
            ));
        }
        let bytes = image.bytes();
        // Addresses are u32; the last byte must be addressable.
        let image_size = u32::try_from(bytes.len())
            .map_err(|_| GenError::ImageTooLarge(bytes.len()))?;

        let mut ctx = GenerationContext {
            image_size,
            ..GenerationContext::default()
        };
        let mut cursor = 0usize;

        while cursor < bytes.len() {
            let address = cursor as u32;
            match self.decoder.decode(&bytes[cursor..]) {
                Ok(decoded) => {
                    let size = self.metadata.size_of(decoded.opcode);
                    let record = DecodedInstruction {
                        address,
                        opcode: decoded.opcode,
                        fields: decoded.fields,
                        size,
                    };
                    *ctx.usage.entry(record.opcode).or_default() += 1;

                    if let Some(flow) = self.metadata.control_flow_of(record.opcode) {
                        if flow.has_flow {
                            LeaderAnalyzer::analyze(&record, flow, &mut ctx.leaders);
                        }
                    }

                    ctx.table.insert(record);
                    cursor += size.max(1) as usize;
                }
                Err(_) => {
                    let step = self.min_instruction_size as usize;
                    let dump_end = bytes
                        .len()
                        .min(cursor + step.min(constants::INVALID_DUMP_BYTES));
                    debug!(
                        "invalid instruction at {:#x}, skipping {} bytes (dump: {:02x?})",
                        address,
                        step,
                        &bytes[cursor..dump_end]
                    );
                    ctx.invalid_count += 1;
                    cursor += step;
                }
            }
        }

        if ctx.invalid_count > 0 {
            warn!("{} invalid instructions were not decoded", ctx.invalid_count);
        }
        info!(
            "application size: {} bytes, {} instructions, {} leaders",
            image_size,
            ctx.table.len(),
            ctx.leaders.len()
        );

        Ok(ctx)
    }
}

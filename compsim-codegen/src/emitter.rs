//! Instruction emission
//!
//! Turns the decoded instructions of one region into structured dispatch
//! entries. The four policies trade dispatch entries and returns to the region
//! dispatcher for straight-line code:
//!
//! | level | labelled entries            | return to dispatcher after      |
//! |-------|-----------------------------|---------------------------------|
//! | 0     | every instruction           | every instruction               |
//! | 1     | every instruction           | branches and their delay slots  |
//! | 2     | every instruction           | branches, resolved inline       |
//! | 3     | leaders and region entries  | branches and their delay slots  |
//!
//! Where execution returns to the dispatcher is decided once over the whole
//! decode table, so splitting the program into regions never changes it.

use crate::{
    decode_table::{DecodedInstruction, GenerationContext},
    error::{GenError, Result},
    expr::{Expr, Scalar},
    isa::{ControlFlow, OpcodeMetadata},
    region::RegionLayout,
};
use std::collections::BTreeSet;

/// Code-shape policy, one per optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EmitPolicy {
    /// Level 0
    Baseline,
    /// Level 1
    ElideBreaks,
    /// Level 2
    InlineBranches,
    /// Level 3
    LeadersOnly,
}

impl EmitPolicy {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(EmitPolicy::Baseline),
            1 => Some(EmitPolicy::ElideBreaks),
            2 => Some(EmitPolicy::InlineBranches),
            3 => Some(EmitPolicy::LeadersOnly),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            EmitPolicy::Baseline => 0,
            EmitPolicy::ElideBreaks => 1,
            EmitPolicy::InlineBranches => 2,
            EmitPolicy::LeadersOnly => 3,
        }
    }
}

/// Behavior calls for one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub address: u32,
    pub name: String,
    pub format: String,
    pub size_bits: u32,
    pub args: Vec<Scalar>,
}

/// A delay-slot instruction executed inside a resolved branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelaySlot {
    /// Executed only when this holds; always when absent.
    pub guard: Option<Expr>,
    pub invocation: Invocation,
}

/// A branch resolved at generation time into a two-way choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineBranch {
    pub address: u32,
    pub name: String,
    pub condition: Expr,
    /// A literal address when the target folds at generation time.
    pub target: Expr,
    pub action: Vec<Expr>,
    pub not_taken: u32,
    pub delay_slots: Vec<DelaySlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBody {
    /// Trace, behavior calls, instruction counter.
    Execute(Invocation),
    /// Sets the program counter from the branch outcome.
    Branch(InlineBranch),
}

/// What happens after an entry's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    FallThrough,
    Dispatch,
}

/// One decoded instruction in emitted form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEntry {
    pub address: u32,
    /// Whether the region dispatcher can jump straight here.
    pub label: bool,
    pub body: EntryBody,
    pub exit: Exit,
}

/// Emitted form of one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionCode {
    pub index: u32,
    pub entries: Vec<DispatchEntry>,
    /// Program counter set when execution runs off the last entry.
    pub tail_pc: u32,
    /// Stop successfully when the dispatcher lands here. Only set in the owning region.
    pub exit_address: Option<u32>,
}

impl RegionCode {
    pub fn label_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.label).count()
    }
}

/// Emits regions under one [`EmitPolicy`].
pub struct InstructionEmitter<'a, M: ?Sized> {
    ctx: &'a GenerationContext,
    metadata: &'a M,
    layout: RegionLayout,
    policy: EmitPolicy,
    exit_address: Option<u32>,
    dispatch_after: BTreeSet<u32>,
}

impl<'a, M> InstructionEmitter<'a, M>
where
    M: OpcodeMetadata + ?Sized,
{
    pub fn new(
        ctx: &'a GenerationContext,
        metadata: &'a M,
        layout: RegionLayout,
        policy: EmitPolicy,
        exit_address: Option<u32>,
    ) -> Self {
        let mut emitter = Self {
            ctx,
            metadata,
            layout,
            policy,
            exit_address,
            dispatch_after: BTreeSet::new(),
        };
        if matches!(policy, EmitPolicy::ElideBreaks | EmitPolicy::LeadersOnly) {
            emitter.dispatch_after = emitter.branch_exits();
        }
        emitter
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    fn flow_of(&self, instr: &DecodedInstruction) -> Option<&'a ControlFlow> {
        self.metadata
            .control_flow_of(instr.opcode)
            .filter(|flow| flow.has_flow)
    }

    /// Addresses after which execution returns to the dispatcher: each branch and
    /// the delay slots that follow it, counted in decode-table order.
    fn branch_exits(&self) -> BTreeSet<u32> {
        let mut exits = BTreeSet::new();
        let mut pending = 0u32;
        for instr in self.ctx.table().iter() {
            if let Some(flow) = self.flow_of(instr) {
                pending = flow.delay_slot_count.saturating_add(1);
            }
            if pending > 0 {
                pending -= 1;
                exits.insert(instr.address);
            }
        }
        exits
    }

    fn invocation(&self, instr: &DecodedInstruction) -> Invocation {
        Invocation {
            address: instr.address,
            name: self.metadata.name_of(instr.opcode).to_string(),
            format: self.metadata.format_of(instr.opcode).to_string(),
            size_bits: instr.size.saturating_mul(8),
            args: instr.fields.iter().map(|field| field.scalar()).collect(),
        }
    }

    fn inline_branch(&self, instr: &DecodedInstruction, flow: &ControlFlow) -> Result<InlineBranch> {
        let name = self.metadata.name_of(instr.opcode).to_string();
        let bindings = instr.bindings();
        let not_taken =
            instr
                .fallthrough(flow.delay_slot_count)
                .ok_or_else(|| GenError::AddressOverflow {
                    opcode: name.clone(),
                    address: instr.address,
                })?;

        let mut delay_slots = Vec::with_capacity(flow.delay_slot_count as usize);
        for k in 1..=flow.delay_slot_count {
            let slot_instr = instr
                .offset(k)
                .and_then(|slot| self.ctx.table().get(slot))
                .ok_or_else(|| GenError::UndecodedDelaySlot {
                    opcode: name.clone(),
                    branch: instr.address,
                    slot: instr.address.wrapping_add(k.wrapping_mul(instr.size)),
                })?;
            delay_slots.push(DelaySlot {
                guard: flow
                    .delay_slot_condition
                    .as_ref()
                    .map(|guard| guard.substitute(&bindings)),
                invocation: self.invocation(slot_instr),
            });
        }

        let target = match flow.target.evaluate(&bindings).map(u32::try_from) {
            Some(Ok(address)) => Expr::Lit(Scalar::unsigned(address.into())),
            _ => flow.target.substitute(&bindings),
        };

        Ok(InlineBranch {
            address: instr.address,
            condition: flow.condition.substitute(&bindings),
            target,
            action: flow
                .post_branch_action
                .iter()
                .map(|stmt| stmt.substitute(&bindings))
                .collect(),
            not_taken,
            delay_slots,
            name,
        })
    }

    /// Emits the entries of `region`.
    pub fn emit_region(&self, region: u32) -> Result<RegionCode> {
        let bounds = self.layout.region_bounds(region);
        let instrs: Vec<&DecodedInstruction> = self.ctx.table().range(bounds).collect();
        let region_entry = instrs.first().map(|instr| instr.address);

        let mut entries = Vec::with_capacity(instrs.len());
        for instr in &instrs {
            let label = match self.policy {
                EmitPolicy::LeadersOnly => {
                    self.ctx.is_leader(instr.address).is_some()
                        || Some(instr.address) == region_entry
                }
                _ => true,
            };

            let (body, exit) = match (self.policy, self.flow_of(instr)) {
                (EmitPolicy::Baseline, _) => (EntryBody::Execute(self.invocation(instr)), Exit::Dispatch),
                (EmitPolicy::InlineBranches, Some(flow)) => {
                    (EntryBody::Branch(self.inline_branch(instr, flow)?), Exit::Dispatch)
                }
                (EmitPolicy::InlineBranches, None) => {
                    (EntryBody::Execute(self.invocation(instr)), Exit::FallThrough)
                }
                (EmitPolicy::ElideBreaks | EmitPolicy::LeadersOnly, _) => {
                    let exit = if self.dispatch_after.contains(&instr.address) {
                        Exit::Dispatch
                    } else {
                        Exit::FallThrough
                    };
                    (EntryBody::Execute(self.invocation(instr)), exit)
                }
            };

            entries.push(DispatchEntry {
                address: instr.address,
                label,
                body,
                exit,
            });
        }

        let tail_pc = match instrs.last() {
            Some(last) => last.address.wrapping_add(last.size),
            None => self.layout.next_region_start(region),
        };
        let exit_address = self
            .exit_address
            .filter(|addr| self.layout.region_of(*addr) == region);

        Ok(RegionCode {
            index: region,
            entries,
            tail_pc,
            exit_address,
        })
    }
}

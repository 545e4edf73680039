//! Leader analysis
//!
//! A leader is an address the generated code must be able to enter directly:
//! a resolved branch target, or the fallthrough after a branch and its delay
//! slots. The set only grows. Leaders with no decoded instruction behind them are
//! kept and simply never labelled.

use crate::{
    decode_table::DecodedInstruction,
    error::{GenError, Result},
    isa::ControlFlow,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};

/// Who first made an address a leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaderOrigin {
    /// Discovered by the control-flow instruction at this address.
    Branch(u32),
    /// Listed in an external leaders file.
    External,
}

/// Ordered, monotonically growing set of leader addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderSet {
    leaders: BTreeMap<u32, LeaderOrigin>,
}

impl LeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `address`. The first origin recorded for an address is kept.
    /// Returns true when the address was not a leader before.
    pub fn insert(&mut self, address: u32, origin: LeaderOrigin) -> bool {
        match self.leaders.entry(address) {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(origin);
                true
            }
            std::collections::btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn contains(&self, address: u32) -> bool {
        self.leaders.contains_key(&address)
    }

    pub fn origin(&self, address: u32) -> Option<LeaderOrigin> {
        self.leaders.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.leaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaders.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, LeaderOrigin)> + '_ {
        self.leaders.iter().map(|(addr, origin)| (*addr, *origin))
    }

    pub fn addresses(&self) -> impl Iterator<Item = u32> + '_ {
        self.leaders.keys().copied()
    }
}

/// Addresses one control-flow instruction contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Discovery {
    pub target: Option<u32>,
    pub next: Option<u32>,
    pub safety: Option<u32>,
}

/// Adds the leaders implied by control-flow instructions.
pub struct LeaderAnalyzer;

impl LeaderAnalyzer {
    /// Records the leaders of `record`, which carries control-flow descriptor `flow`.
    ///
    /// The target is added only when it folds to a constant that fits in 32 bits.
    /// The fallthrough `next` skips the delay slots, and one more instruction of
    /// the branch's own size after it is added as well.
    pub fn analyze(
        record: &DecodedInstruction,
        flow: &ControlFlow,
        leaders: &mut LeaderSet,
    ) -> Discovery {
        let origin = LeaderOrigin::Branch(record.address);
        let mut discovery = Discovery::default();

        match flow.target.evaluate(&record.bindings()) {
            Some(target) => match u32::try_from(target) {
                Ok(target) => {
                    leaders.insert(target, origin);
                    discovery.target = Some(target);
                }
                Err(_) => debug!(
                    "target {:#x} of branch at {:#x} is outside the address space",
                    target, record.address
                ),
            },
            None => debug!(
                "target `{}` of branch at {:#x} is not a constant",
                flow.target, record.address
            ),
        }

        discovery.next = record.fallthrough(flow.delay_slot_count);
        if let Some(next) = discovery.next {
            leaders.insert(next, origin);
            discovery.safety = next.checked_add(record.size);
            if let Some(safety) = discovery.safety {
                leaders.insert(safety, origin);
            }
        }

        discovery
    }
}

/// Default leaders file for a program: `<program>.leaders`.
pub fn leaders_file_for(program: &Path) -> std::path::PathBuf {
    let mut name = program.as_os_str().to_owned();
    name.push(".");
    name.push(crate::constants::LEADERS_EXTENSION);
    name.into()
}

/// Parses whitespace-separated hex addresses, with or without `0x`.
///
/// Addresses above `image_size` are dropped. Tokens that are not hex are
/// skipped with a warning.
pub fn parse_leaders(text: &str, image_size: u32) -> Vec<u32> {
    let mut out = Vec::new();
    for token in text.split_whitespace() {
        let digits = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        match u32::from_str_radix(digits, 16) {
            Ok(addr) if addr <= image_size => out.push(addr),
            Ok(addr) => info!(
                "leader {:#x} is beyond the program size ({:#x}), ignored",
                addr, image_size
            ),
            Err(_) => warn!("ignoring malformed leader `{}`", token),
        }
    }
    out
}

/// Adds the leaders listed in `path` with origin [`LeaderOrigin::External`].
///
/// A missing file is reported and ignored. Returns how many addresses were new.
pub fn load_leaders_file(path: &Path, image_size: u32, leaders: &mut LeaderSet) -> Result<usize> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("leaders file {} does not exist", path.display());
            return Ok(0);
        }
        Err(e) => return Err(GenError::io(path, e)),
    };

    info!("loading leaders from {}", path.display());
    let added = parse_leaders(&text, image_size)
        .into_iter()
        .filter(|addr| leaders.insert(*addr, LeaderOrigin::External))
        .count();
    Ok(added)
}

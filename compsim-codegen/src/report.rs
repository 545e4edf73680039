//! Generation Report
//!
//! Summary of one generation pass: what was decoded, how it was partitioned and
//! how many dispatch entries each region block carries. Always logged, and saved
//! as `report.json` when requested.

use crate::{
    emitter::{Exit, RegionCode},
    error::{GenError, Result},
};
use log::info;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};

/// Statistics for one region block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    /// Region block index
    pub block: u32,
    /// Package name of the generated crate
    pub crate_name: String,
    pub first_region: u32,
    pub region_count: u32,
    /// Decoded instructions emitted in this block
    pub instructions: usize,
    /// Labelled entries reachable from the region dispatcher
    pub dispatch_entries: usize,
    /// Entries that return to the region dispatcher afterwards
    pub dispatch_exits: usize,
}

impl UnitReport {
    pub fn new(block: u32, crate_name: String, first_region: u32, regions: &[RegionCode]) -> Self {
        let entries = regions.iter().flat_map(|region| region.entries.iter());
        let (instructions, dispatch_entries, dispatch_exits) =
            entries.fold((0, 0, 0), |(n, labels, exits), entry| {
                (
                    n + 1,
                    labels + entry.label as usize,
                    exits + (entry.exit == Exit::Dispatch) as usize,
                )
            });
        Self {
            block,
            crate_name,
            first_region,
            region_count: regions.len() as u32,
            instructions,
            dispatch_entries,
            dispatch_exits,
        }
    }
}

/// Complete generation report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub image_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<u32>,
    pub decoded_instructions: usize,
    pub invalid_instructions: usize,
    pub leaders: usize,
    /// Leaders added from an external leaders file
    pub external_leaders: usize,
    /// Optimization level actually used
    pub opt_level: u8,
    pub region_size: u32,
    pub region_block_size: u32,
    pub region_count: u32,
    pub unit_count: usize,
    pub total_dispatch_entries: usize,
    pub avg_dispatch_entries_per_unit: f64,
    pub units: Vec<UnitReport>,
    /// Decoded instruction count per instruction name
    pub instruction_usage: BTreeMap<String, usize>,
}

impl GenerationReport {
    /// Save the report to a JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| GenError::io(path, e))
    }

    pub(crate) fn finish_totals(&mut self) {
        self.unit_count = self.units.len();
        self.total_dispatch_entries = self.units.iter().map(|unit| unit.dispatch_entries).sum();
        self.avg_dispatch_entries_per_unit = if self.unit_count > 0 {
            self.total_dispatch_entries as f64 / self.unit_count as f64
        } else {
            0.0
        };
    }

    /// Logs the pass summary and the instruction usage table.
    pub fn log_summary(&self) {
        info!(
            "application size: {} bytes, {} instructions, {} invalid",
            self.image_size, self.decoded_instructions, self.invalid_instructions
        );
        info!(
            "level {}: {} regions in {} region blocks, {} dispatch entries, {} leaders ({} external)",
            self.opt_level,
            self.region_count,
            self.unit_count,
            self.total_dispatch_entries,
            self.leaders,
            self.external_leaders
        );
        for (name, count) in &self.instruction_usage {
            info!("    {} #{}", name, count);
        }
    }
}

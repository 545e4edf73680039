//! Region partitioning
//!
//! The address space is cut into fixed-size regions, and runs of regions are
//! grouped into region blocks. Each region becomes one function in the generated
//! code; each region block becomes one crate. An instruction belongs to the region
//! holding its first byte.

use crate::error::{GenError, Result};
use std::ops::{Range, RangeInclusive};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    region_size: u32,
    region_shift: u32,
    region_block_size: u32,
    region_count: u32,
    region_block_count: u32,
}

impl RegionLayout {
    pub fn new(image_size: u32, region_size: u32, region_block_size: u32) -> Result<Self> {
        if !region_size.is_power_of_two() {
            return Err(GenError::InvalidConfig(format!(
                "region size {} is not a power of two",
                region_size
            )));
        }
        if region_block_size == 0 {
            return Err(GenError::InvalidConfig(
                "region block size must be at least 1".to_string(),
            ));
        }

        let region_count = image_size.div_ceil(region_size);
        let region_block_count = region_count.div_ceil(region_block_size);
        Ok(Self {
            region_size,
            region_shift: region_size.trailing_zeros(),
            region_block_size,
            region_count,
            region_block_count,
        })
    }

    pub fn region_size(&self) -> u32 {
        self.region_size
    }

    pub fn region_shift(&self) -> u32 {
        self.region_shift
    }

    pub fn region_block_size(&self) -> u32 {
        self.region_block_size
    }

    pub fn region_count(&self) -> u32 {
        self.region_count
    }

    pub fn region_block_count(&self) -> u32 {
        self.region_block_count
    }

    pub fn region_of(&self, address: u32) -> u32 {
        address >> self.region_shift
    }

    pub fn region_start(&self, region: u32) -> u32 {
        region << self.region_shift
    }

    /// Addresses covered by `region`, inclusive so the top region can end at `u32::MAX`.
    pub fn region_bounds(&self, region: u32) -> RangeInclusive<u32> {
        let start = self.region_start(region);
        start..=start + (self.region_size - 1)
    }

    /// First address of the region after `region`, wrapping at the top of memory.
    pub fn next_region_start(&self, region: u32) -> u32 {
        self.region_start(region).wrapping_add(self.region_size)
    }

    /// Region indices making up `block`.
    pub fn block_regions(&self, block: u32) -> Range<u32> {
        let first = block.saturating_mul(self.region_block_size);
        let last = first
            .saturating_add(self.region_block_size)
            .min(self.region_count);
        first.min(last)..last
    }

    pub fn blocks(&self) -> Range<u32> {
        0..self.region_block_count
    }
}

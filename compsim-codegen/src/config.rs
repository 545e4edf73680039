//! Generator Configuration

use crate::{
    constants,
    error::{GenError, Result},
};
use std::path::PathBuf;

/// Requested code shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OptLevel {
    /// Use the highest level the ISA metadata supports.
    #[default]
    BestAvailable,
    /// A fixed level in `0..=3`.
    Level(u8),
}

impl OptLevel {
    /// Parses `-1` (best available) or `0..=3`.
    pub fn from_arg(value: i32) -> Option<Self> {
        match value {
            -1 => Some(OptLevel::BestAvailable),
            0..=3 => Some(OptLevel::Level(value as u8)),
            _ => None,
        }
    }
}

/// Configuration for one generation run
#[derive(Debug, Clone)]
pub struct GenConfig {
    /// Output directory for the dispatcher crate and its region block crates.
    /// Recreated on every run.
    pub output_path: PathBuf,

    /// Region size in bytes. Must be a power of two.
    pub region_size: u32,

    /// Regions per region block (generated crate).
    pub region_block_size: u32,

    /// Resynchronization step after an invalid instruction.
    pub min_instruction_size: u32,

    pub opt_level: OptLevel,

    /// Address at which the generated program stops with success.
    pub exit_address: Option<u32>,

    /// Name of the runtime crate providing `Simulator` and the `isa` behaviors.
    pub runtime_crate: String,

    /// Path to the runtime crate, relative to `output_path`.
    pub runtime_path: String,

    /// Package name prefix of the region block crates.
    pub unit_prefix: String,

    /// Emit region blocks on the rayon pool.
    pub parallel_emission: bool,

    /// Extra leaders, one hex address per entry. Only read at level 3.
    pub extra_leaders_path: Option<PathBuf>,

    /// Write `report.json` into the output directory
    pub save_report: bool,
}

impl GenConfig {
    /// Create a new configuration with default settings
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            region_size: constants::DEFAULT_REGION_SIZE,
            region_block_size: constants::DEFAULT_REGION_BLOCK_SIZE,
            min_instruction_size: constants::DEFAULT_MIN_INSTRUCTION_SIZE,
            opt_level: OptLevel::BestAvailable,
            exit_address: Some(constants::DEFAULT_EXIT_ADDRESS),
            runtime_crate: constants::DEFAULT_RUNTIME_CRATE.to_string(),
            runtime_path: constants::DEFAULT_RUNTIME_PATH.to_string(),
            unit_prefix: constants::DEFAULT_UNIT_PREFIX.to_string(),
            parallel_emission: true,
            extra_leaders_path: None,
            save_report: false,
        }
    }

    pub fn with_region_size(mut self, region_size: u32) -> Self {
        self.region_size = region_size;
        self
    }

    pub fn with_region_block_size(mut self, region_block_size: u32) -> Self {
        self.region_block_size = region_block_size;
        self
    }

    pub fn with_min_instruction_size(mut self, min_instruction_size: u32) -> Self {
        self.min_instruction_size = min_instruction_size;
        self
    }

    pub fn with_opt_level(mut self, opt_level: OptLevel) -> Self {
        self.opt_level = opt_level;
        self
    }

    pub fn with_exit_address(mut self, exit_address: Option<u32>) -> Self {
        self.exit_address = exit_address;
        self
    }

    /// Set the runtime crate name and its path relative to the output directory.
    pub fn with_runtime(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.runtime_crate = name.into();
        self.runtime_path = path.into();
        self
    }

    pub fn with_unit_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.unit_prefix = prefix.into();
        self
    }

    /// Enable or disable parallel region block emission
    pub fn with_parallel_emission(mut self, enable: bool) -> Self {
        self.parallel_emission = enable;
        self
    }

    pub fn with_extra_leaders(mut self, path: Option<PathBuf>) -> Self {
        self.extra_leaders_path = path;
        self
    }

    pub fn with_save_report(mut self, enable: bool) -> Self {
        self.save_report = enable;
        self
    }

    /// Rejects configurations the generator cannot honor.
    pub fn validate(&self) -> Result<()> {
        if !self.region_size.is_power_of_two() {
            return Err(GenError::InvalidConfig(format!(
                "region size {} is not a power of two",
                self.region_size
            )));
        }
        if self.region_block_size == 0 {
            return Err(GenError::InvalidConfig(
                "region block size must be at least 1".to_string(),
            ));
        }
        if self.min_instruction_size == 0 {
            return Err(GenError::InvalidConfig(
                "minimum instruction size must be at least 1".to_string(),
            ));
        }
        if let OptLevel::Level(level) = self.opt_level {
            if level > constants::MAX_OPT_LEVEL {
                return Err(GenError::InvalidConfig(format!(
                    "optimization level {} is above {}",
                    level,
                    constants::MAX_OPT_LEVEL
                )));
            }
        }
        for name in [&self.unit_prefix, &self.runtime_crate] {
            if syn::parse_str::<syn::Ident>(&name.replace('-', "_")).is_err() {
                return Err(GenError::InvalidConfig(format!(
                    "`{}` is not usable as a crate name",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = GenConfig::new(PathBuf::from("out"));
        config.validate().unwrap();
        assert_eq!(config.region_size, 512);
        assert_eq!(config.region_block_size, 300);
        assert_eq!(config.exit_address, Some(0x64));
    }

    #[test]
    fn rejects_bad_partitioning() {
        let base = GenConfig::new(PathBuf::from("out"));
        assert!(base.clone().with_region_size(500).validate().is_err());
        assert!(base.clone().with_region_size(0).validate().is_err());
        assert!(base.clone().with_region_block_size(0).validate().is_err());
        assert!(base.clone().with_min_instruction_size(0).validate().is_err());
        assert!(base
            .with_opt_level(OptLevel::Level(4))
            .validate()
            .is_err());
    }

    #[test]
    fn rejects_crate_names_that_are_not_identifiers() {
        let base = GenConfig::new(PathBuf::from("out"));
        for bad in ["", "my.rt", "1rt", "type", "a b"] {
            let result = base.clone().with_unit_prefix(bad).validate();
            assert!(matches!(result, Err(GenError::InvalidConfig(_))), "{bad}");
            let result = base.clone().with_runtime(bad, "../rt").validate();
            assert!(matches!(result, Err(GenError::InvalidConfig(_))), "{bad}");
        }
        base.clone().with_unit_prefix("my-block").validate().unwrap();
        base.with_runtime("mips_runtime", "../rt").validate().unwrap();
    }

    #[test]
    fn opt_level_arguments() {
        assert_eq!(OptLevel::from_arg(-1), Some(OptLevel::BestAvailable));
        assert_eq!(OptLevel::from_arg(2), Some(OptLevel::Level(2)));
        assert_eq!(OptLevel::from_arg(4), None);
        assert_eq!(OptLevel::from_arg(-2), None);
    }
}

//! Generator Defaults
//!
//! Tunable parameters for region partitioning and emitted-code shape.

// =============================================================================
// Partitioning
// =============================================================================

/// Default region size in bytes (2^9).
/// Every region becomes one function in the generated code, so smaller regions
/// mean more functions and more trips through the outer dispatcher.
pub const DEFAULT_REGION_SIZE: u32 = 1 << 9;

/// Default number of regions per region block.
/// One region block is one generated crate.
pub const DEFAULT_REGION_BLOCK_SIZE: u32 = 300;

/// Default smallest instruction size in bytes.
/// The decode scan advances by this much after an invalid instruction.
pub const DEFAULT_MIN_INSTRUCTION_SIZE: u32 = 4;

// =============================================================================
// Optimization Levels
// =============================================================================

/// Highest optimization level the emitter knows.
pub const MAX_OPT_LEVEL: u8 = 3;

// =============================================================================
// Runtime Contract
// =============================================================================

/// Address that, when reached, ends the simulation successfully.
pub const DEFAULT_EXIT_ADDRESS: u32 = 0x64;

/// Runtime crate every generated crate depends on.
pub const DEFAULT_RUNTIME_CRATE: &str = "compsim-runtime";

/// Path of the runtime crate, relative to the output directory.
pub const DEFAULT_RUNTIME_PATH: &str = "../compsim-runtime";

/// Package name prefix of the region block crates.
pub const DEFAULT_UNIT_PREFIX: &str = "compsim-block";

/// Package name of the dispatcher crate.
pub const DISPATCH_CRATE_NAME: &str = "compsim-dispatch";

/// Directory under the output root holding the region block crates.
pub const UNITS_DIR: &str = "units";

/// Report file name under the output root.
pub const REPORT_FILE: &str = "report.json";

/// Extension of the external leaders file next to the program.
pub const LEADERS_EXTENSION: &str = "leaders";

/// Bytes shown in the dump of an invalid instruction.
pub const INVALID_DUMP_BYTES: usize = 8;

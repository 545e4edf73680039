use anyhow::{bail, Context, Result};
use clap::Parser;
use compsim_codegen::{
    constants, leaders::leaders_file_for, CompsimCompiler, GenConfig, Isa, LoadedImage, OptLevel,
};
use log::{debug, info};
use std::path::PathBuf;

fn parse_address(value: &str) -> Result<u32, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex address `{}`: {}", value, e))
}

#[derive(Debug, Parser)]
#[clap(author, version, about = "Generate compiled-simulation crates for a program", long_about = None)]
struct Args {
    #[clap(help = "Program to translate (ELF or raw binary)")]
    program: PathBuf,

    #[clap(long, env = "COMPSIM_ISA", help = "ISA description (JSON)")]
    isa: PathBuf,

    #[clap(
        long,
        env = "COMPSIM_OUT_DIR",
        default_value = "compsim-generated",
        help = "Output directory, recreated on every run"
    )]
    out_dir: PathBuf,

    #[clap(
        long,
        env = "COMPSIM_REGION_SIZE",
        default_value_t = constants::DEFAULT_REGION_SIZE,
        help = "Bytes per region, a power of two"
    )]
    region_size: u32,

    #[clap(
        long,
        env = "COMPSIM_REGION_BLOCK_SIZE",
        default_value_t = constants::DEFAULT_REGION_BLOCK_SIZE,
        help = "Regions per generated crate"
    )]
    region_block_size: u32,

    #[clap(
        long,
        env = "COMPSIM_MIN_INSN_SIZE",
        default_value_t = constants::DEFAULT_MIN_INSTRUCTION_SIZE,
        help = "Decode stride in bytes"
    )]
    min_instruction_size: u32,

    #[clap(
        long,
        env = "COMPSIM_OPT_LEVEL",
        default_value_t = -1,
        allow_negative_numbers = true,
        help = "Optimization level 0-3, -1 for the best the ISA supports"
    )]
    opt_level: i32,

    #[clap(
        long,
        env = "COMPSIM_EXIT_ADDRESS",
        value_parser = parse_address,
        help = "Address that stops the simulation [default: 0x64]"
    )]
    exit_address: Option<u32>,

    #[clap(long, help = "Do not emit the exit address check")]
    no_exit: bool,

    #[clap(
        long,
        env = "COMPSIM_RUNTIME_CRATE",
        default_value = constants::DEFAULT_RUNTIME_CRATE,
        help = "Runtime crate the generated code links against"
    )]
    runtime_crate: String,

    #[clap(
        long,
        env = "COMPSIM_RUNTIME_PATH",
        default_value = constants::DEFAULT_RUNTIME_PATH,
        help = "Runtime crate path, relative to the output directory"
    )]
    runtime_path: String,

    #[clap(
        long,
        env = "COMPSIM_UNIT_PREFIX",
        default_value = constants::DEFAULT_UNIT_PREFIX,
        help = "Package name prefix of the region block crates"
    )]
    unit_prefix: String,

    #[clap(
        long,
        env = "COMPSIM_LEADERS",
        help = "Extra leaders file [default: <program>.leaders]"
    )]
    leaders: Option<PathBuf>,

    #[clap(long, env = "COMPSIM_SAVE_REPORT", help = "Write report.json")]
    save_report: bool,

    #[clap(long, help = "Emit region blocks on a single thread")]
    sequential: bool,
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    debug!("starting with arguments: {:?}", args);

    let Some(opt_level) = OptLevel::from_arg(args.opt_level) else {
        bail!("optimization level must be between -1 and 3, got {}", args.opt_level);
    };

    let isa_text = std::fs::read_to_string(&args.isa)
        .with_context(|| format!("failed to read ISA description {}", args.isa.display()))?;
    let isa = Isa::from_json(&isa_text)
        .with_context(|| format!("invalid ISA description {}", args.isa.display()))?;
    info!("ISA {}: {} instructions", isa.name(), isa.instruction_count());

    let image = LoadedImage::load(&args.program)
        .with_context(|| format!("failed to load program {}", args.program.display()))?;

    let exit_address = if args.no_exit {
        None
    } else {
        Some(args.exit_address.unwrap_or(constants::DEFAULT_EXIT_ADDRESS))
    };
    let leaders = args
        .leaders
        .clone()
        .unwrap_or_else(|| leaders_file_for(&args.program));

    let config = GenConfig::new(args.out_dir.clone())
        .with_region_size(args.region_size)
        .with_region_block_size(args.region_block_size)
        .with_min_instruction_size(args.min_instruction_size)
        .with_opt_level(opt_level)
        .with_exit_address(exit_address)
        .with_runtime(args.runtime_crate, args.runtime_path)
        .with_unit_prefix(args.unit_prefix)
        .with_extra_leaders(Some(leaders))
        .with_save_report(args.save_report)
        .with_parallel_emission(!args.sequential);

    let report = CompsimCompiler::new(&isa, image.as_image(), config)
        .compile()
        .context("crate generation failed")?;

    info!(
        "generated {} region block crates in {}",
        report.unit_count,
        args.out_dir.display()
    );
    Ok(())
}

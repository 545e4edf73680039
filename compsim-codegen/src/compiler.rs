//! Main Generator
//!
//! Coordinates one generation pass: decode and leader discovery, region
//! partitioning, emission and rendering, then writing the crates.
//!
//! ## Region Block Crates + Dispatch Crate
//!
//! Every region block becomes its own crate under `units/`, so they compile in
//! parallel. The dispatcher crate at the output root links them all and maps the
//! program counter to a region function.

use crate::{
    config::{GenConfig, OptLevel},
    constants,
    decode_table::{DecodeTableBuilder, GenerationContext},
    emitter::{EmitPolicy, InstructionEmitter},
    error::{GenError, Result},
    image::ProgramImage,
    isa::{Decoder, OpcodeMetadata},
    leaders::load_leaders_file,
    region::RegionLayout,
    render::Renderer,
    report::{GenerationReport, UnitReport},
};
use log::{debug, info, warn};
use rayon::prelude::*;
use std::{collections::BTreeMap, fs, path::Path};

/// A rendered region block crate
#[derive(Debug, Clone)]
pub struct GeneratedUnit {
    pub block: u32,
    /// Directory relative to the output root
    pub dir: String,
    pub manifest: String,
    pub source: String,
    pub report: UnitReport,
}

/// Everything one pass produces, before it is written out.
#[derive(Debug, Clone)]
pub struct GeneratedProgram {
    pub units: Vec<GeneratedUnit>,
    pub dispatcher_manifest: String,
    pub dispatcher_source: String,
    pub report: GenerationReport,
}

pub struct CompsimCompiler<'a, I: ?Sized> {
    isa: &'a I,
    image: ProgramImage<'a>,
    config: GenConfig,
}

impl<'a, I> CompsimCompiler<'a, I>
where
    I: Decoder + OpcodeMetadata + Sync + ?Sized,
{
    pub fn new(isa: &'a I, image: ProgramImage<'a>, config: GenConfig) -> Self {
        Self { isa, image, config }
    }

    pub fn config(&self) -> &GenConfig {
        &self.config
    }

    /// Main generation entry point: generates and writes all crates.
    pub fn compile(&self) -> Result<GenerationReport> {
        let program = self.generate()?;
        self.write(&program)?;
        program.report.log_summary();
        Ok(program.report)
    }

    /// Picks the emission policy, never above what the ISA's control-flow
    /// information supports.
    pub fn resolve_policy(&self) -> Result<EmitPolicy> {
        let supported = self.isa.control_info_level().min(constants::MAX_OPT_LEVEL);
        let level = match self.config.opt_level {
            OptLevel::BestAvailable => {
                info!("using optimization level {}", supported);
                supported
            }
            OptLevel::Level(level) if level > supported => {
                warn!(
                    "optimization level {} needs more control-flow information than the ISA provides, using level {}",
                    level, supported
                );
                supported
            }
            OptLevel::Level(level) => level,
        };
        EmitPolicy::from_level(level)
            .ok_or_else(|| GenError::InvalidConfig(format!("unknown optimization level {}", level)))
    }

    /// Decodes the image and collects leaders, including external ones at level 3.
    ///
    /// Returns the context and how many external leaders were new.
    pub fn analyze(&self, policy: EmitPolicy) -> Result<(GenerationContext, usize)> {
        let builder =
            DecodeTableBuilder::new(self.isa, self.isa, self.config.min_instruction_size);
        let mut ctx = builder.build(self.image)?;

        let external = match (&self.config.extra_leaders_path, policy) {
            (Some(path), EmitPolicy::LeadersOnly) => {
                let image_size = ctx.image_size();
                load_leaders_file(path, image_size, ctx.leaders_mut())?
            }
            (Some(path), _) => {
                debug!(
                    "leaders file {} is only used at level 3",
                    path.display()
                );
                0
            }
            (None, _) => 0,
        };

        Ok((ctx, external))
    }

    /// Runs the whole pass in memory.
    pub fn generate(&self) -> Result<GeneratedProgram> {
        self.config.validate()?;
        let policy = self.resolve_policy()?;

        // Phase 1: decode and leader discovery (sequential)
        let (ctx, external_leaders) = self.analyze(policy)?;

        // Phase 2: partition
        let layout = RegionLayout::new(
            ctx.image_size(),
            self.config.region_size,
            self.config.region_block_size,
        )?;
        info!(
            "{} regions of {:#x} bytes in {} region blocks",
            layout.region_count(),
            layout.region_size(),
            layout.region_block_count()
        );

        // Phase 3: emit and render region blocks
        let emitter =
            InstructionEmitter::new(&ctx, self.isa, layout, policy, self.config.exit_address);
        let renderer = Renderer::new(&self.config, layout, policy);
        let blocks: Vec<u32> = layout.blocks().collect();
        let units = if self.config.parallel_emission {
            blocks
                .par_iter()
                .map(|block| Self::generate_unit(&emitter, &renderer, *block))
                .collect::<Result<Vec<_>>>()?
        } else {
            blocks
                .iter()
                .map(|block| Self::generate_unit(&emitter, &renderer, *block))
                .collect::<Result<Vec<_>>>()?
        };

        // Phase 4: dispatcher
        let dispatcher_manifest = renderer.dispatcher_manifest();
        let dispatcher_source = renderer.render_dispatcher()?;

        let mut instruction_usage = BTreeMap::new();
        for (opcode, count) in ctx.usage() {
            *instruction_usage
                .entry(self.isa.name_of(*opcode).to_string())
                .or_insert(0) += count;
        }

        let mut report = GenerationReport {
            image_size: ctx.image_size(),
            entry_point: self.image.entry_point(),
            decoded_instructions: ctx.table().len(),
            invalid_instructions: ctx.invalid_count(),
            leaders: ctx.leaders().len(),
            external_leaders,
            opt_level: policy.level(),
            region_size: layout.region_size(),
            region_block_size: layout.region_block_size(),
            region_count: layout.region_count(),
            unit_count: 0,
            total_dispatch_entries: 0,
            avg_dispatch_entries_per_unit: 0.0,
            units: units.iter().map(|unit| unit.report.clone()).collect(),
            instruction_usage,
        };
        report.finish_totals();

        Ok(GeneratedProgram {
            units,
            dispatcher_manifest,
            dispatcher_source,
            report,
        })
    }

    fn generate_unit(
        emitter: &InstructionEmitter<'_, I>,
        renderer: &Renderer<'_>,
        block: u32,
    ) -> Result<GeneratedUnit> {
        let regions_range = emitter.layout().block_regions(block);
        let first_region = regions_range.start;
        let regions = regions_range
            .map(|region| emitter.emit_region(region))
            .collect::<Result<Vec<_>>>()?;

        let name = renderer.unit_name(block);
        let source = renderer.render_unit(block, &regions)?;
        let report = UnitReport::new(block, name, first_region, &regions);
        debug!(
            "region block {}: {} regions, {} dispatch entries",
            block, report.region_count, report.dispatch_entries
        );

        Ok(GeneratedUnit {
            block,
            dir: renderer.unit_dir(block),
            manifest: renderer.unit_manifest(block),
            source,
            report,
        })
    }

    /// Recreates the output directory and writes every crate.
    pub fn write(&self, program: &GeneratedProgram) -> Result<()> {
        let output_dir = &self.config.output_path;

        // Remove existing output directory to ensure clean generation
        if output_dir.exists() {
            fs::remove_dir_all(output_dir).map_err(|e| GenError::io(output_dir, e))?;
        }

        for unit in &program.units {
            write_crate(&output_dir.join(&unit.dir), &unit.manifest, &unit.source)?;
        }
        write_crate(
            output_dir,
            &program.dispatcher_manifest,
            &program.dispatcher_source,
        )?;

        if self.config.save_report {
            let report_path = output_dir.join(constants::REPORT_FILE);
            program.report.save_to_file(&report_path)?;
            info!("report saved to: {}", report_path.display());
        }

        Ok(())
    }
}

fn write_crate(crate_dir: &Path, manifest: &str, source: &str) -> Result<()> {
    let src_dir = crate_dir.join("src");
    fs::create_dir_all(&src_dir).map_err(|e| GenError::io(&src_dir, e))?;

    let manifest_path = crate_dir.join("Cargo.toml");
    fs::write(&manifest_path, manifest).map_err(|e| GenError::io(&manifest_path, e))?;

    let lib_path = src_dir.join("lib.rs");
    fs::write(&lib_path, source).map_err(|e| GenError::io(&lib_path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode_table::tests::{br, nop, ToyIsa};
    use std::path::PathBuf;

    fn sample() -> Vec<u8> {
        let mut bytes = Vec::new();
        for i in 0..300 {
            match i % 11 {
                4 => bytes.extend(br(-16)),
                7 => bytes.extend([5, 12, 0, 0]),
                _ => bytes.extend(nop()),
            }
        }
        bytes
    }

    fn config(out: PathBuf) -> GenConfig {
        GenConfig::new(out)
            .with_region_size(64)
            .with_region_block_size(4)
    }

    #[test]
    fn parallel_and_sequential_output_match() {
        let isa = ToyIsa::new();
        let bytes = sample();
        for level in 0..=3 {
            let base = config(PathBuf::from("unused")).with_opt_level(OptLevel::Level(level));
            let parallel = CompsimCompiler::new(&isa, ProgramImage::new(&bytes), base.clone())
                .generate()
                .unwrap();
            let sequential = CompsimCompiler::new(
                &isa,
                ProgramImage::new(&bytes),
                base.with_parallel_emission(false),
            )
            .generate()
            .unwrap();
            assert_eq!(parallel.units.len(), sequential.units.len());
            for (a, b) in parallel.units.iter().zip(&sequential.units) {
                assert_eq!(a.source, b.source);
            }
            assert_eq!(parallel.report, sequential.report);
        }
    }

    #[test]
    fn best_available_follows_isa() {
        let isa = ToyIsa::new();
        let bytes = sample();
        let compiler = CompsimCompiler::new(
            &isa,
            ProgramImage::new(&bytes),
            config(PathBuf::from("unused")),
        );
        assert_eq!(compiler.resolve_policy().unwrap(), EmitPolicy::LeadersOnly);
    }

    #[test]
    fn report_totals() {
        let isa = ToyIsa::new();
        let bytes = sample();
        let program = CompsimCompiler::new(
            &isa,
            ProgramImage::new(&bytes),
            config(PathBuf::from("unused")).with_opt_level(OptLevel::Level(0)),
        )
        .generate()
        .unwrap();
        let report = &program.report;
        assert_eq!(report.decoded_instructions, 300);
        assert_eq!(report.invalid_instructions, 0);
        assert_eq!(report.region_count, 19);
        assert_eq!(report.unit_count, 5);
        assert_eq!(report.total_dispatch_entries, 300);
        assert_eq!(report.instruction_usage.values().sum::<usize>(), 300);
    }

    #[test]
    fn writes_crates_and_report() {
        let isa = ToyIsa::new();
        let bytes = sample();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("generated");
        fs::create_dir_all(out.join("stale")).unwrap();

        let report = CompsimCompiler::new(
            &isa,
            ProgramImage::new(&bytes),
            config(out.clone()).with_save_report(true),
        )
        .compile()
        .unwrap();

        assert!(!out.join("stale").exists());
        assert!(out.join("Cargo.toml").exists());
        assert!(out.join("src/lib.rs").exists());
        assert!(out.join("report.json").exists());
        for block in 0..report.unit_count {
            let unit = out.join(format!("units/block_{:03}", block));
            assert!(unit.join("Cargo.toml").exists());
            assert!(unit.join("src/lib.rs").exists());
        }
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let isa = ToyIsa::new();
        let bytes = sample();
        let result = CompsimCompiler::new(
            &isa,
            ProgramImage::new(&bytes),
            config(PathBuf::from("unused")).with_region_size(100),
        )
        .generate();
        assert!(matches!(result, Err(GenError::InvalidConfig(_))));
    }

    #[test]
    fn external_leaders_only_at_level_three() {
        let isa = ToyIsa::new();
        let bytes = sample();
        let dir = tempfile::tempdir().unwrap();
        let leaders = dir.path().join("prog.leaders");
        fs::write(&leaders, "0x8 0xc 0x10000").unwrap();

        let base = config(PathBuf::from("unused")).with_extra_leaders(Some(leaders));
        let l3 = CompsimCompiler::new(&isa, ProgramImage::new(&bytes), base.clone())
            .generate()
            .unwrap();
        assert_eq!(l3.report.external_leaders, 2);

        let l1 = CompsimCompiler::new(
            &isa,
            ProgramImage::new(&bytes),
            base.with_opt_level(OptLevel::Level(1)),
        )
        .generate()
        .unwrap();
        assert_eq!(l1.report.external_leaders, 0);
    }
}

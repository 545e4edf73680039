use compsim_codegen::{
    CompsimCompiler, GenConfig, GenError, GenerationReport, Isa, LoadedImage, OptLevel,
};
use std::{fs, path::Path};

const MIPS_LITE: &str = include_str!("../isa/mips-lite.json");

const NOP: u32 = 0x0000_0000;

/// Counts r2 up to r1, then returns through r31.
fn program() -> Vec<u8> {
    let mut words = vec![
        0x2001_0005, // 0x00 addi r1, r0, 5
        0x2002_0000, // 0x04 addi r2, r0, 0
        0x2042_0001, // 0x08 addi r2, r2, 1
        0x1022_0002, // 0x0c beq r1, r2, 0x18
        NOP,         // 0x10
        0x0800_0002, // 0x14 j 0x08
        NOP,         // 0x18
        0x03e0_0008, // 0x1c jr r31
        NOP,         // 0x20
    ];
    words.resize(32, NOP);
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

fn config(out: &Path) -> GenConfig {
    GenConfig::new(out.to_path_buf())
        .with_region_size(32)
        .with_region_block_size(2)
        .with_runtime("mips-runtime", "/opt/mips-runtime")
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| panic!("{}: {}", path.display(), e))
}

#[test]
fn generates_parseable_crates_at_every_level() {
    let isa = Isa::from_json(MIPS_LITE).unwrap();
    let bytes = program();
    let dir = tempfile::tempdir().unwrap();

    for level in 0..=3u8 {
        let out = dir.path().join(format!("level{}", level));
        let report = CompsimCompiler::new(
            &isa,
            compsim_codegen::ProgramImage::new(&bytes),
            config(&out).with_opt_level(OptLevel::Level(level)),
        )
        .compile()
        .unwrap();

        assert_eq!(report.opt_level, level);
        assert_eq!(report.decoded_instructions, 32);
        assert_eq!(report.invalid_instructions, 0);
        assert_eq!(report.region_count, 4);
        assert_eq!(report.unit_count, 2);

        let dispatcher = read(&out.join("src/lib.rs"));
        syn::parse_file(&dispatcher).unwrap();
        assert!(dispatcher.contains("pub fn execute"));
        let manifest = read(&out.join("Cargo.toml"));
        assert!(manifest.contains("mips-runtime"));
        assert!(manifest.contains("/opt/mips-runtime"));

        for unit in &report.units {
            let unit_dir = out.join(format!("units/block_{:03}", unit.block));
            let source = read(&unit_dir.join("src/lib.rs"));
            syn::parse_file(&source).unwrap();
            assert!(read(&unit_dir.join("Cargo.toml")).contains(&unit.crate_name));
            assert!(manifest.contains(&unit.crate_name));
        }
    }
}

#[test]
fn level_three_discovers_leaders() {
    let isa = Isa::from_json(MIPS_LITE).unwrap();
    let bytes = program();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");

    let report = CompsimCompiler::new(
        &isa,
        compsim_codegen::ProgramImage::new(&bytes),
        config(&out),
    )
    .compile()
    .unwrap();

    assert_eq!(report.opt_level, 3);
    // beq: 0x18 0x14; j: 0x08 0x1c 0x20; jr: 0x24 0x28
    assert_eq!(report.leaders, 7);
    assert_eq!(report.instruction_usage["sll"], 26);
    assert_eq!(report.instruction_usage["addi"], 3);
    assert_eq!(report.instruction_usage["beq"], 1);
}

#[test]
fn raw_program_from_disk_with_leaders_file() {
    let isa = Isa::from_json(MIPS_LITE).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let program_path = dir.path().join("count.bin");
    fs::write(&program_path, program()).unwrap();
    let leaders_path = compsim_codegen::leaders::leaders_file_for(&program_path);
    fs::write(&leaders_path, "40 0x44\nzz 1000\n").unwrap();

    let image = LoadedImage::load(&program_path).unwrap();
    let out = dir.path().join("out");
    let report = CompsimCompiler::new(
        &isa,
        image.as_image(),
        config(&out)
            .with_extra_leaders(Some(leaders_path))
            .with_save_report(true),
    )
    .compile()
    .unwrap();

    assert_eq!(report.external_leaders, 2);
    assert_eq!(report.leaders, 9);

    let saved: GenerationReport =
        serde_json::from_str(&read(&out.join("report.json"))).unwrap();
    assert_eq!(saved, report);
}

#[test]
fn sequential_and_parallel_runs_write_identical_trees() {
    let isa = Isa::from_json(MIPS_LITE).unwrap();
    let bytes = program();
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");

    let report_a = CompsimCompiler::new(
        &isa,
        compsim_codegen::ProgramImage::new(&bytes),
        config(&a),
    )
    .compile()
    .unwrap();
    CompsimCompiler::new(
        &isa,
        compsim_codegen::ProgramImage::new(&bytes),
        config(&b).with_parallel_emission(false),
    )
    .compile()
    .unwrap();

    assert_eq!(read(&a.join("src/lib.rs")), read(&b.join("src/lib.rs")));
    for unit in &report_a.units {
        let rel = format!("units/block_{:03}/src/lib.rs", unit.block);
        assert_eq!(read(&a.join(&rel)), read(&b.join(&rel)));
    }
}

#[test]
fn branch_at_end_of_image_fails_at_level_two() {
    let isa = Isa::from_json(MIPS_LITE).unwrap();
    let mut bytes = program();
    bytes.extend(0x0800_0000u32.to_be_bytes());
    let dir = tempfile::tempdir().unwrap();

    let result = CompsimCompiler::new(
        &isa,
        compsim_codegen::ProgramImage::new(&bytes),
        config(&dir.path().join("out")).with_opt_level(OptLevel::Level(2)),
    )
    .compile();
    match result {
        Err(GenError::UndecodedDelaySlot { opcode, branch, slot }) => {
            assert_eq!(opcode, "j");
            assert_eq!(branch, 0x80);
            assert_eq!(slot, 0x84);
        }
        other => panic!("expected an undecoded delay slot, got {:?}", other.map(|_| ())),
    }

    for level in [0, 1, 3] {
        CompsimCompiler::new(
            &isa,
            compsim_codegen::ProgramImage::new(&bytes),
            config(&dir.path().join(format!("ok{}", level))).with_opt_level(OptLevel::Level(level)),
        )
        .compile()
        .unwrap();
    }
}

#[test]
fn level_two_folds_static_jump_targets() {
    let isa = Isa::from_json(MIPS_LITE).unwrap();
    let bytes = program();
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");

    CompsimCompiler::new(
        &isa,
        compsim_codegen::ProgramImage::new(&bytes),
        config(&out).with_opt_level(OptLevel::Level(2)),
    )
    .compile()
    .unwrap();

    let unit = read(&out.join("units/block_000/src/lib.rs"));
    // j 0x08 and beq to 0x18
    assert!(unit.contains("let target: u32 = 0x8;"));
    assert!(unit.contains("let target: u32 = 0x18;"));
    assert!(!unit.contains("4026531840"));
    // jr r31 is only known at run time
    assert!(unit.contains("as i64)) as u32;"));
}

#[test]
fn decoded_exit_address_still_stops() {
    let isa = Isa::from_json(MIPS_LITE).unwrap();
    let bytes = program();
    let dir = tempfile::tempdir().unwrap();

    for level in 0..=3u8 {
        let out = dir.path().join(format!("level{}", level));
        CompsimCompiler::new(
            &isa,
            compsim_codegen::ProgramImage::new(&bytes),
            config(&out).with_opt_level(OptLevel::Level(level)),
        )
        .compile()
        .unwrap();

        // 0x64 is a decoded sll in region 3
        let unit = read(&out.join("units/block_001/src/lib.rs"));
        let region = &unit[unit.find("pub fn region_3").unwrap()..];
        let check = region.find("if sim.pc == 0x64").unwrap();
        let dispatch = region.find("match sim.pc").unwrap();
        assert!(check < dispatch, "level {}", level);
        if level < 3 {
            assert!(region.contains("0x64 => break 'at_64"));
        }
    }
}

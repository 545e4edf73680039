//! Rendering of emitted regions into crate sources
//!
//! Region functions re-create a C-style `switch` with fallthrough: the labelled
//! entries become nested labelled blocks, and the `match` on the program counter
//! sits in the innermost one, so breaking out of block `'at_N` lands on the code
//! for address `N` and falls through everything after it.
//!
//! ```text
//! 'dispatch: loop {
//!     'at_8: { 'at_0: { match sim.pc { 0x0 => break 'at_0, 0x8 => break 'at_8, _ => .. } }
//!         /* 0x0, 0x4 */ }
//!     /* 0x8 */ continue 'dispatch;
//!     sim.pc = 0xc; return;
//! }
//! ```

use crate::{
    config::GenConfig,
    constants,
    emitter::{DispatchEntry, EmitPolicy, EntryBody, Exit, InlineBranch, Invocation, RegionCode},
    error::{GenError, Result},
    expr::Expr,
    region::RegionLayout,
};
use proc_macro2::{Span, TokenStream};
use quote::{format_ident, quote};
use std::path::Path;

/// Renders region blocks and the dispatcher for one configuration.
pub struct Renderer<'a> {
    config: &'a GenConfig,
    layout: RegionLayout,
    policy: EmitPolicy,
}

impl<'a> Renderer<'a> {
    pub fn new(config: &'a GenConfig, layout: RegionLayout, policy: EmitPolicy) -> Self {
        Self {
            config,
            layout,
            policy,
        }
    }

    /// Package name of region block `block`.
    pub fn unit_name(&self, block: u32) -> String {
        format!("{}-{:03}", self.config.unit_prefix, block)
    }

    /// Directory of region block `block`, relative to the output root.
    pub fn unit_dir(&self, block: u32) -> String {
        format!("{}/block_{:03}", constants::UNITS_DIR, block)
    }

    fn crate_ident(name: &str) -> syn::Ident {
        format_ident!("{}", name.replace('-', "_"))
    }

    fn runtime_ident(&self) -> syn::Ident {
        Self::crate_ident(&self.config.runtime_crate)
    }

    fn runtime_path_from(&self, depth: usize) -> String {
        let path = &self.config.runtime_path;
        if Path::new(path).is_absolute() {
            path.clone()
        } else {
            format!("{}{}", "../".repeat(depth), path)
        }
    }

    pub fn unit_manifest(&self, block: u32) -> String {
        format!(
            "[package]\nname = \"{}\"\nversion = \"0.1.0\"\nedition = \"2021\"\n\n[dependencies]\n{} = {{ path = \"{}\" }}\n",
            self.unit_name(block),
            self.config.runtime_crate,
            self.runtime_path_from(2)
        )
    }

    pub fn dispatcher_manifest(&self) -> String {
        let unit_deps: Vec<String> = self
            .layout
            .blocks()
            .map(|block| {
                format!(
                    "{} = {{ path = \"{}\" }}",
                    self.unit_name(block),
                    self.unit_dir(block)
                )
            })
            .collect();

        format!(
            "[package]\nname = \"{}\"\nversion = \"0.1.0\"\nedition = \"2021\"\n\n[dependencies]\n{} = {{ path = \"{}\" }}\n{}\n",
            constants::DISPATCH_CRATE_NAME,
            self.config.runtime_crate,
            self.runtime_path_from(0),
            unit_deps.join("\n")
        )
    }

    fn header(&self, what: &str) -> String {
        format!(
            "// AUTO-GENERATED by compsim-codegen - {}\n// optimization level {}, region size {:#x}\n// DO NOT EDIT MANUALLY\n\n",
            what,
            self.policy.level(),
            self.layout.region_size()
        )
    }

    fn format(&self, unit: &str, header: String, code: TokenStream) -> Result<String> {
        let syntax_tree: syn::File = syn::parse2(code).map_err(|source| GenError::Syntax {
            unit: unit.to_string(),
            source,
        })?;
        Ok(header + &prettyplease::unparse(&syntax_tree))
    }

    /// Source of the region block crate holding `regions`.
    pub fn render_unit(&self, block: u32, regions: &[RegionCode]) -> Result<String> {
        let runtime = self.runtime_ident();
        let shift = lit(self.layout.region_shift());
        let first_region = lit(self.layout.block_regions(block).start);
        let names: Vec<syn::Ident> = regions
            .iter()
            .map(|region| format_ident!("region_{}", region.index))
            .collect();
        let functions = regions.iter().map(|region| self.region_tokens(region));

        let code = quote! {
            #![allow(unreachable_code, unused_labels, unused_imports, unused_parens, non_snake_case, clippy::all)]

            use #runtime::{isa, Simulator};

            pub type RegionFn = fn(&mut Simulator);

            pub const REGION_SHIFT: u32 = #shift;
            pub const FIRST_REGION: u32 = #first_region;

            pub const REGIONS: &[RegionFn] = &[#(#names),*];

            #(#functions)*
        };

        let name = self.unit_name(block);
        let header = self.header(&format!("{} (region block {})", name, block));
        self.format(&name, header, code)
    }

    /// Source of the dispatcher crate.
    pub fn render_dispatcher(&self) -> Result<String> {
        let runtime = self.runtime_ident();
        let shift = lit(self.layout.region_shift());
        let region_count = lit(self.layout.region_count());

        let arms = self.layout.blocks().map(|block| {
            let regions = self.layout.block_regions(block);
            let first = lit(regions.start);
            let last = lit(regions.end.saturating_sub(1));
            let unit = Self::crate_ident(&self.unit_name(block));
            quote! {
                #first..=#last => #unit::REGIONS[(region - #unit::FIRST_REGION) as usize](sim),
            }
        });

        let code = quote! {
            #![allow(clippy::all)]

            pub use #runtime::Simulator;

            pub const REGION_SHIFT: u32 = #shift;
            pub const REGION_COUNT: u32 = #region_count;

            /// Runs until the simulator stops.
            pub fn execute(sim: &mut Simulator) {
                while !sim.is_stopped() {
                    let region = sim.pc >> REGION_SHIFT;
                    match region {
                        #(#arms)*
                        _ => {
                            let pc = sim.pc;
                            sim.report_beyond_memory(pc);
                        }
                    }
                }
            }
        };

        self.format(
            constants::DISPATCH_CRATE_NAME,
            self.header("dispatch crate"),
            code,
        )
    }

    fn region_tokens(&self, region: &RegionCode) -> TokenStream {
        let sim = &sim_ident();
        let name = format_ident!("region_{}", region.index);
        let index = lit(region.index);
        let tail = hex(region.tail_pc);

        let arms = region
            .entries
            .iter()
            .filter(|entry| entry.label)
            .map(|entry| {
                let pc = hex(entry.address);
                let label = label(entry.address);
                quote! { #pc => break #label, }
            });

        let exit_check = region.exit_address.map(|addr| {
            let addr = hex(addr);
            quote! {
                if #sim.pc == #addr {
                    #sim.stop(0);
                    return;
                }
            }
        });

        let mut code = quote! {
            #exit_check
            match #sim.pc {
                #(#arms)*
                _ => {
                    if #sim.pc >> REGION_SHIFT == #index {
                        let pc = #sim.pc;
                        #sim.report_undecoded(pc);
                    }
                    return;
                }
            }
        };

        let mut open: Option<(syn::Lifetime, TokenStream)> = None;
        for entry in &region.entries {
            let entry_code = self.entry_tokens(entry);
            if entry.label {
                if let Some((label, body)) = open.take() {
                    code = quote! { #label: { #code } #body };
                }
                open = Some((label(entry.address), entry_code));
            } else {
                match open.as_mut() {
                    Some((_, body)) => body.extend(entry_code),
                    None => code.extend(entry_code),
                }
            }
        }
        if let Some((label, body)) = open {
            code = quote! { #label: { #code } #body };
        }

        quote! {
            pub fn #name(#sim: &mut Simulator) {
                'dispatch: loop {
                    #code
                    #sim.pc = #tail;
                    return;
                }
            }
        }
    }

    fn entry_tokens(&self, entry: &DispatchEntry) -> TokenStream {
        let body = match &entry.body {
            EntryBody::Execute(invocation) => self.invocation_tokens(invocation),
            EntryBody::Branch(branch) => self.branch_tokens(branch),
        };
        match entry.exit {
            Exit::FallThrough => body,
            Exit::Dispatch => quote! { #body continue 'dispatch; },
        }
    }

    fn invocation_tokens(&self, invocation: &Invocation) -> TokenStream {
        let sim = &sim_ident();
        let bits = lit(invocation.size_bits);
        let format_fn = format_ident!("format_{}", sanitize(&invocation.format));
        let insn_fn = format_ident!("insn_{}", sanitize(&invocation.name));
        let args: Vec<TokenStream> = invocation
            .args
            .iter()
            .map(|arg| Expr::Lit(*arg).to_tokens(sim))
            .collect();

        quote! {
            #sim.trace_pc();
            isa::instruction(#sim, #bits);
            isa::#format_fn(#sim, #bits, #(#args),*);
            isa::#insn_fn(#sim, #bits, #(#args),*);
            #sim.instr_counter += 1;
        }
    }

    fn branch_tokens(&self, branch: &InlineBranch) -> TokenStream {
        let sim = &sim_ident();
        let condition = branch.condition.wide_condition_tokens(sim);
        let target = match &branch.target {
            Expr::Lit(scalar) if u32::try_from(scalar.value).is_ok() => {
                let address = hex(scalar.value as u32);
                quote! { #address }
            }
            other => {
                let value = other.wide_tokens(sim);
                quote! { (#value) as u32 }
            }
        };
        let actions = branch.action.iter().map(|stmt| stmt.to_tokens(sim));
        let not_taken = hex(branch.not_taken);
        let slots = branch.delay_slots.iter().map(|slot| {
            let body = self.invocation_tokens(&slot.invocation);
            match &slot.guard {
                Some(guard) => {
                    let guard = guard.wide_condition_tokens(sim);
                    quote! { if #guard { #body } }
                }
                None => quote! { { #body } },
            }
        });

        quote! {
            #sim.trace_pc();
            let tmp_pc: u32 = if #condition {
                let target: u32 = #target;
                #(#actions;)*
                target
            } else {
                #not_taken
            };
            #sim.instr_counter += 1;
            #(#slots)*
            #sim.pc = tmp_pc;
        }
    }
}

/// Name of the simulator parameter in generated functions.
fn sim_ident() -> syn::Ident {
    format_ident!("sim")
}

fn lit(value: u32) -> proc_macro2::Literal {
    proc_macro2::Literal::u32_unsuffixed(value)
}

fn hex(value: u32) -> syn::LitInt {
    syn::LitInt::new(&format!("{:#x}", value), Span::call_site())
}

fn label(address: u32) -> syn::Lifetime {
    syn::Lifetime::new(&format!("'at_{:x}", address), Span::call_site())
}

/// Maps a description name onto identifier characters.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decode_table::tests::{br, build, nop, ToyIsa},
        emitter::InstructionEmitter,
    };
    use std::path::PathBuf;

    fn render(bytes: &[u8], level: u8) -> (Vec<String>, String) {
        let ctx = build(bytes, 4);
        let isa = ToyIsa::new();
        let config = GenConfig::new(PathBuf::from("out"))
            .with_region_size(16)
            .with_region_block_size(2);
        let layout = RegionLayout::new(ctx.image_size(), 16, 2).unwrap();
        let policy = EmitPolicy::from_level(level).unwrap();
        let emitter = InstructionEmitter::new(&ctx, &isa, layout, policy, Some(0x10));
        let renderer = Renderer::new(&config, layout, policy);

        let units = layout
            .blocks()
            .map(|block| {
                let regions: Vec<_> = layout
                    .block_regions(block)
                    .map(|r| emitter.emit_region(r).unwrap())
                    .collect();
                renderer.render_unit(block, &regions).unwrap()
            })
            .collect();
        (units, renderer.render_dispatcher().unwrap())
    }

    fn sample() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend(nop());
        bytes.extend(br(-4));
        bytes.extend(nop());
        bytes.extend([5, 8, 0, 0]);
        bytes.extend(nop());
        bytes.extend([4, 3, 0, 0]);
        bytes.extend(nop());
        bytes.extend(nop());
        bytes.extend(nop());
        bytes
    }

    #[test]
    fn every_level_renders_parseable_code() {
        for level in 0..=3 {
            let (units, dispatcher) = render(&sample(), level);
            assert_eq!(units.len(), 2);
            for unit in &units {
                let file = syn::parse_file(unit).expect("unit parses");
                let regions = file
                    .items
                    .iter()
                    .filter(|item| matches!(item, syn::Item::Fn(f) if f.sig.ident.to_string().starts_with("region_")))
                    .count();
                assert!(regions >= 1);
            }
            syn::parse_file(&dispatcher).expect("dispatcher parses");
        }
    }

    #[test]
    fn unit_layout() {
        let (units, dispatcher) = render(&sample(), 0);
        assert!(units[0].starts_with("// AUTO-GENERATED by compsim-codegen"));
        assert!(units[0].contains("pub const REGIONS: &[RegionFn] = &[region_0, region_1];"));
        assert!(units[1].contains("pub const FIRST_REGION: u32 = 2;"));
        assert!(units[0].contains("0x4 => break 'at_4"));
        assert!(units[0].contains("isa::insn_br(sim, 32, (-4));"));
        assert!(units[0].contains("continue 'dispatch;"));
        assert!(dispatcher.contains("0..=1 => compsim_block_000::REGIONS"));
        assert!(dispatcher.contains("2..=2 => compsim_block_001::REGIONS"));
        assert!(dispatcher.contains("sim.report_beyond_memory(pc)"));
    }

    #[test]
    fn exit_check_in_owning_region_only() {
        let (units, _) = render(&sample(), 0);
        assert_eq!(units[0].matches("sim.stop(0)").count(), 1);
        assert_eq!(units[1].matches("sim.stop(0)").count(), 0);
    }

    #[test]
    fn exit_check_runs_before_labelled_arms() {
        // 0x10 holds a decoded instruction, so it also has a labelled arm.
        for level in 0..=3 {
            let (units, _) = render(&sample(), level);
            let region = &units[0][units[0].find("pub fn region_1").unwrap()..];
            let check = region.find("if sim.pc == 0x10").unwrap();
            let dispatch = region.find("match sim.pc").unwrap();
            assert!(check < dispatch, "level {level}");
        }
    }

    #[test]
    fn level_two_inlines_branch_decision() {
        let (units, _) = render(&sample(), 2);
        let unit = &units[0];
        assert!(unit.contains("let tmp_pc: u32 = if"));
        assert!(unit.contains("sim.RB[(31) as usize] = (12 + 8)"));
        assert!(unit.contains("sim.pc = tmp_pc;"));
        assert!(unit.contains("let target: u32 = 0x0;"));
        assert!(unit.contains("let target: u32 = 0x14;"));
        // jr through a register stays a runtime computation in i64
        assert!(unit.contains("let target: u32 = ((sim.RB[(3) as usize] as i64)) as u32;"));
        assert!(unit.contains("isa::insn_nop"));
        assert!(!unit.contains("isa::insn_br("));
        assert!(!unit.contains("isa::insn_bnz"));
    }

    #[test]
    fn level_three_drops_unlabelled_arms() {
        let (l0, _) = render(&sample(), 0);
        let (l3, _) = render(&sample(), 3);
        let arms = |units: &[String]| units.iter().map(|u| u.matches("=> break 'at_").count()).sum::<usize>();
        assert!(arms(&l3) < arms(&l0));
    }

    #[test]
    fn manifests_point_at_runtime_and_units() {
        let config = GenConfig::new(PathBuf::from("out")).with_runtime("my-rt", "../rt");
        let layout = RegionLayout::new(4096, 512, 4).unwrap();
        let renderer = Renderer::new(&config, layout, EmitPolicy::Baseline);
        let unit = renderer.unit_manifest(1);
        assert!(unit.contains("name = \"compsim-block-001\""));
        assert!(unit.contains("my-rt = { path = \"../../../rt\" }"));
        let dispatch = renderer.dispatcher_manifest();
        assert!(dispatch.contains("my-rt = { path = \"../rt\" }"));
        assert!(dispatch.contains("compsim-block-001 = { path = \"units/block_001\" }"));
    }

    #[test]
    fn sanitize_names() {
        assert_eq!(sanitize("add.d"), "add_d");
        assert_eq!(sanitize("Type_R"), "Type_R");
    }
}

//! Startup registries and the detect → resolve → load → analyze driver.

use crate::aux_data::schema::{register_builtin_schemas, DdisasmVersion};
use crate::aux_data::AuxDataTypeRegistry;
use crate::config::DisasmConfig;
use crate::ir::Module;
use crate::pass::disassembly::DisassemblyPass;
use crate::pass::function_inference::FunctionInferencePass;
use crate::pass::loader_stats::LoaderStatsPass;
use crate::pass::pipeline::{Pipeline, PipelineReport};
use crate::target::builtin::{register_builtin_loaders, EnabledTargets};
use crate::target::{detect_target, TargetRegistry};
use crate::DisassemblyError;

/// Read-only registries handed to loaders and passes.
#[derive(Debug, Clone, Copy)]
pub struct Context<'r> {
    pub targets: &'r TargetRegistry,
    pub aux_types: &'r AuxDataTypeRegistry,
}

/// Owns the registries for the lifetime of the process.
#[derive(Debug, Default)]
pub struct Registries {
    pub targets: TargetRegistry,
    pub aux_types: AuxDataTypeRegistry,
}

impl Registries {
    /// Built-in loaders for `enabled` plus every built-in aux data schema.
    pub fn with_builtins(enabled: &EnabledTargets) -> Result<Self, DisassemblyError> {
        let mut registries = Self::default();
        register_builtin_loaders(&mut registries.targets, enabled)?;
        register_builtin_schemas(&mut registries.aux_types)?;
        Ok(registries)
    }

    /// Borrow both registries as a [`Context`].
    pub fn context(&self) -> Context<'_> {
        Context {
            targets: &self.targets,
            aux_types: &self.aux_types,
        }
    }
}

/// Loader Stats, Disassembly and (unless skipped) Function Inference.
pub fn default_pipeline(config: &DisasmConfig) -> Pipeline {
    let mut pipeline = Pipeline::with_options(config.pipeline_options());
    pipeline.push(LoaderStatsPass::new()).push(DisassemblyPass::new());
    if !config.skip_function_analysis {
        pipeline.push(FunctionInferencePass::new());
    }
    pipeline
}

/// Disassemble `image` with the default pipeline.
pub fn disassemble(
    ctx: &Context<'_>,
    image: &[u8],
    name: &str,
    config: &DisasmConfig,
) -> Result<(Module, PipelineReport), DisassemblyError> {
    let mut pipeline = default_pipeline(config);
    disassemble_with(ctx, image, name, config, &mut pipeline)
}

/// Disassemble `image` with a caller-built pipeline.
pub fn disassemble_with(
    ctx: &Context<'_>,
    image: &[u8],
    name: &str,
    config: &DisasmConfig,
    pipeline: &mut Pipeline,
) -> Result<(Module, PipelineReport), DisassemblyError> {
    let key = detect_target(image, config.raw_target());
    let loader = ctx.targets.resolve(key).inspect_err(|e| log::error!("{}: {}", name, e))?;
    log::info!("{}: {} via {} loader", name, key, loader.name());

    let mut module = loader.load(image, key, name, ctx.aux_types)?;
    module
        .aux_data
        .put::<DdisasmVersion>(ctx.aux_types, env!("CARGO_PKG_VERSION").to_string())?;

    let report = if config.threads > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()
            .map_err(|e| DisassemblyError::Generic(format!("Cannot start worker threads: {}", e)))?;
        pool.install(|| pipeline.run(ctx, &mut module))?
    } else {
        pipeline.run(ctx, &mut module)?
    };

    log::info!(
        "{}: {} passes in {:?}, {} code blocks",
        name,
        report.passes.len(),
        report.total_run_time(),
        module.code_blocks.len()
    );
    Ok((module, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{ByteOrder, FileFormat, Isa, TargetKey};

    #[test]
    fn test_registries_follow_enabled_isas() {
        let registries = Registries::with_builtins(&EnabledTargets::only([Isa::Mips32])).unwrap();
        assert_eq!(registries.targets.len(), 4);
        assert!(registries
            .targets
            .is_supported(TargetKey::new(FileFormat::Elf, Isa::Mips32, ByteOrder::Big)));
        assert!(!registries
            .targets
            .is_supported(TargetKey::new(FileFormat::Elf, Isa::X64, ByteOrder::Little)));
        assert!(registries.aux_types.is_registered::<DdisasmVersion>());
    }

    #[test]
    fn test_default_pipeline_order() {
        let config = DisasmConfig::default();
        assert_eq!(
            default_pipeline(&config).names(),
            vec!["Loader Stats", "Disassembly", "Function Inference"]
        );

        let skip = DisasmConfig {
            skip_function_analysis: true,
            ..Default::default()
        };
        assert_eq!(default_pipeline(&skip).names(), vec!["Loader Stats", "Disassembly"]);
    }

    #[test]
    fn test_raw_input_with_threads() {
        let registries = Registries::with_builtins(&EnabledTargets::only([Isa::X64])).unwrap();
        let config = DisasmConfig {
            isa: Some(Isa::X64),
            threads: 2,
            ..Default::default()
        };
        // push rbp; mov rbp, rsp; call 0xb; pop rbp; ret; ret
        let image = [0x55, 0x48, 0x89, 0xe5, 0xe8, 0x02, 0x00, 0x00, 0x00, 0x5d, 0xc3, 0xc3];

        let (module, report) = disassemble(&registries.context(), &image, "blob", &config).unwrap();
        assert_eq!(module.target, TargetKey::new(FileFormat::Raw, Isa::X64, ByteOrder::Little));
        assert_eq!(report.passes.len(), 3);
        assert_eq!(
            module.aux_data.get::<DdisasmVersion>(&registries.aux_types).unwrap(),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );

        let entries = module
            .aux_data
            .get::<crate::aux_data::schema::FunctionEntries>(&registries.aux_types)
            .unwrap()
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_undetectable_raw_input() {
        let registries = Registries::with_builtins(&Default::default()).unwrap();
        let err = disassemble(&registries.context(), &[0x90; 8], "blob", &DisasmConfig::default()).unwrap_err();
        assert!(matches!(err, DisassemblyError::UnsupportedTarget(_)));
    }
}

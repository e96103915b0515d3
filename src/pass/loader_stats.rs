//! Summary counts over what the loader produced.

use std::any::Any;
use std::path::Path;

use anyhow::anyhow;

use super::{AnalysisPass, AnalysisPassResult};
use crate::aux_data::schema::{LoaderStats, LoaderStatsRecord};
use crate::driver::Context;
use crate::facts::write_facts;
use crate::ir::Module;

#[derive(Debug, Default)]
pub struct LoaderStatsPass {
    stats: Option<LoaderStatsRecord>,
}

impl LoaderStatsPass {
    pub const NAME: &'static str = "Loader Stats";

    /// A pass with no state from a previous run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts from the last `analyze`.
    pub fn stats(&self) -> Option<&LoaderStatsRecord> {
        self.stats.as_ref()
    }
}

impl AnalysisPass for LoaderStatsPass {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn analyze_impl(&mut self, result: &mut AnalysisPassResult, module: &Module) -> anyhow::Result<()> {
        let stats = LoaderStatsRecord {
            sections: module.sections.len() as u64,
            executable_sections: module.executable_sections().count() as u64,
            executable_bytes: module.executable_sections().map(|s| s.bytes.len() as u64).sum(),
            symbols: module.symbols.len() as u64,
        };

        if stats.executable_sections == 0 {
            result.warn(format!("'{}' has no executable sections", module.name));
        }
        result.count("sections", stats.sections);
        result.count("executable_sections", stats.executable_sections);
        result.count("executable_bytes", stats.executable_bytes);
        result.count("symbols", stats.symbols);

        self.stats = Some(stats);
        Ok(())
    }

    fn transform_impl(
        &mut self,
        _result: &mut AnalysisPassResult,
        ctx: &Context<'_>,
        module: &mut Module,
    ) -> anyhow::Result<()> {
        let stats = self
            .stats
            .clone()
            .ok_or_else(|| anyhow!("no statistics collected"))?;
        module.aux_data.put::<LoaderStats>(ctx.aux_types, stats)?;
        Ok(())
    }

    fn clear(&mut self) {
        self.stats = None;
    }

    fn dump_facts(&self, dir: &Path) -> anyhow::Result<()> {
        if let Some(s) = &self.stats {
            write_facts(
                dir,
                "loader_stats",
                [(s.sections, s.executable_sections, s.executable_bytes, s.symbols)],
            )?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Registries;
    use crate::ir::Section;
    use crate::pass::tests::empty_module;
    use crate::pass::AnalysisPassExt;

    #[test]
    fn test_counts_and_attaches() {
        let registries = Registries::with_builtins(&Default::default()).unwrap();
        let ctx = registries.context();
        let mut module = empty_module();
        module
            .sections
            .push(Section::new(".text", 0, 3, true).with_bytes(vec![0x90, 0x90, 0xc3]));
        module.sections.push(Section::new(".data", 0x100, 8, false));

        let mut pass = LoaderStatsPass::new();
        let analyze = pass.analyze(&module).unwrap();
        assert_eq!(analyze.counter("executable_bytes"), Some(3));
        assert!(analyze.warnings.is_empty());

        pass.transform(&ctx, &mut module).unwrap();
        let stored = module.aux_data.get::<LoaderStats>(ctx.aux_types).unwrap().unwrap();
        assert_eq!(stored.sections, 2);
        assert_eq!(stored.executable_sections, 1);

        pass.clear();
        assert!(pass.stats().is_none());
        assert_eq!(pass.name(), "Loader Stats");
    }

    #[test]
    fn test_transform_without_analyze_fails() {
        let registries = Registries::with_builtins(&Default::default()).unwrap();
        let mut module = empty_module();
        let mut pass = LoaderStatsPass::new();
        assert!(pass.transform(&registries.context(), &mut module).is_err());
    }

    #[test]
    fn test_warns_without_code() {
        let mut pass = LoaderStatsPass::new();
        let result = pass.analyze(&empty_module()).unwrap();
        assert_eq!(result.warnings.len(), 1);
    }
}

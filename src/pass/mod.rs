//! Analysis passes: a named, timed load → analyze → transform lifecycle.
//!
//! Implementors provide the `*_impl` hooks on [`AnalysisPass`]; callers use
//! the timed wrappers from [`AnalysisPassExt`], which every pass gets for
//! free and cannot override.

pub mod disassembly;
pub mod function_inference;
pub mod loader_stats;
pub mod pipeline;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::driver::Context;
use crate::ir::Module;
use crate::DisassemblyError;

/// Outcome of one stage of one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisPassResult {
    /// Wall-clock time spent in the stage's hook.
    pub run_time: Duration,
    /// Non-fatal problems found by the hook.
    pub warnings: Vec<String>,
    /// Pass-specific counts, e.g. instructions decoded.
    pub counters: BTreeMap<String, u64>,
}

impl AnalysisPassResult {
    /// Record a non-fatal problem.
    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Set counter `name` to `value`.
    pub fn count(&mut self, name: &str, value: u64) {
        self.counters.insert(name.to_string(), value);
    }

    /// Value of counter `name`, if the hook set it.
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.counters.get(name).copied()
    }
}

/// The three stages, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PassStage {
    Load,
    Analyze,
    Transform,
}

impl fmt::Display for PassStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassStage::Load => write!(f, "load"),
            PassStage::Analyze => write!(f, "analyze"),
            PassStage::Transform => write!(f, "transform"),
        }
    }
}

/// A stage hook returned an error.
///
/// Carries the time the stage ran before failing and whatever the hook had
/// already put into its result.
#[derive(Debug, thiserror::Error)]
#[error("Pass '{pass}' failed during {stage} after {run_time:?}")]
pub struct PassFailure {
    pub pass: String,
    pub stage: PassStage,
    pub run_time: Duration,
    pub result: AnalysisPassResult,
    #[source]
    pub source: anyhow::Error,
}

/// One analysis pass.
///
/// `load_impl` and `analyze_impl` see the module read-only; only
/// `transform_impl` may change it.
pub trait AnalysisPass: Any + Send {
    /// Display name, e.g. `"Function Inference"`.
    fn name(&self) -> &str;

    /// Pull in whatever the pass needs, including data computed by the pass
    /// that ran immediately before it.
    fn load_impl(
        &mut self,
        _result: &mut AnalysisPassResult,
        _ctx: &Context<'_>,
        _module: &Module,
        _previous: Option<&dyn AnalysisPass>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn analyze_impl(&mut self, result: &mut AnalysisPassResult, module: &Module) -> anyhow::Result<()>;

    fn transform_impl(
        &mut self,
        _result: &mut AnalysisPassResult,
        _ctx: &Context<'_>,
        _module: &mut Module,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Drop per-run state so the instance can be reused.
    fn clear(&mut self) {}

    /// Write this pass's intermediate facts into `dir`.
    fn dump_facts(&self, _dir: &Path) -> anyhow::Result<()> {
        Ok(())
    }

    /// For downcasting the previous pass in `load_impl`.
    fn as_any(&self) -> &dyn Any;
}

/// `name` with every space replaced by `-`. Nothing else changes.
pub fn slugify(name: &str) -> String {
    name.replace(' ', "-")
}

/// Timed entry points shared by every pass.
pub trait AnalysisPassExt: AnalysisPass {
    fn name_slug(&self) -> String {
        slugify(self.name())
    }

    fn load(
        &mut self,
        ctx: &Context<'_>,
        module: &Module,
        previous: Option<&dyn AnalysisPass>,
    ) -> Result<AnalysisPassResult, DisassemblyError> {
        let name = self.name().to_string();
        timed(name, PassStage::Load, |result| {
            self.load_impl(result, ctx, module, previous)
        })
    }

    fn analyze(&mut self, module: &Module) -> Result<AnalysisPassResult, DisassemblyError> {
        let name = self.name().to_string();
        timed(name, PassStage::Analyze, |result| self.analyze_impl(result, module))
    }

    fn transform(&mut self, ctx: &Context<'_>, module: &mut Module) -> Result<AnalysisPassResult, DisassemblyError> {
        let name = self.name().to_string();
        timed(name, PassStage::Transform, |result| {
            self.transform_impl(result, ctx, module)
        })
    }
}

impl<P: AnalysisPass + ?Sized> AnalysisPassExt for P {}

/// Run `hook` against a fresh result and record its run time on both the
/// success and the failure path.
fn timed(
    pass: String,
    stage: PassStage,
    hook: impl FnOnce(&mut AnalysisPassResult) -> anyhow::Result<()>,
) -> Result<AnalysisPassResult, DisassemblyError> {
    let mut result = AnalysisPassResult::default();
    let start = Instant::now();
    let outcome = hook(&mut result);
    result.run_time = start.elapsed();

    match outcome {
        Ok(()) => Ok(result),
        Err(source) => Err(DisassemblyError::PassFailure(Box::new(PassFailure {
            pass,
            stage,
            run_time: result.run_time,
            result,
            source,
        }))),
    }
}

//! Ordered execution of analysis passes over one module.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AnalysisPass, AnalysisPassExt, AnalysisPassResult};
use crate::driver::Context;
use crate::ir::Module;
use crate::DisassemblyError;

/// Knobs that apply to every pass in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// When set, each pass dumps its facts into `<debug_dir>/<slug>/`.
    pub debug_dir: Option<PathBuf>,
    /// Run the transform stage. With `false` the module is left untouched.
    pub transform: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            debug_dir: None,
            transform: true,
        }
    }
}

/// Stage results of one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub name: String,
    pub slug: String,
    pub load: AnalysisPassResult,
    pub analyze: AnalysisPassResult,
    /// `None` when the transform stage was disabled.
    pub transform: Option<AnalysisPassResult>,
}

impl PassReport {
    /// Sum of the stage run times.
    pub fn total_run_time(&self) -> Duration {
        self.load.run_time
            + self.analyze.run_time
            + self.transform.as_ref().map_or(Duration::ZERO, |t| t.run_time)
    }
}

/// Per-pass reports, in run order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineReport {
    pub passes: Vec<PassReport>,
}

impl PipelineReport {
    /// Sum over every pass that ran.
    pub fn total_run_time(&self) -> Duration {
        self.passes.iter().map(PassReport::total_run_time).sum()
    }

    /// Report of the pass named `name`.
    pub fn pass(&self, name: &str) -> Option<&PassReport> {
        self.passes.iter().find(|p| p.name == name)
    }
}

/// An ordered list of passes. Each pass's `load` sees the pass that ran
/// directly before it.
#[derive(Default)]
pub struct Pipeline {
    passes: Vec<Box<dyn AnalysisPass>>,
    options: PipelineOptions,
}

impl Pipeline {
    /// An empty pipeline with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty pipeline with `options`.
    pub fn with_options(options: PipelineOptions) -> Self {
        Self {
            passes: Vec::new(),
            options,
        }
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Append `pass`.
    pub fn push<P: AnalysisPass>(&mut self, pass: P) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// Append an already boxed pass.
    pub fn push_boxed(&mut self, pass: Box<dyn AnalysisPass>) -> &mut Self {
        self.passes.push(pass);
        self
    }

    /// Insert `pass` at `index`, shifting later passes back.
    pub fn insert<P: AnalysisPass>(&mut self, index: usize, pass: P) -> Result<(), DisassemblyError> {
        if index > self.passes.len() {
            return Err(DisassemblyError::Generic(format!(
                "Cannot insert pass at {} in a pipeline of {}",
                index,
                self.passes.len()
            )));
        }
        self.passes.insert(index, Box::new(pass));
        Ok(())
    }

    /// Remove the first pass called `name`.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn AnalysisPass>> {
        let index = self.passes.iter().position(|p| p.name() == name)?;
        Some(self.passes.remove(index))
    }

    /// Pass names in run order.
    pub fn names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Pass at `index`.
    pub fn pass(&self, index: usize) -> Option<&dyn AnalysisPass> {
        self.passes.get(index).map(|p| &**p)
    }

    /// First pass of concrete type `P`.
    pub fn find<P: AnalysisPass>(&self) -> Option<&P> {
        self.passes.iter().find_map(|p| p.as_any().downcast_ref::<P>())
    }

    /// Call `clear` on every pass.
    pub fn clear_all(&mut self) {
        for pass in &mut self.passes {
            pass.clear();
        }
    }

    /// Run every pass in order: load, analyze, then (if enabled) transform.
    ///
    /// Stops at the first failing stage and returns its
    /// [`DisassemblyError::PassFailure`]; passes after it do not run.
    pub fn run(&mut self, ctx: &Context<'_>, module: &mut Module) -> Result<PipelineReport, DisassemblyError> {
        let mut report = PipelineReport::default();

        for index in 0..self.passes.len() {
            let (done, rest) = self.passes.split_at_mut(index);
            let previous = done.last().map(|p| &**p);
            let pass = &mut rest[0];
            let name = pass.name().to_string();
            let slug = pass.name_slug();

            let load = stage(&name, "load", pass.load(ctx, module, previous))?;
            let analyze = stage(&name, "analyze", pass.analyze(module))?;
            let transform = if self.options.transform {
                Some(stage(&name, "transform", pass.transform(ctx, module))?)
            } else {
                None
            };

            if let Some(debug_dir) = &self.options.debug_dir {
                let dir = debug_dir.join(&slug);
                fs::create_dir_all(&dir)?;
                pass.dump_facts(&dir).map_err(|e| {
                    DisassemblyError::Generic(format!("Pass '{}' could not dump facts: {:#}", name, e))
                })?;
            }

            report.passes.push(PassReport {
                name,
                slug,
                load,
                analyze,
                transform,
            });
        }

        Ok(report)
    }
}

fn stage(
    name: &str,
    label: &str,
    outcome: Result<AnalysisPassResult, DisassemblyError>,
) -> Result<AnalysisPassResult, DisassemblyError> {
    match outcome {
        Ok(result) => {
            log::info!("{}: {} finished in {:?}", name, label, result.run_time);
            for warning in &result.warnings {
                log::warn!("{}: {}", name, warning);
            }
            Ok(result)
        }
        Err(e) => {
            match &e {
                DisassemblyError::PassFailure(failure) => log::error!("{}: {:#}", failure, failure.source),
                _ => log::error!("{}", e),
            }
            Err(e)
        }
    }
}

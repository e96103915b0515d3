//! Run configuration, usable as CLI arguments or a JSON file.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::pass::pipeline::PipelineOptions;
use crate::target::builtin::EnabledTargets;
use crate::target::{ByteOrder, Isa};
use crate::DisassemblyError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct DisasmConfig {
    /// ISA of raw (headerless) inputs
    #[arg(long, value_enum, value_name = "ISA")]
    pub isa: Option<Isa>,

    /// Byte order of raw inputs (defaults to little)
    #[arg(long, value_enum, value_name = "ORDER")]
    pub byte_order: Option<ByteOrder>,

    /// Restrict the built-in loaders to these ISAs (comma separated)
    #[arg(long = "enable-isa", value_enum, value_delimiter = ',', value_name = "ISA")]
    pub enabled_isas: Vec<Isa>,

    /// Skip the Function Inference pass
    #[arg(long)]
    pub skip_function_analysis: bool,

    /// Analyze only; leave the module as loaded
    #[arg(long)]
    pub no_transform: bool,

    /// Dump each pass's facts under this directory
    #[arg(long, value_name = "DIR")]
    pub debug_dir: Option<PathBuf>,

    /// Worker threads for the linear sweep (0 = one per core)
    #[arg(short = 'j', long, default_value_t = 0, value_name = "N")]
    pub threads: usize,
}

impl DisasmConfig {
    /// Read a configuration from a JSON file. Missing fields take their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self, DisassemblyError> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            DisassemblyError::ParsingError(format!("Invalid config {}: {}", path.display(), e))
        })
    }

    /// ISA and byte order to assume for inputs with no recognized header.
    pub fn raw_target(&self) -> Option<(Isa, ByteOrder)> {
        self.isa
            .map(|isa| (isa, self.byte_order.unwrap_or(ByteOrder::Little)))
    }

    /// Build-enabled ISAs, narrowed to `enabled_isas` when any are given.
    pub fn enabled_targets(&self) -> EnabledTargets {
        let built = EnabledTargets::from_build();
        if self.enabled_isas.is_empty() {
            built
        } else {
            built.restrict_to(self.enabled_isas.iter().copied())
        }
    }

    /// Debug dump directory and transform switch for the pipeline.
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            debug_dir: self.debug_dir.clone(),
            transform: !self.no_transform,
        }
    }
}

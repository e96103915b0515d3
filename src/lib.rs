//! Target dispatch and staged analysis passes for the Nuclide disassembler.
//!
//! An input binary is matched to a loader through its
//! (format, ISA, byte order) triple, producing an IR [`ir::Module`]; an
//! ordered [`pass::pipeline::Pipeline`] of timed analysis passes then runs
//! over that module.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use std::fs;
//! use nuclide_pipeline::{
//!     config::DisasmConfig,
//!     driver::{disassemble, Registries},
//! };
//!
//! let config = DisasmConfig::default();
//! let registries = Registries::with_builtins(&config.enabled_targets()).unwrap();
//!
//! let image = fs::read("path/to/binary").unwrap();
//! let (module, report) = disassemble(&registries.context(), &image, "binary", &config).unwrap();
//!
//! println!("{} code blocks", module.code_blocks.len());
//! for pass in &report.passes {
//!     println!("{}: {:?}", pass.name, pass.total_run_time());
//! }
//! ```

pub mod aux_data;
pub mod config;
pub mod decoder;
pub mod driver;
pub mod facts;
pub mod ident;
pub mod ir;
pub mod pass;
pub mod target;
#[cfg(test)]
mod scenario_tests;

/// Represents an address in memory
pub type Address = u64;

use std::fmt;

use crate::pass::PassFailure;
use crate::target::TargetKey;

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 16;

/// How an instruction affects control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    /// Falls through to the next instruction
    Sequential,
    /// Unconditional jump
    Jump,
    /// Conditional branch (falls through when not taken)
    ConditionalJump,
    /// Call (returns to the next instruction)
    Call,
    /// Return or other instruction that ends the function's flow
    Return,
}

impl FlowKind {
    /// True if a basic block must end after this instruction.
    pub fn ends_block(&self) -> bool {
        !matches!(self, FlowKind::Sequential | FlowKind::Call)
    }

    /// True if execution may continue at the next instruction.
    pub fn falls_through(&self) -> bool {
        matches!(self, FlowKind::Sequential | FlowKind::ConditionalJump | FlowKind::Call)
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insn {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes
    pub size: u8,
    /// Instruction mnemonic (e.g., "mov", "add")
    pub mnemonic: String,
    /// Instruction operands as string representation
    pub operands: String,
    /// Raw bytes of the instruction (up to MAX_INSTRUCTION_SIZE)
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
    /// Control-flow class assigned by the decoder
    pub flow: FlowKind,
}

impl Insn {
    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Address of the following instruction.
    pub fn next_addr(&self) -> Address {
        self.addr.saturating_add(self.size as Address)
    }

    /// Direct branch or call target, when the last operand is an immediate.
    pub fn branch_target(&self) -> Option<Address> {
        if matches!(self.flow, FlowKind::Sequential | FlowKind::Return) {
            return None;
        }
        let last = self.operands.rsplit(',').next()?.trim();
        let last = last.trim_start_matches('#');
        if let Some(hex) = last.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).ok()
        } else if !last.is_empty() && last.bytes().all(|b| b.is_ascii_digit()) {
            last.parse().ok()
        } else {
            None
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.mnemonic, self.operands)
    }
}

/// Decoder trait: architecture-specific instruction decoder.
pub trait Decoder: Send + Sync {
    /// Decode a single instruction.
    ///
    /// # Arguments
    /// * `image` - Bytes of the region being decoded
    /// * `offset` - Offset into `image`
    /// * `address` - Virtual address of `image[offset]`
    ///
    /// # Returns
    /// Some(Insn) if an instruction was successfully decoded, None otherwise
    fn decode(&self, image: &[u8], offset: usize, address: Address) -> Option<Insn>;
}

/// Error type for disassembly operations
#[derive(Debug, thiserror::Error)]
pub enum DisassemblyError {
    /// Failed to parse binary format
    #[error("Failed to parse binary format: {0}")]
    ParsingError(String),

    /// Loader or instruction decoder error
    #[error("Decoder error: {0}")]
    DecoderError(String),

    /// No loader bound for the detected target
    #[error("Cannot disassemble this input: unsupported target {0}")]
    UnsupportedTarget(TargetKey),

    /// A loader is already bound for the target
    #[error("Target {0} already has a registered loader")]
    DuplicateTarget(TargetKey),

    /// Aux data does not match a registered schema
    #[error("Aux data '{name}' does not match its schema: {reason}")]
    SchemaMismatch { name: String, reason: String },

    /// A pass stage failed
    #[error(transparent)]
    PassFailure(Box<PassFailure>),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}

//! Linear-sweep disassembly of executable sections into basic blocks.
//!
//! Each section is cut into fixed-size chunks that are swept in parallel.
//! The chunks are then stitched in address order: where a chunk's first
//! instructions disagree with where the previous chunk left off, decoding
//! continues from the previous cursor until it lands on an offset the chunk
//! also visited. From there on both sweeps are identical, so the result is
//! exactly what a single sequential sweep would produce.

use std::any::Any;
use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context as _};
use rayon::prelude::*;

use super::{AnalysisPass, AnalysisPassResult};
use crate::decoder::CapstoneDecoder;
use crate::driver::Context;
use crate::facts::write_facts;
use crate::ident::next_id;
use crate::ir::{CodeBlock, Module, Section, SymbolKind};
use crate::{Address, Decoder, FlowKind, Insn};

/// Bytes per parallel work unit.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// A basic block found by the sweep, before it gets an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub address: Address,
    pub size: u64,
    pub instruction_count: u32,
    pub successors: Vec<Address>,
    pub calls: Vec<Address>,
}

#[derive(Debug)]
pub struct DisassemblyPass {
    chunk_size: usize,
    decoder: Option<CapstoneDecoder>,
    instructions: Vec<Insn>,
    blocks: Vec<Block>,
}

impl Default for DisassemblyPass {
    fn default() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }
}

impl DisassemblyPass {
    pub const NAME: &'static str = "Disassembly";

    /// Sweep in chunks of the default size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sweep in chunks of `chunk_size` bytes (at least one).
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            decoder: None,
            instructions: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Blocks from the last `analyze`, sorted by address.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Instructions from the last `analyze`, sorted by address.
    pub fn instructions(&self) -> &[Insn] {
        &self.instructions
    }
}

impl AnalysisPass for DisassemblyPass {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn load_impl(
        &mut self,
        _result: &mut AnalysisPassResult,
        _ctx: &Context<'_>,
        module: &Module,
        _previous: Option<&dyn AnalysisPass>,
    ) -> anyhow::Result<()> {
        let decoder = CapstoneDecoder::for_target(module.target.isa, module.target.byte_order)
            .with_context(|| format!("no decoder for {}", module.target))?;
        self.decoder = Some(decoder);
        Ok(())
    }

    fn analyze_impl(&mut self, result: &mut AnalysisPassResult, module: &Module) -> anyhow::Result<()> {
        let decoder = match self.decoder {
            Some(d) => d,
            None => CapstoneDecoder::for_target(module.target.isa, module.target.byte_order)?,
        };
        self.instructions.clear();
        self.blocks.clear();

        let mut extra_leaders: BTreeSet<Address> = module
            .symbols
            .iter()
            .filter(|s| s.kind == SymbolKind::Function)
            .map(|s| s.address)
            .collect();
        extra_leaders.extend(module.entry_point);

        let mut covered = 0u64;
        for section in module.executable_sections() {
            if section.bytes.is_empty() {
                result.warn(format!("executable section '{}' has no contents", section.name));
                continue;
            }
            if section.address.checked_add(section.bytes.len() as u64).is_none() {
                bail!(
                    "section '{}' at 0x{:x} runs past the end of the address space",
                    section.name,
                    section.address
                );
            }
            let insns = linear_sweep(&section.bytes, section.address, &decoder, self.chunk_size);
            covered += insns.iter().map(|i| i.size as u64).sum::<u64>();
            log::debug!(
                "{}: {} instructions in {} at 0x{:x}",
                Self::NAME,
                insns.len(),
                section.name,
                section.address
            );
            self.blocks.extend(split_blocks(&insns, section, &extra_leaders));
            self.instructions.extend(insns);
        }

        self.instructions.sort_by_key(|i| i.addr);
        self.blocks.sort_by_key(|b| b.address);

        let total: u64 = module.executable_sections().map(|s| s.bytes.len() as u64).sum();
        result.count("instructions", self.instructions.len() as u64);
        result.count("blocks", self.blocks.len() as u64);
        result.count("undecoded_bytes", total.saturating_sub(covered));
        Ok(())
    }

    fn transform_impl(
        &mut self,
        result: &mut AnalysisPassResult,
        _ctx: &Context<'_>,
        module: &mut Module,
    ) -> anyhow::Result<()> {
        module.code_blocks = self
            .blocks
            .iter()
            .map(|b| CodeBlock {
                id: next_id(),
                address: b.address,
                size: b.size,
                instruction_count: b.instruction_count,
                successors: b.successors.clone(),
                calls: b.calls.clone(),
            })
            .collect();
        result.count("code_blocks", module.code_blocks.len() as u64);
        Ok(())
    }

    fn clear(&mut self) {
        self.decoder = None;
        self.instructions.clear();
        self.blocks.clear();
    }

    fn dump_facts(&self, dir: &Path) -> anyhow::Result<()> {
        write_facts(
            dir,
            "instruction",
            self.instructions
                .iter()
                .map(|i| (i.addr, i.size, &i.mnemonic, &i.operands)),
        )?;
        write_facts(
            dir,
            "block",
            self.blocks.iter().map(|b| (b.address, b.size, b.instruction_count)),
        )?;
        write_facts(
            dir,
            "block_edge",
            self.blocks
                .iter()
                .flat_map(|b| b.successors.iter().map(move |s| (b.address, *s))),
        )?;
        write_facts(
            dir,
            "direct_call",
            self.blocks
                .iter()
                .flat_map(|b| b.calls.iter().map(move |c| (b.address, *c))),
        )?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// What one chunk's sweep produced.
struct ChunkSweep {
    insns: Vec<Insn>,
    /// Every offset the sweep started a decode at, ascending.
    visited: Vec<usize>,
    /// First offset at or past the chunk's end.
    cursor: usize,
}

/// Decode at `at`; skip one byte when nothing decodes.
fn step(bytes: &[u8], base: Address, decoder: &dyn Decoder, at: usize) -> (Option<Insn>, usize) {
    let Some(address) = base.checked_add(at as Address) else {
        return (None, at + 1);
    };
    match decoder.decode(bytes, at, address) {
        Some(insn) if insn.size > 0 => {
            let next = at + insn.size as usize;
            (Some(insn), next)
        }
        _ => (None, at + 1),
    }
}

fn sweep_chunk(bytes: &[u8], base: Address, decoder: &dyn Decoder, start: usize, end: usize) -> ChunkSweep {
    let mut insns = Vec::new();
    let mut visited = Vec::new();
    let mut at = start;
    while at < end {
        visited.push(at);
        let (insn, next) = step(bytes, base, decoder, at);
        insns.extend(insn);
        at = next;
    }
    ChunkSweep {
        insns,
        visited,
        cursor: at,
    }
}

/// Sweep `bytes`, mapped at `base`, splitting the work into `chunk_size`
/// pieces decoded in parallel. Undecodable bytes are skipped one at a time.
pub fn linear_sweep(bytes: &[u8], base: Address, decoder: &dyn Decoder, chunk_size: usize) -> Vec<Insn> {
    if bytes.is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let num_chunks = bytes.len().div_ceil(chunk_size);

    let chunks: Vec<ChunkSweep> = (0..num_chunks)
        .into_par_iter()
        .map(|i| {
            let start = i * chunk_size;
            let end = std::cmp::min(start + chunk_size, bytes.len());
            sweep_chunk(bytes, base, decoder, start, end)
        })
        .collect();

    let mut out = Vec::new();
    let mut cursor = 0usize;
    let mut resynced = 0usize;
    for chunk in chunks {
        while cursor < chunk.cursor && chunk.visited.binary_search(&cursor).is_err() {
            let (insn, next) = step(bytes, base, decoder, cursor);
            out.extend(insn);
            cursor = next;
            resynced += 1;
        }
        if cursor < chunk.cursor {
            let offset_of = |i: &Insn| i.addr.wrapping_sub(base) as usize;
            let from = chunk.insns.partition_point(|i| offset_of(i) < cursor);
            out.extend(chunk.insns.into_iter().skip(from));
            cursor = chunk.cursor;
        }
    }

    log::trace!(
        "Swept {} bytes in {} chunks, {} decodes repeated while stitching",
        bytes.len(),
        num_chunks,
        resynced
    );
    out
}

/// Split the instructions of `section` into basic blocks.
///
/// Blocks start at the first instruction, after any block-ending
/// instruction, at in-section branch and call targets, after a decoding gap
/// and at any of `extra_leaders` that is an instruction start.
pub fn split_blocks(insns: &[Insn], section: &Section, extra_leaders: &BTreeSet<Address>) -> Vec<Block> {
    let Some(first) = insns.first() else {
        return Vec::new();
    };
    let is_insn_start = |addr: Address| insns.binary_search_by_key(&addr, |i| i.addr).is_ok();
    let local_target = |insn: &Insn| {
        insn.branch_target()
            .filter(|t| section.contains(*t) && is_insn_start(*t))
    };

    let mut leaders = BTreeSet::new();
    leaders.insert(first.addr);
    leaders.extend(extra_leaders.iter().copied().filter(|a| is_insn_start(*a)));
    for (i, insn) in insns.iter().enumerate() {
        leaders.extend(local_target(insn));
        if let Some(next) = insns.get(i + 1) {
            if insn.flow.ends_block() || next.addr != insn.next_addr() {
                leaders.insert(next.addr);
            }
        }
    }

    let mut blocks = Vec::new();
    let mut current: Option<Block> = None;
    for (i, insn) in insns.iter().enumerate() {
        let block = current.get_or_insert_with(|| Block {
            address: insn.addr,
            size: 0,
            instruction_count: 0,
            successors: Vec::new(),
            calls: Vec::new(),
        });
        block.size += insn.size as u64;
        block.instruction_count += 1;
        if insn.flow == FlowKind::Call {
            block.calls.extend(insn.branch_target());
        }

        let next = insns.get(i + 1);
        let ends_here = next.map_or(true, |n| leaders.contains(&n.addr));
        if !ends_here {
            continue;
        }

        if matches!(insn.flow, FlowKind::Jump | FlowKind::ConditionalJump) {
            block.successors.extend(local_target(insn));
        }
        if insn.flow.falls_through() {
            if let Some(n) = next.filter(|n| n.addr == insn.next_addr()) {
                if !block.successors.contains(&n.addr) {
                    block.successors.push(n.addr);
                }
            }
        }
        blocks.extend(current.take());
    }
    blocks
}

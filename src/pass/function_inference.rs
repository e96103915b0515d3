//! Function entry discovery and block ownership.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;

use super::disassembly::DisassemblyPass;
use super::{AnalysisPass, AnalysisPassResult};
use crate::aux_data::schema::{FunctionBlocks, FunctionEntries, FunctionNames};
use crate::driver::Context;
use crate::facts::write_facts;
use crate::ident::{next_id, Identifier};
use crate::ir::{Module, SymbolKind};
use crate::Address;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Edges {
    successors: Vec<Address>,
    calls: Vec<Address>,
}

/// One inferred function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub entry: Address,
    /// Symbol naming the function, if one sits at the entry.
    pub symbol: Option<Identifier>,
    /// Start addresses of every block reachable from the entry without
    /// entering another function.
    pub blocks: BTreeSet<Address>,
}

#[derive(Debug, Default)]
pub struct FunctionInferencePass {
    graph: BTreeMap<Address, Edges>,
    functions: BTreeMap<Address, Function>,
}

impl FunctionInferencePass {
    pub const NAME: &'static str = "Function Inference";

    /// A pass with no state from a previous run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Functions from the last `analyze`, keyed by entry address.
    pub fn functions(&self) -> &BTreeMap<Address, Function> {
        &self.functions
    }
}

impl AnalysisPass for FunctionInferencePass {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn load_impl(
        &mut self,
        result: &mut AnalysisPassResult,
        _ctx: &Context<'_>,
        module: &Module,
        previous: Option<&dyn AnalysisPass>,
    ) -> anyhow::Result<()> {
        let disassembly = previous.and_then(|p| p.as_any().downcast_ref::<DisassemblyPass>());
        self.graph = match disassembly {
            Some(pass) => {
                log::debug!("{}: block graph from {}", Self::NAME, pass.name());
                pass.blocks()
                    .iter()
                    .map(|b| {
                        let edges = Edges {
                            successors: b.successors.clone(),
                            calls: b.calls.clone(),
                        };
                        (b.address, edges)
                    })
                    .collect()
            }
            None => {
                log::debug!("{}: block graph from module code blocks", Self::NAME);
                module
                    .code_blocks
                    .iter()
                    .map(|b| {
                        let edges = Edges {
                            successors: b.successors.clone(),
                            calls: b.calls.clone(),
                        };
                        (b.address, edges)
                    })
                    .collect()
            }
        };
        result.count("blocks", self.graph.len() as u64);
        if self.graph.is_empty() {
            result.warn("no code blocks to analyze");
        }
        Ok(())
    }

    fn analyze_impl(&mut self, result: &mut AnalysisPassResult, module: &Module) -> anyhow::Result<()> {
        let mut entries: BTreeMap<Address, Option<Identifier>> = BTreeMap::new();

        if let Some(entry) = module.entry_point.filter(|e| self.graph.contains_key(e)) {
            entries.insert(entry, None);
        }
        for symbol in module.symbols.iter().filter(|s| s.kind == SymbolKind::Function) {
            if self.graph.contains_key(&symbol.address) {
                let slot = entries.entry(symbol.address).or_insert(None);
                slot.get_or_insert(symbol.id);
            }
        }
        for edges in self.graph.values() {
            for target in &edges.calls {
                if self.graph.contains_key(target) {
                    entries.entry(*target).or_insert(None);
                }
            }
        }

        self.functions = entries
            .iter()
            .map(|(&entry, &symbol)| {
                let blocks = reachable(&self.graph, entry, &entries);
                (entry, Function { entry, symbol, blocks })
            })
            .collect();

        let owned: BTreeSet<Address> = self.functions.values().flat_map(|f| f.blocks.iter().copied()).collect();
        result.count("functions", self.functions.len() as u64);
        result.count("unowned_blocks", (self.graph.len() - owned.len()) as u64);
        Ok(())
    }

    fn transform_impl(
        &mut self,
        result: &mut AnalysisPassResult,
        ctx: &Context<'_>,
        module: &mut Module,
    ) -> anyhow::Result<()> {
        let block_ids: HashMap<Address, Identifier> =
            module.code_blocks.iter().map(|b| (b.address, b.id)).collect();

        let mut entries = BTreeMap::new();
        let mut blocks = BTreeMap::new();
        let mut names = BTreeMap::new();

        for function in self.functions.values() {
            let Some(&entry_id) = block_ids.get(&function.entry) else {
                result.warn(format!("no code block at function entry 0x{:x}", function.entry));
                continue;
            };
            let id = next_id();
            entries.insert(id, BTreeSet::from([entry_id]));

            let mut owned = BTreeSet::new();
            for addr in &function.blocks {
                match block_ids.get(addr) {
                    Some(block) => {
                        owned.insert(*block);
                    }
                    None => result.warn(format!("no code block at 0x{:x}", addr)),
                }
            }
            blocks.insert(id, owned);

            if let Some(symbol) = function.symbol {
                names.insert(id, symbol);
            }
        }

        result.count("functions", entries.len() as u64);
        module.aux_data.put::<FunctionEntries>(ctx.aux_types, entries)?;
        module.aux_data.put::<FunctionBlocks>(ctx.aux_types, blocks)?;
        module.aux_data.put::<FunctionNames>(ctx.aux_types, names)?;
        Ok(())
    }

    fn clear(&mut self) {
        self.graph.clear();
        self.functions.clear();
    }

    fn dump_facts(&self, dir: &Path) -> anyhow::Result<()> {
        write_facts(dir, "function_entry", self.functions.keys().map(|a| (*a,)))?;
        write_facts(
            dir,
            "function_block",
            self.functions
                .values()
                .flat_map(|f| f.blocks.iter().map(move |b| (f.entry, *b))),
        )?;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Breadth-first walk over successor edges from `entry`. Calls are not
/// followed, and neither are jumps into other functions' entries.
fn reachable<V>(graph: &BTreeMap<Address, Edges>, entry: Address, entries: &BTreeMap<Address, V>) -> BTreeSet<Address> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([entry]);

    while let Some(addr) = queue.pop_front() {
        if !graph.contains_key(&addr) || !seen.insert(addr) {
            continue;
        }
        if let Some(edges) = graph.get(&addr) {
            for &next in &edges.successors {
                if next != entry && entries.contains_key(&next) {
                    continue;
                }
                if !seen.contains(&next) {
                    queue.push_back(next);
                }
            }
        }
    }
    seen
}

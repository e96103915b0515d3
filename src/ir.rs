//! In-memory IR produced by loaders and refined by passes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aux_data::{AuxDataContainer, AuxDataTypeRegistry, EncodedAuxData};
use crate::ident::{next_id, Identifier};
use crate::target::TargetKey;
use crate::{Address, DisassemblyError};

/// A section of the input, with its bytes when they exist in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: Identifier,
    pub name: String,
    pub address: Address,
    pub size: u64,
    pub executable: bool,
    pub writable: bool,
    /// Empty for sections with no file contents (e.g. `.bss`).
    #[serde(default)]
    pub bytes: Vec<u8>,
}

impl Section {
    /// Create a section with a freshly drawn identifier.
    pub fn new(name: impl Into<String>, address: Address, size: u64, executable: bool) -> Self {
        Self {
            id: next_id(),
            name: name.into(),
            address,
            size,
            executable,
            writable: false,
            bytes: Vec::new(),
        }
    }

    /// Attach the section's file contents.
    pub fn with_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.bytes = bytes;
        self
    }

    /// Mark the section writable.
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// First address past the section, clamped to the top of the address
    /// space.
    pub fn end_address(&self) -> Address {
        self.address.saturating_add(self.size)
    }

    /// True when `addr` lies in `[address, address + size)`.
    pub fn contains(&self, addr: Address) -> bool {
        addr.checked_sub(self.address).is_some_and(|offset| offset < self.size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    Function,
    Object,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub id: Identifier,
    pub name: String,
    pub address: Address,
    pub kind: SymbolKind,
}

impl Symbol {
    /// Create a symbol with a freshly drawn identifier.
    pub fn new(name: impl Into<String>, address: Address, kind: SymbolKind) -> Self {
        Self {
            id: next_id(),
            name: name.into(),
            address,
            kind,
        }
    }
}

/// A run of instructions ending at a branch, return or section end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub id: Identifier,
    pub address: Address,
    pub size: u64,
    pub instruction_count: u32,
    /// Start addresses of successor blocks.
    pub successors: Vec<Address>,
    /// Direct call targets of calls inside the block.
    #[serde(default)]
    pub calls: Vec<Address>,
}

/// One disassembled binary.
#[derive(Debug)]
pub struct Module {
    pub id: Identifier,
    pub name: String,
    pub target: TargetKey,
    pub entry_point: Option<Address>,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub code_blocks: Vec<CodeBlock>,
    pub aux_data: AuxDataContainer,
}

/// On-disk shape of a [`Module`].
#[derive(Serialize, Deserialize)]
struct SerializedModule {
    id: Identifier,
    name: String,
    target: TargetKey,
    entry_point: Option<Address>,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
    code_blocks: Vec<CodeBlock>,
    aux_data: BTreeMap<String, EncodedAuxData>,
}

impl Module {
    /// An empty module for `target`.
    pub fn new(name: impl Into<String>, target: TargetKey) -> Self {
        Self {
            id: next_id(),
            name: name.into(),
            target,
            entry_point: None,
            sections: Vec::new(),
            symbols: Vec::new(),
            code_blocks: Vec::new(),
            aux_data: AuxDataContainer::new(),
        }
    }

    /// First section named `name`.
    pub fn find_section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Section whose address range holds `addr`.
    pub fn section_containing(&self, addr: Address) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(addr))
    }

    /// Sections marked executable, in load order.
    pub fn executable_sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter().filter(|s| s.executable)
    }

    /// Code block starting exactly at `addr`.
    pub fn code_block_at(&self, addr: Address) -> Option<&CodeBlock> {
        self.code_blocks.iter().find(|b| b.address == addr)
    }

    /// Serialize to JSON. Aux data is encoded through `registry`.
    pub fn to_json(&self, registry: &AuxDataTypeRegistry) -> Result<String, DisassemblyError> {
        let serialized = SerializedModule {
            id: self.id,
            name: self.name.clone(),
            target: self.target,
            entry_point: self.entry_point,
            sections: self.sections.clone(),
            symbols: self.symbols.clone(),
            code_blocks: self.code_blocks.clone(),
            aux_data: self.aux_data.encode(registry)?,
        };
        serde_json::to_string(&serialized)
            .map_err(|e| DisassemblyError::Generic(format!("JSON serialization error: {}", e)))
    }

    /// Deserialize from JSON. Aux data entries stay encoded until read.
    pub fn from_json(json: &str) -> Result<Self, DisassemblyError> {
        let serialized: SerializedModule = serde_json::from_str(json)
            .map_err(|e| DisassemblyError::ParsingError(format!("Invalid module JSON: {}", e)))?;

        let mut aux_data = AuxDataContainer::new();
        for (name, entry) in serialized.aux_data {
            aux_data.insert_encoded(name, entry);
        }

        Ok(Self {
            id: serialized.id,
            name: serialized.name,
            target: serialized.target,
            entry_point: serialized.entry_point,
            sections: serialized.sections,
            symbols: serialized.symbols,
            code_blocks: serialized.code_blocks,
            aux_data,
        })
    }

    /// Deserialize and decode every aux data entry up front.
    pub fn from_json_checked(json: &str, registry: &AuxDataTypeRegistry) -> Result<Self, DisassemblyError> {
        let mut module = Self::from_json(json)?;
        module.aux_data.materialize(registry)?;
        Ok(module)
    }
}

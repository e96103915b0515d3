//! ELF loader.

use std::collections::{BTreeMap, HashSet};

use goblin::elf::{header, section_header, sym, Elf};

use super::{elf_byte_order, elf_isa, Loader, TargetKey};
use crate::aux_data::schema::{Alignment, ArchInfo, BinaryType, ElfSoname, Libraries, SectionProperties};
use crate::aux_data::AuxDataTypeRegistry;
use crate::ir::{Module, Section, Symbol, SymbolKind};
use crate::DisassemblyError;

/// Loads ELF images for any ISA the registry binds it to.
#[derive(Debug, Default)]
pub struct ElfLoader;

impl Loader for ElfLoader {
    fn name(&self) -> &'static str {
        "elf"
    }

    fn load(
        &self,
        image: &[u8],
        target: TargetKey,
        name: &str,
        aux_types: &AuxDataTypeRegistry,
    ) -> Result<Module, DisassemblyError> {
        let elf = Elf::parse(image).map_err(|e| DisassemblyError::ParsingError(e.to_string()))?;

        let (isa, byte_order) = (elf_isa(&elf), elf_byte_order(&elf));
        if isa != target.isa || byte_order != target.byte_order {
            return Err(DisassemblyError::DecoderError(format!(
                "{} loader given an ELF image for {}-{}",
                target, isa, byte_order
            )));
        }

        let mut module = Module::new(name, target);
        module.entry_point = match elf.header.e_type {
            header::ET_REL => None,
            _ => Some(elf.entry),
        };

        let mut alignment = BTreeMap::new();
        let mut properties = BTreeMap::new();
        for sh in &elf.section_headers {
            if sh.sh_type == section_header::SHT_NULL || !sh.is_alloc() {
                continue;
            }
            let Some(section_name) = elf.shdr_strtab.get_at(sh.sh_name) else {
                log::warn!("Skipping section with unreadable name at index {}", sh.sh_name);
                continue;
            };

            check_address_range(section_name, sh.sh_addr, sh.sh_size)?;
            let bytes = if sh.sh_type == section_header::SHT_NOBITS {
                Vec::new()
            } else {
                file_range(image, sh.sh_offset, sh.sh_size)?.to_vec()
            };
            let section = Section::new(section_name, sh.sh_addr, sh.sh_size, sh.is_executable())
                .writable(sh.is_writable())
                .with_bytes(bytes);

            alignment.insert(section.id, sh.sh_addralign);
            properties.insert(section.id, (sh.sh_type as u64, sh.sh_flags));
            module.sections.push(section);
        }

        module.symbols = collect_symbols(&elf);

        log::debug!(
            "ELF '{}': {} sections, {} symbols, entry {:?}",
            name,
            module.sections.len(),
            module.symbols.len(),
            module.entry_point
        );

        let binary_type = match elf.header.e_type {
            header::ET_EXEC => "EXEC",
            header::ET_DYN => "DYN",
            header::ET_REL => "REL",
            _ => "NONE",
        };
        module
            .aux_data
            .put::<BinaryType>(aux_types, vec![binary_type.to_string()])?;
        module.aux_data.put::<Libraries>(
            aux_types,
            elf.libraries.iter().map(|l| l.to_string()).collect(),
        )?;
        if let Some(soname) = elf.soname {
            module.aux_data.put::<ElfSoname>(aux_types, soname.to_string())?;
        }
        module.aux_data.put::<Alignment>(aux_types, alignment)?;
        module.aux_data.put::<SectionProperties>(aux_types, properties)?;
        module.aux_data.put::<ArchInfo>(aux_types, arch_info(&elf))?;

        Ok(module)
    }
}

/// Bounds-checked `image[offset..offset + size]`.
pub(crate) fn file_range(image: &[u8], offset: u64, size: u64) -> Result<&[u8], DisassemblyError> {
    let start = usize::try_from(offset).ok();
    let end = offset.checked_add(size).and_then(|e| usize::try_from(e).ok());
    match (start, end) {
        (Some(start), Some(end)) if end <= image.len() => Ok(&image[start..end]),
        _ => Err(DisassemblyError::ParsingError(format!(
            "Range 0x{:x}+0x{:x} lies outside the {}-byte image",
            offset,
            size,
            image.len()
        ))),
    }
}

/// Reject sections that run past the end of the address space.
pub(crate) fn check_address_range(name: &str, address: u64, size: u64) -> Result<(), DisassemblyError> {
    match address.checked_add(size) {
        Some(_) => Ok(()),
        None => Err(DisassemblyError::ParsingError(format!(
            "Section '{}' at 0x{:x} of size 0x{:x} overflows the address space",
            name, address, size
        ))),
    }
}

/// Named symbols from `.symtab` and `.dynsym`, deduplicated by
/// (name, address).
fn collect_symbols(elf: &Elf<'_>) -> Vec<Symbol> {
    let mut seen = HashSet::new();
    let mut symbols = Vec::new();

    let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
    for (table, strtab) in tables {
        for s in table.iter() {
            if s.st_name == 0 || matches!(s.st_type(), sym::STT_SECTION | sym::STT_FILE) {
                continue;
            }
            let Some(name) = strtab.get_at(s.st_name).filter(|n| !n.is_empty()) else {
                continue;
            };
            if !seen.insert((name.to_string(), s.st_value)) {
                continue;
            }
            let kind = if s.is_function() {
                SymbolKind::Function
            } else if s.st_type() == sym::STT_OBJECT {
                SymbolKind::Object
            } else {
                SymbolKind::Other
            };
            symbols.push(Symbol::new(name, s.st_value, kind));
        }
    }
    symbols
}

fn arch_info(elf: &Elf<'_>) -> BTreeMap<String, String> {
    let mut info = BTreeMap::new();
    info.insert("isa".to_string(), elf_isa(elf).to_string());
    info.insert("byteOrder".to_string(), elf_byte_order(elf).to_string());
    info.insert(
        "class".to_string(),
        if elf.is_64 { "ELF64" } else { "ELF32" }.to_string(),
    );
    info.insert(
        "machine".to_string(),
        header::machine_to_str(elf.header.e_machine).to_string(),
    );
    info
}

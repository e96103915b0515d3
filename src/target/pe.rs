//! PE loader.

use std::collections::BTreeMap;

use goblin::pe::{section_table, PE};

use super::elf::{check_address_range, file_range};
use super::{pe_isa, Loader, TargetKey};
use crate::aux_data::schema::{Alignment, ArchInfo, BinaryType, Libraries, PeImportedSymbols};
use crate::aux_data::AuxDataTypeRegistry;
use crate::ir::{Module, Section, Symbol, SymbolKind};
use crate::{Address, DisassemblyError};

/// Loads PE/COFF images, rebasing RVAs onto the preferred image base.
#[derive(Debug, Default)]
pub struct PeLoader;

impl Loader for PeLoader {
    fn name(&self) -> &'static str {
        "pe"
    }

    fn load(
        &self,
        image: &[u8],
        target: TargetKey,
        name: &str,
        aux_types: &AuxDataTypeRegistry,
    ) -> Result<Module, DisassemblyError> {
        let pe = PE::parse(image).map_err(|e| DisassemblyError::ParsingError(e.to_string()))?;

        let isa = pe_isa(&pe);
        if isa != target.isa {
            return Err(DisassemblyError::DecoderError(format!(
                "{} loader given a PE image for {}",
                target, isa
            )));
        }

        let image_base = pe.image_base as Address;
        let mut module = Module::new(name, target);
        module.entry_point = Some(rebase(image_base, pe.entry as Address, "entry point")?);

        let section_alignment = pe
            .header
            .optional_header
            .as_ref()
            .map(|oh| oh.windows_fields.section_alignment as u64)
            .unwrap_or(0);

        let mut alignment = BTreeMap::new();
        for sect in &pe.sections {
            let section_name = sect.name().unwrap_or("").to_string();
            let characteristics = sect.characteristics;
            let size = if sect.virtual_size != 0 {
                sect.virtual_size as u64
            } else {
                sect.size_of_raw_data as u64
            };
            let raw_len = (sect.size_of_raw_data as u64).min(size);
            let bytes = file_range(image, sect.pointer_to_raw_data as u64, raw_len)?.to_vec();

            let address = rebase(image_base, sect.virtual_address as Address, &section_name)?;
            check_address_range(&section_name, address, size)?;
            let section = Section::new(
                section_name,
                address,
                size,
                characteristics & section_table::IMAGE_SCN_MEM_EXECUTE != 0,
            )
            .writable(characteristics & section_table::IMAGE_SCN_MEM_WRITE != 0)
            .with_bytes(bytes);

            if section_alignment != 0 {
                alignment.insert(section.id, section_alignment);
            }
            module.sections.push(section);
        }

        for export in &pe.exports {
            if let Some(export_name) = export.name {
                let address = rebase(image_base, export.rva as Address, export_name)?;
                let kind = if module.section_containing(address).is_some_and(|s| s.executable) {
                    SymbolKind::Function
                } else {
                    SymbolKind::Object
                };
                module.symbols.push(Symbol::new(export_name, address, kind));
            }
        }

        let imports = pe
            .imports
            .iter()
            .map(|i| {
                let address = rebase(image_base, i.rva as Address, &i.name)?;
                Ok((address, i.name.to_string(), i.dll.to_string()))
            })
            .collect::<Result<Vec<_>, DisassemblyError>>()?;

        log::debug!(
            "PE '{}': {} sections, {} exports, {} imports",
            name,
            module.sections.len(),
            module.symbols.len(),
            imports.len()
        );

        let binary_type = if pe.is_lib { "DLL" } else { "EXE" };
        module
            .aux_data
            .put::<BinaryType>(aux_types, vec![binary_type.to_string()])?;
        module.aux_data.put::<Libraries>(
            aux_types,
            pe.libraries.iter().map(|l| l.to_string()).collect(),
        )?;
        module.aux_data.put::<PeImportedSymbols>(aux_types, imports)?;
        module.aux_data.put::<Alignment>(aux_types, alignment)?;

        let mut info = BTreeMap::new();
        info.insert("isa".to_string(), isa.to_string());
        info.insert("byteOrder".to_string(), target.byte_order.to_string());
        info.insert("imageBase".to_string(), format!("0x{:x}", image_base));
        module.aux_data.put::<ArchInfo>(aux_types, info)?;

        Ok(module)
    }
}

/// `image_base + rva`, failing when the sum leaves the address space.
fn rebase(image_base: Address, rva: Address, what: &str) -> Result<Address, DisassemblyError> {
    image_base.checked_add(rva).ok_or_else(|| {
        DisassemblyError::ParsingError(format!(
            "RVA 0x{:x} of {} overflows image base 0x{:x}",
            rva, what, image_base
        ))
    })
}

//! Loader for headerless code blobs.

use std::collections::BTreeMap;

use super::{Loader, TargetKey};
use crate::aux_data::schema::{ArchInfo, BinaryType};
use crate::aux_data::AuxDataTypeRegistry;
use crate::ir::{Module, Section};
use crate::DisassemblyError;

/// Maps the whole image as one executable `.text` section at address 0.
#[derive(Debug, Default)]
pub struct RawLoader;

impl Loader for RawLoader {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn load(
        &self,
        image: &[u8],
        target: TargetKey,
        name: &str,
        aux_types: &AuxDataTypeRegistry,
    ) -> Result<Module, DisassemblyError> {
        if image.is_empty() {
            return Err(DisassemblyError::ParsingError("Empty raw image".into()));
        }

        let mut module = Module::new(name, target);
        module.entry_point = Some(0);
        module
            .sections
            .push(Section::new(".text", 0, image.len() as u64, true).with_bytes(image.to_vec()));

        module.aux_data.put::<BinaryType>(aux_types, vec!["RAW".to_string()])?;
        let mut info = BTreeMap::new();
        info.insert("isa".to_string(), target.isa.to_string());
        info.insert("byteOrder".to_string(), target.byte_order.to_string());
        module.aux_data.put::<ArchInfo>(aux_types, info)?;

        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aux_data::schema::register_builtin_schemas;
    use crate::target::{ByteOrder, FileFormat, Isa};

    #[test]
    fn test_raw_module_layout() {
        let mut registry = AuxDataTypeRegistry::new();
        register_builtin_schemas(&mut registry).unwrap();
        let target = TargetKey::new(FileFormat::Raw, Isa::Arm64, ByteOrder::Little);

        let module = RawLoader
            .load(&[0xc0, 0x03, 0x5f, 0xd6], target, "blob", &registry)
            .unwrap();

        assert_eq!(module.target, target);
        assert_eq!(module.entry_point, Some(0));
        assert_eq!(module.sections.len(), 1);
        assert_eq!(module.sections[0].size, 4);
        assert!(module.sections[0].executable);
        assert_eq!(
            module.aux_data.get::<BinaryType>(&registry).unwrap(),
            Some(vec!["RAW".to_string()])
        );
    }

    #[test]
    fn test_empty_raw_image() {
        let registry = AuxDataTypeRegistry::new();
        let target = TargetKey::new(FileFormat::Raw, Isa::X64, ByteOrder::Little);
        assert!(RawLoader.load(&[], target, "empty", &registry).is_err());
    }
}

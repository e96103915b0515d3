//! Aux data schemas produced by the built-in loaders and passes.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{AuxDataSchema, AuxDataTypeRegistry};
use crate::ident::Identifier;
use crate::{Address, DisassemblyError};

macro_rules! aux_schema {
    ($(#[$doc:meta])* $name:ident, $key:literal, $type_name:literal, $value:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl AuxDataSchema for $name {
            const NAME: &'static str = $key;
            const TYPE_NAME: &'static str = $type_name;
            type Value = $value;
        }
    };
}

aux_schema!(
    /// Required alignment of sections and blocks.
    Alignment, "alignment", "mapping<UUID,uint64_t>", BTreeMap<Identifier, u64>
);
aux_schema!(
    /// Free-form comments keyed by address.
    Comments, "comments", "mapping<Addr,string>", BTreeMap<Address, String>
);
aux_schema!(
    /// Function id to its entry blocks.
    FunctionEntries, "functionEntries", "mapping<UUID,set<UUID>>", BTreeMap<Identifier, BTreeSet<Identifier>>
);
aux_schema!(
    /// Function id to every block belonging to it.
    FunctionBlocks, "functionBlocks", "mapping<UUID,set<UUID>>", BTreeMap<Identifier, BTreeSet<Identifier>>
);
aux_schema!(
    /// Function id to the symbol naming it.
    FunctionNames, "functionNames", "mapping<UUID,UUID>", BTreeMap<Identifier, Identifier>
);
aux_schema!(
    /// `EXEC`, `DYN`, `REL`, `DLL`, ...
    BinaryType, "binaryType", "vector<string>", Vec<String>
);
aux_schema!(
    ArchInfo, "archInfo", "mapping<string,string>", BTreeMap<String, String>
);
aux_schema!(
    /// Shared libraries the binary depends on.
    Libraries, "libraries", "vector<string>", Vec<String>
);
aux_schema!(
    ElfSoname, "elfSoname", "string", String
);
aux_schema!(
    /// Section id to (type, flags) as found in the section header.
    SectionProperties, "sectionProperties", "mapping<UUID,tuple<uint64_t,uint64_t>>", BTreeMap<Identifier, (u64, u64)>
);
aux_schema!(
    /// (import address, symbol, library) triples.
    PeImportedSymbols, "peImportedSymbols", "vector<tuple<Addr,string,string>>", Vec<(Address, String, String)>
);
aux_schema!(
    /// Version of the tool that built the module.
    DdisasmVersion, "ddisasmVersion", "string", String
);
aux_schema!(
    LoaderStats, "loaderStats", "LoaderStatsRecord", LoaderStatsRecord
);

/// Summary attached by the Loader Stats pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderStatsRecord {
    pub sections: u64,
    pub executable_sections: u64,
    pub executable_bytes: u64,
    pub symbols: u64,
}

/// Register every schema the built-in loaders and passes write.
pub fn register_builtin_schemas(registry: &mut AuxDataTypeRegistry) -> Result<(), DisassemblyError> {
    registry.register::<Alignment>()?;
    registry.register::<Comments>()?;
    registry.register::<FunctionEntries>()?;
    registry.register::<FunctionBlocks>()?;
    registry.register::<FunctionNames>()?;
    registry.register::<BinaryType>()?;
    registry.register::<ArchInfo>()?;
    registry.register::<Libraries>()?;
    registry.register::<ElfSoname>()?;
    registry.register::<SectionProperties>()?;
    registry.register::<PeImportedSymbols>()?;
    registry.register::<DdisasmVersion>()?;
    registry.register::<LoaderStats>()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registration_is_idempotent() {
        let mut registry = AuxDataTypeRegistry::new();
        register_builtin_schemas(&mut registry).unwrap();
        let count = registry.len();
        register_builtin_schemas(&mut registry).unwrap();
        assert_eq!(registry.len(), count);
        assert!(registry.is_registered::<FunctionEntries>());
        assert_eq!(
            registry.descriptor("sectionProperties").map(|d| d.type_name()),
            Some("mapping<UUID,tuple<uint64_t,uint64_t>>")
        );
    }
}

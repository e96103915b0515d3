//! Target dispatch: (format, ISA, byte order) → loader.
//!
//! A [`TargetRegistry`] maps each [`TargetKey`] to at most one [`Loader`].
//! New targets are added by registering another loader; callers only ever go
//! through [`TargetRegistry::resolve`], so dispatch sites never name a
//! target.

pub mod builtin;
pub mod elf;
pub mod pe;
pub mod raw;

use std::collections::HashMap;
use std::fmt;

use clap::ValueEnum;
use goblin::mach::{constants::cputype, Mach};
use goblin::{elf as goblin_elf, pe as goblin_pe, Object};
use serde::{Deserialize, Serialize};

use crate::aux_data::AuxDataTypeRegistry;
use crate::ir::Module;
use crate::DisassemblyError;

/// Container format of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileFormat {
    Elf,
    Pe,
    Raw,
    MachO,
    Undefined,
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Elf => write!(f, "ELF"),
            FileFormat::Pe => write!(f, "PE"),
            FileFormat::Raw => write!(f, "RAW"),
            FileFormat::MachO => write!(f, "MACHO"),
            FileFormat::Undefined => write!(f, "UNDEFINED"),
        }
    }
}

/// Instruction set architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum)]
pub enum Isa {
    /// 32-bit x86
    #[value(name = "ia32", alias = "x86")]
    Ia32,
    /// x86-64
    #[value(name = "x64", alias = "x86-64")]
    X64,
    /// 32-bit ARM
    Arm,
    /// AArch64
    #[value(name = "arm64", alias = "aarch64")]
    Arm64,
    /// 32-bit MIPS
    Mips32,
    #[value(skip)]
    Undefined,
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isa::Ia32 => write!(f, "IA32"),
            Isa::X64 => write!(f, "X64"),
            Isa::Arm => write!(f, "ARM"),
            Isa::Arm64 => write!(f, "ARM64"),
            Isa::Mips32 => write!(f, "MIPS32"),
            Isa::Undefined => write!(f, "UNDEFINED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum)]
pub enum ByteOrder {
    #[value(name = "little", alias = "le")]
    Little,
    #[value(name = "big", alias = "be")]
    Big,
    #[value(skip)]
    Undefined,
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Little => write!(f, "LE"),
            ByteOrder::Big => write!(f, "BE"),
            ByteOrder::Undefined => write!(f, "UNDEFINED"),
        }
    }
}

/// Lookup key for a loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TargetKey {
    pub format: FileFormat,
    pub isa: Isa,
    pub byte_order: ByteOrder,
}

impl TargetKey {
    pub const fn new(format: FileFormat, isa: Isa, byte_order: ByteOrder) -> Self {
        Self {
            format,
            isa,
            byte_order,
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.format, self.isa, self.byte_order)
    }
}

/// Turns an input image into a [`Module`] for one or more targets.
///
/// Loaders are stateless and live for the whole process; the registry only
/// holds `&'static` references to them.
pub trait Loader: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Build a module from `image`, which was detected as `target`.
    fn load(
        &self,
        image: &[u8],
        target: TargetKey,
        name: &str,
        aux_types: &AuxDataTypeRegistry,
    ) -> Result<Module, DisassemblyError>;
}

/// Dispatch table from target keys to loaders.
#[derive(Default)]
pub struct TargetRegistry {
    loaders: HashMap<TargetKey, &'static dyn Loader>,
}

impl fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.targets().into_iter().map(|k| (k, self.loaders[&k].name())))
            .finish()
    }
}

impl TargetRegistry {
    /// A registry with no loaders bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `loader` to `key`.
    ///
    /// Fails with `DuplicateTarget` if `key` already has a loader; the
    /// existing binding is kept.
    pub fn register(&mut self, key: TargetKey, loader: &'static dyn Loader) -> Result<(), DisassemblyError> {
        use std::collections::hash_map::Entry;
        match self.loaders.entry(key) {
            Entry::Occupied(_) => Err(DisassemblyError::DuplicateTarget(key)),
            Entry::Vacant(slot) => {
                log::debug!("Registered {} loader for {}", loader.name(), key);
                slot.insert(loader);
                Ok(())
            }
        }
    }

    /// Loader bound to `key`.
    pub fn resolve(&self, key: TargetKey) -> Result<&'static dyn Loader, DisassemblyError> {
        self.loaders
            .get(&key)
            .copied()
            .ok_or(DisassemblyError::UnsupportedTarget(key))
    }

    /// True when some loader is bound to `key`.
    pub fn is_supported(&self, key: TargetKey) -> bool {
        self.loaders.contains_key(&key)
    }

    /// Registered keys, sorted.
    pub fn targets(&self) -> Vec<TargetKey> {
        let mut keys: Vec<_> = self.loaders.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Number of bound keys.
    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

pub(crate) fn elf_isa(elf: &goblin_elf::Elf<'_>) -> Isa {
    use goblin_elf::header::{EM_386, EM_AARCH64, EM_ARM, EM_MIPS, EM_X86_64};
    match (elf.header.e_machine, elf.is_64) {
        (EM_386, false) => Isa::Ia32,
        (EM_X86_64, true) => Isa::X64,
        (EM_ARM, false) => Isa::Arm,
        (EM_AARCH64, true) => Isa::Arm64,
        (EM_MIPS, false) => Isa::Mips32,
        _ => Isa::Undefined,
    }
}

pub(crate) fn elf_byte_order(elf: &goblin_elf::Elf<'_>) -> ByteOrder {
    if elf.little_endian {
        ByteOrder::Little
    } else {
        ByteOrder::Big
    }
}

pub(crate) fn pe_isa(pe: &goblin_pe::PE<'_>) -> Isa {
    match pe.header.coff_header.machine {
        goblin_pe::header::COFF_MACHINE_X86 => Isa::Ia32,
        goblin_pe::header::COFF_MACHINE_X86_64 => Isa::X64,
        goblin_pe::header::COFF_MACHINE_ARM => Isa::Arm,
        goblin_pe::header::COFF_MACHINE_ARM64 => Isa::Arm64,
        _ => Isa::Undefined,
    }
}

/// Work out the target key of `image`.
///
/// Images goblin does not recognise are treated as raw code for `raw`, when
/// given. Parts that cannot be determined are `Undefined`, so an
/// unrecognisable input surfaces as `UnsupportedTarget` on resolve.
pub fn detect_target(image: &[u8], raw: Option<(Isa, ByteOrder)>) -> TargetKey {
    match Object::parse(image) {
        Ok(Object::Elf(elf)) => TargetKey::new(FileFormat::Elf, elf_isa(&elf), elf_byte_order(&elf)),
        Ok(Object::PE(pe)) => TargetKey::new(FileFormat::Pe, pe_isa(&pe), ByteOrder::Little),
        Ok(Object::Mach(Mach::Binary(macho))) => {
            let isa = match macho.header.cputype {
                cputype::CPU_TYPE_I386 => Isa::Ia32,
                cputype::CPU_TYPE_X86_64 => Isa::X64,
                cputype::CPU_TYPE_ARM => Isa::Arm,
                cputype::CPU_TYPE_ARM64 => Isa::Arm64,
                _ => Isa::Undefined,
            };
            let byte_order = if macho.little_endian {
                ByteOrder::Little
            } else {
                ByteOrder::Big
            };
            TargetKey::new(FileFormat::MachO, isa, byte_order)
        }
        Ok(Object::Mach(Mach::Fat(_))) => {
            TargetKey::new(FileFormat::MachO, Isa::Undefined, ByteOrder::Undefined)
        }
        other => {
            if let Err(e) = other {
                log::debug!("Not a recognised container ({}), treating as raw", e);
            }
            match raw {
                Some((isa, byte_order)) => TargetKey::new(FileFormat::Raw, isa, byte_order),
                None => TargetKey::new(FileFormat::Raw, Isa::Undefined, ByteOrder::Undefined),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedLoader(&'static str);

    impl Loader for NamedLoader {
        fn name(&self) -> &'static str {
            self.0
        }

        fn load(
            &self,
            _image: &[u8],
            target: TargetKey,
            name: &str,
            _aux_types: &AuxDataTypeRegistry,
        ) -> Result<Module, DisassemblyError> {
            Ok(Module::new(name, target))
        }
    }

    static FIRST: NamedLoader = NamedLoader("first");
    static SECOND: NamedLoader = NamedLoader("second");

    const ELF_X64: TargetKey = TargetKey::new(FileFormat::Elf, Isa::X64, ByteOrder::Little);
    const ELF_MIPS_BE: TargetKey = TargetKey::new(FileFormat::Elf, Isa::Mips32, ByteOrder::Big);

    fn same_loader(a: &'static dyn Loader, b: &'static dyn Loader) -> bool {
        std::ptr::addr_eq(a as *const dyn Loader, b as *const dyn Loader)
    }

    #[test]
    fn test_resolve_returns_bound_loader() {
        let mut registry = TargetRegistry::new();
        registry.register(ELF_X64, &FIRST).unwrap();
        registry.register(ELF_MIPS_BE, &SECOND).unwrap();

        assert!(same_loader(registry.resolve(ELF_X64).unwrap(), &FIRST));
        assert!(same_loader(registry.resolve(ELF_MIPS_BE).unwrap(), &SECOND));
    }

    #[test]
    fn test_resolve_unregistered_key() {
        let mut registry = TargetRegistry::new();
        registry.register(ELF_X64, &FIRST).unwrap();

        let other = TargetKey::new(FileFormat::Elf, Isa::X64, ByteOrder::Big);
        match registry.resolve(other) {
            Err(DisassemblyError::UnsupportedTarget(key)) => assert_eq!(key, other),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(loader) => panic!("unexpected loader {}", loader.name()),
        }
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let mut registry = TargetRegistry::new();
        registry.register(ELF_X64, &FIRST).unwrap();
        assert!(matches!(
            registry.register(ELF_X64, &SECOND),
            Err(DisassemblyError::DuplicateTarget(k)) if k == ELF_X64
        ));
        assert_eq!(registry.resolve(ELF_X64).unwrap().name(), "first");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(ELF_X64.to_string(), "ELF-X64-LE");
        assert_eq!(ELF_MIPS_BE.to_string(), "ELF-MIPS32-BE");
    }

    #[test]
    fn test_targets_sorted() {
        let mut registry = TargetRegistry::new();
        registry.register(ELF_MIPS_BE, &SECOND).unwrap();
        registry.register(ELF_X64, &FIRST).unwrap();
        let targets = registry.targets();
        assert!(targets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_detect_raw_fallback() {
        let code = [0x55, 0x48, 0x89, 0xe5, 0xc3];
        assert_eq!(
            detect_target(&code, Some((Isa::X64, ByteOrder::Little))),
            TargetKey::new(FileFormat::Raw, Isa::X64, ByteOrder::Little)
        );
        assert_eq!(
            detect_target(&code, None),
            TargetKey::new(FileFormat::Raw, Isa::Undefined, ByteOrder::Undefined)
        );
    }
}

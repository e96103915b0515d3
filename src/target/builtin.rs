//! The loaders shipped with the crate and the set of ISAs enabled for a run.

use std::collections::BTreeSet;

use super::elf::ElfLoader;
use super::pe::PeLoader;
use super::raw::RawLoader;
use super::{ByteOrder, FileFormat, Isa, Loader, TargetKey, TargetRegistry};
use crate::DisassemblyError;

static ELF_LOADER: ElfLoader = ElfLoader;
static PE_LOADER: PeLoader = PeLoader;
static RAW_LOADER: RawLoader = RawLoader;

/// ISAs whose built-in loaders get registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnabledTargets {
    isas: BTreeSet<Isa>,
}

impl Default for EnabledTargets {
    fn default() -> Self {
        Self::from_build()
    }
}

impl EnabledTargets {
    /// ISAs compiled in through Cargo features.
    pub fn from_build() -> Self {
        let mut isas = BTreeSet::new();
        if cfg!(feature = "arm32") {
            isas.insert(Isa::Arm);
        }
        if cfg!(feature = "arm64") {
            isas.insert(Isa::Arm64);
        }
        if cfg!(feature = "mips32") {
            isas.insert(Isa::Mips32);
        }
        if cfg!(feature = "x86-32") {
            isas.insert(Isa::Ia32);
        }
        if cfg!(feature = "x86-64") {
            isas.insert(Isa::X64);
        }
        Self { isas }
    }

    /// Exactly `isas`, regardless of the build.
    pub fn only(isas: impl IntoIterator<Item = Isa>) -> Self {
        Self {
            isas: isas.into_iter().filter(|isa| *isa != Isa::Undefined).collect(),
        }
    }

    /// Keep only the ISAs also present in `other`.
    pub fn restrict_to(&self, other: impl IntoIterator<Item = Isa>) -> Self {
        let other: BTreeSet<_> = other.into_iter().collect();
        Self {
            isas: self.isas.intersection(&other).copied().collect(),
        }
    }

    /// True when loaders for `isa` should be registered.
    pub fn contains(&self, isa: Isa) -> bool {
        self.isas.contains(&isa)
    }

    /// Enabled ISAs in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Isa> + '_ {
        self.isas.iter().copied()
    }
}

/// Every (key, loader) pair the crate can provide.
pub fn builtin_targets() -> Vec<(TargetKey, &'static dyn Loader)> {
    const ISAS: &[(Isa, &[ByteOrder])] = &[
        (Isa::Arm, &[ByteOrder::Little]),
        (Isa::Arm64, &[ByteOrder::Little]),
        (Isa::Mips32, &[ByteOrder::Big, ByteOrder::Little]),
        (Isa::Ia32, &[ByteOrder::Little]),
        (Isa::X64, &[ByteOrder::Little]),
    ];

    let mut targets: Vec<(TargetKey, &'static dyn Loader)> = Vec::new();
    for &(isa, orders) in ISAS {
        for &byte_order in orders {
            targets.push((TargetKey::new(FileFormat::Elf, isa, byte_order), &ELF_LOADER));
            targets.push((TargetKey::new(FileFormat::Raw, isa, byte_order), &RAW_LOADER));
        }
        if matches!(isa, Isa::Ia32 | Isa::X64) {
            targets.push((TargetKey::new(FileFormat::Pe, isa, ByteOrder::Little), &PE_LOADER));
        }
    }
    targets
}

/// Register the built-in loader for every enabled ISA. Returns how many
/// targets were bound.
pub fn register_builtin_loaders(
    registry: &mut TargetRegistry,
    enabled: &EnabledTargets,
) -> Result<usize, DisassemblyError> {
    let mut count = 0;
    for (key, loader) in builtin_targets() {
        if enabled.contains(key.isa) {
            registry.register(key, loader)?;
            count += 1;
        }
    }
    log::debug!("Registered {} built-in targets", count);
    Ok(count)
}

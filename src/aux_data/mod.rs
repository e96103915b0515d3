//! Typed, named metadata attached to an IR module.
//!
//! A schema is a marker type implementing [`AuxDataSchema`].  It must be
//! registered with an [`AuxDataTypeRegistry`] before a module can store,
//! read, or serialize a value under its name.

pub mod schema;

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::DisassemblyError;

/// Declares a kind of auxiliary data: its canonical name, a stable type
/// name written next to serialized payloads, and the Rust value type.
pub trait AuxDataSchema: 'static {
    /// Key under which values live in a module's aux data map.
    const NAME: &'static str;
    /// Stable description of the value layout, checked on decode.
    const TYPE_NAME: &'static str;
    type Value: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;
}

type EncodeFn = fn(&(dyn Any + Send + Sync)) -> Result<serde_json::Value, String>;
type DecodeFn = fn(serde_json::Value) -> Result<Box<dyn Any + Send + Sync>, String>;

/// Everything the registry knows about one schema.
#[derive(Debug, Clone, Copy)]
pub struct AuxDataTypeDescriptor {
    schema_id: TypeId,
    name: &'static str,
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

impl AuxDataTypeDescriptor {
    fn of<S: AuxDataSchema>() -> Self {
        Self {
            schema_id: TypeId::of::<S>(),
            name: S::NAME,
            type_name: S::TYPE_NAME,
            encode: encode_erased::<S>,
            decode: decode_erased::<S>,
        }
    }

    /// Schema name the entry is stored under.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Human-readable value type, e.g. `mapping<UUID,uint64_t>`.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

fn encode_erased<S: AuxDataSchema>(
    value: &(dyn Any + Send + Sync),
) -> Result<serde_json::Value, String> {
    let value = value
        .downcast_ref::<S::Value>()
        .ok_or_else(|| format!("stored value is not a {}", S::TYPE_NAME))?;
    serde_json::to_value(value).map_err(|e| e.to_string())
}

fn decode_erased<S: AuxDataSchema>(
    payload: serde_json::Value,
) -> Result<Box<dyn Any + Send + Sync>, String> {
    let value: S::Value = serde_json::from_value(payload).map_err(|e| e.to_string())?;
    Ok(Box::new(value))
}

fn mismatch(name: &str, reason: impl Into<String>) -> DisassemblyError {
    DisassemblyError::SchemaMismatch {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Name-indexed set of registered schemas.
///
/// Populated once at startup and then only read.
#[derive(Debug, Default)]
pub struct AuxDataTypeRegistry {
    by_name: HashMap<&'static str, AuxDataTypeDescriptor>,
}

impl AuxDataTypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register schema `S`.
    ///
    /// Registering the same schema again is a no-op; a different schema
    /// claiming an already-registered name is rejected.
    pub fn register<S: AuxDataSchema>(&mut self) -> Result<(), DisassemblyError> {
        let descriptor = AuxDataTypeDescriptor::of::<S>();
        if let Some(existing) = self.by_name.get(S::NAME) {
            if existing.schema_id == descriptor.schema_id {
                return Ok(());
            }
            return Err(mismatch(
                S::NAME,
                format!(
                    "name already registered with type {}, cannot register {}",
                    existing.type_name, S::TYPE_NAME
                ),
            ));
        }
        log::debug!("Registered aux data type '{}' ({})", S::NAME, S::TYPE_NAME);
        self.by_name.insert(S::NAME, descriptor);
        Ok(())
    }

    /// Descriptor registered under `name`, if any.
    pub fn descriptor(&self, name: &str) -> Option<&AuxDataTypeDescriptor> {
        self.by_name.get(name)
    }

    /// True when `S` is registered under its own name.
    pub fn is_registered<S: AuxDataSchema>(&self) -> bool {
        self.lookup::<S>().is_ok()
    }

    fn lookup<S: AuxDataSchema>(&self) -> Result<&AuxDataTypeDescriptor, DisassemblyError> {
        match self.by_name.get(S::NAME) {
            Some(d) if d.schema_id == TypeId::of::<S>() => Ok(d),
            Some(d) => Err(mismatch(
                S::NAME,
                format!("registered as {}, requested as {}", d.type_name, S::TYPE_NAME),
            )),
            None => Err(mismatch(S::NAME, "aux data type is not registered")),
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Number of registered schemas.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

/// Serialized form of one aux data entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedAuxData {
    pub type_name: String,
    pub data: serde_json::Value,
}

enum AuxDataSlot {
    Typed {
        type_name: &'static str,
        value: Box<dyn Any + Send + Sync>,
    },
    /// Read from a serialized module and not decoded yet.
    Encoded(EncodedAuxData),
}

/// Per-module aux data map.
#[derive(Default)]
pub struct AuxDataContainer {
    entries: BTreeMap<String, AuxDataSlot>,
}

impl fmt::Debug for AuxDataContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

impl AuxDataContainer {
    /// An empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `S::NAME`, replacing any previous entry.
    pub fn put<S: AuxDataSchema>(
        &mut self,
        registry: &AuxDataTypeRegistry,
        value: S::Value,
    ) -> Result<(), DisassemblyError> {
        let descriptor = registry.lookup::<S>()?;
        self.entries.insert(
            S::NAME.to_string(),
            AuxDataSlot::Typed {
                type_name: descriptor.type_name,
                value: Box::new(value),
            },
        );
        Ok(())
    }

    /// Read the value stored under `S::NAME`.
    ///
    /// Entries that came from a serialized module are decoded on access; an
    /// unregistered schema, a type-name mismatch or an undecodable payload is
    /// a `SchemaMismatch`.
    pub fn get<S: AuxDataSchema>(
        &self,
        registry: &AuxDataTypeRegistry,
    ) -> Result<Option<S::Value>, DisassemblyError> {
        let descriptor = registry.lookup::<S>()?;
        match self.entries.get(S::NAME) {
            None => Ok(None),
            Some(AuxDataSlot::Typed { value, .. }) => value
                .downcast_ref::<S::Value>()
                .cloned()
                .map(Some)
                .ok_or_else(|| mismatch(S::NAME, format!("stored value is not a {}", S::TYPE_NAME))),
            Some(AuxDataSlot::Encoded(encoded)) => {
                if encoded.type_name != descriptor.type_name {
                    return Err(mismatch(
                        S::NAME,
                        format!(
                            "serialized as {}, registered as {}",
                            encoded.type_name, descriptor.type_name
                        ),
                    ));
                }
                serde_json::from_value(encoded.data.clone())
                    .map(Some)
                    .map_err(|e| mismatch(S::NAME, e.to_string()))
            }
        }
    }

    /// Insert an entry in serialized form, as read from disk.
    pub fn insert_encoded(&mut self, name: impl Into<String>, encoded: EncodedAuxData) {
        self.entries.insert(name.into(), AuxDataSlot::Encoded(encoded));
    }

    /// Decode every serialized entry in place.
    ///
    /// Fails on the first entry whose name is not registered or whose type
    /// name or payload does not match its schema.
    pub fn materialize(&mut self, registry: &AuxDataTypeRegistry) -> Result<(), DisassemblyError> {
        for (name, slot) in self.entries.iter_mut() {
            let AuxDataSlot::Encoded(encoded) = slot else {
                continue;
            };
            let descriptor = registry
                .descriptor(name)
                .ok_or_else(|| mismatch(name, "aux data type is not registered"))?;
            if encoded.type_name != descriptor.type_name {
                return Err(mismatch(
                    name,
                    format!(
                        "serialized as {}, registered as {}",
                        encoded.type_name, descriptor.type_name
                    ),
                ));
            }
            let value = (descriptor.decode)(encoded.data.clone()).map_err(|e| mismatch(name, e))?;
            *slot = AuxDataSlot::Typed {
                type_name: descriptor.type_name,
                value,
            };
        }
        Ok(())
    }

    /// Serialize every entry. Entries that were never decoded pass through
    /// unchanged.
    pub fn encode(
        &self,
        registry: &AuxDataTypeRegistry,
    ) -> Result<BTreeMap<String, EncodedAuxData>, DisassemblyError> {
        let mut out = BTreeMap::new();
        for (name, slot) in &self.entries {
            let encoded = match slot {
                AuxDataSlot::Encoded(encoded) => encoded.clone(),
                AuxDataSlot::Typed { type_name, value } => {
                    let descriptor = registry
                        .descriptor(name)
                        .ok_or_else(|| mismatch(name, "aux data type is not registered"))?;
                    if descriptor.type_name != *type_name {
                        return Err(mismatch(
                            name,
                            format!("stored as {}, registered as {}", type_name, descriptor.type_name),
                        ));
                    }
                    EncodedAuxData {
                        type_name: type_name.to_string(),
                        data: (descriptor.encode)(value.as_ref()).map_err(|e| mismatch(name, e))?,
                    }
                }
            };
            out.insert(name.clone(), encoded);
        }
        Ok(out)
    }

    /// True when an entry named `name` is present, decoded or not.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Drop the entry named `name`. Returns whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Entry names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of entries, decoded or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Process-local, strictly increasing 128-bit identifiers for IR elements.
//!
//! Identifiers come from a single counter behind a mutex, not from a random
//! source, so two runs over the same input build identical IR.  They are only
//! unique within one process; callers that need cross-process uniqueness must
//! add their own run discriminator.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 128-bit identifier for an IR node (module, section, symbol, block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier(u128);

impl Identifier {
    /// The all-zero identifier. Never handed out by the generator.
    pub const NIL: Identifier = Identifier(0);

    /// Raw counter value.
    pub fn value(&self) -> u128 {
        self.0
    }

    /// Fixed 16-byte layout (little-endian counter).
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    /// Rebuild from the 16-byte layout produced by [`Identifier::to_bytes`].
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Identifier(u128::from_le_bytes(bytes))
    }

    /// True for [`Identifier::NIL`].
    pub fn is_nil(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Identifier {
    /// UUID-style hyphenated hex over the byte layout.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        for (i, byte) in b.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for Identifier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: Vec<u8> = s.bytes().filter(|b| *b != b'-').collect();
        if hex.len() != 32 || !hex.iter().all(u8::is_ascii_hexdigit) {
            return Err(format!("Invalid identifier: {}", s));
        }
        let mut bytes = [0u8; 16];
        for (byte, pair) in bytes.iter_mut().zip(hex.chunks_exact(2)) {
            *byte = (hex_value(pair[0]) << 4) | hex_value(pair[1]);
        }
        Ok(Identifier::from_bytes(bytes))
    }
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Mutex-guarded monotonic counter.
///
/// Only the process-wide instance behind [`next_id`] is reachable from
/// outside this module, so every identifier in a process shares one counter.
#[derive(Debug)]
pub struct IdentifierGenerator {
    counter: Mutex<u128>,
}

static GENERATOR: IdentifierGenerator = IdentifierGenerator::new();

impl IdentifierGenerator {
    const fn new() -> Self {
        Self {
            counter: Mutex::new(0),
        }
    }

    /// The process-wide generator.
    pub fn global() -> &'static IdentifierGenerator {
        &GENERATOR
    }

    /// Increment the counter and return the new value as an identifier.
    pub fn next(&self) -> Identifier {
        // A panic while holding the lock cannot leave the counter torn, so a
        // poisoned lock is still safe to use.
        let mut counter = self
            .counter
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *counter += 1;
        Identifier(*counter)
    }
}

/// Draw the next identifier from the process-wide generator.
pub fn next_id() -> Identifier {
    GENERATOR.next()
}

/// x86 register file encoding
///
/// The `g`/`G` packets carry all registers as one hex blob. The blob layout
/// follows the i386 target description: sixteen registers, four
/// little-endian bytes each.

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::{GdbError, Result};

/// One register slot in the blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDef {
    pub name: &'static str,
    /// Width in bytes, at most four
    pub width: usize,
}

const fn reg(name: &'static str) -> RegisterDef {
    RegisterDef { name, width: 4 }
}

pub const I386_REGISTERS: &[RegisterDef] = &[
    reg("eax"),
    reg("ecx"),
    reg("edx"),
    reg("ebx"),
    reg("esp"),
    reg("ebp"),
    reg("esi"),
    reg("edi"),
    reg("eip"),
    reg("eflags"),
    reg("cs"),
    reg("ss"),
    reg("ds"),
    reg("es"),
    reg("fs"),
    reg("gs"),
];

/// Register numbers used in `T` stop replies
pub const EIP_REGNUM: usize = 8;
pub const CS_REGNUM: usize = 10;

/// Register values by name, in layout order when decoded
#[derive(Debug, Clone, Default)]
pub struct RegisterSet {
    values: Vec<(String, u32)>,
}

impl RegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<u32> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
    }

    /// Insert or replace a value, keeping the position of an existing entry
    pub fn set(&mut self, name: &str, value: u32) {
        match self.values.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.values.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<u32> {
        let index = self.values.iter().position(|(n, _)| n == name)?;
        Some(self.values.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> + '_ {
        self.values.iter().map(|(n, v)| (n.as_str(), *v))
    }

    /// Linear address of `cs:ip`
    pub fn pc(&self) -> Option<u32> {
        let cs = self.get("cs")?;
        let eip = self.get("eip")?;
        Some(((cs & 0xFFFF) << 4).wrapping_add(eip))
    }
}

// Equality ignores insertion order.
impl PartialEq for RegisterSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|(name, value)| other.get(name) == Some(value))
    }
}

impl Eq for RegisterSet {}

impl Serialize for RegisterSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in &self.values {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Converts between register blobs and [`RegisterSet`]s
#[derive(Debug, Clone, Copy)]
pub struct RegisterCodec {
    layout: &'static [RegisterDef],
}

impl Default for RegisterCodec {
    fn default() -> Self {
        Self::i386()
    }
}

impl RegisterCodec {
    pub const fn i386() -> Self {
        Self { layout: I386_REGISTERS }
    }

    /// Total blob size in bytes
    pub fn blob_size(&self) -> usize {
        self.layout.iter().map(|r| r.width).sum()
    }

    /// Slice a blob into named values. Bytes past the layout are ignored.
    pub fn decode(&self, blob: &[u8]) -> Result<RegisterSet> {
        let expected = self.blob_size();
        if blob.len() < expected {
            return Err(GdbError::Format(format!(
                "register blob is {} bytes, expected at least {}",
                blob.len(),
                expected
            )));
        }

        let mut set = RegisterSet::new();
        let mut offset = 0;
        for def in self.layout {
            let bytes = &blob[offset..offset + def.width];
            let value = bytes.iter().rev().fold(0u32, |acc, &b| (acc << 8) | b as u32);
            set.set(def.name, value);
            offset += def.width;
        }

        if blob.len() > expected {
            log::debug!("Ignoring {} trailing bytes of register blob", blob.len() - expected);
        }
        Ok(set)
    }

    /// Lay a register set out as a blob
    pub fn encode(&self, set: &RegisterSet) -> Result<Vec<u8>> {
        let known = |name: &str| self.layout.iter().any(|d| d.name == name);
        if let Some((name, _)) = set.iter().find(|(name, _)| !known(*name)) {
            return Err(GdbError::Format(format!("unknown register '{}'", name)));
        }

        let mut blob = Vec::with_capacity(self.blob_size());
        for def in self.layout {
            let value = set
                .get(def.name)
                .ok_or_else(|| GdbError::Format(format!("register '{}' is missing", def.name)))?;

            if def.width < 4 && value >> (def.width * 8) != 0 {
                return Err(GdbError::Format(format!(
                    "value {:#x} does not fit in {}-byte register '{}'",
                    value, def.width, def.name
                )));
            }
            blob.extend_from_slice(&value.to_le_bytes()[..def.width]);
        }
        Ok(blob)
    }
}

/// Real-mode segmented addressing
///
/// DOS programs name memory as `segment:offset`; the stub speaks linear
/// addresses. Linear addresses are wrapped to 20 bits the way an 8086 does
/// with the A20 line disabled.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{GdbError, Result};

/// Highest address reachable in real mode without A20
pub const REAL_MODE_LIMIT: u32 = 0xFFFFF;

/// A `segment:offset` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentedAddress {
    pub segment: u16,
    pub offset: u16,
}

impl SegmentedAddress {
    pub fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// Normalized form of a linear address (offset below 16)
    pub fn from_linear(linear: u32) -> Self {
        let linear = linear & REAL_MODE_LIMIT;
        Self {
            segment: (linear >> 4) as u16,
            offset: (linear & 0xF) as u16,
        }
    }

    pub fn to_linear(self) -> u32 {
        ((self.segment as u32) * 16 + self.offset as u32) & REAL_MODE_LIMIT
    }

    /// Parse `SSSS:OOOO` hex notation, each half optionally `0x`-prefixed
    pub fn parse(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.trim().split(':').collect();
        if parts.len() != 2 {
            return Err(GdbError::Format(format!(
                "expected SEGMENT:OFFSET, got {:?}",
                text
            )));
        }

        let segment = parse_component(parts[0], "segment", text)?;
        let offset = parse_component(parts[1], "offset", text)?;
        Ok(Self::new(segment, offset))
    }
}

fn hex_number(text: &str) -> Result<u32> {
    let re = Regex::new(r"^(?:0[xX])?([0-9a-fA-F]+)$")
        .map_err(|e| GdbError::Format(format!("Regex error: {}", e)))?;

    let caps = re
        .captures(text.trim())
        .ok_or_else(|| GdbError::Format(format!("{:?} is not a hexadecimal number", text)))?;

    u32::from_str_radix(&caps[1], 16)
        .map_err(|_| GdbError::Format(format!("{:?} does not fit in 32 bits", text)))
}

fn parse_component(part: &str, name: &str, text: &str) -> Result<u16> {
    let value = hex_number(part)
        .map_err(|_| GdbError::Format(format!("invalid {} in address {:?}", name, text)))?;
    u16::try_from(value).map_err(|_| {
        GdbError::Format(format!("{} {:#x} in {:?} exceeds 16 bits", name, value, text))
    })
}

/// Parse a user-supplied address: `SSSS:OOOO`, `0x` hex, or bare hex
pub fn parse_address(text: &str) -> Result<u32> {
    if text.contains(':') {
        SegmentedAddress::parse(text).map(SegmentedAddress::to_linear)
    } else {
        hex_number(text)
    }
}

impl FromStr for SegmentedAddress {
    type Err = GdbError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<SegmentedAddress> for u32 {
    fn from(address: SegmentedAddress) -> Self {
        address.to_linear()
    }
}

impl fmt::Display for SegmentedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}

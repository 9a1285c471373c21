/// Remote protocol types and data structures
///
/// This module defines the typed forms that decoded packet payloads take.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::address::{SegmentedAddress, REAL_MODE_LIMIT};
use crate::registers::{CS_REGNUM, EIP_REGNUM};

/// Signal number the stub reports for an interrupt request
pub const SIGINT: u8 = 2;
/// Signal number the stub reports for breakpoints and completed steps
pub const SIGTRAP: u8 = 5;

/// A decoded reply to an ordinary command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `OK`
    Ok,
    /// `Exx`
    Error(u8),
    /// The empty packet: the stub does not implement the command
    Unsupported,
    /// Anything else, left for the command to interpret
    Data(String),
}

/// How execution ended, as reported on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopKind {
    /// `S`/`T`: the target stopped with a signal
    Signal(u8),
    /// `W`: the process exited with a status
    Exited(u8),
    /// `X`: the process was terminated by a signal
    Terminated(u8),
}

/// A stop-reply packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReply {
    pub kind: StopKind,
    pub thread: Option<String>,
    /// Stop reason keyword such as `swbreak`, `hwbreak` or `watch`
    pub reason: Option<String>,
    /// Register values carried by a `T` reply, keyed by register number
    pub registers: BTreeMap<usize, u32>,
}

impl StopReply {
    pub fn new(kind: StopKind) -> Self {
        Self {
            kind,
            thread: None,
            reason: None,
            registers: BTreeMap::new(),
        }
    }

    pub fn signal(&self) -> Option<u8> {
        match self.kind {
            StopKind::Signal(signal) | StopKind::Terminated(signal) => Some(signal),
            StopKind::Exited(_) => None,
        }
    }

    /// Linear program counter from the reported `cs`/`eip`, if present
    pub fn pc(&self) -> Option<u32> {
        let eip = *self.registers.get(&EIP_REGNUM)?;
        match self.registers.get(&CS_REGNUM) {
            Some(&cs) if eip <= 0xffff => {
                Some(SegmentedAddress::new(cs as u16, eip as u16).to_linear())
            }
            // 32-bit offsets still wrap at the 1 MiB real-mode boundary
            Some(&cs) => Some((cs << 4).wrapping_add(eip) & REAL_MODE_LIMIT),
            None => Some(eip),
        }
    }
}

/// Classified reason execution stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "kebab-case")]
pub enum StopCause {
    BreakpointHit { pc: Option<u32> },
    StepComplete { pc: Option<u32> },
    Signal { signal: u8 },
    ProcessExit { code: u8 },
}

impl StopCause {
    pub fn pc(&self) -> Option<u32> {
        match self {
            StopCause::BreakpointHit { pc } | StopCause::StepComplete { pc } => *pc,
            _ => None,
        }
    }
}

impl std::fmt::Display for StopCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopCause::BreakpointHit { pc: Some(pc) } => write!(f, "breakpoint-hit at {:#07x}", pc),
            StopCause::BreakpointHit { pc: None } => write!(f, "breakpoint-hit"),
            StopCause::StepComplete { pc: Some(pc) } => write!(f, "step-complete at {:#07x}", pc),
            StopCause::StepComplete { pc: None } => write!(f, "step-complete"),
            StopCause::Signal { signal } => write!(f, "signal {}", signal),
            StopCause::ProcessExit { code } => write!(f, "process-exit with code {}", code),
        }
    }
}

/// Support level of one `qSupported` feature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureValue {
    Supported,
    Unsupported,
    Maybe,
    Value(String),
}

/// One entry of a `qSupported` reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub value: FeatureValue,
}

impl Feature {
    pub fn is_supported(&self) -> bool {
        matches!(self.value, FeatureValue::Supported | FeatureValue::Value(_))
    }
}

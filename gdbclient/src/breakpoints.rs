/// Breakpoint bookkeeping
///
/// The table only ever holds breakpoints the stub has acknowledged. A set or
/// clear that fails leaves it untouched.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::commands::GdbCommands;
use crate::Result;

/// Breakpoint flavour, mapped to the `Z`/`z` type digit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakpointKind {
    #[default]
    Software,
    Hardware,
}

impl BreakpointKind {
    pub fn type_code(self) -> u8 {
        match self {
            BreakpointKind::Software => 0,
            BreakpointKind::Hardware => 1,
        }
    }

    /// Breakpoint length field; one byte on x86
    pub fn length(self) -> u8 {
        1
    }
}

/// An acknowledged breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub address: u32,
    pub kind: BreakpointKind,
}

/// Breakpoints currently set in the stub, in the order they were set
#[derive(Debug, Default)]
pub struct BreakpointTable {
    entries: Vec<Breakpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, address: u32) -> bool {
        self.get(address).is_some()
    }

    pub fn get(&self, address: u32) -> Option<&Breakpoint> {
        self.entries.iter().find(|bp| bp.address == address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tracked addresses in insertion order. The iterator can be cloned to
    /// walk the table again.
    pub fn list(&self) -> Addresses<'_> {
        Addresses {
            inner: self.entries.iter(),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Breakpoint> {
        self.entries.iter()
    }

    /// Set a breakpoint. Returns `false` without touching the wire when one
    /// is already tracked at `address`.
    pub async fn set<S>(
        &mut self,
        commands: &mut GdbCommands<S>,
        address: u32,
        kind: BreakpointKind,
    ) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(existing) = self.get(address) {
            log::debug!("Breakpoint at {:#x} already set ({:?})", address, existing.kind);
            return Ok(false);
        }

        commands.set_breakpoint(address, kind).await?;
        self.entries.push(Breakpoint { address, kind });
        log::debug!("Breakpoint set at {:#x} ({:?})", address, kind);
        Ok(true)
    }

    /// Clear a breakpoint. Returns `false` when none was tracked.
    pub async fn clear<S>(&mut self, commands: &mut GdbCommands<S>, address: u32) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(index) = self.entries.iter().position(|bp| bp.address == address) else {
            return Ok(false);
        };

        commands.clear_breakpoint(address, self.entries[index].kind).await?;
        self.entries.remove(index);
        log::debug!("Breakpoint cleared at {:#x}", address);
        Ok(true)
    }

    /// Track a breakpoint set by an earlier session without touching the wire
    pub fn adopt(&mut self, address: u32, kind: BreakpointKind) -> bool {
        if self.contains(address) {
            return false;
        }
        self.entries.push(Breakpoint { address, kind });
        true
    }

    /// Stop tracking everything, leaving the breakpoints set in the stub
    pub fn release(&mut self) -> Vec<Breakpoint> {
        std::mem::take(&mut self.entries)
    }

    /// Clear every tracked breakpoint, stopping at the first failure
    pub async fn clear_all<S>(&mut self, commands: &mut GdbCommands<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(bp) = self.entries.first().copied() {
            commands.clear_breakpoint(bp.address, bp.kind).await?;
            self.entries.remove(0);
        }
        Ok(())
    }
}

/// Iterator over tracked breakpoint addresses
#[derive(Debug, Clone)]
pub struct Addresses<'a> {
    inner: std::slice::Iter<'a, Breakpoint>,
}

impl Iterator for Addresses<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        self.inner.next().map(|bp| bp.address)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::Transport;
    use crate::packet::PacketCodec;
    use crate::GdbError;
    use std::time::Duration;
    use tokio_test::io::Builder;

    fn commands(mock: tokio_test::io::Mock) -> GdbCommands<tokio_test::io::Mock> {
        GdbCommands::new(PacketCodec::new(Transport::new(mock, Duration::from_secs(1))), 4096)
    }

    #[tokio::test]
    async fn test_set_is_idempotent() {
        // The mock fails the test if a second Z0 is written.
        let mock = Builder::new()
            .write(b"$Z0,1000,1#d4")
            .read(b"+$OK#9a")
            .write(b"+")
            .build();
        let mut cmds = commands(mock);
        let mut table = BreakpointTable::new();

        assert!(table.set(&mut cmds, 0x1000, BreakpointKind::Software).await.unwrap());
        assert!(!table.set(&mut cmds, 0x1000, BreakpointKind::Software).await.unwrap());
        assert_eq!(table.len(), 1);
        assert_eq!(table.list().collect::<Vec<_>>(), vec![0x1000]);
    }

    #[tokio::test]
    async fn test_failed_set_leaves_table_alone() {
        let mock = Builder::new()
            .write(b"$Z0,1000,1#d4")
            .read(b"+$E0e#da")
            .write(b"+")
            .build();
        let mut cmds = commands(mock);
        let mut table = BreakpointTable::new();

        let result = table.set(&mut cmds, 0x1000, BreakpointKind::Software).await;
        assert!(matches!(result, Err(GdbError::Rejected { .. })));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_clear_absent_is_noop() {
        let mock = Builder::new().build();
        let mut cmds = commands(mock);
        let mut table = BreakpointTable::new();

        assert!(!table.clear(&mut cmds, 0x1000).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_uses_recorded_kind() {
        let mock = Builder::new()
            .write(b"$Z1,1000,1#d5")
            .read(b"+$OK#9a")
            .write(b"+")
            .write(b"$z1,1000,1#f5")
            .read(b"+$OK#9a")
            .write(b"+")
            .build();
        let mut cmds = commands(mock);
        let mut table = BreakpointTable::new();

        table.set(&mut cmds, 0x1000, BreakpointKind::Hardware).await.unwrap();
        assert!(table.clear(&mut cmds, 0x1000).await.unwrap());
        assert!(!table.contains(0x1000));
    }

    #[tokio::test]
    async fn test_failed_clear_keeps_entry() {
        let mock = Builder::new()
            .write(b"$Z0,1000,1#d4")
            .read(b"+$OK#9a")
            .write(b"+")
            .write(b"$z0,1000,1#f4")
            .read(b"+$E01#a6")
            .write(b"+")
            .build();
        let mut cmds = commands(mock);
        let mut table = BreakpointTable::new();

        table.set(&mut cmds, 0x1000, BreakpointKind::Software).await.unwrap();
        assert!(table.clear(&mut cmds, 0x1000).await.is_err());
        assert!(table.contains(0x1000));
    }

    #[tokio::test]
    async fn test_adopted_breakpoint_is_cleared_on_the_wire() {
        let mock = Builder::new()
            .write(b"$z1,1000,1#f5")
            .read(b"+$OK#9a")
            .write(b"+")
            .build();
        let mut cmds = commands(mock);
        let mut table = BreakpointTable::new();

        assert!(table.adopt(0x1000, BreakpointKind::Hardware));
        assert!(!table.adopt(0x1000, BreakpointKind::Software));
        assert!(table.clear(&mut cmds, 0x1000).await.unwrap());
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_forgets_without_clearing() {
        let mut table = BreakpointTable::new();
        table.adopt(0x2000, BreakpointKind::Software);
        table.adopt(0x1000, BreakpointKind::Software);

        let released = table.release();
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].address, 0x2000);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_restartable() {
        let mock = Builder::new()
            .write(b"$Z0,2000,1#d5")
            .read(b"+$OK#9a")
            .write(b"+")
            .write(b"$Z0,1000,1#d4")
            .read(b"+$OK#9a")
            .write(b"+")
            .build();
        let mut cmds = commands(mock);
        let mut table = BreakpointTable::new();

        table.set(&mut cmds, 0x2000, BreakpointKind::Software).await.unwrap();
        table.set(&mut cmds, 0x1000, BreakpointKind::Software).await.unwrap();

        let addresses = table.list();
        let first: Vec<u32> = addresses.clone().collect();
        let second: Vec<u32> = addresses.collect();
        assert_eq!(first, vec![0x2000, 0x1000]);
        assert_eq!(first, second);
    }
}

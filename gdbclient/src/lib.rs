/// Debug-stub client for DOSBox-X
///
/// This crate speaks the remote serial protocol of the DOSBox-X debug stub
/// and provides a high-level API for memory, register, breakpoint and
/// execution control of the DOS program being emulated.

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub mod address;
pub mod breakpoints;
pub mod commands;
pub mod communication;
pub mod config;
pub mod execution;
pub mod packet;
pub mod parser;
pub mod registers;
pub mod types;

pub use address::{parse_address, SegmentedAddress};
pub use breakpoints::{Breakpoint, BreakpointKind, BreakpointTable};
pub use commands::GdbCommands;
pub use communication::Transport;
pub use config::*;
pub use execution::{ExecutionController, ExecutionState, Resume};
pub use packet::PacketCodec;
pub use registers::{RegisterCodec, RegisterSet};
pub use types::*;

#[derive(Error, Debug)]
pub enum GdbError {
    #[error("Failed to connect to debug stub at {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("Timed out after {0:?} waiting for the debug stub")]
    Timeout(Duration),
    #[error("Checksum mismatch: packet says {expected:02x}, computed {actual:02x}")]
    Checksum { expected: u8, actual: u8 },
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Debug stub rejected '{command}' with error {code:02x}")]
    Rejected { command: String, code: u8 },
    #[error("Debug stub does not support '{0}'")]
    Unsupported(String),
    #[error("Invalid execution state: {0}")]
    InvalidState(String),
    #[error("Invalid format: {0}")]
    Format(String),
    #[error("Cannot access {length} bytes at {address:#x} (stub error {code:02x})")]
    MemoryAccess { address: u32, length: usize, code: u8 },
}

impl GdbError {
    /// The connection is gone; reconnect before doing anything else
    pub fn is_fatal(&self) -> bool {
        matches!(self, GdbError::Connection { .. } | GdbError::Transport(_))
    }

    /// The session can't be trusted until the caller interrupts or reconnects
    pub fn needs_recovery(&self) -> bool {
        self.is_fatal() || matches!(self, GdbError::Timeout(_))
    }

    /// Damaged on the wire; the stub will resend after a `-`
    pub fn is_retransmittable(&self) -> bool {
        matches!(self, GdbError::Checksum { .. } | GdbError::MalformedPacket(_))
    }
}

pub type Result<T> = std::result::Result<T, GdbError>;

/// One debug session: connection, breakpoints and execution state
pub struct GdbClient<S = TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    config: ClientConfig,
    commands: GdbCommands<S>,
    breakpoints: BreakpointTable,
    execution: ExecutionController,
}

impl GdbClient<TcpStream> {
    /// Connect to the stub described by `config`
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let transport = Transport::connect(
            &config.host,
            config.port,
            config.connect_timeout(),
            config.response_timeout(),
        )
        .await?;

        let mut client = Self::from_transport(transport, config);
        if client.config.no_ack_mode {
            match client.commands.start_no_ack_mode().await {
                Ok(true) => {}
                Ok(false) => log::warn!("Debug stub refused no-ack mode, keeping acknowledgements"),
                Err(e) => {
                    client.close().await;
                    return Err(e);
                }
            }
        }
        log::info!("Debug session open on {}", client.config.endpoint());
        Ok(client)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> GdbClient<S> {
    /// Run a session over an already connected stream
    pub fn from_stream(stream: S, config: ClientConfig) -> Self {
        let transport = Transport::new(stream, config.response_timeout());
        Self::from_transport(transport, config)
    }

    fn from_transport(transport: Transport<S>, config: ClientConfig) -> Self {
        let commands = GdbCommands::new(PacketCodec::new(transport), config.max_memory_chunk);
        Self {
            config,
            commands,
            breakpoints: BreakpointTable::new(),
            execution: ExecutionController::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ExecutionState {
        self.execution.state()
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    pub fn is_connected(&self) -> bool {
        self.commands.codec().transport().is_open()
    }

    fn ensure_not_running(&self) -> Result<()> {
        if self.execution.is_running() {
            return Err(GdbError::InvalidState(
                "target is running; interrupt it before issuing commands".into(),
            ));
        }
        Ok(())
    }

    pub async fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.ensure_not_running()?;
        self.commands.read_memory(address, length).await
    }

    pub async fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.ensure_not_running()?;
        self.commands.write_memory(address, data).await
    }

    pub async fn read_registers(&mut self) -> Result<RegisterSet> {
        self.ensure_not_running()?;
        self.commands.read_registers().await
    }

    pub async fn write_registers(&mut self, registers: &RegisterSet) -> Result<()> {
        self.ensure_not_running()?;
        self.commands.write_registers(registers).await
    }

    /// Set a breakpoint; `false` if one was already tracked at `address`
    pub async fn set_breakpoint(&mut self, address: u32, kind: BreakpointKind) -> Result<bool> {
        self.ensure_not_running()?;
        self.breakpoints.set(&mut self.commands, address, kind).await
    }

    /// Clear a breakpoint; `false` if none was tracked at `address`
    pub async fn clear_breakpoint(&mut self, address: u32) -> Result<bool> {
        self.ensure_not_running()?;
        self.breakpoints.clear(&mut self.commands, address).await
    }

    /// Track a breakpoint left in the stub by an earlier session so it can be
    /// cleared from this one
    pub fn adopt_breakpoint(&mut self, address: u32, kind: BreakpointKind) -> bool {
        self.breakpoints.adopt(address, kind)
    }

    /// Hand tracked breakpoints back to the stub; `close` will leave them set
    pub fn release_breakpoints(&mut self) -> Vec<Breakpoint> {
        self.breakpoints.release()
    }

    /// Resume until the next stop. `None` waits indefinitely.
    pub async fn continue_execution(&mut self, timeout: Option<Duration>) -> Result<StopCause> {
        self.execution.continue_execution(&mut self.commands, timeout).await
    }

    pub async fn step(&mut self, timeout: Option<Duration>) -> Result<StopCause> {
        self.execution.step(&mut self.commands, timeout).await
    }

    /// Break into a running target and wait for it to stop
    pub async fn interrupt(&mut self, timeout: Option<Duration>) -> Result<StopCause> {
        self.execution.interrupt(&mut self.commands, timeout).await
    }

    /// Ask why the target is stopped and record the answer
    pub async fn halt_reason(&mut self) -> Result<StopReply> {
        self.ensure_not_running()?;
        let reply = self.commands.halt_reason().await?;
        self.execution.observe(&reply);
        Ok(reply)
    }

    pub async fn query(&mut self, key: &str) -> Result<Option<String>> {
        self.ensure_not_running()?;
        self.commands.query(key).await
    }

    pub async fn supported_features(&mut self) -> Result<Vec<Feature>> {
        self.ensure_not_running()?;
        self.commands.supported_features().await
    }

    /// Remove our breakpoints and let the target run free
    pub async fn detach(&mut self) -> Result<()> {
        self.ensure_not_running()?;
        self.breakpoints.clear_all(&mut self.commands).await?;
        self.commands.detach().await?;
        self.execution.reset();
        Ok(())
    }

    /// Clear breakpoints if the target is stopped, then close the connection.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        if self.is_connected() && !self.execution.is_running() && !self.breakpoints.is_empty() {
            if let Err(e) = self.breakpoints.clear_all(&mut self.commands).await {
                log::warn!("Could not clear breakpoints before closing: {}", e);
            }
        }
        self.commands.close().await;
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Drop for GdbClient<S> {
    fn drop(&mut self) {
        if self.is_connected() && !self.breakpoints.is_empty() {
            log::warn!(
                "Dropping session with {} breakpoint(s) still set in the stub",
                self.breakpoints.len()
            );
        }
    }
}

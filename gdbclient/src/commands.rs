/// Debug stub command management and execution
///
/// This module provides one call per stub capability. Each call sends a
/// framed command and waits for the matching reply; nothing is pipelined.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::breakpoints::BreakpointKind;
use crate::packet::PacketCodec;
use crate::parser::{
    decode_hex, encode_hex, parse_console_output, parse_features, parse_response, parse_stop_reply,
};
use crate::registers::{RegisterCodec, RegisterSet};
use crate::types::{Feature, FeatureValue, Response, StopReply};
use crate::{GdbError, Result};

/// Bytes of framing around a packet body (`$`, `#`, two checksum digits)
const PACKET_OVERHEAD: usize = 4;

/// High-level interface for stub commands
pub struct GdbCommands<S = TcpStream> {
    codec: PacketCodec<S>,
    registers: RegisterCodec,
    max_chunk: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> GdbCommands<S> {
    pub fn new(codec: PacketCodec<S>, max_chunk: usize) -> Self {
        Self {
            codec,
            registers: RegisterCodec::i386(),
            max_chunk: max_chunk.max(1),
        }
    }

    pub fn codec(&self) -> &PacketCodec<S> {
        &self.codec
    }

    /// Largest number of bytes moved per memory packet
    pub fn max_chunk(&self) -> usize {
        self.max_chunk
    }

    /// Receive one packet, asking once for a retransmission if it arrives damaged
    async fn receive_payload(&mut self, deadline: Option<Duration>) -> Result<Vec<u8>> {
        match self.codec.receive_packet(deadline).await {
            Err(e) if e.is_retransmittable() && self.codec.acks_enabled() => {
                log::warn!("RECV: waiting for retransmission after: {}", e);
                self.codec.receive_packet(deadline).await.map_err(|e| {
                    log::error!("RECV: retransmitted packet was also rejected: {}", e);
                    e
                })
            }
            other => other,
        }
    }

    /// Send a raw command payload and return the decoded reply
    pub async fn request(&mut self, payload: &str) -> Result<Response> {
        self.codec.send_packet(payload).await?;
        let timeout = self.codec.transport().timeout();
        let reply = self.receive_payload(Some(timeout)).await?;
        parse_response(&reply)
    }

    /// Send a command whose only successful reply is `OK`
    async fn request_ok(&mut self, payload: &str, command: &str) -> Result<()> {
        match self.request(payload).await? {
            Response::Ok => Ok(()),
            Response::Error(code) => Err(GdbError::Rejected {
                command: command.to_string(),
                code,
            }),
            Response::Unsupported => Err(GdbError::Unsupported(command.to_string())),
            Response::Data(data) => Err(GdbError::Protocol(format!(
                "unexpected reply to '{}': {}",
                command, data
            ))),
        }
    }

    /// Read exactly `length` bytes starting at a linear address
    pub async fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(length);

        while data.len() < length {
            let chunk_address = address.wrapping_add(data.len() as u32);
            let chunk_length = (length - data.len()).min(self.max_chunk);

            let command = format!("m{:x},{:x}", chunk_address, chunk_length);
            let bytes = match self.request(&command).await? {
                Response::Data(hex) => decode_hex(&hex)?,
                Response::Error(code) => {
                    return Err(GdbError::MemoryAccess {
                        address: chunk_address,
                        length: chunk_length,
                        code,
                    })
                }
                Response::Unsupported => return Err(GdbError::Unsupported("m".into())),
                Response::Ok => {
                    return Err(GdbError::Protocol(format!(
                        "unexpected OK reply to memory read at {:#x}",
                        chunk_address
                    )))
                }
            };

            if bytes.len() > chunk_length {
                return Err(GdbError::Protocol(format!(
                    "asked for {} bytes at {:#x}, stub returned {}",
                    chunk_length,
                    chunk_address,
                    bytes.len()
                )));
            }
            if bytes.len() < chunk_length {
                log::debug!(
                    "Short memory read at {:#x}: {} of {} bytes, continuing",
                    chunk_address,
                    bytes.len(),
                    chunk_length
                );
            }
            data.extend_from_slice(&bytes);
        }

        Ok(data)
    }

    /// Write `data` starting at a linear address
    pub async fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let mut written = 0;

        while written < data.len() {
            let chunk_address = address.wrapping_add(written as u32);
            let chunk = &data[written..(written + self.max_chunk).min(data.len())];
            let payload = format!("M{:x},{:x}:{}", chunk_address, chunk.len(), encode_hex(chunk));

            match self.request(&payload).await? {
                Response::Ok => written += chunk.len(),
                Response::Error(code) => {
                    return Err(GdbError::MemoryAccess {
                        address: chunk_address,
                        length: chunk.len(),
                        code,
                    })
                }
                Response::Unsupported => return Err(GdbError::Unsupported("M".into())),
                Response::Data(reply) => {
                    let message = format!("unexpected reply to memory write: {}", reply);
                    return Err(GdbError::Protocol(message));
                }
            }
        }

        Ok(())
    }

    pub async fn read_registers(&mut self) -> Result<RegisterSet> {
        match self.request("g").await? {
            Response::Data(hex) => self.registers.decode(&decode_hex(&hex)?),
            Response::Error(code) => Err(GdbError::Rejected {
                command: "g".into(),
                code,
            }),
            Response::Unsupported => Err(GdbError::Unsupported("g".into())),
            Response::Ok => Err(GdbError::Protocol("unexpected OK reply to register read".into())),
        }
    }

    pub async fn write_registers(&mut self, registers: &RegisterSet) -> Result<()> {
        let blob = self.registers.encode(registers)?;
        self.request_ok(&format!("G{}", encode_hex(&blob)), "G").await
    }

    pub async fn set_breakpoint(&mut self, address: u32, kind: BreakpointKind) -> Result<()> {
        let command = format!("Z{}", kind.type_code());
        self.request_ok(&format!("{},{:x},{}", command, address, kind.length()), &command)
            .await
    }

    pub async fn clear_breakpoint(&mut self, address: u32, kind: BreakpointKind) -> Result<()> {
        let command = format!("z{}", kind.type_code());
        self.request_ok(&format!("{},{:x},{}", command, address, kind.length()), &command)
            .await
    }

    /// Resume and wait for the next stop reply
    pub async fn continue_execution(&mut self, timeout: Option<Duration>) -> Result<StopReply> {
        self.resume("c", timeout).await
    }

    /// Execute one instruction and wait for the stop reply
    pub async fn single_step(&mut self, timeout: Option<Duration>) -> Result<StopReply> {
        self.resume("s", timeout).await
    }

    /// Ask why the target last stopped
    pub async fn halt_reason(&mut self) -> Result<StopReply> {
        let timeout = self.codec.transport().timeout();
        self.resume("?", Some(timeout)).await
    }

    /// Send the break byte and wait for the stop it causes
    pub async fn interrupt(&mut self, timeout: Option<Duration>) -> Result<StopReply> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.codec.send_interrupt().await?;
        self.wait_for_stop(deadline, timeout).await
    }

    /// Send a command answered by a stop reply. `timeout` covers both the
    /// acknowledgment and the stop reply.
    async fn resume(&mut self, payload: &str, timeout: Option<Duration>) -> Result<StopReply> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.codec
            .send_packet_within(payload, timeout)
            .await
            .map_err(|e| overall_timeout(e, timeout))?;
        self.wait_for_stop(deadline, timeout).await
    }

    /// Wait until `deadline` for a stop reply, skipping console output packets
    async fn wait_for_stop(
        &mut self,
        deadline: Option<Instant>,
        timeout: Option<Duration>,
    ) -> Result<StopReply> {
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(GdbError::Timeout(timeout.unwrap_or_default()));
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let payload = self
                .receive_payload(remaining)
                .await
                .map_err(|e| overall_timeout(e, timeout))?;

            let text = String::from_utf8_lossy(&payload);
            if let Some(output) = parse_console_output(&text) {
                log::info!("Target output: {}", output.trim_end());
                continue;
            }
            if payload.is_empty() {
                return Err(GdbError::Protocol("empty reply while waiting for a stop reply".into()));
            }
            return parse_stop_reply(&text);
        }
    }

    /// Detach; the stub resumes the target on its own
    pub async fn detach(&mut self) -> Result<()> {
        self.request_ok("D", "D").await
    }

    /// Generic query passthrough. `None` means the stub doesn't know the query.
    pub async fn query(&mut self, key: &str) -> Result<Option<String>> {
        let payload = if key.starts_with('q') || key.starts_with('Q') {
            key.to_string()
        } else {
            format!("q{}", key)
        };

        match self.request(&payload).await? {
            Response::Unsupported => Ok(None),
            Response::Ok => Ok(Some("OK".into())),
            Response::Error(code) => Ok(Some(format!("E{:02x}", code))),
            Response::Data(data) => Ok(Some(data)),
        }
    }

    /// `qSupported`; a reported `PacketSize` narrows the memory chunk size
    pub async fn supported_features(&mut self) -> Result<Vec<Feature>> {
        let reply = self
            .query("qSupported:swbreak+;hwbreak+")
            .await?
            .ok_or_else(|| GdbError::Unsupported("qSupported".into()))?;
        let features = parse_features(&reply);

        let packet_size = features.iter().find_map(|f| match (&f.name[..], &f.value) {
            ("PacketSize", FeatureValue::Value(size)) => usize::from_str_radix(size, 16).ok(),
            _ => None,
        });
        if let Some(size) = packet_size {
            let limit = (size.saturating_sub(PACKET_OVERHEAD + 32) / 2).max(1);
            if limit < self.max_chunk {
                log::debug!(
                    "Stub packet size {:#x}: memory chunk {} -> {} bytes",
                    size,
                    self.max_chunk,
                    limit
                );
                self.max_chunk = limit;
            }
        }

        Ok(features)
    }

    /// Negotiate no-ack mode. Returns whether the stub agreed.
    pub async fn start_no_ack_mode(&mut self) -> Result<bool> {
        match self.request("QStartNoAckMode").await? {
            Response::Ok => {
                self.codec.set_acks_enabled(false);
                log::debug!("No-ack mode enabled");
                Ok(true)
            }
            Response::Unsupported => Ok(false),
            other => Err(GdbError::Protocol(format!(
                "unexpected reply to QStartNoAckMode: {:?}",
                other
            ))),
        }
    }

    pub async fn close(&mut self) {
        self.codec.close().await;
    }
}

/// Report a timeout against the caller's overall limit
fn overall_timeout(error: GdbError, timeout: Option<Duration>) -> GdbError {
    match (error, timeout) {
        (GdbError::Timeout(_), Some(limit)) => GdbError::Timeout(limit),
        (other, _) => other,
    }
}

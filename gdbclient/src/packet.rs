/// Remote serial protocol packet framing
///
/// Packets travel as `$<body>#<checksum>` where the checksum is the sum of
/// the transmitted body bytes modulo 256, written as two hex digits. Inside
/// the body `}` escapes a reserved byte (XOR 0x20) and `*` introduces a
/// run-length count for the preceding byte. Each packet is answered with a
/// single `+` (accepted) or `-` (retransmit) byte unless acks are disabled.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::communication::Transport;
use crate::{GdbError, Result};

pub const PACKET_START: u8 = b'$';
pub const PACKET_END: u8 = b'#';
pub const ESCAPE: u8 = b'}';
pub const RUN_LENGTH: u8 = b'*';
pub const ACK: u8 = b'+';
pub const NACK: u8 = b'-';
/// Out-of-band break request, sent unframed.
pub const INTERRUPT: u8 = 0x03;

/// How many times a packet refused with `-` is sent again.
pub const MAX_RETRANSMITS: usize = 1;

const ESCAPE_XOR: u8 = 0x20;
const RUN_LENGTH_BIAS: u8 = 29;
const MIN_RUN_REPEAT: usize = 3;
const MAX_RUN_REPEAT: usize = (b'~' - RUN_LENGTH_BIAS) as usize;

/// Body encoding used for an outgoing packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    RunLength,
}

/// Sum of `data` modulo 256
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn is_reserved(byte: u8) -> bool {
    matches!(byte, PACKET_START | PACKET_END | ESCAPE | RUN_LENGTH)
}

/// Frame a payload without compression
pub fn encode(payload: &str) -> Vec<u8> {
    encode_with(payload.as_bytes(), Compression::None)
}

/// Frame a payload: start marker, encoded body, end marker, checksum
pub fn encode_with(payload: &[u8], compression: Compression) -> Vec<u8> {
    let body = match compression {
        Compression::None => escape(payload),
        Compression::RunLength => compress(payload),
    };

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.push(PACKET_START);
    frame.extend_from_slice(&body);
    frame.push(PACKET_END);
    frame.extend_from_slice(format!("{:02x}", checksum(&body)).as_bytes());
    frame
}

/// Escape reserved bytes
pub fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for &byte in payload {
        if is_reserved(byte) {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
    out
}

/// Escape reserved bytes and run-length encode repeats of the others
pub fn compress(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    let mut i = 0;

    while i < payload.len() {
        let byte = payload[i];
        let run = payload[i..].iter().take_while(|&&b| b == byte).count();
        i += run;

        if is_reserved(byte) {
            for _ in 0..run {
                out.push(ESCAPE);
                out.push(byte ^ ESCAPE_XOR);
            }
            continue;
        }

        let mut remaining = run;
        while remaining > 0 {
            out.push(byte);
            remaining -= 1;

            let mut repeat = remaining.min(MAX_RUN_REPEAT);
            if repeat < MIN_RUN_REPEAT {
                continue;
            }
            // counts of 6 and 7 would put '#' or '$' on the wire
            if repeat == 6 || repeat == 7 {
                repeat = 5;
            }
            out.push(RUN_LENGTH);
            out.push(repeat as u8 + RUN_LENGTH_BIAS);
            remaining -= repeat;
        }
    }

    out
}

/// Undo escaping and expand run-length runs of a received body
pub fn decode_body(body: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(body.len());
    let mut bytes = body.iter().copied();

    while let Some(byte) = bytes.next() {
        match byte {
            ESCAPE => {
                let escaped = bytes.next().ok_or_else(|| {
                    GdbError::MalformedPacket("dangling escape at end of packet".into())
                })?;
                out.push(escaped ^ ESCAPE_XOR);
            }
            RUN_LENGTH => {
                let count = bytes.next().ok_or_else(|| {
                    GdbError::MalformedPacket("run-length marker without a count".into())
                })?;
                let previous = *out.last().ok_or_else(|| {
                    let message = "run-length marker without a preceding character";
                    GdbError::MalformedPacket(message.into())
                })?;
                let repeat = count.checked_sub(RUN_LENGTH_BIAS).ok_or_else(|| {
                    GdbError::MalformedPacket(format!("invalid run-length count {:#04x}", count))
                })?;
                out.extend(std::iter::repeat(previous).take(repeat as usize));
            }
            _ => out.push(byte),
        }
    }

    Ok(out)
}

/// Check a received body against its checksum digits and decode it
pub fn verify_frame(body: &[u8], digits: &[u8]) -> Result<Vec<u8>> {
    let expected = std::str::from_utf8(digits)
        .ok()
        .filter(|s| s.len() == 2)
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or_else(|| {
            let digits = String::from_utf8_lossy(digits);
            GdbError::MalformedPacket(format!("invalid checksum digits {:?}", digits))
        })?;

    let actual = checksum(body);
    if actual != expected {
        return Err(GdbError::Checksum { expected, actual });
    }

    decode_body(body)
}

/// Index just past the first complete `$...#xx` frame in `buffered`
fn frame_end(buffered: &[u8]) -> Option<usize> {
    let start = buffered.iter().position(|&b| b == PACKET_START)?;
    let hash = start + buffered[start..].iter().position(|&b| b == PACKET_END)?;
    (buffered.len() >= hash + 3).then_some(hash + 3)
}

/// Packet layer on top of a [`Transport`]
pub struct PacketCodec<S = TcpStream> {
    transport: Transport<S>,
    acks: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> PacketCodec<S> {
    pub fn new(transport: Transport<S>) -> Self {
        Self { transport, acks: true }
    }

    pub fn transport(&self) -> &Transport<S> {
        &self.transport
    }

    pub fn acks_enabled(&self) -> bool {
        self.acks
    }

    /// Switch acknowledgment bytes on or off (no-ack mode)
    pub fn set_acks_enabled(&mut self, enabled: bool) {
        self.acks = enabled;
    }

    /// Send a framed payload and wait for the stub to accept it
    pub async fn send_packet(&mut self, payload: &str) -> Result<()> {
        self.send_packet_within(payload, None).await
    }

    /// Like [`send_packet`](Self::send_packet), but the wait for the
    /// acknowledgment ends at `limit` instead of the transport timeout.
    /// Retransmissions share the same limit.
    pub async fn send_packet_within(
        &mut self,
        payload: &str,
        limit: Option<Duration>,
    ) -> Result<()> {
        let frame = encode(payload);
        let limit = limit.unwrap_or_else(|| self.transport.timeout());
        let deadline = Instant::now() + limit;

        for attempt in 0..=MAX_RETRANSMITS {
            if attempt == 0 {
                log::debug!("SEND: {}", payload);
            } else {
                log::warn!("SEND: retransmitting '{}' (attempt {})", payload, attempt + 1);
            }
            self.transport.send(&frame).await?;

            if !self.acks {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let accepted = self.receive_ack(remaining).await.map_err(|e| match e {
                GdbError::Timeout(_) => GdbError::Timeout(limit),
                other => other,
            })?;
            if accepted {
                return Ok(());
            }
        }

        log::error!("Debug stub kept rejecting packet '{}'", payload);
        Err(GdbError::Protocol(format!(
            "debug stub rejected packet '{}' after {} retransmission(s)",
            payload, MAX_RETRANSMITS
        )))
    }

    /// Wait for `+` or `-`. A packet start seen first counts as accepted
    /// and is left in the buffer.
    async fn receive_ack(&mut self, timeout: Duration) -> Result<bool> {
        let skipped = self
            .transport
            .receive_until(Some(timeout), |buffered| {
                buffered
                    .iter()
                    .position(|&b| b == ACK || b == NACK || b == PACKET_START)
                    .map(|i| if buffered[i] == PACKET_START { i } else { i + 1 })
            })
            .await?;

        match skipped.last() {
            Some(&ACK) => {
                log::trace!("ACK: +");
                Ok(true)
            }
            Some(&NACK) => {
                log::warn!("ACK: - (debug stub asked for retransmission)");
                Ok(false)
            }
            _ => {
                log::warn!("Reply arrived without acknowledgment; treating packet as accepted");
                Ok(true)
            }
        }
    }

    /// Read the next packet, verify it, acknowledge it and return its payload.
    ///
    /// A packet that fails verification is answered with `-` and the error is
    /// returned; reading the retransmission is up to the caller.
    pub async fn receive_packet(&mut self, deadline: Option<Duration>) -> Result<Vec<u8>> {
        let raw = self.transport.receive_until(deadline, frame_end).await?;

        let start = raw.iter().position(|&b| b == PACKET_START).unwrap_or(0);
        if start > 0 {
            let skipped = String::from_utf8_lossy(&raw[..start]);
            log::trace!("Skipped {} bytes before packet start: {:?}", start, skipped);
        }
        let hash = raw.len() - 3;

        match verify_frame(&raw[start + 1..hash], &raw[hash + 1..]) {
            Ok(payload) => {
                if self.acks {
                    self.transport.send(&[ACK]).await?;
                }
                log::debug!("RECV: {}", String::from_utf8_lossy(&payload));
                Ok(payload)
            }
            Err(e) => {
                let rejected = String::from_utf8_lossy(&raw[start..]);
                log::warn!("RECV: rejecting packet {:?}: {}", rejected, e);
                if self.acks {
                    self.transport.send(&[NACK]).await?;
                }
                Err(e)
            }
        }
    }

    /// Send the unframed break byte
    pub async fn send_interrupt(&mut self) -> Result<()> {
        log::debug!("SEND: <interrupt>");
        self.transport.send(&[INTERRUPT]).await
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn codec(mock: tokio_test::io::Mock) -> PacketCodec<tokio_test::io::Mock> {
        PacketCodec::new(Transport::new(mock, Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_ack_wait_uses_given_limit() {
        let (client, _stub) = tokio::io::duplex(64);
        let mut codec = PacketCodec::new(Transport::new(client, Duration::from_secs(5)));

        let started = std::time::Instant::now();
        let result = codec.send_packet_within("c", Some(Duration::from_millis(100))).await;

        let limit = Duration::from_millis(100);
        assert!(matches!(result, Err(GdbError::Timeout(reported)) if reported == limit));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_checksum() {
        assert_eq!(checksum(b"OK"), 0x9a);
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(&[0xff, 0x02]), 0x01);
    }

    #[test]
    fn test_encode_frames_payload() {
        assert_eq!(encode("g"), b"$g#67");
        assert_eq!(encode("OK"), b"$OK#9a");
        assert_eq!(encode(""), b"$#00");
    }

    #[test]
    fn test_escape_reserved_bytes() {
        let payload = b"a$b#c}d*";
        let escaped = escape(payload);
        assert_eq!(escaped, b"a}\x04b}\x03c}]d}\x0a");
        assert_eq!(decode_body(&escaped).unwrap(), payload);

        let frame = encode_with(payload, Compression::None);
        assert_eq!(frame.iter().filter(|&&b| b == PACKET_END).count(), 1);
    }

    #[test]
    fn test_decode_run_length() {
        assert_eq!(decode_body(b"0* ").unwrap(), b"0000");
        assert_eq!(decode_body(b"00*\"00").unwrap(), b"000000000");
    }

    #[test]
    fn test_compress_round_trip() {
        let payloads: Vec<Vec<u8>> = vec![
            Vec::new(),
            b"a".to_vec(),
            b"aaaa".to_vec(),
            vec![b'0'; 7],
            vec![b'0'; 8],
            vec![b'x'; 200],
            [b"ab".repeat(50), vec![b'c'; 30]].concat(),
            b"$$$$$##}}**".to_vec(),
        ];

        for payload in &payloads {
            let body = compress(payload);
            assert!(!body.contains(&PACKET_START), "{:?}", body);
            assert!(!body.contains(&PACKET_END), "{:?}", body);
            assert_eq!(&decode_body(&body).unwrap(), payload);
        }
    }

    #[test]
    fn test_compress_shrinks_runs() {
        let body = compress(&[b'0'; 100]);
        assert!(body.len() < 10, "{:?}", body);
    }

    #[test]
    fn test_decode_rejects_malformed_bodies() {
        for body in [&b"*a"[..], b"ab}", b"a*", b"a*\x10"] {
            let result = decode_body(body);
            assert!(matches!(result, Err(GdbError::MalformedPacket(_))), "{:?}", body);
        }
    }

    #[test]
    fn test_verify_frame_round_trip() {
        for payload in ["OK", "deadbeef", "S05", "", "qSupported:swbreak+"] {
            let frame = encode(payload);
            let hash = frame.len() - 3;
            let decoded = verify_frame(&frame[1..hash], &frame[hash + 1..]).unwrap();
            assert_eq!(decoded, payload.as_bytes());
        }
    }

    #[test]
    fn test_single_bit_corruption_is_detected() {
        let body = b"deadbeef".to_vec();
        let digits = b"20".to_vec();
        assert!(verify_frame(&body, &digits).is_ok());

        for i in 0..body.len() {
            for bit in 0..8 {
                let mut corrupted = body.clone();
                corrupted[i] ^= 1 << bit;
                let result = verify_frame(&corrupted, &digits);
                assert!(matches!(result, Err(GdbError::Checksum { .. })), "byte {} bit {}", i, bit);
            }
        }

        for i in 0..digits.len() {
            for bit in 0..8 {
                let mut corrupted = digits.clone();
                corrupted[i] ^= 1 << bit;
                let result = verify_frame(&body, &corrupted);
                assert!(
                    matches!(
                        result,
                        Err(GdbError::Checksum { .. }) | Err(GdbError::MalformedPacket(_))
                    ),
                    "digit {} bit {}",
                    i,
                    bit
                );
            }
        }
    }

    #[tokio::test]
    async fn test_receive_packet_acknowledges() {
        let mock = Builder::new().read(b"+$OK#9a").write(b"+").build();
        let mut codec = codec(mock);

        let payload = codec.receive_packet(None).await.unwrap();
        assert_eq!(payload, b"OK");
    }

    #[tokio::test]
    async fn test_receive_packet_rejects_bad_checksum() {
        let mock = Builder::new().read(b"$OK#00").write(b"-").build();
        let mut codec = codec(mock);

        let result = codec.receive_packet(None).await;
        match result {
            Err(GdbError::Checksum { expected, actual }) => {
                assert_eq!(expected, 0x00);
                assert_eq!(actual, 0x9a);
            }
            other => panic!("Expected checksum error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receive_empty_packet() {
        let mock = Builder::new().read(b"$#00").write(b"+").build();
        let mut codec = codec(mock);

        let payload = codec.receive_packet(None).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_send_packet_retransmits_once() {
        let mock = Builder::new()
            .write(b"$g#67")
            .read(b"-")
            .write(b"$g#67")
            .read(b"+")
            .build();
        let mut codec = codec(mock);

        codec.send_packet("g").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_packet_gives_up_after_retransmit() {
        let mock = Builder::new()
            .write(b"$g#67")
            .read(b"-")
            .write(b"$g#67")
            .read(b"-")
            .build();
        let mut codec = codec(mock);

        let result = codec.send_packet("g").await;
        assert!(matches!(result, Err(GdbError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_reply_without_ack_is_kept() {
        let mock = Builder::new().write(b"$g#67").read(b"$OK#9a").write(b"+").build();
        let mut codec = codec(mock);

        codec.send_packet("g").await.unwrap();
        let payload = codec.receive_packet(None).await.unwrap();
        assert_eq!(payload, b"OK");
    }

    #[tokio::test]
    async fn test_no_ack_mode_skips_ack_bytes() {
        let mock = Builder::new().write(b"$g#67").read(b"$OK#9a").build();
        let mut codec = codec(mock);
        codec.set_acks_enabled(false);

        codec.send_packet("g").await.unwrap();
        let payload = codec.receive_packet(None).await.unwrap();
        assert_eq!(payload, b"OK");
    }

    #[tokio::test]
    async fn test_send_interrupt_is_unframed() {
        let mock = Builder::new().write(&[INTERRUPT]).build();
        let mut codec = codec(mock);

        codec.send_interrupt().await.unwrap();
    }
}

/// Remote protocol payload parser
///
/// This module turns decoded packet payloads into typed replies.

use crate::types::*;
use crate::{GdbError, Result};
use regex::Regex;

/// Classify a reply payload
pub fn parse_response(payload: &[u8]) -> Result<Response> {
    let text = std::str::from_utf8(payload).map_err(|_| {
        GdbError::Protocol(format!("non-ASCII reply: {:?}", String::from_utf8_lossy(payload)))
    })?;

    if text.is_empty() {
        return Ok(Response::Unsupported);
    }
    if text == "OK" {
        return Ok(Response::Ok);
    }
    // Hex data is always an even number of digits, so `Exx` can't be data.
    if text.len() == 3 && text.starts_with('E') {
        if let Ok(code) = u8::from_str_radix(&text[1..], 16) {
            return Ok(Response::Error(code));
        }
    }
    Ok(Response::Data(text.to_string()))
}

/// Parse an `S`, `T`, `W` or `X` stop reply
pub fn parse_stop_reply(payload: &str) -> Result<StopReply> {
    let re = Regex::new(r"^([STWX])([0-9a-fA-F]{2})(.*)$")
        .map_err(|e| GdbError::Protocol(format!("Regex error: {}", e)))?;

    let caps = re
        .captures(payload)
        .ok_or_else(|| GdbError::Protocol(format!("invalid stop reply: {}", payload)))?;

    let number = u8::from_str_radix(&caps[2], 16)
        .map_err(|_| GdbError::Protocol(format!("invalid stop reply: {}", payload)))?;
    let rest = caps.get(3).map(|m| m.as_str()).unwrap_or("");

    let kind = match &caps[1] {
        "S" | "T" => StopKind::Signal(number),
        "W" => StopKind::Exited(number),
        "X" => StopKind::Terminated(number),
        other => return Err(GdbError::Protocol(format!("unknown stop reply type: {}", other))),
    };

    let mut reply = StopReply::new(kind);
    if &caps[1] == "T" {
        parse_stop_fields(rest, &mut reply)?;
    }
    Ok(reply)
}

/// Parse the `n:r;` pairs that follow a `T` reply
fn parse_stop_fields(fields: &str, reply: &mut StopReply) -> Result<()> {
    for field in fields.split(';').filter(|f| !f.is_empty()) {
        let (name, value) = field.split_once(':').unwrap_or((field, ""));

        if name.chars().all(|c| c.is_ascii_hexdigit()) {
            let regnum = usize::from_str_radix(name, 16).map_err(|_| {
                GdbError::Protocol(format!("invalid register number in stop reply: {}", name))
            })?;
            reply.registers.insert(regnum, parse_le_hex(value)?);
            continue;
        }

        match name {
            "thread" => reply.thread = Some(value.to_string()),
            "swbreak" | "hwbreak" | "watch" | "rwatch" | "awatch" | "library" | "replaylog"
            | "create" => {
                reply.reason = Some(name.to_string());
            }
            _ => log::debug!("Ignoring stop reply field '{}'", field),
        }
    }
    Ok(())
}

/// Decode an `O<hex>` console output packet, if that's what `payload` is
pub fn parse_console_output(payload: &str) -> Option<String> {
    let hex = payload.strip_prefix('O')?;
    if hex.is_empty() || hex.len() % 2 != 0 {
        return None;
    }
    decode_hex(hex).ok().map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

/// Parse a `qSupported` reply
pub fn parse_features(payload: &str) -> Vec<Feature> {
    payload
        .split(';')
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            if let Some((name, value)) = entry.split_once('=') {
                Feature {
                    name: name.to_string(),
                    value: FeatureValue::Value(value.to_string()),
                }
            } else {
                let (name, value) = match entry.as_bytes()[entry.len() - 1] {
                    b'+' => (&entry[..entry.len() - 1], FeatureValue::Supported),
                    b'-' => (&entry[..entry.len() - 1], FeatureValue::Unsupported),
                    b'?' => (&entry[..entry.len() - 1], FeatureValue::Maybe),
                    _ => (entry, FeatureValue::Supported),
                };
                Feature {
                    name: name.to_string(),
                    value,
                }
            }
        })
        .collect()
}

/// Lowercase hex encoding, two digits per byte
pub fn encode_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Decode a hex string into bytes
pub fn decode_hex(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(GdbError::Protocol(format!("odd-length hex data ({} digits)", hex.len())));
    }

    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| {
                    let digits = String::from_utf8_lossy(pair);
                    GdbError::Protocol(format!("invalid hex digits {:?}", digits))
                })
        })
        .collect()
}

/// Decode a little-endian register value of up to four bytes
pub fn parse_le_hex(hex: &str) -> Result<u32> {
    let bytes = decode_hex(hex)?;
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(GdbError::Protocol(format!("invalid register value: {:?}", hex)));
    }
    Ok(bytes.iter().rev().fold(0u32, |acc, &b| (acc << 8) | b as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_responses() {
        assert_eq!(parse_response(b"").unwrap(), Response::Unsupported);
        assert_eq!(parse_response(b"OK").unwrap(), Response::Ok);
        assert_eq!(parse_response(b"E0e").unwrap(), Response::Error(0x0e));
        assert_eq!(parse_response(b"E01").unwrap(), Response::Error(0x01));
        assert_eq!(parse_response(b"deadbeef").unwrap(), Response::Data("deadbeef".into()));
    }

    #[test]
    fn test_error_lookalikes_are_data() {
        assert_eq!(parse_response(b"Exy").unwrap(), Response::Data("Exy".into()));
        assert_eq!(parse_response(b"E0102").unwrap(), Response::Data("E0102".into()));
    }

    #[test]
    fn test_parse_signal_stop() {
        let reply = parse_stop_reply("S05").unwrap();
        assert_eq!(reply.kind, StopKind::Signal(SIGTRAP));
        assert!(reply.registers.is_empty());
        assert_eq!(reply.signal(), Some(5));
    }

    #[test]
    fn test_parse_t_stop_with_registers() {
        let reply = parse_stop_reply("T05thread:01;08:00100000;0a:00000000;swbreak:;").unwrap();
        assert_eq!(reply.kind, StopKind::Signal(SIGTRAP));
        assert_eq!(reply.thread.as_deref(), Some("01"));
        assert_eq!(reply.reason.as_deref(), Some("swbreak"));
        assert_eq!(reply.registers.get(&8), Some(&0x1000));
        assert_eq!(reply.registers.get(&10), Some(&0));
        assert_eq!(reply.pc(), Some(0x1000));
    }

    #[test]
    fn test_parse_exit_and_termination() {
        assert_eq!(parse_stop_reply("W00").unwrap().kind, StopKind::Exited(0));
        assert_eq!(parse_stop_reply("W01;process:2a").unwrap().kind, StopKind::Exited(1));
        assert_eq!(parse_stop_reply("X09").unwrap().kind, StopKind::Terminated(9));
        assert_eq!(parse_stop_reply("W00").unwrap().signal(), None);
    }

    #[test]
    fn test_parse_invalid_stop_reply() {
        for payload in ["OK", "", "S5", "Q05", "T05;08:zz;"] {
            assert!(matches!(parse_stop_reply(payload), Err(GdbError::Protocol(_))), "{}", payload);
        }
    }

    #[test]
    fn test_parse_console_output() {
        assert_eq!(parse_console_output("O48690a").as_deref(), Some("Hi\n"));
        assert_eq!(parse_console_output("OK"), None);
        assert_eq!(parse_console_output("S05"), None);
    }

    #[test]
    fn test_parse_features() {
        let features = parse_features(
            "PacketSize=1000;swbreak+;hwbreak-;qXfer:features:read?;vContSupported",
        );
        assert_eq!(features.len(), 5);
        assert_eq!(features[0].name, "PacketSize");
        assert_eq!(features[0].value, FeatureValue::Value("1000".into()));
        assert_eq!(features[1].value, FeatureValue::Supported);
        assert_eq!(features[2].value, FeatureValue::Unsupported);
        assert_eq!(features[3].name, "qXfer:features:read");
        assert_eq!(features[3].value, FeatureValue::Maybe);
        assert!(features[4].is_supported());
        assert!(!features[2].is_supported());
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(encode_hex(&[0xde, 0xad, 0x00, 0x0f]), "dead000f");
        assert_eq!(decode_hex("DEad000f").unwrap(), vec![0xde, 0xad, 0x00, 0x0f]);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
        assert_eq!(parse_le_hex("00100000").unwrap(), 0x1000);
        assert_eq!(parse_le_hex("34").unwrap(), 0x34);
        assert!(parse_le_hex("").is_err());
        assert!(parse_le_hex("0011223344").is_err());
    }
}

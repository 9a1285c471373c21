/// Text rendering for command output
use gdbclient::{GdbError, RegisterSet};

use crate::screen::display_char;

const BYTES_PER_LINE: usize = 16;

/// Classic hex dump: address, sixteen hex bytes, printable characters
pub fn hexdump(data: &[u8], start: u32) -> Vec<String> {
    data.chunks(BYTES_PER_LINE)
        .enumerate()
        .map(|(i, chunk)| {
            let address = start.wrapping_add((i * BYTES_PER_LINE) as u32);
            let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            let ascii: String = chunk.iter().map(|&b| display_char(b)).collect();
            format!("{:08x}  {:<47}  |{}|", address, hex.join(" "), ascii)
        })
        .collect()
}

/// Registers grouped the way a DOS debugger shows them
pub fn format_registers(registers: &RegisterSet) -> Vec<String> {
    let value = |name: &str| registers.get(name).unwrap_or(0);
    let row = |names: &[&str], width: usize| {
        names
            .iter()
            .map(|name| format!("{}={:0width$X}", name.to_uppercase(), value(name), width = width))
            .collect::<Vec<_>>()
            .join("  ")
    };

    vec![
        "General Purpose:".to_string(),
        format!("  {}", row(&["eax", "ecx", "edx", "ebx"], 8)),
        format!("  {}", row(&["esp", "ebp", "esi", "edi"], 8)),
        String::new(),
        "Instruction Pointer:".to_string(),
        format!("  {}", row(&["eip", "eflags"], 8)),
        String::new(),
        "Segment Registers:".to_string(),
        format!("  {}", row(&["cs", "ss", "ds", "es", "fs", "gs"], 4)),
    ]
}

/// Process exit status for each error kind
pub fn exit_code(error: &GdbError) -> i32 {
    match error {
        GdbError::Connection { .. } => 2,
        GdbError::Transport(_) => 3,
        GdbError::Timeout(_) => 4,
        GdbError::Checksum { .. }
        | GdbError::MalformedPacket(_)
        | GdbError::Protocol(_)
        | GdbError::Rejected { .. }
        | GdbError::Unsupported(_)
        | GdbError::InvalidState(_) => 5,
        GdbError::MemoryAccess { .. } => 6,
        GdbError::Format(_) => 7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdbclient::RegisterCodec;
    use std::time::Duration;

    #[test]
    fn test_hexdump_full_line() {
        let data: Vec<u8> = (0x41..0x51).collect();
        let lines = hexdump(&data, 0xb8000);
        assert_eq!(lines.len(), 1);
        assert_eq!(
            lines[0],
            "000b8000  41 42 43 44 45 46 47 48 49 4a 4b 4c 4d 4e 4f 50  |ABCDEFGHIJKLMNOP|"
        );
    }

    #[test]
    fn test_hexdump_partial_line_is_padded() {
        let lines = hexdump(&[0x00, 0x41, 0xff, 0x20, 0x42], 0x100);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("00000100  00 41 ff 20 42 "));
        assert!(lines[0].ends_with("  |.A. B|"));
        assert_eq!(lines[0].find('|'), Some(10 + 47 + 2));
    }

    #[test]
    fn test_hexdump_addresses_advance() {
        let lines = hexdump(&[0u8; 40], 0x1000);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("00001010"));
        assert!(lines[2].starts_with("00001020"));
    }

    #[test]
    fn test_format_registers() {
        let mut blob = vec![0u8; 64];
        blob[0..4].copy_from_slice(&0x1234u32.to_le_bytes());
        blob[40..44].copy_from_slice(&0x0070u32.to_le_bytes());
        let registers = RegisterCodec::i386().decode(&blob).unwrap();

        let lines = format_registers(&registers);
        assert_eq!(lines[0], "General Purpose:");
        assert_eq!(lines[1], "  EAX=00001234  ECX=00000000  EDX=00000000  EBX=00000000");
        assert_eq!(lines[8], "  CS=0070  SS=0000  DS=0000  ES=0000  FS=0000  GS=0000");
    }

    #[test]
    fn test_exit_codes_are_distinct_per_kind() {
        let timeout = GdbError::Timeout(Duration::from_secs(1));
        let memory = GdbError::MemoryAccess { address: 0, length: 1, code: 1 };
        let format = GdbError::Format("bad".into());
        let protocol = GdbError::Protocol("bad".into());

        let codes: Vec<i32> = [timeout, memory, format, protocol].iter().map(exit_code).collect();
        for (i, a) in codes.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}

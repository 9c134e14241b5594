// src/checksums.rs
//
// Checksum registry for frame validation.
// Maps case-insensitive algorithm names to digest length + compute function.
// The CRC engines are table-driven; the lookup tables are built at compile
// time by const fns.

use serde::{Deserialize, Serialize};

// ============================================================================
// Types
// ============================================================================

/// Supported checksum algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumKind {
    /// No checksum (zero-length digest)
    None,
    /// CRC-8 polynomial 0x07 (ITU/SMBUS)
    Crc8,
    /// CRC-16/CCITT-FALSE polynomial 0x1021, init 0xFFFF
    Crc16CcittFalse,
    /// CRC-16/MODBUS polynomial 0x8005 reflected, init 0xFFFF
    Crc16Modbus,
    /// CRC-32 (ISO-HDLC) reflected, init/xorout 0xFFFFFFFF
    Crc32,
    /// XOR of all bytes
    Xor8,
    /// sum(bytes) & 0xFF
    Sum8,
    /// Fletcher-16 (mod-255 running sums)
    Fletcher16,
}

impl ChecksumKind {
    /// Look up an algorithm by its registry name. Case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "" | "none" => Some(ChecksumKind::None),
            "crc-8" | "crc8" => Some(ChecksumKind::Crc8),
            "crc-16/ccitt-false" | "crc16/ccitt-false" | "crc-16-ccitt-false" => {
                Some(ChecksumKind::Crc16CcittFalse)
            }
            "crc-16/modbus" | "crc16/modbus" | "crc-16-modbus" => Some(ChecksumKind::Crc16Modbus),
            "crc-32" | "crc32" => Some(ChecksumKind::Crc32),
            "xor-8" | "xor8" | "xor" => Some(ChecksumKind::Xor8),
            "sum-8" | "sum8" | "sum" => Some(ChecksumKind::Sum8),
            "fletcher-16" | "fletcher16" => Some(ChecksumKind::Fletcher16),
            _ => None,
        }
    }

    /// Canonical registry name.
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumKind::None => "none",
            ChecksumKind::Crc8 => "CRC-8",
            ChecksumKind::Crc16CcittFalse => "CRC-16/CCITT-FALSE",
            ChecksumKind::Crc16Modbus => "CRC-16/MODBUS",
            ChecksumKind::Crc32 => "CRC-32",
            ChecksumKind::Xor8 => "XOR-8",
            ChecksumKind::Sum8 => "SUM-8",
            ChecksumKind::Fletcher16 => "Fletcher-16",
        }
    }

    /// Digest size in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            ChecksumKind::None => 0,
            ChecksumKind::Crc8 | ChecksumKind::Xor8 | ChecksumKind::Sum8 => 1,
            ChecksumKind::Crc16CcittFalse | ChecksumKind::Crc16Modbus | ChecksumKind::Fletcher16 => 2,
            ChecksumKind::Crc32 => 4,
        }
    }

    /// Compute the digest over `data`. Multi-byte digests are big-endian.
    pub fn compute(&self, data: &[u8]) -> Vec<u8> {
        match self {
            ChecksumKind::None => Vec::new(),
            ChecksumKind::Crc8 => vec![crc8_checksum(data)],
            ChecksumKind::Crc16CcittFalse => crc16_ccitt_false_checksum(data).to_be_bytes().to_vec(),
            ChecksumKind::Crc16Modbus => crc16_modbus_checksum(data).to_be_bytes().to_vec(),
            ChecksumKind::Crc32 => crc32_checksum(data).to_be_bytes().to_vec(),
            ChecksumKind::Xor8 => vec![xor_checksum(data)],
            ChecksumKind::Sum8 => vec![sum8_checksum(data)],
            ChecksumKind::Fletcher16 => fletcher16_checksum(data).to_be_bytes().to_vec(),
        }
    }

    /// All registry entries, for config enumeration.
    pub fn all() -> &'static [ChecksumKind] {
        &[
            ChecksumKind::None,
            ChecksumKind::Crc8,
            ChecksumKind::Crc16CcittFalse,
            ChecksumKind::Crc16Modbus,
            ChecksumKind::Crc32,
            ChecksumKind::Xor8,
            ChecksumKind::Sum8,
            ChecksumKind::Fletcher16,
        ]
    }
}

// ============================================================================
// CRC Lookup Tables
// ============================================================================

/// Table for an MSB-first CRC-8: entry i is i pushed through 8 shift rounds.
const fn crc8_table(poly: u8) -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut entry = i as u8;
        let mut round = 0;
        while round < 8 {
            entry = if entry & 0x80 != 0 {
                (entry << 1) ^ poly
            } else {
                entry << 1
            };
            round += 1;
        }
        table[i] = entry;
        i += 1;
    }
    table
}

/// Table for an MSB-first CRC-16: entry i covers the top byte of the state.
const fn crc16_table(poly: u16) -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut entry = (i as u16) << 8;
        let mut round = 0;
        while round < 8 {
            entry = if entry & 0x8000 != 0 {
                (entry << 1) ^ poly
            } else {
                entry << 1
            };
            round += 1;
        }
        table[i] = entry;
        i += 1;
    }
    table
}

/// Table for an LSB-first (reflected) CRC-16; `poly` is already reversed.
const fn crc16_table_reflected(poly: u16) -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut entry = i as u16;
        let mut round = 0;
        while round < 8 {
            entry = if entry & 1 != 0 { (entry >> 1) ^ poly } else { entry >> 1 };
            round += 1;
        }
        table[i] = entry;
        i += 1;
    }
    table
}

/// Table for an LSB-first (reflected) CRC-32; `poly` is already reversed.
const fn crc32_table_reflected(poly: u32) -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut entry = i as u32;
        let mut round = 0;
        while round < 8 {
            entry = if entry & 1 != 0 { (entry >> 1) ^ poly } else { entry >> 1 };
            round += 1;
        }
        table[i] = entry;
        i += 1;
    }
    table
}

const CRC8_SMBUS: [u8; 256] = crc8_table(0x07);
const CRC16_CCITT: [u16; 256] = crc16_table(0x1021);
// 0x8005 bit-reversed.
const CRC16_MODBUS_REFLECTED: [u16; 256] = crc16_table_reflected(0xA001);
// 0x04C11DB7 bit-reversed.
const CRC32_HDLC_REFLECTED: [u32; 256] = crc32_table_reflected(0xEDB8_8320);

// ============================================================================
// Named Checksum Functions
// ============================================================================

/// XOR of all bytes.
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, &byte| acc ^ byte)
}

/// Simple modulo-256 sum of bytes (8-bit sum).
pub fn sum8_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &byte| acc.wrapping_add(byte))
}

/// CRC-8 with polynomial 0x07 (ITU/SMBUS). Init 0x00, no final XOR.
pub fn crc8_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &byte| CRC8_SMBUS[(acc ^ byte) as usize])
}

/// CRC-16/CCITT-FALSE (polynomial 0x1021, init 0xFFFF, non-reflected).
pub fn crc16_ccitt_false_checksum(data: &[u8]) -> u16 {
    let mut acc = 0xFFFFu16;
    for &byte in data {
        let idx = ((acc >> 8) as u8 ^ byte) as usize;
        acc = (acc << 8) ^ CRC16_CCITT[idx];
    }
    acc
}

/// CRC-16/MODBUS (polynomial 0x8005 reflected, init 0xFFFF).
/// Used by Modbus RTU.
pub fn crc16_modbus_checksum(data: &[u8]) -> u16 {
    let mut acc = 0xFFFFu16;
    for &byte in data {
        let idx = ((acc as u8) ^ byte) as usize;
        acc = (acc >> 8) ^ CRC16_MODBUS_REFLECTED[idx];
    }
    acc
}

/// CRC-32/ISO-HDLC (reflected, init and final XOR 0xFFFFFFFF). The common
/// "zip" CRC.
pub fn crc32_checksum(data: &[u8]) -> u32 {
    let mut acc = 0xFFFF_FFFFu32;
    for &byte in data {
        let idx = ((acc as u8) ^ byte) as usize;
        acc = (acc >> 8) ^ CRC32_HDLC_REFLECTED[idx];
    }
    !acc
}

/// Fletcher-16 with modulo-255 running sums. Result is `hi << 8 | lo`.
pub fn fletcher16_checksum(data: &[u8]) -> u16 {
    let mut lo: u16 = 0;
    let mut hi: u16 = 0;
    for &byte in data {
        lo = (lo + byte as u16) % 255;
        hi = (hi + lo) % 255;
    }
    (hi << 8) | lo
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECK: &[u8] = b"123456789";

    #[test]
    fn crc8_reference_vector() {
        assert_eq!(crc8_checksum(CHECK), 0xF4);
    }

    #[test]
    fn crc16_ccitt_false_reference_vectors() {
        assert_eq!(crc16_ccitt_false_checksum(CHECK), 0x29B1);
        assert_eq!(crc16_ccitt_false_checksum(b"hello"), 0xD26E);
    }

    #[test]
    fn crc16_modbus_reference_vector() {
        assert_eq!(crc16_modbus_checksum(CHECK), 0x4B37);
    }

    #[test]
    fn crc32_reference_vector() {
        assert_eq!(crc32_checksum(CHECK), 0xCBF43926);
    }

    #[test]
    fn xor_and_sum_reference_vectors() {
        assert_eq!(xor_checksum(CHECK), 0x31);
        assert_eq!(sum8_checksum(CHECK), 0xDD);
    }

    #[test]
    fn fletcher16_reference_vectors() {
        assert_eq!(fletcher16_checksum(b"abcde"), 0xC8F0);
        assert_eq!(fletcher16_checksum(CHECK), 0x1EDE);
    }

    #[test]
    fn tables_match_bitwise_evaluation() {
        // Cross-check the table-driven engines against a direct bit-at-a-time
        // computation over the full byte range.
        fn crc16_ccitt_bitwise(data: &[u8]) -> u16 {
            let mut state = 0xFFFFu16;
            for &byte in data {
                state ^= (byte as u16) << 8;
                for _ in 0..8 {
                    state = if state & 0x8000 != 0 {
                        (state << 1) ^ 0x1021
                    } else {
                        state << 1
                    };
                }
            }
            state
        }
        fn crc16_modbus_bitwise(data: &[u8]) -> u16 {
            let mut state = 0xFFFFu16;
            for &byte in data {
                state ^= byte as u16;
                for _ in 0..8 {
                    state = if state & 1 != 0 { (state >> 1) ^ 0xA001 } else { state >> 1 };
                }
            }
            state
        }

        let all_bytes: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
        assert_eq!(
            crc16_ccitt_false_checksum(&all_bytes),
            crc16_ccitt_bitwise(&all_bytes)
        );
        assert_eq!(
            crc16_modbus_checksum(&all_bytes),
            crc16_modbus_bitwise(&all_bytes)
        );
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(
            ChecksumKind::from_name("crc-16/ccitt-false"),
            Some(ChecksumKind::Crc16CcittFalse)
        );
        assert_eq!(
            ChecksumKind::from_name("CRC-16/MODBUS"),
            Some(ChecksumKind::Crc16Modbus)
        );
        assert_eq!(ChecksumKind::from_name("NONE"), Some(ChecksumKind::None));
        assert_eq!(ChecksumKind::from_name("crc-99"), None);
    }

    #[test]
    fn digest_lengths_match_output() {
        for kind in ChecksumKind::all() {
            assert_eq!(kind.compute(CHECK).len(), kind.digest_len(), "{}", kind.name());
        }
    }

    #[test]
    fn digests_are_big_endian() {
        assert_eq!(ChecksumKind::Crc16CcittFalse.compute(b"hello"), vec![0xD2, 0x6E]);
    }
}

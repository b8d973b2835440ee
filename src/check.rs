//! Check-code capability table.
//!
//! `bref.methods` packs a compression id (low nibble) and a check-code id
//! (high nibble). The engine never interprets the bytes of `bref.check`
//! itself; it asks this table to generate or verify them. Compression codecs
//! are external collaborators, so only their ids travel through here.

use core::convert::TryInto;

use crate::error::{ErrorSet, Result};
use crate::ondisk::CHECK_BYTES;

/// No check code stored.
pub const CHECK_NONE: u8 = 0;
/// Checking administratively disabled; treated like `CHECK_NONE`.
pub const CHECK_DISABLED: u8 = 1;
/// CRC32 over the block contents.
pub const CHECK_CRC32: u8 = 2;
/// CRC32 plus the freemap bookkeeping copy; used on FREEMAP_* blocks.
pub const CHECK_FREEMAP: u8 = 5;

/// No compression.
pub const COMP_NONE: u8 = 0;
/// Automatic zero-block elision.
pub const COMP_AUTOZERO: u8 = 1;
/// LZ4 codec id (external).
pub const COMP_LZ4: u8 = 2;
/// ZLIB codec id (external).
pub const COMP_ZLIB: u8 = 3;

/// Packs a compression id and a check id into a methods byte.
pub const fn methods(comp: u8, check: u8) -> u8 {
    (check << 4) | (comp & 0x0f)
}

/// Check-code id of a methods byte.
pub const fn check_id(methods: u8) -> u8 {
    methods >> 4
}

/// Compression id of a methods byte.
pub const fn comp_id(methods: u8) -> u8 {
    methods & 0x0f
}

const fn build_crc32_table() -> [u32; 256] {
    const POLY: u32 = 0xEDB8_8320;
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut crc = n as u32;
        let mut k = 0;
        while k < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            k += 1;
        }
        table[n] = crc;
        n += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = build_crc32_table();

/// CRC32 used for volume-header sections and block check codes.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ byte as u32) & 0xff) as usize];
    }
    !crc
}

/// CRC32 continued across discontiguous input.
pub fn crc32_multi(parts: &[&[u8]]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for part in parts {
        for &byte in *part {
            crc = (crc >> 8) ^ CRC32_TABLE[((crc ^ byte as u32) & 0xff) as usize];
        }
    }
    !crc
}

/// Computes the check area for `data` under the method selected by
/// `methods`. Unknown check ids are rejected so a newer volume cannot be
/// silently modified by an older engine.
pub fn generate(methods: u8, data: &[u8]) -> Result<[u8; CHECK_BYTES]> {
    let mut check = [0u8; CHECK_BYTES];
    match check_id(methods) {
        CHECK_NONE | CHECK_DISABLED => Ok(check),
        CHECK_CRC32 | CHECK_FREEMAP => {
            check[..4].copy_from_slice(&crc32(data).to_le_bytes());
            Ok(check)
        }
        _ => Err(ErrorSet::EINVAL),
    }
}

/// Verifies `data` against a stored check area. A failure is reported as
/// `CHECK` so it accumulates alongside any I/O error on the same chain.
pub fn verify(methods: u8, check: &[u8; CHECK_BYTES], data: &[u8]) -> Result<()> {
    match check_id(methods) {
        CHECK_NONE | CHECK_DISABLED => Ok(()),
        CHECK_CRC32 | CHECK_FREEMAP => {
            let stored = u32::from_le_bytes(check[..4].try_into().unwrap());
            if stored == crc32(data) {
                Ok(())
            } else {
                Err(ErrorSet::CHECK)
            }
        }
        _ => Err(ErrorSet::EINVAL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_vectors() {
        assert_eq!(crc32(b""), 0x0000_0000);
        assert_eq!(crc32(b"a"), 0xE8B7_BE43);
        assert_eq!(crc32(b"abc"), 0x3524_41C2);
        assert_eq!(crc32(b"message digest"), 0x2015_9D7F);
    }

    #[test]
    fn crc32_multi_matches_contiguous() {
        let whole = crc32(b"message digest");
        let split = crc32_multi(&[b"message ", b"digest"]);
        assert_eq!(whole, split);
    }

    #[test]
    fn methods_roundtrip() {
        let m = methods(COMP_LZ4, CHECK_CRC32);
        assert_eq!(comp_id(m), COMP_LZ4);
        assert_eq!(check_id(m), CHECK_CRC32);
    }

    #[test]
    fn generate_then_verify() {
        let m = methods(COMP_NONE, CHECK_CRC32);
        let data = [7u8; 4096];
        let check = generate(m, &data).unwrap();
        assert!(verify(m, &check, &data).is_ok());
        let mut bad = data;
        bad[0] ^= 1;
        assert_eq!(verify(m, &check, &bad), Err(ErrorSet::CHECK));
    }

    #[test]
    fn unknown_method_rejected() {
        let m = methods(COMP_NONE, 9);
        assert_eq!(generate(m, b"x"), Err(ErrorSet::EINVAL));
    }
}

//! Packet error codes.
//!
//! Command headers carry an 8 bit PEC (CRC-8, polynomial 0x2F, seed 0x10, MSB first).
//! Every per-device payload block carries a 14 bit PEC computed over the payload bytes
//! followed by [`CC_BITS`] zero command counter bits. On the wire the PEC word is big-endian
//! with the device's 2 bit command counter in its top bits.

/// Command PEC polynomial.
pub const CMD_POLY: u8 = 0x2f;
/// Command PEC seed.
pub const CMD_SEED: u8 = 0x10;

/// Payload PEC polynomial (x^14 + x^13 + x^5 + x^3 + x^2 + 1).
pub const PAYLOAD_POLY: u16 = 0x202d;
/// Payload PEC seed.
pub const PAYLOAD_SEED: u16 = 0x0010;
/// Number of command counter bits appended to the payload PEC computation.
pub const CC_BITS: u32 = 2;

const PAYLOAD_MASK: u16 = 0x3fff;

/// Compute the command PEC over the header bytes preceding the PEC byte.
pub fn command(header: &[u8]) -> u8 {
    header.iter().fold(CMD_SEED, |crc, &byte| {
        (0..8).fold(crc ^ byte, |crc, _| {
            if crc & 0x80 != 0 {
                (crc << 1) ^ CMD_POLY
            } else {
                crc << 1
            }
        })
    })
}

#[inline]
fn step(crc: u16, bit: bool) -> u16 {
    let top = (crc >> 13) & 1 != 0;
    let crc = (crc << 1) & PAYLOAD_MASK;
    if top ^ bit {
        crc ^ PAYLOAD_POLY
    } else {
        crc
    }
}

/// Compute the 14 bit payload PEC over `payload` and the trailing zero command counter bits.
pub fn payload(payload: &[u8]) -> u16 {
    let crc = payload.iter().fold(PAYLOAD_SEED, |crc, &byte| {
        (0..8).rev().fold(crc, |crc, i| step(crc, (byte >> i) & 1 != 0))
    });
    (0..CC_BITS).fold(crc, |crc, _| step(crc, false))
}

/// Split a received big-endian PEC word into `(command counter, pec)`.
pub fn split(word: [u8; 2]) -> (u8, u16) {
    (word[0] >> 6, u16::from_be_bytes(word) & PAYLOAD_MASK)
}

/// Join a command counter and a 14 bit PEC into the big-endian wire word.
pub fn join(cc: u8, pec: u16) -> [u8; 2] {
    (((cc as u16 & 0x3) << 14) | (pec & PAYLOAD_MASK)).to_be_bytes()
}

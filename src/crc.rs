//! CRC16/Modbus checksum used by every RTU frame.
//!
//! Polynomial 0xA001 (reflected 0x8005), initial value 0xFFFF, no final XOR.
//! The checksum is transmitted low byte first.

use crate::{Error, Result};

const INITIAL: u16 = 0xFFFF;
const POLYNOMIAL: u16 = 0xA001;

/// Computes the checksum over the whole slice.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = INITIAL;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn prefix(data: &[u8], length: usize) -> Result<&[u8]> {
    data.get(..length).ok_or(Error::InputSize {
        requested: length,
        available: data.len(),
    })
}

/// Computes the checksum over the first `length` bytes of `data`.
pub fn calculate(data: &[u8], length: usize) -> Result<u16> {
    Ok(crc16(prefix(data, length)?))
}

/// Checks the trailing two bytes of a `length`-byte buffer against the checksum of the
/// bytes before them.
///
/// Buffers shorter than 3 bytes, or a `length` beyond the data, never verify.
pub fn verify(data: &[u8], length: usize) -> bool {
    if length < 3 || length > data.len() {
        return false;
    }
    let received = u16::from_le_bytes([data[length - 2], data[length - 1]]);
    crc16(&data[..length - 2]) == received
}

/// Returns the first `length` bytes of `data` followed by their checksum.
pub fn append_crc(data: &[u8], length: usize) -> Result<Vec<u8>> {
    let data = prefix(data, length)?;
    let mut frame = Vec::with_capacity(length + 2);
    frame.extend_from_slice(data);
    frame.extend_from_slice(&crc16(data).to_le_bytes());
    Ok(frame)
}

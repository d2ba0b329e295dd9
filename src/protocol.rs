//! Domain types of the GJVdc-32 board and the codecs between them and raw register words.

use crate::registers::{self, NUMBER_OF_CHANNELS};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// 16-bit value stored in a holding register.
pub type Word = u16;

/// Unit (slave) address of the board on the serial bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Address(u8);

impl Address {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 128;

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn encode_for_write_register(&self) -> Word {
        self.0 as Word
    }
}

impl Default for Address {
    fn default() -> Self {
        Self(Self::MIN)
    }
}

impl TryFrom<u8> for Address {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::Range(format!(
                "device address {value} is outside {}..={}",
                Self::MIN,
                Self::MAX
            )))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serial baud rates the board supports.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum BaudRate {
    B9600,
    B19200,
    B38400,
    /// Factory default, also used for unknown codes.
    #[default]
    B57600,
}

impl BaudRate {
    pub const ALL: [BaudRate; 4] = [Self::B9600, Self::B19200, Self::B38400, Self::B57600];

    /// Decodes the baud-rate register. Unknown codes fall back to 57600 instead of failing.
    pub fn decode_from_holding_registers(code: Word) -> Self {
        match code {
            0 => Self::B9600,
            1 => Self::B19200,
            2 => Self::B38400,
            3 => Self::B57600,
            _ => {
                log::debug!("Unknown baud rate code {code}, assuming 57600");
                Self::B57600
            }
        }
    }

    pub fn encode_for_write_register(&self) -> Word {
        match self {
            Self::B9600 => 0,
            Self::B19200 => 1,
            Self::B38400 => 2,
            Self::B57600 => 3,
        }
    }

    pub fn bits_per_second(&self) -> u32 {
        match self {
            Self::B9600 => 9600,
            Self::B19200 => 19200,
            Self::B38400 => 38400,
            Self::B57600 => 57600,
        }
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|b| b.bits_per_second() == value)
            .ok_or(Error::UnsupportedValue(value))
    }
}

impl From<BaudRate> for u32 {
    fn from(baud_rate: BaudRate) -> u32 {
        baud_rate.bits_per_second()
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits_per_second())
    }
}

/// One of the 32 voltage inputs, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Channel(u8);

impl Channel {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = NUMBER_OF_CHANNELS as u8;

    pub fn number(&self) -> u8 {
        self.0
    }

    /// 0-based position inside a channel block.
    pub fn index(&self) -> usize {
        (self.0 - 1) as usize
    }

    pub fn all() -> impl Iterator<Item = Channel> {
        (Self::MIN..=Self::MAX).map(Channel)
    }
}

impl TryFrom<u8> for Channel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(Error::Range(format!(
                "channel {value} is outside {}..={}",
                Self::MIN,
                Self::MAX
            )))
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

const HIGH_RANGE_OFFSET: Word = 0x8000;
/// Largest voltage of the millivolt range; anything above uses the 10 mV range.
pub const LOW_RANGE_LIMIT: f32 = 32.768;
pub const MAX_VOLTAGE: f32 = 327.67;
pub const MAX_THRESHOLD: f32 = 655.35;

/// Decodes a voltage register.
///
/// Values up to and including 0x8000 are millivolts. Values above 0x8000 carry
/// `volts * 100` offset by 0x8000.
pub fn decode_voltage(raw: Word) -> f32 {
    if raw > HIGH_RANGE_OFFSET {
        (raw - HIGH_RANGE_OFFSET) as f32 / 100.0
    } else {
        raw as f32 / 1000.0
    }
}

/// Encodes a voltage into its register representation, the inverse of [`decode_voltage`].
pub fn encode_voltage(voltage: f32) -> Result<Word> {
    if !voltage.is_finite() || !(0.0..=MAX_VOLTAGE).contains(&voltage) {
        return Err(Error::Range(format!(
            "voltage {voltage} is outside 0..={MAX_VOLTAGE}"
        )));
    }
    if voltage > LOW_RANGE_LIMIT {
        let raw = (voltage as f64 * 100.0).round() as u32 + HIGH_RANGE_OFFSET as u32;
        Ok(raw.min(Word::MAX as u32) as Word)
    } else {
        Ok((voltage as f64 * 1000.0).round() as Word)
    }
}

/// Decodes a drop threshold register (10 mV steps).
pub fn decode_threshold(raw: Word) -> f32 {
    raw as f32 / 100.0
}

/// Encodes a drop threshold in volts.
pub fn encode_threshold(voltage: f32) -> Result<Word> {
    if !voltage.is_finite() || !(0.0..=MAX_THRESHOLD).contains(&voltage) {
        return Err(Error::Range(format!(
            "threshold {voltage} is outside 0..={MAX_THRESHOLD}"
        )));
    }
    Ok((voltage as f64 * 100.0).round() as Word)
}

/// Decodes a fixed-width text block, one UTF-16 code unit per register.
///
/// The text ends at the first all-zero register. Malformed UTF-16 falls back to a lossy
/// UTF-8 reading of the same bytes.
pub fn decode_text(words: &[Word]) -> String {
    let end = words.iter().position(|w| *w == 0).unwrap_or(words.len());
    let units = &words[..end];
    let text = match String::from_utf16(units) {
        Ok(text) => text,
        Err(err) => {
            let bytes: Vec<u8> = units.iter().flat_map(|w| w.to_be_bytes()).collect();
            log::warn!("Text block is not valid UTF-16 ({err}), decoding as UTF-8: {bytes:02X?}");
            String::from_utf8_lossy(&bytes).into_owned()
        }
    };
    text.trim_end_matches('\0').to_string()
}

/// An unprogrammed (factory-erased) text block reads as all 0xFFFF.
pub fn is_unprogrammed(words: &[Word]) -> bool {
    !words.is_empty() && words.iter().all(|w| *w == 0xFFFF)
}

/// Per-channel drop flags. Counted from the most significant bit, bit `n` belongs to
/// channel `n + 1`: channel 1 is the top bit of the high word, channel 32 the lowest bit
/// of the low word.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DropMask(u32);

impl DropMask {
    pub const ADDRESS: u16 = registers::DROP_MASK.start;
    pub const QUANTITY: u16 = registers::DROP_MASK.quantity;

    pub fn decode_from_holding_registers(words: &[Word]) -> Result<Self> {
        match words {
            [high, low] => Ok(Self(((*high as u32) << 16) | *low as u32)),
            _ => Err(Error::Range(format!(
                "drop mask needs {} registers, got {}",
                Self::QUANTITY,
                words.len()
            ))),
        }
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_dropped(&self, channel: Channel) -> bool {
        (self.0 >> (31 - channel.index())) & 1 != 0
    }

    pub fn dropped_channels(&self) -> Vec<Channel> {
        Channel::all().filter(|c| self.is_dropped(*c)).collect()
    }
}

impl fmt::Display for DropMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Selects one of the two calibration blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CalibrationBlock {
    A,
    B,
}

impl CalibrationBlock {
    pub fn block(&self) -> registers::Block {
        match self {
            Self::A => registers::CALIBRATION_A,
            Self::B => registers::CALIBRATION_B,
        }
    }
}

/// One decoded voltage sample.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct VoltageReading {
    pub channel: Channel,
    pub raw: Word,
    pub voltage: f32,
    pub address: Address,
    pub timestamp: DateTime<Utc>,
}

impl VoltageReading {
    pub fn new(channel: Channel, raw: Word, address: Address, timestamp: DateTime<Utc>) -> Self {
        Self {
            channel,
            raw,
            voltage: decode_voltage(raw),
            address,
            timestamp,
        }
    }
}

impl fmt::Display for VoltageReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CH{:02}: {:.3} V", self.channel.number(), self.voltage)
    }
}

/// Identification and status of a board, read as one unit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceSnapshot {
    /// Address the board reports for itself.
    pub address: Word,
    pub firmware_version: f32,
    pub baud_rate: BaudRate,
    pub board_name: String,
    pub serial_number: String,
    pub io_direction: Word,
    pub io_value: Word,
    pub drop_mask: DropMask,
    pub set_temperature: Word,
    pub current_temperature: Word,
    /// mA
    pub fan_current: Word,
    pub ac_on: bool,
    pub timestamp: DateTime<Utc>,
    pub online: bool,
}

impl DeviceSnapshot {
    pub fn decode_firmware_version(raw: Word) -> f32 {
        raw as f32 / 10.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_range() {
        assert!(Address::try_from(0).is_err());
        assert_eq!(Address::try_from(1).unwrap().value(), 1);
        assert_eq!(Address::try_from(128).unwrap().value(), 128);
        assert!(matches!(Address::try_from(129), Err(Error::Range(_))));
    }

    #[test]
    fn baud_rate_table() {
        for baud in [9600u32, 19200, 38400, 57600] {
            let code = BaudRate::try_from(baud).unwrap().encode_for_write_register();
            assert_eq!(
                u32::from(BaudRate::decode_from_holding_registers(code)),
                baud
            );
        }
        assert!(matches!(
            BaudRate::try_from(12345),
            Err(Error::UnsupportedValue(12345))
        ));
        assert_eq!(BaudRate::decode_from_holding_registers(99), BaudRate::B57600);
    }

    #[test]
    fn channel_range() {
        assert!(Channel::try_from(0).is_err());
        assert!(Channel::try_from(33).is_err());
        assert_eq!(Channel::try_from(32).unwrap().index(), 31);
        assert_eq!(Channel::all().count(), 32);
    }

    #[test]
    fn voltage_decode_ranges() {
        assert_eq!(decode_voltage(0), 0.0);
        assert_eq!(decode_voltage(1000), 1.0);
        assert_eq!(decode_voltage(200), 0.2);
        // 0x8000 is still millivolts
        assert_eq!(decode_voltage(0x8000), 32.768);
        assert_eq!(decode_voltage(0x8001), 0.01);
        assert_eq!(decode_voltage(0xFFFF), 327.67);
    }

    #[test]
    fn voltage_round_trip() {
        for raw in [0u16, 999, 1000, 0x8000, 0x8000 + 3277, 0xFFFF] {
            assert_eq!(encode_voltage(decode_voltage(raw)).unwrap(), raw, "raw={raw:#x}");
        }
        assert_eq!(encode_voltage(32.768).unwrap(), 0x8000);
        assert_eq!(encode_voltage(32.77).unwrap(), 0x8000 + 3277);
    }

    #[test]
    fn high_range_aliases_keep_their_voltage() {
        // Above 0x8000 but decoding below 32.768 V: re-encodes in the millivolt range.
        let raw = 0x8000 + 1;
        let voltage = decode_voltage(raw);
        let encoded = encode_voltage(voltage).unwrap();
        assert_eq!(encoded, 10);
        assert_eq!(decode_voltage(encoded), voltage);
    }

    #[test]
    fn voltage_encode_rejects_out_of_range() {
        assert!(encode_voltage(-0.1).is_err());
        assert!(encode_voltage(327.7).is_err());
        assert!(encode_voltage(f32::NAN).is_err());
    }

    #[test]
    fn threshold_codec() {
        assert_eq!(decode_threshold(1250), 12.5);
        assert_eq!(encode_threshold(12.5).unwrap(), 1250);
        assert_eq!(encode_threshold(0.0).unwrap(), 0);
        assert!(encode_threshold(-1.0).is_err());
        assert!(encode_threshold(700.0).is_err());
    }

    #[test]
    fn text_stops_at_first_nul_register() {
        let words = [0x0047, 0x004A, 0x0056, 0x0000, 0x0041, 0x0042];
        assert_eq!(decode_text(&words), "GJV");
    }

    #[test]
    fn text_without_terminator_uses_whole_block() {
        let words = [0x0056, 0x0064, 0x0063];
        assert_eq!(decode_text(&words), "Vdc");
        assert_eq!(decode_text(&[]), "");
    }

    #[test]
    fn text_non_ascii() {
        let words: Vec<Word> = "电压板".encode_utf16().collect();
        assert_eq!(decode_text(&words), "电压板");
    }

    #[test]
    fn malformed_utf16_falls_back_to_utf8() {
        // A lone high surrogate.
        let words = [0xD800, 0x4142];
        let text = decode_text(&words);
        assert!(text.ends_with("AB"));
    }

    #[test]
    fn unprogrammed_block() {
        let words = [0xFFFF; 32];
        assert!(is_unprogrammed(&words));
        assert!(!decode_text(&words).is_empty());
        assert!(!is_unprogrammed(&[0x0041, 0xFFFF]));
        assert!(!is_unprogrammed(&[]));
    }

    #[test]
    fn drop_mask_lowest_bit_is_channel_32() {
        let mask = DropMask::decode_from_holding_registers(&[0x0000, 0x0001]).unwrap();
        assert!(mask.is_dropped(Channel::try_from(32).unwrap()));
        assert!(!mask.is_dropped(Channel::try_from(1).unwrap()));
        assert_eq!(mask.dropped_channels(), vec![Channel::try_from(32).unwrap()]);
    }

    #[test]
    fn drop_mask_high_word_first() {
        let mask = DropMask::decode_from_holding_registers(&[0x8000, 0x0000]).unwrap();
        assert_eq!(mask.bits(), 0x8000_0000);
        assert_eq!(mask.dropped_channels(), vec![Channel::try_from(1).unwrap()]);
        assert!(DropMask::decode_from_holding_registers(&[0x0001]).is_err());
    }

    #[test]
    fn firmware_version_is_tenths() {
        assert_eq!(DeviceSnapshot::decode_firmware_version(12), 1.2);
    }
}

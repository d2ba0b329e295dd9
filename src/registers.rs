//! Holding register addresses of the GJVdc-32 protocol.

/// Number of monitored voltage channels.
pub const NUMBER_OF_CHANNELS: usize = 32;

/// A contiguous block of holding registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub start: u16,
    pub quantity: u16,
}

impl Block {
    const fn new(start: u16, quantity: u16) -> Self {
        Self { start, quantity }
    }

    /// Register address of the `index`-th element (0-based), if it lies inside the block.
    pub fn address_of(&self, index: usize) -> Option<u16> {
        if index < self.quantity as usize {
            Some(self.start + index as u16)
        } else {
            None
        }
    }
}

pub const DEVICE_ADDRESS: u16 = 0x8000;
/// Firmware version multiplied by 10.
pub const FIRMWARE_VERSION: u16 = 0x8001;
pub const BAUD_RATE: u16 = 0x8002;
pub const IO_DIRECTION: u16 = 0x8003;
pub const IO_VALUE: u16 = 0x8004;
/// High word first.
pub const DROP_MASK: Block = Block::new(0x8005, 2);
pub const SET_TEMPERATURE: u16 = 0x8007;
pub const CURRENT_TEMPERATURE: u16 = 0x8008;
/// Fan current in mA.
pub const FAN_CURRENT: u16 = 0x8009;
/// 1 while the AC supply is present.
pub const AC_ON: u16 = 0x800A;

pub const VOLTAGES: Block = Block::new(0x8010, NUMBER_OF_CHANNELS as u16);
/// Drop duration per channel, in seconds.
pub const DROP_DURATIONS: Block = Block::new(0x8030, NUMBER_OF_CHANNELS as u16);
pub const DROP_THRESHOLDS: Block = Block::new(0x8050, NUMBER_OF_CHANNELS as u16);
pub const CALIBRATION_A: Block = Block::new(0x80C0, NUMBER_OF_CHANNELS as u16);
pub const CALIBRATION_B: Block = Block::new(0x80E0, NUMBER_OF_CHANNELS as u16);

/// 64 bytes of UTF-16 text.
pub const BOARD_NAME: Block = Block::new(0x8800, 32);
/// 62 bytes of UTF-16 text.
pub const SERIAL_NUMBER: Block = Block::new(0x8820, 31);

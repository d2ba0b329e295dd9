//! High level access to one GJVdc-32 board.
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(feature = "serialport")]
//! # fn main() -> Result<(), gjvdc32_lib::Error> {
//! use gjvdc32_lib::serialport::{open, SerialConfig};
//!
//! let mut board = open("/dev/ttyUSB0", &SerialConfig::default())?;
//! for reading in board.read_all_voltages()? {
//!     println!("{reading}");
//! }
//! let snapshot = board.read_device_snapshot()?;
//! println!("{} ({})", snapshot.board_name, snapshot.serial_number);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "serialport"))]
//! # fn main() {}
//! ```

use crate::protocol::{
    self, Address, BaudRate, CalibrationBlock, Channel, DeviceSnapshot, DropMask,
    VoltageReading, Word,
};
use crate::registers::{self, Block, NUMBER_OF_CHANNELS};
use crate::rtu::{RtuConfig, RtuMaster, Transport};
use crate::{Error, Result};

fn channel_register(block: Block, channel: Channel) -> Result<u16> {
    block.address_of(channel.index()).ok_or_else(|| {
        Error::Range(format!("channel {channel} is outside block {block:?}"))
    })
}

/// Session with one board: a byte stream, the addressed unit and the last snapshot.
///
/// All operations take `&mut self`; wrap the value in a `Mutex` to poll it from
/// another thread.
#[derive(Debug)]
pub struct Gjvdc32<T: Transport> {
    master: RtuMaster<T>,
    unit: Address,
    snapshot: Option<DeviceSnapshot>,
}

impl<T: Transport> Gjvdc32<T> {
    pub fn new(transport: T, unit: Address, config: RtuConfig) -> Self {
        Self {
            master: RtuMaster::new(transport, config),
            unit,
            snapshot: None,
        }
    }

    pub fn unit(&self) -> Address {
        self.unit
    }

    /// Addresses another board on the same stream.
    pub fn set_unit(&mut self, unit: Address) {
        self.unit = unit;
        self.snapshot = None;
    }

    pub fn master(&self) -> &RtuMaster<T> {
        &self.master
    }

    pub fn master_mut(&mut self) -> &mut RtuMaster<T> {
        &mut self.master
    }

    /// The result of the last [`Self::read_device_snapshot`]; marked offline if a later
    /// attempt failed.
    pub fn last_snapshot(&self) -> Option<&DeviceSnapshot> {
        self.snapshot.as_ref()
    }

    fn read_block(&mut self, block: Block) -> Result<Vec<Word>> {
        self.master
            .read_holding_registers(self.unit.value(), block.start, block.quantity)
    }

    fn read_word(&mut self, register: u16) -> Result<Word> {
        let words = self
            .master
            .read_holding_registers(self.unit.value(), register, 1)?;
        Ok(words[0])
    }

    fn write_word(&mut self, register: u16, value: Word) -> Result<()> {
        self.master
            .write_multiple_registers(self.unit.value(), register, &[value])
    }

    /// Reads all 32 channels in one transaction. The readings share one timestamp.
    pub fn read_all_voltages(&mut self) -> Result<Vec<VoltageReading>> {
        let words = self.read_block(registers::VOLTAGES)?;
        let timestamp = chrono::Utc::now();
        Ok(Channel::all()
            .zip(words)
            .map(|(channel, raw)| VoltageReading::new(channel, raw, self.unit, timestamp))
            .collect())
    }

    pub fn read_single_voltage(&mut self, channel: u8) -> Result<VoltageReading> {
        let channel = Channel::try_from(channel)?;
        let register = channel_register(registers::VOLTAGES, channel)?;
        let raw = self.read_word(register)?;
        Ok(VoltageReading::new(
            channel,
            raw,
            self.unit,
            chrono::Utc::now(),
        ))
    }

    fn read_snapshot_registers(&mut self) -> Result<DeviceSnapshot> {
        let address = self.read_word(registers::DEVICE_ADDRESS)?;
        let firmware_version = self.read_word(registers::FIRMWARE_VERSION)?;
        let baud_rate = self.read_word(registers::BAUD_RATE)?;
        let io_direction = self.read_word(registers::IO_DIRECTION)?;
        let io_value = self.read_word(registers::IO_VALUE)?;
        let drop_mask = DropMask::decode_from_holding_registers(
            &self.read_block(registers::DROP_MASK)?,
        )?;
        let set_temperature = self.read_word(registers::SET_TEMPERATURE)?;
        let current_temperature = self.read_word(registers::CURRENT_TEMPERATURE)?;
        let fan_current = self.read_word(registers::FAN_CURRENT)?;
        let ac_on = self.read_word(registers::AC_ON)?;
        let board_name = self.read_block(registers::BOARD_NAME)?;
        let serial_number = self.read_block(registers::SERIAL_NUMBER)?;
        if protocol::is_unprogrammed(&board_name) {
            log::debug!("Board name is not programmed");
        }
        Ok(DeviceSnapshot {
            address,
            firmware_version: DeviceSnapshot::decode_firmware_version(firmware_version),
            baud_rate: BaudRate::decode_from_holding_registers(baud_rate),
            board_name: protocol::decode_text(&board_name),
            serial_number: protocol::decode_text(&serial_number),
            io_direction,
            io_value,
            drop_mask,
            set_temperature,
            current_temperature,
            fan_current,
            ac_on: ac_on == 1,
            timestamp: chrono::Utc::now(),
            online: true,
        })
    }

    /// Reads identification and status registers one after another.
    ///
    /// If any read fails nothing from this attempt is kept, the cached snapshot is marked
    /// offline and the error is returned.
    pub fn read_device_snapshot(&mut self) -> Result<DeviceSnapshot> {
        match self.read_snapshot_registers() {
            Ok(snapshot) => {
                self.snapshot = Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(err) => {
                log::warn!("Unit {} is offline: {err}", self.unit);
                if let Some(snapshot) = self.snapshot.as_mut() {
                    snapshot.online = false;
                }
                Err(err)
            }
        }
    }

    /// Seconds each channel has been below its threshold.
    pub fn read_drop_durations(&mut self) -> Result<Vec<Word>> {
        self.read_block(registers::DROP_DURATIONS)
    }

    /// Drop threshold of each channel in volts.
    pub fn read_drop_thresholds(&mut self) -> Result<Vec<f32>> {
        Ok(self
            .read_block(registers::DROP_THRESHOLDS)?
            .into_iter()
            .map(protocol::decode_threshold)
            .collect())
    }

    pub fn read_calibration(&mut self, block: CalibrationBlock) -> Result<Vec<Word>> {
        self.read_block(block.block())
    }

    /// Changes the board's unit address. On success the session talks to the new address.
    pub fn write_device_address(&mut self, address: u8) -> Result<()> {
        let address = Address::try_from(address)?;
        self.write_word(
            registers::DEVICE_ADDRESS,
            address.encode_for_write_register(),
        )?;
        log::info!("Unit address changed from {} to {address}", self.unit);
        self.unit = address;
        Ok(())
    }

    /// The board switches after acknowledging; reopen the session with the new rate.
    pub fn write_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        let baud_rate = BaudRate::try_from(baud_rate)?;
        self.write_word(registers::BAUD_RATE, baud_rate.encode_for_write_register())?;
        log::info!("Baud rate of unit {} set to {baud_rate}", self.unit);
        Ok(())
    }

    pub fn write_io_direction(&mut self, direction: Word) -> Result<()> {
        self.write_word(registers::IO_DIRECTION, direction)
    }

    pub fn write_io_value(&mut self, value: Word) -> Result<()> {
        self.write_word(registers::IO_VALUE, value)
    }

    pub fn write_set_temperature(&mut self, temperature: Word) -> Result<()> {
        self.write_word(registers::SET_TEMPERATURE, temperature)
    }

    pub fn write_drop_threshold(&mut self, channel: u8, voltage: f32) -> Result<()> {
        let channel = Channel::try_from(channel)?;
        let raw = protocol::encode_threshold(voltage)?;
        let register = channel_register(registers::DROP_THRESHOLDS, channel)?;
        self.write_word(register, raw)
    }

    /// Writes all 32 thresholds in a single transaction.
    pub fn write_drop_thresholds(&mut self, voltages: &[f32; NUMBER_OF_CHANNELS]) -> Result<()> {
        let raw = voltages
            .iter()
            .map(|v| protocol::encode_threshold(*v))
            .collect::<Result<Vec<Word>>>()?;
        self.master
            .write_multiple_registers(self.unit.value(), registers::DROP_THRESHOLDS.start, &raw)
    }

    /// Ends the session and hands back the byte stream.
    pub fn close(self) -> T {
        log::debug!("Closing session with unit {}", self.unit);
        self.master.close()
    }
}

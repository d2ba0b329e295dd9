use crate::device::Gjvdc32;
use crate::protocol::{Address, BaudRate};
use crate::rtu::{self, RtuConfig, Transport};
use crate::{Error, Result};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io;
use std::time::Duration;

/// Serial line settings and transaction timing of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialConfig {
    pub baud_rate: BaudRate,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Read and write timeout of the port.
    pub timeout: Duration,
    pub delay: Duration,
    pub poll_retries: u8,
    pub poll_interval: Duration,
    pub address: Address,
}

impl Default for SerialConfig {
    fn default() -> Self {
        let rtu = RtuConfig::default();
        Self {
            baud_rate: BaudRate::default(),
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_millis(1000),
            delay: rtu.delay,
            poll_retries: rtu.poll_retries,
            poll_interval: rtu.poll_interval,
            address: Address::default(),
        }
    }
}

impl SerialConfig {
    pub fn rtu_config(&self) -> RtuConfig {
        RtuConfig {
            delay: self.delay,
            poll_retries: self.poll_retries,
            poll_interval: self.poll_interval,
            silent_interval: rtu::silent_interval(self.baud_rate.bits_per_second()),
        }
    }
}

/// An open serial port. The port is released when the value is dropped.
#[derive(Debug)]
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialTransport {
    pub fn open(device: &str, config: &SerialConfig) -> Result<Self> {
        let port = serialport::new(device, config.baud_rate.bits_per_second())
            .data_bits(DataBits::Eight)
            .parity(config.parity)
            .stop_bits(config.stop_bits)
            .flow_control(FlowControl::None)
            .timeout(config.timeout)
            .open()
            .map_err(|err| Error::Connection(format!("Cannot open serial port '{device}': {err}")))?;
        log::debug!("Opened serial port '{device}' with {config:?}");
        Ok(Self {
            port,
            name: device.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for SerialTransport {
    fn clear(&mut self) -> io::Result<()> {
        let pending = self.port.bytes_to_read().map_err(io::Error::from)?;
        if pending > 0 {
            log::trace!("Discarding {pending} pending bytes");
        }
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        io::Write::write_all(&mut self.port, data)?;
        io::Write::flush(&mut self.port)
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(io::Error::from)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(&mut self.port, buf)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        // the port may already be gone
        if let Err(err) = self.port.clear(ClearBuffer::All) {
            log::debug!("Ignoring error while releasing '{}': {err}", self.name);
        }
        log::debug!("Released serial port '{}'", self.name);
    }
}

/// Opens `device` and starts a session with the board at `config.address`.
pub fn open(device: &str, config: &SerialConfig) -> Result<Gjvdc32<SerialTransport>> {
    let transport = SerialTransport::open(device, config)?;
    log::info!(
        "Session with unit {} on '{}' at {} baud",
        config.address,
        transport.name(),
        config.baud_rate
    );
    Ok(Gjvdc32::new(transport, config.address, config.rtu_config()))
}

use crate::mqtt;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use gjvdc32_lib::protocol::{Address, BaudRate, CalibrationBlock};
use gjvdc32_lib::serialport::SerialConfig;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum ParityArg {
    None,
    Odd,
    Even,
}

impl From<ParityArg> for serialport::Parity {
    fn from(parity: ParityArg) -> Self {
        match parity {
            ParityArg::None => serialport::Parity::None,
            ParityArg::Odd => serialport::Parity::Odd,
            ParityArg::Even => serialport::Parity::Even,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum StopBitsArg {
    One,
    Two,
}

impl From<StopBitsArg> for serialport::StopBits {
    fn from(stop_bits: StopBitsArg) -> Self {
        match stop_bits {
            StopBitsArg::One => serialport::StopBits::One,
            StopBitsArg::Two => serialport::StopBits::Two,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum CalibrationArg {
    A,
    B,
}

impl From<CalibrationArg> for CalibrationBlock {
    fn from(block: CalibrationArg) -> Self {
        match block {
            CalibrationArg::A => CalibrationBlock::A,
            CalibrationArg::B => CalibrationBlock::B,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show the voltage of all 32 channels
    Voltages,
    /// Show the voltage of one channel
    Voltage {
        /// Channel number 1-32
        channel: u8,
    },
    /// Show identification and status: address, firmware, baud rate, name, serial number, IO, drops, temperatures, fan, AC
    Info,
    /// Show for how many seconds each channel has been below its threshold
    DropDurations,
    /// Show the drop threshold of each channel in volts
    Thresholds,
    /// Show the raw words of a calibration block
    Calibration {
        #[arg(value_enum)]
        block: CalibrationArg,
    },
    /// Set the Modbus unit address of the board (1-128)
    SetAddress { address: u8 },
    /// Set the baud rate of the board (9600, 19200, 38400, 57600). Reconnect with the new rate afterwards.
    SetBaudRate { baud_rate: u32 },
    /// Set the IO direction bits (decimal or 0x-prefixed hex)
    SetIoDirection {
        #[arg(value_parser = maybe_hex::<u16>)]
        direction: u16,
    },
    /// Set the IO output bits (decimal or 0x-prefixed hex)
    SetIoValue {
        #[arg(value_parser = maybe_hex::<u16>)]
        value: u16,
    },
    /// Set the fan control temperature
    SetTemperature { temperature: u16 },
    /// Set the drop threshold of one channel in volts
    SetThreshold {
        /// Channel number 1-32
        channel: u8,
        /// Threshold voltage, e.g. 11.5
        voltage: f32,
    },
    /// Run in daemon mode, periodically fetching and outputting metrics
    Daemon {
        /// Output destination for metrics
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval for fetching metrics (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
        /// Comma-separated list of metrics to fetch (voltages,info,drop-durations,thresholds or all)
        #[clap(long, short, use_value_delimiter = true, default_value = "voltages,info")]
        metrics: Vec<String>,
        /// Number of retries for failed transactions
        #[arg(long, default_value = "3")]
        retries: u8,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously read metrics and print them to the standard output (console).
    Console,
    /// Continuously read metrics and publish them to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "GJVdc-32 voltage monitor command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Modbus unit address of the board (1-128)
    #[arg(short, long, default_value = "1")]
    pub address: u8,

    /// Serial baud rate (9600, 19200, 38400, 57600)
    #[arg(short, long, default_value = "57600")]
    pub baud_rate: u32,

    #[arg(long, value_enum, default_value_t = ParityArg::None)]
    pub parity: ParityArg,

    #[arg(long, value_enum, default_value_t = StopBitsArg::One)]
    pub stop_bits: StopBitsArg,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for serial I/O operations (e.g., "500ms", "1s", "2s 500ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "1s")]
    pub timeout: Duration,

    // Some USB - RS485 dongles need time to switch between TX and RX
    /// Delay between sending a request and reading the reply (e.g., "50ms", "100ms")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "50ms")]
    pub delay: Duration,

    /// How often to look for missing reply bytes before a request times out
    #[arg(long, default_value = "10")]
    pub poll_retries: u8,

    /// Pause between two looks for reply bytes
    #[arg(value_parser = humantime::parse_duration, long, default_value = "10ms")]
    pub poll_interval: Duration,
}

impl CliArgs {
    pub fn serial_config(&self) -> Result<SerialConfig> {
        Ok(SerialConfig {
            baud_rate: BaudRate::try_from(self.baud_rate)
                .with_context(|| format!("Invalid baud rate {}", self.baud_rate))?,
            parity: self.parity.into(),
            stop_bits: self.stop_bits.into(),
            timeout: self.timeout,
            delay: self.delay,
            poll_retries: self.poll_retries,
            poll_interval: self.poll_interval,
            address: Address::try_from(self.address)
                .with_context(|| format!("Invalid unit address {}", self.address))?,
        })
    }
}

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use gjvdc32_lib::protocol::DeviceSnapshot;
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn print_snapshot(snapshot: &DeviceSnapshot) {
    println!("Address:             {}", snapshot.address);
    println!("Firmware version:    {:.1}", snapshot.firmware_version);
    println!("Baud rate:           {}", snapshot.baud_rate);
    println!("Board name:          {}", snapshot.board_name);
    println!("Serial number:       {}", snapshot.serial_number);
    println!("IO direction:        {:#06x}", snapshot.io_direction);
    println!("IO value:            {:#06x}", snapshot.io_value);
    let dropped: Vec<String> = snapshot
        .drop_mask
        .dropped_channels()
        .iter()
        .map(|c| c.to_string())
        .collect();
    println!(
        "Dropped channels:    {} [{}]",
        snapshot.drop_mask,
        dropped.join(", ")
    );
    println!("Set temperature:     {}", snapshot.set_temperature);
    println!("Current temperature: {}", snapshot.current_temperature);
    println!("Fan current:         {} mA", snapshot.fan_current);
    println!("AC on:               {}", snapshot.ac_on);
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = args.serial_config()?;
    let mut board = gjvdc32_lib::serialport::open(&args.device, &config)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;

    match args.command {
        CliCommands::Voltages => {
            for reading in board
                .read_all_voltages()
                .with_context(|| "Cannot read voltages")?
            {
                println!("{reading}");
            }
        }
        CliCommands::Voltage { channel } => println!(
            "{}",
            board
                .read_single_voltage(channel)
                .with_context(|| format!("Cannot read voltage of channel {channel}"))?
        ),
        CliCommands::Info => print_snapshot(
            &board
                .read_device_snapshot()
                .with_context(|| "Cannot read device info")?,
        ),
        CliCommands::DropDurations => {
            let durations = board
                .read_drop_durations()
                .with_context(|| "Cannot read drop durations")?;
            for (i, seconds) in durations.iter().enumerate() {
                println!("CH{:02}: {seconds} s", i + 1);
            }
        }
        CliCommands::Thresholds => {
            let thresholds = board
                .read_drop_thresholds()
                .with_context(|| "Cannot read drop thresholds")?;
            for (i, volts) in thresholds.iter().enumerate() {
                println!("CH{:02}: {volts:.2} V", i + 1);
            }
        }
        CliCommands::Calibration { block } => {
            let words = board
                .read_calibration(block.into())
                .with_context(|| format!("Cannot read calibration block {block:?}"))?;
            println!("Calibration {block:?}: {words:04X?}");
        }
        CliCommands::SetAddress { address } => board
            .write_device_address(address)
            .with_context(|| "Cannot set device address")?,
        CliCommands::SetBaudRate { baud_rate } => board
            .write_baud_rate(baud_rate)
            .with_context(|| format!("Cannot set baud rate {baud_rate}"))?,
        CliCommands::SetIoDirection { direction } => board
            .write_io_direction(direction)
            .with_context(|| "Cannot set IO direction")?,
        CliCommands::SetIoValue { value } => board
            .write_io_value(value)
            .with_context(|| "Cannot set IO value")?,
        CliCommands::SetTemperature { temperature } => board
            .write_set_temperature(temperature)
            .with_context(|| "Cannot set temperature")?,
        CliCommands::SetThreshold { channel, voltage } => board
            .write_drop_threshold(channel, voltage)
            .with_context(|| format!("Cannot set threshold of channel {channel}"))?,
        CliCommands::Daemon {
            output,
            interval,
            metrics,
            retries,
        } => daemon::run(board, output, interval, metrics, retries)?,
    }

    Ok(())
}

#![cfg_attr(docsrs, feature(doc_cfg))]
//! # gjvdc32_lib
//!
//! Modbus RTU master for the GJVdc-32 32-channel DC voltage monitoring board.
//!
//! The board speaks a vendor profile of Modbus RTU with two function codes:
//! 0x03 (read holding registers) and 0x10 (write multiple registers).
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `gjvdc32` command-line tool.
//!
//! ### Client Features
//! - `serialport`: Enables the **synchronous** serial port session using the `serialport` crate.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for the domain types.
//! - `bin-dependencies`: Enables all features required by the `gjvdc32` binary executable.
//!
//! Any other byte stream can be used by implementing [`rtu::Transport`] and passing it
//! to [`device::Gjvdc32::new`].

/// CRC16/Modbus checksum.
pub mod crc;
/// High level operations on one board.
pub mod device;
/// Contains error types for the library.
mod error;
/// Register values and their domain types.
pub mod protocol;
/// Holding register map.
pub mod registers;
/// Modbus RTU framing and transaction engine.
pub mod rtu;

pub use error::{exception_text, Error, Mismatch, Result};

/// Synchronous serial port session.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

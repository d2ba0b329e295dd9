use std::fmt;

/// Which echoed field of a reply did not match the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    UnitAddress { expected: u8, received: u8 },
    FunctionCode { expected: u8, received: u8 },
    ByteCount { expected: u8, received: u8 },
    StartAddress { expected: u16, received: u16 },
    Quantity { expected: u16, received: u16 },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Mismatch::UnitAddress { expected, received } => write!(
                f,
                "unit address mismatch - expected={expected:#04x} received={received:#04x}"
            ),
            Mismatch::FunctionCode { expected, received } => write!(
                f,
                "function code mismatch - expected={expected:#04x} received={received:#04x}"
            ),
            Mismatch::ByteCount { expected, received } => write!(
                f,
                "byte count mismatch - expected={expected} received={received}"
            ),
            Mismatch::StartAddress { expected, received } => write!(
                f,
                "start address mismatch - expected={expected:#06x} received={received:#06x}"
            ),
            Mismatch::Quantity { expected, received } => write!(
                f,
                "register quantity mismatch - expected={expected} received={received}"
            ),
        }
    }
}

/// Errors reported by the GJVdc-32 protocol library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The byte stream is not open or went away.
    #[error("Connection error: {0}")]
    Connection(String),
    /// The reply failed the CRC check.
    #[error("CRC mismatch - calculated={calculated:#06x} received={received:#06x}")]
    Framing { calculated: u16, received: u16 },
    /// The reply does not answer the request that was sent.
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(Mismatch),
    /// The device answered with a Modbus exception response.
    #[error("Device exception {code:#04x} ({})", exception_text(*code))]
    DeviceException { code: u8 },
    /// Fewer bytes than expected arrived within the poll budget.
    #[error("Timeout - expected {expected} bytes, received {received}")]
    Timeout { expected: usize, received: usize },
    /// An argument lies outside the supported domain.
    #[error("Value out of range: {0}")]
    Range(String),
    /// A value that has no encoding in the protocol.
    #[error("Unsupported value {0}")]
    UnsupportedValue(u32),
    /// A length argument exceeds the supplied buffer.
    #[error("Input size error - requested {requested} bytes, available {available}")]
    InputSize { requested: usize, available: usize },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

/// Standard Modbus exception code names.
pub fn exception_text(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

pub type Result<T> = std::result::Result<T, Error>;

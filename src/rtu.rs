//! Modbus RTU framing and the blocking request/response engine.
//!
//! Only the two function codes the board understands are implemented:
//! 0x03 (read holding registers) and 0x10 (write multiple registers).

use crate::crc;
use crate::error::Mismatch;
use crate::protocol::Word;
use crate::{Error, Result};
use std::io;
use std::time::{Duration, Instant};

pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
const EXCEPTION_FLAG: u8 = 0x80;

/// unit, function, exception code, crc
const EXCEPTION_REPLY_SIZE: usize = 5;
/// unit, function, start, quantity, crc
const WRITE_REPLY_SIZE: usize = 8;

pub const MAX_READ_QUANTITY: u16 = 125;
pub const MAX_WRITE_QUANTITY: u16 = 123;

/// Byte stream the engine talks over.
pub trait Transport {
    /// Discards bytes buffered in both directions.
    fn clear(&mut self) -> io::Result<()>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Number of received bytes that can be read without blocking.
    fn bytes_to_read(&mut self) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Modbus RTU silent interval of 3.5 character times (11 bits each), fixed to 1.75 ms
/// above 19200 baud.
pub fn silent_interval(baud_rate: u32) -> Duration {
    if baud_rate > 19200 || baud_rate == 0 {
        Duration::from_micros(1750)
    } else {
        Duration::from_micros(3_500_000 * 11 / baud_rate as u64)
    }
}

/// Timing of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct RtuConfig {
    /// Wait between writing a request and reading the reply.
    pub delay: Duration,
    /// How often the engine looks for missing reply bytes before giving up.
    pub poll_retries: u8,
    pub poll_interval: Duration,
    /// Minimum bus silence between the end of one exchange and the next request.
    pub silent_interval: Duration,
}

impl Default for RtuConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(50),
            poll_retries: 10,
            poll_interval: Duration::from_millis(10),
            silent_interval: silent_interval(57600),
        }
    }
}

/// Builds a function 0x03 request frame.
pub fn read_request(unit: u8, start: u16, count: u16) -> Result<Vec<u8>> {
    if !(1..=MAX_READ_QUANTITY).contains(&count) {
        return Err(Error::Range(format!(
            "read quantity {count} is outside 1..={MAX_READ_QUANTITY}"
        )));
    }
    let mut tx_buffer = vec![unit, READ_HOLDING_REGISTERS];
    tx_buffer.extend_from_slice(&start.to_be_bytes());
    tx_buffer.extend_from_slice(&count.to_be_bytes());
    crc::append_crc(&tx_buffer, tx_buffer.len())
}

pub fn read_reply_size(count: u16) -> usize {
    5 + 2 * count as usize
}

/// Builds a function 0x10 request frame.
pub fn write_request(unit: u8, start: u16, values: &[Word]) -> Result<Vec<u8>> {
    let count = values.len();
    if count == 0 || count > MAX_WRITE_QUANTITY as usize {
        return Err(Error::Range(format!(
            "write quantity {count} is outside 1..={MAX_WRITE_QUANTITY}"
        )));
    }
    let mut tx_buffer = Vec::with_capacity(9 + 2 * count);
    tx_buffer.extend_from_slice(&[unit, WRITE_MULTIPLE_REGISTERS]);
    tx_buffer.extend_from_slice(&start.to_be_bytes());
    tx_buffer.extend_from_slice(&(count as u16).to_be_bytes());
    tx_buffer.push((count * 2) as u8);
    for value in values {
        tx_buffer.extend_from_slice(&value.to_be_bytes());
    }
    crc::append_crc(&tx_buffer, tx_buffer.len())
}

pub fn write_reply_size() -> usize {
    WRITE_REPLY_SIZE
}

/// Checks CRC, unit echo and function code of a reply, in that order.
fn validate_header(unit: u8, function: u8, rx_buffer: &[u8]) -> Result<()> {
    if rx_buffer.len() < EXCEPTION_REPLY_SIZE {
        return Err(Error::Timeout {
            expected: EXCEPTION_REPLY_SIZE,
            received: rx_buffer.len(),
        });
    }
    if !crc::verify(rx_buffer, rx_buffer.len()) {
        let len = rx_buffer.len();
        let calculated = crc::crc16(&rx_buffer[..len - 2]);
        let received = u16::from_le_bytes([rx_buffer[len - 2], rx_buffer[len - 1]]);
        log::warn!(
            "Invalid CRC - calculated={calculated:04X} received={received:04X} buffer={rx_buffer:02X?}"
        );
        return Err(Error::Framing {
            calculated,
            received,
        });
    }
    if rx_buffer[0] != unit {
        log::warn!(
            "Reply from unexpected unit - expected={unit} received={}",
            rx_buffer[0]
        );
        return Err(Error::ProtocolMismatch(Mismatch::UnitAddress {
            expected: unit,
            received: rx_buffer[0],
        }));
    }
    if rx_buffer[1] == function | EXCEPTION_FLAG {
        log::warn!("Exception reply {:#04x} to function {function:#04x}", rx_buffer[2]);
        return Err(Error::DeviceException { code: rx_buffer[2] });
    }
    if rx_buffer[1] != function {
        return Err(Error::ProtocolMismatch(Mismatch::FunctionCode {
            expected: function,
            received: rx_buffer[1],
        }));
    }
    Ok(())
}

/// Validates a function 0x03 reply and returns its register words.
pub fn decode_read_reply(unit: u8, count: u16, rx_buffer: &[u8]) -> Result<Vec<Word>> {
    validate_header(unit, READ_HOLDING_REGISTERS, rx_buffer)?;
    let expected = 2 * count as usize;
    let byte_count = rx_buffer[2];
    if byte_count as usize != expected || rx_buffer.len() != read_reply_size(count) {
        return Err(Error::ProtocolMismatch(Mismatch::ByteCount {
            expected: expected as u8,
            received: byte_count,
        }));
    }
    Ok(rx_buffer[3..3 + expected]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Validates the acknowledgement of a function 0x10 request.
pub fn decode_write_reply(unit: u8, start: u16, quantity: u16, rx_buffer: &[u8]) -> Result<()> {
    validate_header(unit, WRITE_MULTIPLE_REGISTERS, rx_buffer)?;
    if rx_buffer.len() != WRITE_REPLY_SIZE {
        return Err(Error::Timeout {
            expected: WRITE_REPLY_SIZE,
            received: rx_buffer.len(),
        });
    }
    let echoed_start = u16::from_be_bytes([rx_buffer[2], rx_buffer[3]]);
    if echoed_start != start {
        return Err(Error::ProtocolMismatch(Mismatch::StartAddress {
            expected: start,
            received: echoed_start,
        }));
    }
    let echoed_quantity = u16::from_be_bytes([rx_buffer[4], rx_buffer[5]]);
    if echoed_quantity != quantity {
        return Err(Error::ProtocolMismatch(Mismatch::Quantity {
            expected: quantity,
            received: echoed_quantity,
        }));
    }
    Ok(())
}

/// Where the engine is within a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Sending,
    AwaitingReply { retries_remaining: u8 },
    Validating,
    Complete,
    Failed,
}

fn map_io(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => Error::Connection(err.to_string()),
        _ => Error::Io(err),
    }
}

/// Single-master Modbus RTU engine over one byte stream.
///
/// Every transaction borrows the engine mutably, so only one can be in flight.
/// A failed transaction is never re-sent here; the byte poll only waits for a reply
/// that is already on its way.
#[derive(Debug)]
pub struct RtuMaster<T: Transport> {
    transport: T,
    config: RtuConfig,
    last_execution: Option<Instant>,
    state: TransactionState,
}

impl<T: Transport> RtuMaster<T> {
    pub fn new(transport: T, config: RtuConfig) -> Self {
        Self {
            transport,
            config,
            last_execution: None,
            state: TransactionState::Idle,
        }
    }

    pub fn config(&self) -> &RtuConfig {
        &self.config
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn transition(&mut self, state: TransactionState) {
        log::trace!("Transaction {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn await_silent_interval(&self) {
        if let Some(last_execution) = self.last_execution {
            let elapsed = Instant::now().duration_since(last_execution);
            if let Some(remaining) = self.config.silent_interval.checked_sub(elapsed) {
                std::thread::sleep(remaining);
            }
        }
    }

    fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // stale bytes of an earlier failed exchange would corrupt this reply
        self.transport.clear().map_err(map_io)?;
        self.await_silent_interval();
        log::trace!("send_bytes: {tx_buffer:02X?}");
        self.transport.write_all(tx_buffer).map_err(map_io)?;
        if !self.config.delay.is_zero() {
            std::thread::sleep(self.config.delay);
        }
        Ok(())
    }

    fn receive_bytes(&mut self, function: u8, size: usize) -> Result<Vec<u8>> {
        let mut expected = size;
        let mut rx_buffer: Vec<u8> = Vec::with_capacity(size);
        let mut retries_remaining = self.config.poll_retries;
        loop {
            let pending = self.transport.bytes_to_read().map_err(map_io)?;
            if pending > 0 {
                let filled = rx_buffer.len();
                let wanted = pending.min(expected - filled);
                rx_buffer.resize(filled + wanted, 0);
                let received = self
                    .transport
                    .read(&mut rx_buffer[filled..])
                    .map_err(map_io)?;
                rx_buffer.truncate(filled + received);
                if rx_buffer.len() >= 2 && rx_buffer[1] == function | EXCEPTION_FLAG {
                    expected = EXCEPTION_REPLY_SIZE;
                }
                if rx_buffer.len() >= expected {
                    rx_buffer.truncate(expected);
                    self.last_execution = Some(Instant::now());
                    log::trace!("receive_bytes: {rx_buffer:02X?}");
                    return Ok(rx_buffer);
                }
            }
            if retries_remaining == 0 {
                self.last_execution = Some(Instant::now());
                log::debug!(
                    "Reply incomplete - expected={expected} received={} buffer={rx_buffer:02X?}",
                    rx_buffer.len()
                );
                return Err(Error::Timeout {
                    expected,
                    received: rx_buffer.len(),
                });
            }
            retries_remaining -= 1;
            self.transition(TransactionState::AwaitingReply { retries_remaining });
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn exchange(&mut self, tx_buffer: &[u8], function: u8, reply_size: usize) -> Result<Vec<u8>> {
        self.transition(TransactionState::Sending);
        self.send_bytes(tx_buffer)?;
        let retries_remaining = self.config.poll_retries;
        self.transition(TransactionState::AwaitingReply { retries_remaining });
        self.receive_bytes(function, reply_size)
    }

    /// Runs one request/response exchange. The engine is back in `Idle` on every path.
    fn transact<R>(
        &mut self,
        tx_buffer: &[u8],
        function: u8,
        reply_size: usize,
        decode: impl FnOnce(&[u8]) -> Result<R>,
    ) -> Result<R> {
        let result = self
            .exchange(tx_buffer, function, reply_size)
            .and_then(|rx_buffer| {
                self.transition(TransactionState::Validating);
                decode(&rx_buffer)
            });
        match &result {
            Ok(_) => self.transition(TransactionState::Complete),
            Err(err) => {
                log::debug!("Transaction failed: {err}");
                self.transition(TransactionState::Failed);
            }
        }
        self.transition(TransactionState::Idle);
        result
    }

    /// Reads `count` holding registers starting at `start`.
    pub fn read_holding_registers(&mut self, unit: u8, start: u16, count: u16) -> Result<Vec<Word>> {
        log::debug!("read_holding_registers unit={unit} start={start:#06x} count={count}");
        let tx_buffer = read_request(unit, start, count)?;
        self.transact(
            &tx_buffer,
            READ_HOLDING_REGISTERS,
            read_reply_size(count),
            |rx_buffer| decode_read_reply(unit, count, rx_buffer),
        )
    }

    /// Writes `values` to consecutive holding registers starting at `start`.
    pub fn write_multiple_registers(&mut self, unit: u8, start: u16, values: &[Word]) -> Result<()> {
        log::debug!("write_multiple_registers unit={unit} start={start:#06x} values={values:04X?}");
        let tx_buffer = write_request(unit, start, values)?;
        let quantity = values.len() as u16;
        self.transact(
            &tx_buffer,
            WRITE_MULTIPLE_REGISTERS,
            write_reply_size(),
            |rx_buffer| decode_write_reply(unit, start, quantity, rx_buffer),
        )
    }

    /// Best-effort discard of pending bytes before the stream is released.
    pub fn close(mut self) -> T {
        if let Err(err) = self.transport.clear() {
            log::debug!("Ignoring error while closing the session: {err}");
        }
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct ScriptedPort {
        replies: VecDeque<Vec<u8>>,
        rx: VecDeque<u8>,
        written: Vec<Vec<u8>>,
        clears: usize,
        /// Bytes made available per poll, all at once if unset.
        chunk: Option<usize>,
    }

    impl ScriptedPort {
        fn replying(replies: &[&[u8]]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_vec()).collect(),
                ..Default::default()
            }
        }
    }

    impl Transport for ScriptedPort {
        fn clear(&mut self) -> io::Result<()> {
            self.rx.clear();
            self.clears += 1;
            Ok(())
        }

        fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
            self.written.push(data.to_vec());
            if let Some(reply) = self.replies.pop_front() {
                self.rx.extend(reply);
            }
            Ok(())
        }

        fn bytes_to_read(&mut self) -> io::Result<usize> {
            Ok(self.chunk.map_or(self.rx.len(), |c| c.min(self.rx.len())))
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.rx.len());
            for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    fn fast_config() -> RtuConfig {
        RtuConfig {
            delay: Duration::ZERO,
            poll_retries: 3,
            poll_interval: Duration::ZERO,
            silent_interval: Duration::ZERO,
        }
    }

    fn with_crc(data: &[u8]) -> Vec<u8> {
        crc::append_crc(data, data.len()).unwrap()
    }

    #[test]
    fn read_request_frame() {
        let frame = read_request(1, 0x8010, 2).unwrap();
        assert_eq!(frame, with_crc(&[0x01, 0x03, 0x80, 0x10, 0x00, 0x02]));
        assert_eq!(frame.len(), 8);
        assert!(read_request(1, 0x8010, 0).is_err());
        assert!(read_request(1, 0x8010, 126).is_err());
    }

    #[test]
    fn write_request_frame() {
        let frame = write_request(3, 0x8000, &[0x0005]).unwrap();
        assert_eq!(
            frame,
            with_crc(&[0x03, 0x10, 0x80, 0x00, 0x00, 0x01, 0x02, 0x00, 0x05])
        );
        assert!(write_request(3, 0x8000, &[]).is_err());
    }

    #[test]
    fn silent_interval_by_baud_rate() {
        assert_eq!(silent_interval(9600), Duration::from_micros(4010));
        assert_eq!(silent_interval(57600), Duration::from_micros(1750));
    }

    #[test]
    fn reads_two_registers() {
        let reply = with_crc(&[0x01, 0x03, 0x04, 0x03, 0xE8, 0x00, 0xC8]);
        let mut master = RtuMaster::new(ScriptedPort::replying(&[&reply]), fast_config());
        let words = master.read_holding_registers(1, 0x8010, 2).unwrap();
        assert_eq!(words, vec![0x03E8, 0x00C8]);
        assert_eq!(
            master.transport().written,
            vec![with_crc(&[0x01, 0x03, 0x80, 0x10, 0x00, 0x02])]
        );
        assert_eq!(master.transport().clears, 1);
        assert_eq!(master.state(), TransactionState::Idle);
    }

    #[test]
    fn reply_arriving_in_pieces_is_assembled() {
        let reply = with_crc(&[0x01, 0x03, 0x04, 0x03, 0xE8, 0x00, 0xC8]);
        let mut port = ScriptedPort::replying(&[&reply]);
        port.chunk = Some(3);
        let mut config = fast_config();
        config.poll_retries = 0;
        let mut master = RtuMaster::new(port, config);
        // With no poll budget the first three bytes are all that arrive.
        assert!(matches!(
            master.read_holding_registers(1, 0x8010, 2),
            Err(Error::Timeout {
                expected: 9,
                received: 3
            })
        ));

        let mut port = ScriptedPort::replying(&[&reply]);
        port.chunk = Some(3);
        let mut master = RtuMaster::new(port, fast_config());
        assert_eq!(
            master.read_holding_registers(1, 0x8010, 2).unwrap(),
            vec![0x03E8, 0x00C8]
        );
    }

    #[test]
    fn exception_reply() {
        let reply = with_crc(&[0x01, 0x83, 0x02]);
        let mut master = RtuMaster::new(ScriptedPort::replying(&[&reply]), fast_config());
        assert!(matches!(
            master.read_holding_registers(1, 0x8010, 2),
            Err(Error::DeviceException { code: 2 })
        ));
        assert_eq!(master.state(), TransactionState::Idle);
    }

    #[test]
    fn corrupted_reply_is_a_framing_error() {
        let mut reply = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x01]);
        reply[4] ^= 0x10;
        let mut master = RtuMaster::new(ScriptedPort::replying(&[&reply]), fast_config());
        assert!(matches!(
            master.read_holding_registers(1, 0x8000, 1),
            Err(Error::Framing { .. })
        ));
    }

    #[test]
    fn reply_from_other_unit() {
        let reply = with_crc(&[0x02, 0x03, 0x02, 0x00, 0x01]);
        let mut master = RtuMaster::new(ScriptedPort::replying(&[&reply]), fast_config());
        assert!(matches!(
            master.read_holding_registers(1, 0x8000, 1),
            Err(Error::ProtocolMismatch(Mismatch::UnitAddress {
                expected: 1,
                received: 2
            }))
        ));
    }

    #[test]
    fn wrong_function_code() {
        let reply = with_crc(&[0x01, 0x04, 0x02, 0x00, 0x01]);
        assert!(matches!(
            decode_read_reply(1, 1, &reply),
            Err(Error::ProtocolMismatch(Mismatch::FunctionCode {
                expected: 0x03,
                received: 0x04
            }))
        ));
    }

    #[test]
    fn wrong_byte_count() {
        let reply = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x01]);
        assert!(matches!(
            decode_read_reply(1, 1, &reply),
            Err(Error::ProtocolMismatch(Mismatch::ByteCount {
                expected: 2,
                received: 4
            }))
        ));
    }

    #[test]
    fn silence_is_a_timeout() {
        let mut master = RtuMaster::new(ScriptedPort::default(), fast_config());
        assert!(matches!(
            master.read_holding_registers(1, 0x8000, 1),
            Err(Error::Timeout {
                expected: 7,
                received: 0
            })
        ));
        // nothing is re-sent
        assert_eq!(master.transport().written.len(), 1);
    }

    #[test]
    fn stale_bytes_are_discarded_before_sending() {
        let reply = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x07]);
        let mut port = ScriptedPort::replying(&[&reply]);
        port.rx.extend([0xAA, 0xBB, 0xCC]);
        let mut master = RtuMaster::new(port, fast_config());
        assert_eq!(master.read_holding_registers(1, 0x8000, 1).unwrap(), vec![7]);
    }

    #[test]
    fn write_is_acknowledged() {
        let ack = with_crc(&[0x01, 0x10, 0x80, 0x07, 0x00, 0x01]);
        let mut master = RtuMaster::new(ScriptedPort::replying(&[&ack]), fast_config());
        master.write_multiple_registers(1, 0x8007, &[25]).unwrap();
        assert_eq!(
            master.transport().written,
            vec![with_crc(&[0x01, 0x10, 0x80, 0x07, 0x00, 0x01, 0x02, 0x00, 0x19])]
        );
    }

    #[test]
    fn write_exception() {
        let reply = with_crc(&[0x01, 0x90, 0x03]);
        let mut master = RtuMaster::new(ScriptedPort::replying(&[&reply]), fast_config());
        assert!(matches!(
            master.write_multiple_registers(1, 0x8007, &[25]),
            Err(Error::DeviceException { code: 3 })
        ));
    }

    #[test]
    fn write_ack_for_other_register() {
        let ack = with_crc(&[0x01, 0x10, 0x80, 0x08, 0x00, 0x01]);
        assert!(matches!(
            decode_write_reply(1, 0x8007, 1, &ack),
            Err(Error::ProtocolMismatch(Mismatch::StartAddress { .. }))
        ));
    }

    #[test]
    fn write_ack_with_other_quantity() {
        let ack = with_crc(&[0x01, 0x10, 0x80, 0x07, 0x00, 0x02]);
        assert!(matches!(
            decode_write_reply(1, 0x8007, 1, &ack),
            Err(Error::ProtocolMismatch(Mismatch::Quantity {
                expected: 1,
                received: 2
            }))
        ));
    }

    #[test]
    fn write_ack_with_other_function_code() {
        let ack = with_crc(&[0x01, 0x06, 0x80, 0x07, 0x00, 0x01]);
        assert!(matches!(
            decode_write_reply(1, 0x8007, 1, &ack),
            Err(Error::ProtocolMismatch(Mismatch::FunctionCode {
                expected: 0x10,
                received: 0x06
            }))
        ));
    }

    #[test]
    fn write_ack_from_other_unit() {
        let ack = with_crc(&[0x02, 0x10, 0x80, 0x07, 0x00, 0x01]);
        assert!(matches!(
            decode_write_reply(1, 0x8007, 1, &ack),
            Err(Error::ProtocolMismatch(Mismatch::UnitAddress {
                expected: 1,
                received: 2
            }))
        ));
        assert!(decode_write_reply(2, 0x8007, 1, &ack).is_ok());
    }

    #[test]
    fn transport_failure_maps_to_connection_error() {
        #[derive(Debug)]
        struct Unplugged;
        impl Transport for Unplugged {
            fn clear(&mut self) -> io::Result<()> {
                Err(io::Error::from(io::ErrorKind::BrokenPipe))
            }
            fn write_all(&mut self, _: &[u8]) -> io::Result<()> {
                unreachable!()
            }
            fn bytes_to_read(&mut self) -> io::Result<usize> {
                unreachable!()
            }
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                unreachable!()
            }
        }
        let mut master = RtuMaster::new(Unplugged, fast_config());
        assert!(matches!(
            master.read_holding_registers(1, 0x8000, 1),
            Err(Error::Connection(_))
        ));
        assert_eq!(master.state(), TransactionState::Idle);
    }
}

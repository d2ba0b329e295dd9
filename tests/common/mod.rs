use gjvdc32_lib::crc;
use gjvdc32_lib::rtu::{RtuConfig, Transport};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::time::Duration;

/// Register-backed stand-in for a GJVdc-32 board on the other end of the line.
#[derive(Debug, Default)]
pub struct SimulatedBoard {
    pub unit: u8,
    pub registers: BTreeMap<u16, u16>,
    /// Every frame the master wrote.
    pub requests: Vec<Vec<u8>>,
    /// Stop answering once this many requests were seen.
    pub answer_limit: Option<usize>,
    /// Answer reads touching this register with an exception code.
    pub exception_at: Option<(u16, u8)>,
    rx: VecDeque<u8>,
}

impl SimulatedBoard {
    pub fn new(unit: u8) -> Self {
        Self {
            unit,
            ..Default::default()
        }
    }

    pub fn set(&mut self, start: u16, values: &[u16]) {
        for (i, value) in values.iter().enumerate() {
            self.registers.insert(start + i as u16, *value);
        }
    }

    pub fn set_text(&mut self, start: u16, text: &str) {
        let units: Vec<u16> = text.encode_utf16().collect();
        self.set(start, &units);
    }

    fn respond(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        if request[0] != self.unit || !crc::verify(request, request.len()) {
            return None;
        }
        let function = request[1];
        let start = u16::from_be_bytes([request[2], request[3]]);
        let quantity = u16::from_be_bytes([request[4], request[5]]);
        let mut reply = vec![self.unit];
        match function {
            0x03 => {
                if let Some((register, code)) = self.exception_at {
                    if (start..start + quantity).contains(&register) {
                        reply.extend_from_slice(&[0x83, code]);
                        return Some(crc::append_crc(&reply, reply.len()).unwrap());
                    }
                }
                reply.extend_from_slice(&[0x03, (quantity * 2) as u8]);
                for register in start..start + quantity {
                    let value = self.registers.get(&register).copied().unwrap_or(0);
                    reply.extend_from_slice(&value.to_be_bytes());
                }
            }
            0x10 => {
                let values: Vec<u16> = request[7..7 + 2 * quantity as usize]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect();
                self.set(start, &values);
                reply.extend_from_slice(&request[1..6]);
                if start == 0x8000 {
                    // the new address takes effect after the acknowledgement
                    self.unit = values[0] as u8;
                }
            }
            _ => reply.extend_from_slice(&[function | 0x80, 0x01]),
        }
        Some(crc::append_crc(&reply, reply.len()).unwrap())
    }
}

impl Transport for SimulatedBoard {
    fn clear(&mut self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.requests.push(data.to_vec());
        if self
            .answer_limit
            .is_some_and(|limit| self.requests.len() > limit)
        {
            return Ok(());
        }
        if let Some(reply) = self.respond(data) {
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.rx.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.rx.len());
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

pub fn fast_config() -> RtuConfig {
    RtuConfig {
        delay: Duration::ZERO,
        poll_retries: 2,
        poll_interval: Duration::ZERO,
        silent_interval: Duration::ZERO,
    }
}

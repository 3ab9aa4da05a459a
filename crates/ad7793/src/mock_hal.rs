//! Simulated AD7793 behind the [`SpiTransport`] capability.
//!
//! The mock decodes the same command framing as the chip and keeps an
//! eight-entry register file. Time only moves when the bus is used: every
//! exchange advances the clock by a fixed tick, which keeps timeout tests
//! deterministic.

use std::io;

use log::debug;

use crate::hal::SpiTransport;
use crate::helpers::{be_bytes_to_u32, u32_to_be_bytes};
use crate::registers::{
    Register, CONF_CHANNEL, COMM_ADDR_MASK, COMM_ADDR_SHIFT, COMM_READ, COMM_WEN, MODE_SELECT,
    STAT_AD7793, STAT_CHANNEL_MASK, STAT_ERR, STAT_RDY,
};
use crate::types::Mode;

/// Register contents after power-on or a serial interface reset.
pub const POWER_ON_REGISTERS: [u32; 8] = [
    (STAT_RDY | STAT_AD7793) as u32, // status
    0x000A,                          // mode
    0x0710,                          // configuration
    0x000000,                        // data
    0x4B,                            // id
    0x00,                            // io
    0x800000,                        // offset
    0x500000,                        // full-scale
];

/// Bytes sent during one chip-select window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTransaction {
    pub sent: Vec<u8>,
}

/// Mock implementation of the AD7793 on an SPI bus
#[derive(Debug)]
pub struct MockAd7793 {
    registers: [u32; 8],
    now_ms: u64,
    tick_ms: u64,
    ready_after_ms: Option<u64>,
    conversion_started_ms: Option<u64>,
    conversion_result: u32,
    error_flag: bool,
    selected: bool,
    pending_read: Option<Register>,
    faults_skip: usize,
    faults_remaining: usize,
    current: Vec<u8>,
    transactions: Vec<MockTransaction>,
    resets: usize,
}

impl Default for MockAd7793 {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAd7793 {
    /// Create a mock chip in its power-on state. Conversions never become ready
    /// until [`MockAd7793::set_ready_after_ms`] is called.
    pub fn new() -> Self {
        MockAd7793 {
            registers: POWER_ON_REGISTERS,
            now_ms: 0,
            tick_ms: 1,
            ready_after_ms: None,
            conversion_started_ms: None,
            conversion_result: 0,
            error_flag: false,
            selected: false,
            pending_read: None,
            faults_skip: 0,
            faults_remaining: 0,
            current: Vec::new(),
            transactions: Vec::new(),
            resets: 0,
        }
    }

    /// Milliseconds the clock advances on every exchange.
    pub fn with_tick_ms(mut self, tick_ms: u64) -> Self {
        self.tick_ms = tick_ms;
        self
    }

    /// Delay between a single-conversion mode write and RDY going low. `None` never completes.
    pub fn set_ready_after_ms(&mut self, delay: Option<u64>) {
        self.ready_after_ms = delay;
    }

    /// Code latched into the data register when a conversion completes.
    pub fn set_conversion_result(&mut self, code: u32) {
        self.conversion_result = code & size_mask(Register::Data.size());
    }

    /// Raise or clear the overrange/underrange flag in the status register.
    pub fn set_error_flag(&mut self, error: bool) {
        self.error_flag = error;
    }

    /// Overwrite a register as if the chip had changed it on its own.
    pub fn set_register(&mut self, register: Register, value: u32) {
        self.registers[register as usize] = value & size_mask(register.size());
    }

    /// Current content of a register, without touching the bus.
    pub fn register(&self, register: Register) -> u32 {
        match register {
            Register::Status => self.status_byte() as u32,
            _ => self.registers[register as usize],
        }
    }

    /// Make the next `count` exchanges fail with a bus fault.
    pub fn fail_next_exchanges(&mut self, count: usize) {
        self.fail_exchanges_after(0, count);
    }

    /// Let `skip` exchanges through, then fail the following `count`.
    pub fn fail_exchanges_after(&mut self, skip: usize, count: usize) {
        self.faults_skip = skip;
        self.faults_remaining = count;
    }

    pub fn advance_ms(&mut self, ms: u64) {
        self.now_ms += ms;
    }

    /// Completed chip-select windows, oldest first.
    pub fn transactions(&self) -> &[MockTransaction] {
        &self.transactions
    }

    pub fn clear_transactions(&mut self) {
        self.transactions.clear();
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    /// Number of serial interface resets seen.
    pub fn resets(&self) -> usize {
        self.resets
    }

    fn conversion_ready(&self) -> bool {
        match (self.conversion_started_ms, self.ready_after_ms) {
            (Some(started), Some(delay)) => self.now_ms.saturating_sub(started) >= delay,
            _ => false,
        }
    }

    fn status_byte(&self) -> u8 {
        let mut status = STAT_AD7793;
        if !self.conversion_ready() {
            status |= STAT_RDY;
        }
        if self.error_flag {
            status |= STAT_ERR;
        }
        let channel = CONF_CHANNEL.extract(self.registers[Register::Configuration as usize]) as u8;
        status | (channel & STAT_CHANNEL_MASK)
    }

    fn power_on_reset(&mut self) {
        debug!("Mock AD7793 serial interface reset");
        self.registers = POWER_ON_REGISTERS;
        self.conversion_started_ms = None;
        self.pending_read = None;
        self.resets += 1;
    }

    /// Fill `rx` with the register value, MSB first.
    fn read_into(&mut self, register: Register, rx: &mut [u8]) {
        if register == Register::Data && self.conversion_ready() {
            self.registers[Register::Data as usize] = self.conversion_result;
        }
        let size = register.size();
        let mut bytes = [0u8; 3];
        u32_to_be_bytes(self.register(register), &mut bytes[..size]);
        for (i, slot) in rx.iter_mut().enumerate() {
            *slot = bytes.get(i).copied().filter(|_| i < size).unwrap_or(0);
        }
        if register == Register::Data {
            // Reading the result returns RDY high until the next conversion
            self.conversion_started_ms = None;
        }
    }

    fn write_from(&mut self, register: Register, payload: &[u8]) {
        let size = register.size();
        if payload.len() < size {
            debug!("Mock AD7793 ignoring short write to {:?}", register);
            return;
        }
        let value = be_bytes_to_u32(&payload[..size]);
        match register {
            // Read-only, or the communications register itself
            Register::Status | Register::Data | Register::Id => {}
            Register::Mode => {
                self.registers[Register::Mode as usize] = value;
                if MODE_SELECT.extract(value) == Mode::Single as u32 {
                    self.conversion_started_ms = Some(self.now_ms);
                }
            }
            _ => self.registers[register as usize] = value,
        }
    }
}

fn size_mask(size: usize) -> u32 {
    if size >= 4 {
        u32::MAX
    } else {
        (1u32 << (8 * size)) - 1
    }
}

impl SpiTransport for MockAd7793 {
    fn select(&mut self) {
        self.selected = true;
        self.current.clear();
    }

    fn deselect(&mut self) {
        if self.selected && !self.current.is_empty() {
            self.transactions.push(MockTransaction {
                sent: std::mem::take(&mut self.current),
            });
        }
        self.selected = false;
        self.pending_read = None;
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), io::Error> {
        self.now_ms += self.tick_ms;

        if self.faults_remaining > 0 {
            if self.faults_skip > 0 {
                self.faults_skip -= 1;
            } else {
                self.faults_remaining -= 1;
                return Err(io::Error::new(io::ErrorKind::Other, "injected bus fault"));
            }
        }
        if tx.len() != rx.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer length mismatch: tx {} rx {}", tx.len(), rx.len()),
            ));
        }
        if !self.selected {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "chip select not asserted"));
        }
        if tx.is_empty() {
            return Ok(());
        }

        self.current.extend_from_slice(tx);
        rx.fill(0xFF);

        // Data phase of a read started by an earlier exchange in this window
        if let Some(register) = self.pending_read.take() {
            self.read_into(register, rx);
            return Ok(());
        }

        if tx.len() >= 4 && tx.iter().all(|&b| b == 0xFF) {
            self.power_on_reset();
            return Ok(());
        }

        let command = tx[0];
        if command & COMM_WEN != 0 {
            return Ok(());
        }
        let register = Register::from_address((command >> COMM_ADDR_SHIFT) & COMM_ADDR_MASK);

        if command & COMM_READ != 0 {
            if tx.len() > 1 {
                self.read_into(register, &mut rx[1..]);
            } else {
                self.pending_read = Some(register);
            }
        } else {
            self.write_from(register, &tx[1..]);
        }
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.now_ms
    }
}

/// Helper function to create a mock chip that completes conversions after `ready_after_ms`
pub fn create_transport(ready_after_ms: u64) -> MockAd7793 {
    debug!("Creating mock AD7793 transport");
    let mut mock = MockAd7793::new();
    mock.set_ready_after_ms(Some(ready_after_ms));
    mock
}

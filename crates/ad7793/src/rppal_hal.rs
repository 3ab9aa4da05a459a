//! Raspberry Pi transport built on rppal.

use std::io;
use std::time::Instant;

use log::debug;
use rppal::gpio::{Gpio, OutputPin};
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

use crate::hal::SpiTransport;

/// SPI transport using rppal with a software-driven chip select.
///
/// The hardware slave select `Ss0` is claimed but unused; CS0/GPIO 8 must be
/// left unconnected so it does not interfere with the GPIO chip select.
pub struct RppalTransport {
    spi: Spi,
    cs_pin: OutputPin,
    epoch: Instant,
}

impl RppalTransport {
    /// Open `bus` in SPI mode 3 (the AD7793 clocks on the rising edge with SCLK idle high).
    pub fn new(bus: Bus, clock_speed: u32, cs_pin: u8) -> Result<Self, io::Error> {
        let spi = Spi::new(bus, SlaveSelect::Ss0, clock_speed, Mode::Mode3)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let gpio = Gpio::new().map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let mut cs_pin = gpio
            .get(cs_pin)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .into_output();
        cs_pin.set_high();

        Ok(RppalTransport {
            spi,
            cs_pin,
            epoch: Instant::now(),
        })
    }
}

impl SpiTransport for RppalTransport {
    fn select(&mut self) {
        self.cs_pin.set_low();
    }

    fn deselect(&mut self) {
        self.cs_pin.set_high();
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), io::Error> {
        self.spi
            .transfer(rx, tx)
            .map(|_| ())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// Helper function to create the hardware transport on SPI0 at 1 MHz
pub fn create_transport(cs_pin: u8) -> Result<RppalTransport, io::Error> {
    debug!("Creating hardware SPI transport (CS on GPIO {})", cs_pin);
    RppalTransport::new(Bus::Spi0, 1_000_000, cs_pin)
}

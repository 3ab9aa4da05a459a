//! Blocking driver for the Analog Devices AD7793 24-bit sigma-delta ADC.
//!
//! The driver talks to the chip through the narrow [`SpiTransport`] capability
//! (chip select, full-duplex exchange, millisecond clock), keeps a mirror of
//! the chip configuration, and runs single conversions with a bounded poll.

pub mod config;
pub mod driver;
pub mod hal;
pub mod helpers;
pub mod mock_hal;
pub mod registers;
pub mod types;

#[cfg(feature = "pi-hardware")]
pub mod rppal_hal;

// Re-export the main types that users need
pub use config::{load_config, AdcConfig};
pub use driver::Ad7793Driver;
pub use hal::SpiTransport;
pub use helpers::{raw_to_voltage, DATA_BITS, INTERNAL_REFERENCE_MV};
pub use registers::Register;
pub use types::{
    BiasSelect, Channel, ClockSource, ConversionState, DriverError, DriverStatus,
    ExcitationCurrent, ExcitationDirection, Gain, Mode, Polarity, Rate, ReferenceSelect, Status,
};

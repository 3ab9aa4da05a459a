//! Common types for the AD7793 driver: configuration values, status and errors.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registers::{
    Field, FieldValue, CONF_BIAS, CONF_CHANNEL, CONF_GAIN, CONF_REFSEL, CONF_UNIPOLAR,
    IO_EXC_CURRENT, IO_EXC_DIRECTION, MODE_CLOCK, MODE_RATE, MODE_SELECT, STAT_CHANNEL_MASK,
    STAT_ERR, STAT_RDY,
};

macro_rules! field_value {
    ($ty:ty, $field:expr) => {
        impl FieldValue for $ty {
            const FIELD: Field = $field;

            fn bits(self) -> u32 {
                self as u32
            }
        }
    };
}

/// Operating mode (mode register bits 15:13).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    Continuous = 0,
    Single = 1,
    Idle = 2,
    PowerDown = 3,
}

/// ADC clock source (mode register bits 7:6).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClockSource {
    /// Internal 64 kHz clock, not driven on the CLK pin.
    #[default]
    Internal = 0,
    /// Internal 64 kHz clock, also driven on the CLK pin.
    InternalWithOutput = 1,
    External = 2,
    /// External clock divided by 2.
    ExternalDiv2 = 3,
}

/// Filter update rate (mode register bits 3:0). Code 0 is reserved.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rate {
    Hz470 = 1,
    Hz242 = 2,
    Hz123 = 3,
    Hz62 = 4,
    Hz50 = 5,
    Hz39 = 6,
    Hz33_2 = 7,
    /// 60 Hz rejection only.
    Hz19_6 = 8,
    /// 50 Hz rejection only.
    Hz16_7Reject50 = 9,
    /// Simultaneous 50 Hz and 60 Hz rejection.
    #[default]
    Hz16_7 = 10,
    Hz12_5 = 11,
    Hz10 = 12,
    Hz8_33 = 13,
    Hz6_25 = 14,
    Hz4_17 = 15,
}

impl Rate {
    pub const ALL: [Rate; 15] = [
        Rate::Hz470,
        Rate::Hz242,
        Rate::Hz123,
        Rate::Hz62,
        Rate::Hz50,
        Rate::Hz39,
        Rate::Hz33_2,
        Rate::Hz19_6,
        Rate::Hz16_7Reject50,
        Rate::Hz16_7,
        Rate::Hz12_5,
        Rate::Hz10,
        Rate::Hz8_33,
        Rate::Hz6_25,
        Rate::Hz4_17,
    ];

    /// Time the filter needs to settle at this update rate.
    pub fn settle_time_ms(self) -> u32 {
        match self {
            Rate::Hz470 => 4,
            Rate::Hz242 => 8,
            Rate::Hz123 => 16,
            Rate::Hz62 => 32,
            Rate::Hz50 => 40,
            Rate::Hz39 => 48,
            Rate::Hz33_2 => 60,
            Rate::Hz19_6 => 101,
            Rate::Hz16_7Reject50 => 120,
            Rate::Hz16_7 => 120,
            Rate::Hz12_5 => 160,
            Rate::Hz10 => 200,
            Rate::Hz8_33 => 240,
            Rate::Hz6_25 => 320,
            Rate::Hz4_17 => 480,
        }
    }

    /// Nominal output data rate.
    pub fn update_rate_hz(self) -> f32 {
        match self {
            Rate::Hz470 => 470.0,
            Rate::Hz242 => 242.0,
            Rate::Hz123 => 123.0,
            Rate::Hz62 => 62.0,
            Rate::Hz50 => 50.0,
            Rate::Hz39 => 39.0,
            Rate::Hz33_2 => 33.2,
            Rate::Hz19_6 => 19.6,
            Rate::Hz16_7Reject50 | Rate::Hz16_7 => 16.7,
            Rate::Hz12_5 => 12.5,
            Rate::Hz10 => 10.0,
            Rate::Hz8_33 => 8.33,
            Rate::Hz6_25 => 6.25,
            Rate::Hz4_17 => 4.17,
        }
    }
}

/// Input channel (configuration register bits 2:0).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Channel {
    /// AIN1(+) - AIN1(-)
    #[default]
    Ain1 = 0,
    /// AIN2(+) - AIN2(-)
    Ain2 = 1,
    /// AIN3(+) - AIN3(-)
    Ain3 = 2,
    /// AIN1(-) - AIN1(-), used for noise measurements
    Ain1Shorted = 3,
    TemperatureSensor = 6,
    /// AVDD / 6. Code 111 on the AD7793; some vendor headers list it as 4.
    AvddMonitor = 7,
}

/// PGA gain as a power-of-two index (configuration register bits 10:8).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Gain {
    #[default]
    X1 = 0,
    X2 = 1,
    X4 = 2,
    X8 = 3,
    X16 = 4,
    X32 = 5,
    X64 = 6,
    X128 = 7,
}

impl Gain {
    /// Power-of-two exponent `g` such that the multiplier is `2^g`.
    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn multiplier(self) -> u32 {
        1 << self.index()
    }
}

/// Coding of the conversion result (configuration register bit 12).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Polarity {
    /// Offset binary, zero input at mid-scale.
    #[default]
    Bipolar = 0,
    /// Straight binary, zero input at code zero.
    Unipolar = 1,
}

/// Bias voltage generator connection (configuration register bits 15:14).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BiasSelect {
    #[default]
    Disabled = 0,
    Ain1Negative = 1,
    Ain2Negative = 2,
}

/// Excitation current magnitude (IO register bits 1:0).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExcitationCurrent {
    #[default]
    Disabled = 0,
    Ua10 = 1,
    Ua210 = 2,
    Ma1 = 3,
}

/// Excitation current routing (IO register bits 3:2).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExcitationDirection {
    /// IEXC1 to IOUT1, IEXC2 to IOUT2
    #[default]
    Direct = 0,
    /// IEXC1 to IOUT2, IEXC2 to IOUT1
    Swapped = 1,
    /// Both sources to IOUT1
    BothToIout1 = 2,
    /// Both sources to IOUT2
    BothToIout2 = 3,
}

/// Reference source (configuration register bit 7).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReferenceSelect {
    #[default]
    External = 0,
    Internal = 1,
}

field_value!(Mode, MODE_SELECT);
field_value!(ClockSource, MODE_CLOCK);
field_value!(Rate, MODE_RATE);
field_value!(Channel, CONF_CHANNEL);
field_value!(Gain, CONF_GAIN);
field_value!(Polarity, CONF_UNIPOLAR);
field_value!(BiasSelect, CONF_BIAS);
field_value!(ExcitationCurrent, IO_EXC_CURRENT);
field_value!(ExcitationDirection, IO_EXC_DIRECTION);
field_value!(ReferenceSelect, CONF_REFSEL);

/// Decoded status register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// A conversion result is waiting in the data register.
    pub ready: bool,
    /// The last result was clamped (overrange or underrange).
    pub error: bool,
    /// Channel the result belongs to (raw CH2:CH0 bits).
    pub channel: u8,
}

impl From<u8> for Status {
    fn from(raw: u8) -> Self {
        Self {
            ready: raw & STAT_RDY == 0,
            error: raw & STAT_ERR != 0,
            channel: raw & STAT_CHANNEL_MASK,
        }
    }
}

/// Identity state of the device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    /// `init` has not run yet.
    Unverified,
    /// The chip answered with the expected ID.
    Verified,
    /// The chip answered with this ID register value instead.
    IdentityMismatch(u8),
}

/// Phase of the most recent single conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionState {
    Idle,
    ModeSet,
    Polling,
    Ready,
    DataRead,
    Scaled,
    TimedOut,
}

/// Errors that can occur in the AD7793 driver
#[derive(Error, Debug)]
pub enum DriverError {
    /// The transport failed; the underlying error is passed through untouched.
    #[error("SPI bus fault: {0}")]
    Bus(#[source] io::Error),
    /// The ID register did not carry the AD7793 identifier.
    #[error("Unexpected chip ID 0x{found:02X}, expected 0xB in the low nibble")]
    IdentityMismatch { found: u8 },
    /// The status register never reported ready within the poll budget.
    #[error("Conversion timed out after {elapsed_ms} ms (budget {budget_ms} ms)")]
    ConversionTimeout { budget_ms: u64, elapsed_ms: u64 },
    /// Register transfers are 1, 2 or 3 bytes wide.
    #[error("Invalid register size: {0} bytes")]
    InvalidRegisterSize(usize),
    /// The device failed identity verification and must be re-initialized.
    #[error("Device identity not verified")]
    NotVerified,
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

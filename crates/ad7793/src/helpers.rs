//! Helper functions for the AD7793 driver.

use log::trace;

use crate::types::{Gain, Polarity, Rate};

/// Resolution of the data register.
pub const DATA_BITS: u32 = 24;

/// Reference voltage of the on-chip bandgap, in millivolts.
pub const INTERNAL_REFERENCE_MV: f32 = 1170.0;

/// Assemble big-endian register bytes (MSB first) into a zero-extended value.
pub fn be_bytes_to_u32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32)
}

/// Split `value` into `out.len()` big-endian bytes. Bits above the buffer width are dropped.
pub fn u32_to_be_bytes(value: u32, out: &mut [u8]) {
    let len = out.len();
    for (i, byte) in out.iter_mut().enumerate() {
        let shift = 8 * (len - 1 - i);
        *byte = (value >> shift) as u8;
    }
}

/// Convert a raw conversion code to a voltage in the unit of `vref` (millivolts).
///
/// Unipolar: `raw * vref / (2^bits * 2^g)`
/// Bipolar:  `(raw - 2^(bits-1)) * vref / (2^(bits-1) * 2^g)`
pub fn raw_to_voltage(raw: u32, gain: Gain, polarity: Polarity, vref: f32, bits: u32) -> f32 {
    let gain_factor = 2f64.powi(gain.index() as i32);
    let raw = raw as f64;
    let vref = vref as f64;

    let voltage = match polarity {
        Polarity::Unipolar => {
            let full_scale = 2f64.powi(bits as i32);
            raw * vref / (full_scale * gain_factor)
        }
        Polarity::Bipolar => {
            let half_scale = 2f64.powi(bits as i32 - 1);
            (raw - half_scale) * vref / (half_scale * gain_factor)
        }
    };

    trace!(
        "raw_to_voltage: raw={}, gain={:?}, polarity={:?}, vref={}, voltage={}",
        raw, gain, polarity, vref, voltage
    );
    voltage as f32
}

/// Upper bound on how long to wait for a conversion at `rate`: 1.5 times the settle time.
pub fn poll_budget_ms(rate: Rate) -> u64 {
    (1.5 * rate.settle_time_ms() as f64) as u64
}

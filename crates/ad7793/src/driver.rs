//! Main driver implementation for the AD7793 chip.

use std::io;

use log::{debug, error, info, trace, warn};

use crate::config::AdcConfig;
use crate::hal::SpiTransport;
use crate::helpers::{
    be_bytes_to_u32, poll_budget_ms, raw_to_voltage, u32_to_be_bytes, DATA_BITS,
    INTERNAL_REFERENCE_MV,
};
use crate::registers::{
    command_byte, Field, FieldValue, Register, CHIP_ID, CHIP_ID_MASK, CONF_BOOST, CONF_BUFFER,
    CONF_BURNOUT, RESET_SEQUENCE,
};
use crate::types::{
    BiasSelect, Channel, ClockSource, ConversionState, DriverError, DriverStatus,
    ExcitationCurrent, ExcitationDirection, Gain, Mode, Polarity, Rate, ReferenceSelect, Status,
};

const MAX_REGISTER_BYTES: usize = 3;

/// AD7793 driver bound to one transport.
///
/// Every configuration field below mirrors the chip. Mirrors change only after
/// the register write that carries them succeeds.
pub struct Ad7793Driver<T: SpiTransport> {
    transport: T,
    status: DriverStatus,
    conversion_state: ConversionState,

    mode: Mode,
    clock: ClockSource,
    rate: Rate,
    channel: Channel,
    gain: Gain,
    polarity: Polarity,
    bias: BiasSelect,
    excitation_current: ExcitationCurrent,
    excitation_direction: ExcitationDirection,
    reference: ReferenceSelect,
    buffered: bool,
    burnout: bool,
    boost: bool,

    reference_voltage_mv: f32,
    last_raw_code: u32,
    last_voltage_mv: f32,
}

impl<T: SpiTransport> Ad7793Driver<T> {
    /// Bind a driver to `transport`. `external_reference_mv` is the voltage on
    /// REFIN, used while the external reference is selected.
    ///
    /// Nothing is sent to the chip; call [`init`](Self::init) and
    /// [`reset`](Self::reset) to bring chip and mirrors in line.
    pub fn new(transport: T, external_reference_mv: f32) -> Result<Self, DriverError> {
        validate_reference(external_reference_mv)?;

        Ok(Ad7793Driver {
            transport,
            status: DriverStatus::Unverified,
            conversion_state: ConversionState::Idle,
            mode: Mode::default(),
            clock: ClockSource::default(),
            rate: Rate::default(),
            channel: Channel::default(),
            gain: Gain::default(),
            polarity: Polarity::default(),
            bias: BiasSelect::default(),
            excitation_current: ExcitationCurrent::default(),
            excitation_direction: ExcitationDirection::default(),
            reference: ReferenceSelect::default(),
            buffered: true,
            burnout: false,
            boost: false,
            reference_voltage_mv: external_reference_mv,
            last_raw_code: 0,
            last_voltage_mv: 0.0,
        })
    }

    /// Verify the chip identity from the ID register.
    pub fn init(&mut self) -> Result<(), DriverError> {
        let id = self.read_register(Register::Id, Register::Id.size())? as u8;

        if id & CHIP_ID_MASK != CHIP_ID {
            error!("AD7793 identity check failed: ID register 0x{:02X}", id);
            self.status = DriverStatus::IdentityMismatch(id);
            return Err(DriverError::IdentityMismatch { found: id });
        }

        info!("AD7793 detected (ID register 0x{:02X})", id);
        self.status = DriverStatus::Verified;
        Ok(())
    }

    /// Reset the serial interface and force the default configuration:
    /// continuous mode, internal clock, 16.7 Hz (50/60 Hz rejection), bipolar,
    /// gain x1, channel AIN1, external reference, buffered, excitation off.
    pub fn reset(&mut self) -> Result<(), DriverError> {
        self.ensure_usable()?;

        let mut discard = [0u8; RESET_SEQUENCE.len()];
        self.transaction(|spi| spi.exchange(&RESET_SEQUENCE, &mut discard))?;

        let mode_reg = [
            Mode::Continuous.bits_in_place(),
            ClockSource::Internal.bits_in_place(),
            Rate::Hz16_7.bits_in_place(),
        ]
        .iter()
        .fold(0, |acc, bits| acc | bits);
        let conf_reg = [
            BiasSelect::Disabled.bits_in_place(),
            Polarity::Bipolar.bits_in_place(),
            Gain::X1.bits_in_place(),
            ReferenceSelect::External.bits_in_place(),
            Channel::Ain1.bits_in_place(),
        ]
        .iter()
        .fold(CONF_BUFFER.insert(0, 1), |acc, bits| acc | bits);
        let io_reg = ExcitationDirection::Direct.bits_in_place()
            | ExcitationCurrent::Disabled.bits_in_place();

        self.write_register(Register::Mode, mode_reg, Register::Mode.size())?;
        self.write_register(Register::Configuration, conf_reg, Register::Configuration.size())?;
        self.write_register(Register::Io, io_reg, Register::Io.size())?;

        self.mode = Mode::Continuous;
        self.clock = ClockSource::Internal;
        self.rate = Rate::Hz16_7;
        self.bias = BiasSelect::Disabled;
        self.burnout = false;
        self.polarity = Polarity::Bipolar;
        self.boost = false;
        self.gain = Gain::X1;
        self.reference = ReferenceSelect::External;
        self.buffered = true;
        self.channel = Channel::Ain1;
        self.excitation_direction = ExcitationDirection::Direct;
        self.excitation_current = ExcitationCurrent::Disabled;

        info!(
            "AD7793 reset: mode=0x{:04X} conf=0x{:04X} io=0x{:02X}",
            mode_reg, conf_reg, io_reg
        );
        Ok(())
    }

    /// Read `size` bytes (1 to 3) from `register`, MSB first, zero-extended.
    pub fn read_register(&mut self, register: Register, size: usize) -> Result<u32, DriverError> {
        check_size(size)?;

        let command = [command_byte(register, true)];
        let dummy = [0u8; MAX_REGISTER_BYTES];
        let mut data = [0u8; MAX_REGISTER_BYTES];
        let rx = &mut data[..size];

        self.transaction(|spi| {
            let mut discard = [0u8; 1];
            spi.exchange(&command, &mut discard)?;
            spi.exchange(&dummy[..size], rx)
        })?;

        let value = be_bytes_to_u32(&data[..size]);
        trace!("read {:?} ({} bytes): 0x{:06X}", register, size, value);
        Ok(value)
    }

    /// Write the low `size` bytes (1 to 3) of `value` to `register`, MSB first.
    /// Higher bits are dropped, as the chip itself would.
    pub fn write_register(
        &mut self,
        register: Register,
        value: u32,
        size: usize,
    ) -> Result<(), DriverError> {
        check_size(size)?;

        let mut frame = [0u8; 1 + MAX_REGISTER_BYTES];
        frame[0] = command_byte(register, false);
        u32_to_be_bytes(value, &mut frame[1..=size]);
        let mut discard = [0u8; 1 + MAX_REGISTER_BYTES];

        // Command and payload go out in one exchange, CS held low throughout
        self.transaction(|spi| spi.exchange(&frame[..=size], &mut discard[..=size]))?;

        trace!("wrote {:?} ({} bytes): {:02X?}", register, size, &frame[1..=size]);
        Ok(())
    }

    /// Read and decode the status register.
    pub fn status(&mut self) -> Result<Status, DriverError> {
        let raw = self.read_register(Register::Status, Register::Status.size())?;
        Ok(Status::from(raw as u8))
    }

    /// True once a conversion result is waiting (RDY low).
    pub fn ready(&mut self) -> Result<bool, DriverError> {
        Ok(self.status()?.ready)
    }

    pub fn set_mode(&mut self, mode: Mode) -> Result<(), DriverError> {
        self.set_field(mode)?;
        self.mode = mode;
        Ok(())
    }

    pub fn set_clock_source(&mut self, clock: ClockSource) -> Result<(), DriverError> {
        self.set_field(clock)?;
        self.clock = clock;
        Ok(())
    }

    pub fn set_rate(&mut self, rate: Rate) -> Result<(), DriverError> {
        self.set_field(rate)?;
        self.rate = rate;
        Ok(())
    }

    pub fn set_channel(&mut self, channel: Channel) -> Result<(), DriverError> {
        self.set_field(channel)?;
        self.channel = channel;
        Ok(())
    }

    pub fn set_gain(&mut self, gain: Gain) -> Result<(), DriverError> {
        self.set_field(gain)?;
        self.gain = gain;
        Ok(())
    }

    pub fn set_polarity(&mut self, polarity: Polarity) -> Result<(), DriverError> {
        self.set_field(polarity)?;
        self.polarity = polarity;
        Ok(())
    }

    pub fn set_bias_voltage(&mut self, bias: BiasSelect) -> Result<(), DriverError> {
        self.set_field(bias)?;
        self.bias = bias;
        Ok(())
    }

    pub fn set_excitation_current(
        &mut self,
        current: ExcitationCurrent,
    ) -> Result<(), DriverError> {
        self.set_field(current)?;
        self.excitation_current = current;
        Ok(())
    }

    pub fn set_excitation_direction(
        &mut self,
        direction: ExcitationDirection,
    ) -> Result<(), DriverError> {
        self.set_field(direction)?;
        self.excitation_direction = direction;
        Ok(())
    }

    /// Select the reference source.
    ///
    /// Choosing the internal reference sets the reference voltage to 1170 mV
    /// whether or not the register write goes through, even on a device that
    /// failed its identity check. Choosing the external reference leaves the
    /// reference voltage as it was.
    pub fn set_reference(&mut self, reference: ReferenceSelect) -> Result<(), DriverError> {
        if reference == ReferenceSelect::Internal {
            self.reference_voltage_mv = INTERNAL_REFERENCE_MV;
        }
        self.set_field(reference)?;
        self.reference = reference;
        Ok(())
    }

    /// Enable the analog input buffer.
    pub fn set_buffered(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.set_flag(CONF_BUFFER, enabled)?;
        self.buffered = enabled;
        Ok(())
    }

    /// Enable the 100 nA burnout current sources on the selected input.
    pub fn set_burnout_current(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.set_flag(CONF_BURNOUT, enabled)?;
        self.burnout = enabled;
        Ok(())
    }

    /// Raise the bias voltage generator current.
    pub fn set_boost(&mut self, enabled: bool) -> Result<(), DriverError> {
        self.set_flag(CONF_BOOST, enabled)?;
        self.boost = enabled;
        Ok(())
    }

    /// Voltage on REFIN in millivolts, used while the external reference is selected.
    pub fn set_external_reference_mv(&mut self, millivolts: f32) -> Result<(), DriverError> {
        validate_reference(millivolts)?;
        if self.reference == ReferenceSelect::Internal {
            debug!("External reference stored while the internal reference is selected");
        }
        self.reference_voltage_mv = millivolts;
        Ok(())
    }

    /// Zero-scale calibration coefficient (24-bit).
    pub fn offset(&mut self) -> Result<u32, DriverError> {
        self.read_register(Register::Offset, Register::Offset.size())
    }

    pub fn set_offset(&mut self, value: u32) -> Result<(), DriverError> {
        self.ensure_usable()?;
        self.write_register(Register::Offset, value, Register::Offset.size())
    }

    /// Full-scale calibration coefficient (24-bit).
    pub fn full_scale(&mut self) -> Result<u32, DriverError> {
        self.read_register(Register::FullScale, Register::FullScale.size())
    }

    pub fn set_full_scale(&mut self, value: u32) -> Result<(), DriverError> {
        self.ensure_usable()?;
        self.write_register(Register::FullScale, value, Register::FullScale.size())
    }

    /// Apply every setting in `config`, one read-modify-write per field.
    pub fn apply_config(&mut self, config: &AdcConfig) -> Result<(), DriverError> {
        self.set_external_reference_mv(config.external_reference_mv)?;

        self.set_clock_source(config.clock)?;
        self.set_rate(config.rate)?;

        self.set_bias_voltage(config.bias)?;
        self.set_burnout_current(config.burnout_current)?;
        self.set_polarity(config.polarity)?;
        self.set_boost(config.boost)?;
        self.set_gain(config.gain)?;
        self.set_reference(config.reference)?;
        self.set_buffered(config.buffered)?;
        self.set_channel(config.channel)?;

        self.set_excitation_direction(config.excitation_direction)?;
        self.set_excitation_current(config.excitation_current)?;

        info!("AD7793 configured: {:?}", config);
        Ok(())
    }

    /// Run one single-shot conversion and return the scaled voltage in millivolts.
    ///
    /// Polls the status register until RDY drops or 1.5 settle times of the
    /// current rate have elapsed on the transport clock. On failure the last
    /// raw code and voltage keep their previous values.
    pub fn single_conversion(&mut self) -> Result<f32, DriverError> {
        self.ensure_usable()?;

        let result = self.run_single_conversion();
        if let Err(e) = &result {
            self.conversion_state = match e {
                DriverError::ConversionTimeout { .. } => ConversionState::TimedOut,
                _ => ConversionState::Idle,
            };
        }
        result
    }

    fn run_single_conversion(&mut self) -> Result<f32, DriverError> {
        self.conversion_state = ConversionState::ModeSet;
        self.set_mode(Mode::Single)?;

        self.conversion_state = ConversionState::Polling;
        let budget_ms = poll_budget_ms(self.rate);
        let start = self.transport.now_ms();
        loop {
            let status = self.status()?;
            if status.ready {
                if status.error {
                    warn!("AD7793 flagged the conversion as overrange/underrange");
                }
                break;
            }
            let elapsed_ms = self.transport.now_ms().wrapping_sub(start);
            if elapsed_ms > budget_ms {
                warn!(
                    "AD7793 conversion not ready after {} ms (budget {} ms at {:?})",
                    elapsed_ms, budget_ms, self.rate
                );
                return Err(DriverError::ConversionTimeout { budget_ms, elapsed_ms });
            }
        }
        self.conversion_state = ConversionState::Ready;

        let raw = self.read_register(Register::Data, Register::Data.size())?;
        self.conversion_state = ConversionState::DataRead;

        let voltage = raw_to_voltage(
            raw,
            self.gain,
            self.polarity,
            self.reference_voltage_mv,
            DATA_BITS,
        );
        self.last_raw_code = raw;
        self.last_voltage_mv = voltage;
        self.conversion_state = ConversionState::Scaled;

        debug!("AD7793 conversion: raw=0x{:06X} voltage={} mV", raw, voltage);
        Ok(voltage)
    }

    /// Convert the last raw code again with the current gain, polarity and reference.
    pub fn raw_to_voltage(&self) -> f32 {
        raw_to_voltage(
            self.last_raw_code,
            self.gain,
            self.polarity,
            self.reference_voltage_mv,
            DATA_BITS,
        )
    }

    pub fn driver_status(&self) -> DriverStatus {
        self.status
    }

    pub fn conversion_state(&self) -> ConversionState {
        self.conversion_state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn clock_source(&self) -> ClockSource {
        self.clock
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn gain(&self) -> Gain {
        self.gain
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    pub fn bias_voltage(&self) -> BiasSelect {
        self.bias
    }

    pub fn excitation_current(&self) -> ExcitationCurrent {
        self.excitation_current
    }

    pub fn excitation_direction(&self) -> ExcitationDirection {
        self.excitation_direction
    }

    pub fn reference(&self) -> ReferenceSelect {
        self.reference
    }

    pub fn buffered(&self) -> bool {
        self.buffered
    }

    pub fn burnout_current(&self) -> bool {
        self.burnout
    }

    pub fn boost(&self) -> bool {
        self.boost
    }

    pub fn reference_voltage_mv(&self) -> f32 {
        self.reference_voltage_mv
    }

    /// Raw code of the last successful conversion.
    pub fn last_raw_code(&self) -> u32 {
        self.last_raw_code
    }

    /// Voltage of the last successful conversion, in millivolts.
    pub fn last_voltage_mv(&self) -> f32 {
        self.last_voltage_mv
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give the transport back.
    pub fn release(self) -> T {
        self.transport
    }

    /// Run `f` with chip select asserted. CS is released even when `f` fails.
    fn transaction<F>(&mut self, f: F) -> Result<(), DriverError>
    where
        F: FnOnce(&mut T) -> Result<(), io::Error>,
    {
        self.transport.select();
        let result = f(&mut self.transport);
        self.transport.deselect();
        result.map_err(DriverError::Bus)
    }

    fn ensure_usable(&self) -> Result<(), DriverError> {
        match self.status {
            DriverStatus::IdentityMismatch(_) => Err(DriverError::NotVerified),
            _ => Ok(()),
        }
    }

    fn set_field<V: FieldValue + std::fmt::Debug>(&mut self, value: V) -> Result<(), DriverError> {
        self.ensure_usable()?;
        self.update_field(V::FIELD, value.bits())?;
        debug!("{:?} set to {:?}", V::FIELD.register, value);
        Ok(())
    }

    fn set_flag(&mut self, field: Field, enabled: bool) -> Result<(), DriverError> {
        self.ensure_usable()?;
        self.update_field(field, enabled as u32)?;
        debug!("{:?} bit {} set to {}", field.register, field.offset, enabled);
        Ok(())
    }

    /// Read the owning register, replace only `field`'s bits, write it back.
    fn update_field(&mut self, field: Field, bits: u32) -> Result<(), DriverError> {
        let size = field.register.size();
        let current = self.read_register(field.register, size)?;
        let updated = field.insert(current, bits);
        self.write_register(field.register, updated, size)
    }
}

/// Field bits shifted into register position.
trait InPlace {
    fn bits_in_place(self) -> u32;
}

impl<V: FieldValue> InPlace for V {
    fn bits_in_place(self) -> u32 {
        V::FIELD.insert(0, self.bits())
    }
}

fn check_size(size: usize) -> Result<(), DriverError> {
    if (1..=MAX_REGISTER_BYTES).contains(&size) {
        Ok(())
    } else {
        Err(DriverError::InvalidRegisterSize(size))
    }
}

fn validate_reference(millivolts: f32) -> Result<(), DriverError> {
    if millivolts.is_finite() && millivolts > 0.0 {
        Ok(())
    } else {
        Err(DriverError::ConfigurationError(format!(
            "Reference voltage must be a positive number of millivolts, got {}",
            millivolts
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_hal::MockAd7793;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::fmt::Debug;

    type MockDriver = Ad7793Driver<MockAd7793>;
    type FlagSetter = fn(&mut MockDriver, bool) -> Result<(), DriverError>;
    type FlagGetter = fn(&MockDriver) -> bool;

    fn driver() -> MockDriver {
        Ad7793Driver::new(MockAd7793::new(), 2500.0).unwrap()
    }

    fn width_mask(size: usize) -> u32 {
        (1u32 << (8 * size)) - 1
    }

    fn last_frame(adc: &MockDriver) -> Vec<u8> {
        adc.transport().transactions().last().unwrap().sent.clone()
    }

    #[test]
    fn test_read_register_framing() {
        let mut adc = driver();
        assert_eq!(adc.read_register(Register::Id, 1).unwrap(), 0x4B);
        // Command byte, then one dummy byte clocked in the same CS window
        assert_eq!(last_frame(&adc), vec![0x60, 0x00]);

        assert_eq!(adc.read_register(Register::Configuration, 2).unwrap(), 0x0710);
        assert_eq!(last_frame(&adc), vec![0x50, 0x00, 0x00]);
        assert!(!adc.transport().is_selected());
    }

    #[test]
    fn test_write_register_framing() {
        let mut adc = driver();
        adc.write_register(Register::Mode, 0x200A, 2).unwrap();
        assert_eq!(last_frame(&adc), vec![0x08, 0x20, 0x0A]);

        adc.write_register(Register::Offset, 0x123456, 3).unwrap();
        assert_eq!(last_frame(&adc), vec![0x30, 0x12, 0x34, 0x56]);

        adc.write_register(Register::Io, 0x0C, 1).unwrap();
        assert_eq!(last_frame(&adc), vec![0x28, 0x0C]);
        assert_eq!(adc.transport().register(Register::Io), 0x0C);
    }

    #[test]
    fn test_write_read_round_trip_truncates() {
        let mut rng = StdRng::seed_from_u64(7793);
        let mut adc = driver();
        for _ in 0..100 {
            for register in [
                Register::Mode,
                Register::Configuration,
                Register::Io,
                Register::Offset,
                Register::FullScale,
            ] {
                let size = register.size();
                let value: u32 = rng.gen();
                adc.write_register(register, value, size).unwrap();
                assert_eq!(adc.read_register(register, size).unwrap(), value & width_mask(size));
            }
        }
    }

    #[test]
    fn test_invalid_register_size() {
        let mut adc = driver();
        assert!(matches!(
            adc.read_register(Register::Data, 0),
            Err(DriverError::InvalidRegisterSize(0))
        ));
        assert!(matches!(
            adc.write_register(Register::Offset, 1, 4),
            Err(DriverError::InvalidRegisterSize(4))
        ));
        assert!(adc.transport().transactions().is_empty());
    }

    #[test]
    fn test_init_identity() {
        let mut adc = driver();
        assert_eq!(adc.driver_status(), DriverStatus::Unverified);
        adc.init().unwrap();
        assert_eq!(adc.driver_status(), DriverStatus::Verified);

        // Only the low nibble is compared
        adc.transport_mut().set_register(Register::Id, 0xFB);
        adc.init().unwrap();

        adc.transport_mut().set_register(Register::Id, 0x4A);
        assert!(matches!(adc.init(), Err(DriverError::IdentityMismatch { found: 0x4A })));
        assert_eq!(adc.driver_status(), DriverStatus::IdentityMismatch(0x4A));
    }

    #[test]
    fn test_identity_mismatch_blocks_until_reverified() {
        let mut adc = driver();
        adc.transport_mut().set_register(Register::Id, 0x00);
        assert!(adc.init().is_err());

        assert!(matches!(adc.set_gain(Gain::X4), Err(DriverError::NotVerified)));
        assert!(matches!(adc.single_conversion(), Err(DriverError::NotVerified)));
        assert_eq!(adc.gain(), Gain::X1);

        // Raw access stays available for diagnostics
        assert_eq!(adc.read_register(Register::Id, 1).unwrap(), 0x00);

        adc.transport_mut().set_register(Register::Id, 0x4B);
        adc.init().unwrap();
        adc.set_gain(Gain::X4).unwrap();
        assert_eq!(adc.gain(), Gain::X4);
    }

    #[test]
    fn test_reset_refused_after_identity_mismatch() {
        let mut adc = driver();
        adc.transport_mut().set_register(Register::Id, 0x00);
        assert!(adc.init().is_err());
        adc.transport_mut().set_register(Register::Configuration, 0x1234);
        adc.transport_mut().clear_transactions();

        assert!(matches!(adc.reset(), Err(DriverError::NotVerified)));

        let mock = adc.transport();
        assert!(mock.transactions().is_empty());
        assert_eq!(mock.resets(), 0);
        assert_eq!(mock.register(Register::Configuration), 0x1234);
    }

    #[test]
    fn test_internal_reference_overrides_voltage_on_unverified_chip() {
        let mut adc = Ad7793Driver::new(MockAd7793::new(), 3300.0).unwrap();
        adc.transport_mut().set_register(Register::Id, 0x5A);
        assert!(adc.init().is_err());
        adc.transport_mut().clear_transactions();

        let result = adc.set_reference(ReferenceSelect::Internal);

        assert!(matches!(result, Err(DriverError::NotVerified)));
        assert_eq!(adc.reference_voltage_mv(), 1170.0);
        assert_eq!(adc.reference(), ReferenceSelect::External);
        assert!(adc.transport().transactions().is_empty());
    }

    #[test]
    fn test_reset_forces_defaults() {
        let mut adc = driver();
        adc.transport_mut().set_register(Register::Mode, 0xFFFF);
        adc.transport_mut().set_register(Register::Configuration, 0xFFFF);
        adc.transport_mut().set_register(Register::Io, 0xFF);
        adc.set_gain(Gain::X64).unwrap();
        adc.set_polarity(Polarity::Unipolar).unwrap();
        adc.transport_mut().clear_transactions();

        adc.reset().unwrap();

        let mock = adc.transport();
        assert_eq!(mock.resets(), 1);
        assert_eq!(mock.transactions()[0].sent, vec![0xFF; 4]);
        assert_eq!(mock.transactions()[1].sent, vec![0x08, 0x00, 0x0A]);
        assert_eq!(mock.transactions()[2].sent, vec![0x10, 0x00, 0x10]);
        assert_eq!(mock.transactions()[3].sent, vec![0x28, 0x00]);
        assert_eq!(mock.register(Register::Mode), 0x000A);
        assert_eq!(mock.register(Register::Configuration), 0x0010);
        assert_eq!(mock.register(Register::Io), 0x00);

        assert_eq!(adc.mode(), Mode::Continuous);
        assert_eq!(adc.gain(), Gain::X1);
        assert_eq!(adc.channel(), Channel::Ain1);
        assert_eq!(adc.polarity(), Polarity::Bipolar);
        assert_eq!(adc.rate(), Rate::Hz16_7);
        assert!(adc.buffered());
    }

    fn check_field_isolation<V: FieldValue + Debug>(
        values: &[V],
        set: fn(&mut MockDriver, V) -> Result<(), DriverError>,
        mirror: fn(&MockDriver) -> V,
    ) where
        V: PartialEq,
    {
        let mut rng = StdRng::seed_from_u64(0xAD77_93);
        let mut adc = driver();
        let field = V::FIELD;
        let size = field.register.size();

        for _ in 0..64 {
            let before = rng.gen::<u32>() & width_mask(size);
            adc.transport_mut().set_register(field.register, before);
            let value = values[rng.gen_range(0..values.len())];

            set(&mut adc, value).unwrap();

            let after = adc.transport().register(field.register);
            assert_eq!(
                after & !field.mask(),
                before & !field.mask(),
                "{:?} disturbed other bits: 0x{:04X} -> 0x{:04X}",
                value,
                before,
                after
            );
            assert_eq!(field.extract(after), value.bits());
            assert_eq!(mirror(&adc), value);
        }
    }

    #[test]
    fn test_setters_only_touch_their_field() {
        check_field_isolation(
            &[Mode::Continuous, Mode::Single, Mode::Idle, Mode::PowerDown],
            MockDriver::set_mode,
            MockDriver::mode,
        );
        check_field_isolation(
            &[
                ClockSource::Internal,
                ClockSource::InternalWithOutput,
                ClockSource::External,
                ClockSource::ExternalDiv2,
            ],
            MockDriver::set_clock_source,
            MockDriver::clock_source,
        );
        check_field_isolation(&Rate::ALL, MockDriver::set_rate, MockDriver::rate);
        check_field_isolation(
            &[
                Channel::Ain1,
                Channel::Ain2,
                Channel::Ain3,
                Channel::Ain1Shorted,
                Channel::TemperatureSensor,
                Channel::AvddMonitor,
            ],
            MockDriver::set_channel,
            MockDriver::channel,
        );
        check_field_isolation(
            &[Gain::X1, Gain::X2, Gain::X4, Gain::X8, Gain::X16, Gain::X32, Gain::X64, Gain::X128],
            MockDriver::set_gain,
            MockDriver::gain,
        );
        check_field_isolation(
            &[Polarity::Bipolar, Polarity::Unipolar],
            MockDriver::set_polarity,
            MockDriver::polarity,
        );
        check_field_isolation(
            &[BiasSelect::Disabled, BiasSelect::Ain1Negative, BiasSelect::Ain2Negative],
            MockDriver::set_bias_voltage,
            MockDriver::bias_voltage,
        );
        check_field_isolation(
            &[
                ExcitationCurrent::Disabled,
                ExcitationCurrent::Ua10,
                ExcitationCurrent::Ua210,
                ExcitationCurrent::Ma1,
            ],
            MockDriver::set_excitation_current,
            MockDriver::excitation_current,
        );
        check_field_isolation(
            &[
                ExcitationDirection::Direct,
                ExcitationDirection::Swapped,
                ExcitationDirection::BothToIout1,
                ExcitationDirection::BothToIout2,
            ],
            MockDriver::set_excitation_direction,
            MockDriver::excitation_direction,
        );
        check_field_isolation(
            &[ReferenceSelect::External, ReferenceSelect::Internal],
            MockDriver::set_reference,
            MockDriver::reference,
        );
    }

    #[test]
    fn test_flag_setters_only_touch_their_bit() {
        let cases: [(Field, FlagSetter, FlagGetter); 3] = [
            (CONF_BUFFER, MockDriver::set_buffered, MockDriver::buffered),
            (CONF_BURNOUT, MockDriver::set_burnout_current, MockDriver::burnout_current),
            (CONF_BOOST, MockDriver::set_boost, MockDriver::boost),
        ];
        let mut rng = StdRng::seed_from_u64(42);
        let mut adc = driver();

        for (field, set, mirror) in cases {
            for _ in 0..32 {
                let before = rng.gen::<u32>() & 0xFFFF;
                adc.transport_mut().set_register(Register::Configuration, before);
                let enabled: bool = rng.gen();

                set(&mut adc, enabled).unwrap();

                let after = adc.transport().register(Register::Configuration);
                assert_eq!(after & !field.mask(), before & !field.mask());
                assert_eq!(field.extract(after), enabled as u32);
                assert_eq!(mirror(&adc), enabled);
            }
        }
    }

    #[test]
    fn test_internal_reference_overrides_voltage() {
        let mut adc = Ad7793Driver::new(MockAd7793::new(), 3300.0).unwrap();
        assert_eq!(adc.reference_voltage_mv(), 3300.0);

        adc.set_reference(ReferenceSelect::Internal).unwrap();
        assert_eq!(adc.reference_voltage_mv(), 1170.0);

        // Selecting the external reference does not restore anything
        adc.set_reference(ReferenceSelect::External).unwrap();
        assert_eq!(adc.reference_voltage_mv(), 1170.0);

        adc.set_external_reference_mv(2048.0).unwrap();
        assert_eq!(adc.reference_voltage_mv(), 2048.0);

        // The override happens even when the bus fails
        adc.transport_mut().fail_next_exchanges(1);
        assert!(matches!(adc.set_reference(ReferenceSelect::Internal), Err(DriverError::Bus(_))));
        assert_eq!(adc.reference_voltage_mv(), 1170.0);
        assert_eq!(adc.reference(), ReferenceSelect::External);
    }

    #[test]
    fn test_reference_voltage_must_be_positive() {
        assert!(matches!(
            Ad7793Driver::new(MockAd7793::new(), 0.0),
            Err(DriverError::ConfigurationError(_))
        ));
        let mut adc = driver();
        assert!(adc.set_external_reference_mv(f32::NAN).is_err());
        assert_eq!(adc.reference_voltage_mv(), 2500.0);
    }

    #[test]
    fn test_failed_write_keeps_mirror() {
        let mut adc = driver();
        let conf_before = adc.transport().register(Register::Configuration);

        // Read (command + data) succeeds, the write-back fails
        adc.transport_mut().fail_exchanges_after(2, 1);
        let err = adc.set_gain(Gain::X8).unwrap_err();
        match err {
            DriverError::Bus(e) => {
                assert_eq!(e.kind(), io::ErrorKind::Other);
                assert_eq!(e.to_string(), "injected bus fault");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert_eq!(adc.gain(), Gain::X1);
        assert_eq!(adc.transport().register(Register::Configuration), conf_before);
        assert!(!adc.transport().is_selected(), "chip select must be released on failure");
    }

    #[test]
    fn test_failed_read_aborts_update() {
        let mut adc = driver();
        adc.transport_mut().fail_next_exchanges(1);
        assert!(adc.set_rate(Rate::Hz470).is_err());
        assert_eq!(adc.rate(), Rate::Hz16_7);
        assert_eq!(adc.transport().register(Register::Mode), 0x000A);
        assert!(!adc.transport().is_selected());
    }

    #[test]
    fn test_single_conversion_success() {
        let mut adc = driver();
        adc.transport_mut().set_ready_after_ms(Some(20));
        adc.transport_mut().set_conversion_result(1 << 23);
        adc.reset().unwrap();

        let mv = adc.single_conversion().unwrap();
        assert_eq!(mv, 0.0);
        assert_eq!(adc.last_raw_code(), 1 << 23);
        assert_eq!(adc.last_voltage_mv(), 0.0);
        assert_eq!(adc.mode(), Mode::Single);
        assert_eq!(adc.conversion_state(), ConversionState::Scaled);

        // The data register was read as three bytes
        assert_eq!(last_frame(&adc), vec![0x58, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_single_conversion_timeout() {
        let mut adc = driver();
        adc.reset().unwrap();

        let budget = poll_budget_ms(adc.rate());
        match adc.single_conversion() {
            Err(DriverError::ConversionTimeout { budget_ms, elapsed_ms }) => {
                assert_eq!(budget_ms, budget);
                assert!(elapsed_ms > budget_ms);
                // One status poll is two exchanges of one tick each
                assert!(elapsed_ms <= budget_ms + 2, "elapsed {}", elapsed_ms);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(adc.conversion_state(), ConversionState::TimedOut);
        assert_eq!(adc.last_raw_code(), 0);
        assert_eq!(adc.last_voltage_mv(), 0.0);
    }

    #[test]
    fn test_timeout_overshoot_bounded_by_one_poll() {
        let mut adc = Ad7793Driver::new(MockAd7793::new().with_tick_ms(7), 2500.0).unwrap();

        match adc.single_conversion() {
            Err(DriverError::ConversionTimeout { budget_ms, elapsed_ms }) => {
                assert_eq!(budget_ms, 90);
                assert!(elapsed_ms > budget_ms);
                // One status poll is two 7 ms exchanges
                assert!(elapsed_ms <= budget_ms + 14, "elapsed {}", elapsed_ms);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_timeout_keeps_previous_result() {
        let mut adc = driver();
        adc.transport_mut().set_ready_after_ms(Some(5));
        adc.transport_mut().set_conversion_result(0xC00000);
        adc.set_rate(Rate::Hz470).unwrap();
        let first = adc.single_conversion().unwrap();
        assert_eq!(first, 1250.0);

        adc.transport_mut().set_ready_after_ms(None);
        adc.transport_mut().set_conversion_result(0x000001);
        assert!(matches!(adc.single_conversion(), Err(DriverError::ConversionTimeout { .. })));
        assert_eq!(adc.last_raw_code(), 0xC00000);
        assert_eq!(adc.last_voltage_mv(), first);
    }

    #[test]
    fn test_bus_fault_during_poll() {
        let mut adc = driver();
        // Mode read-modify-write takes three exchanges; fail the first status poll
        adc.transport_mut().fail_exchanges_after(3, 1);
        assert!(matches!(adc.single_conversion(), Err(DriverError::Bus(_))));
        assert_eq!(adc.conversion_state(), ConversionState::Idle);
        assert!(!adc.transport().is_selected());
    }

    #[test]
    fn test_conversion_with_error_flag_still_completes() {
        let mut adc = driver();
        adc.transport_mut().set_ready_after_ms(Some(1));
        adc.transport_mut().set_error_flag(true);
        adc.transport_mut().set_conversion_result(0xFFFFFF);

        let status = adc.status().unwrap();
        assert!(status.error);
        assert!(adc.single_conversion().is_ok());
        assert_eq!(adc.last_raw_code(), 0xFFFFFF);
    }

    #[test]
    fn test_status_and_ready() {
        let mut adc = driver();
        adc.set_channel(Channel::Ain3).unwrap();
        let status = adc.status().unwrap();
        assert!(!status.ready);
        assert_eq!(status.channel, 2);
        assert!(!adc.ready().unwrap());
    }

    #[test]
    fn test_calibration_registers() {
        let mut adc = driver();
        assert_eq!(adc.offset().unwrap(), 0x800000);
        assert_eq!(adc.full_scale().unwrap(), 0x500000);

        adc.set_offset(0x812345).unwrap();
        assert_eq!(adc.offset().unwrap(), 0x812345);

        adc.set_full_scale(0x1ABCDEF).unwrap();
        assert_eq!(adc.full_scale().unwrap(), 0xABCDEF);
    }

    #[test]
    fn test_raw_to_voltage_follows_current_settings() {
        let mut adc = driver();
        adc.transport_mut().set_ready_after_ms(Some(1));
        adc.transport_mut().set_conversion_result(1 << 23);
        adc.set_polarity(Polarity::Unipolar).unwrap();
        let mv = adc.single_conversion().unwrap();
        assert_eq!(mv, 1250.0);

        adc.set_gain(Gain::X2).unwrap();
        assert_eq!(adc.raw_to_voltage(), 625.0);
        // The stored result is untouched
        assert_eq!(adc.last_voltage_mv(), 1250.0);
    }

    #[test]
    fn test_apply_config() {
        let mut adc = driver();
        let config = AdcConfig {
            external_reference_mv: 1800.0,
            rate: Rate::Hz50,
            channel: Channel::Ain2,
            gain: Gain::X16,
            polarity: Polarity::Unipolar,
            bias: BiasSelect::Ain2Negative,
            excitation_current: ExcitationCurrent::Ma1,
            excitation_direction: ExcitationDirection::Swapped,
            clock: ClockSource::External,
            buffered: false,
            burnout_current: true,
            boost: true,
            ..Default::default()
        };
        adc.apply_config(&config).unwrap();

        assert_eq!(adc.rate(), Rate::Hz50);
        assert_eq!(adc.channel(), Channel::Ain2);
        assert_eq!(adc.gain(), Gain::X16);
        assert_eq!(adc.reference_voltage_mv(), 1800.0);

        let mock = adc.transport();
        // clock=10, rate=0101, mode bits untouched from power-on (continuous)
        assert_eq!(mock.register(Register::Mode), 0x0085);
        // vbias=10 burnout=1 unipolar=1 boost=1 gain=100 ext ref, unbuffered, AIN2
        assert_eq!(mock.register(Register::Configuration), 0xBC01);
        assert_eq!(mock.register(Register::Io), 0x07);
    }

    #[test]
    fn test_apply_config_internal_reference_wins() {
        let mut adc = driver();
        let config = AdcConfig {
            external_reference_mv: 1800.0,
            reference: ReferenceSelect::Internal,
            ..Default::default()
        };
        adc.apply_config(&config).unwrap();
        assert_eq!(adc.reference_voltage_mv(), 1170.0);
    }
}

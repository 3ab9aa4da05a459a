use std::io;

/// Capability the driver needs from the platform: a chip-select line, a
/// full-duplex SPI exchange and a monotonic millisecond clock.
///
/// Implementations own the bus timeout. A failed exchange is reported as an
/// `io::Error` and handed to the caller untouched.
pub trait SpiTransport {
    /// Assert the chip-select line (drive CS low).
    fn select(&mut self);

    /// Deassert the chip-select line (drive CS high).
    fn deselect(&mut self);

    /// Clock out `tx` while clocking in `rx`. Both buffers have the same length.
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), io::Error>;

    /// Monotonic milliseconds. Wrap-around is the platform's concern.
    fn now_ms(&self) -> u64;
}

impl<T: SpiTransport + ?Sized> SpiTransport for &mut T {
    fn select(&mut self) {
        (**self).select()
    }

    fn deselect(&mut self) {
        (**self).deselect()
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), io::Error> {
        (**self).exchange(tx, rx)
    }

    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

//! Register map, command byte framing and bitfield windows for the AD7793.

use serde::{Deserialize, Serialize};

// Communications register bits
pub const COMM_WEN: u8 = 1 << 7;   // 0 : the byte is a command, 1 : ignored by the chip
pub const COMM_WRITE: u8 = 0 << 6; // next operation is a write
pub const COMM_READ: u8 = 1 << 6;  // next operation is a read
pub const COMM_ADDR_SHIFT: u8 = 3;
pub const COMM_ADDR_MASK: u8 = 0x7;

// Status register bits
pub const STAT_RDY: u8 = 1 << 7;   // 0 : conversion result available
pub const STAT_ERR: u8 = 1 << 6;   // overrange / underrange
pub const STAT_AD7793: u8 = 1 << 3; // always set on the AD7793
pub const STAT_CHANNEL_MASK: u8 = 0x7;

// ID register
pub const CHIP_ID: u8 = 0xB;
pub const CHIP_ID_MASK: u8 = 0xF;

/// Bytes clocked out with DIN high for 32 serial clocks to reset the interface.
pub const RESET_SEQUENCE: [u8; 4] = [0xFF; 4];

/// Logical registers addressable through the communications register.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Register {
    /// Status on read. Writes at this address go to the communications register.
    Status = 0,
    Mode = 1,
    Configuration = 2,
    Data = 3,
    Id = 4,
    Io = 5,
    Offset = 6,
    FullScale = 7,
}

impl Register {
    pub const ALL: [Register; 8] = [
        Register::Status,
        Register::Mode,
        Register::Configuration,
        Register::Data,
        Register::Id,
        Register::Io,
        Register::Offset,
        Register::FullScale,
    ];

    pub fn address(self) -> u8 {
        self as u8
    }

    /// Decode a 3-bit register address.
    pub fn from_address(address: u8) -> Register {
        Self::ALL[(address & COMM_ADDR_MASK) as usize]
    }

    /// Width of the register on the wire, in bytes.
    pub fn size(self) -> usize {
        match self {
            Register::Status | Register::Id | Register::Io => 1,
            Register::Mode | Register::Configuration => 2,
            Register::Data | Register::Offset | Register::FullScale => 3,
        }
    }
}

/// Build the one-byte command that precedes every register access.
pub fn command_byte(register: Register, read: bool) -> u8 {
    let op = if read { COMM_READ } else { COMM_WRITE };
    op | ((register.address() & COMM_ADDR_MASK) << COMM_ADDR_SHIFT)
}

/// A fixed bit window inside one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub register: Register,
    pub offset: u32,
    pub width: u32,
}

impl Field {
    pub const fn new(register: Register, offset: u32, width: u32) -> Self {
        Self { register, offset, width }
    }

    /// Mask of the bits owned by this field, in register position.
    pub const fn mask(self) -> u32 {
        ((1 << self.width) - 1) << self.offset
    }

    /// Replace this field's bits in `current` with `value`, leaving every other bit alone.
    pub fn insert(self, current: u32, value: u32) -> u32 {
        (current & !self.mask()) | ((value << self.offset) & self.mask())
    }

    pub fn extract(self, current: u32) -> u32 {
        (current & self.mask()) >> self.offset
    }
}

// Mode register (16-bit)
pub const MODE_SELECT: Field = Field::new(Register::Mode, 13, 3);
pub const MODE_CLOCK: Field = Field::new(Register::Mode, 6, 2);
pub const MODE_RATE: Field = Field::new(Register::Mode, 0, 4);

// Configuration register (16-bit)
pub const CONF_BIAS: Field = Field::new(Register::Configuration, 14, 2);
pub const CONF_BURNOUT: Field = Field::new(Register::Configuration, 13, 1);
pub const CONF_UNIPOLAR: Field = Field::new(Register::Configuration, 12, 1);
pub const CONF_BOOST: Field = Field::new(Register::Configuration, 11, 1);
pub const CONF_GAIN: Field = Field::new(Register::Configuration, 8, 3);
pub const CONF_REFSEL: Field = Field::new(Register::Configuration, 7, 1);
pub const CONF_BUFFER: Field = Field::new(Register::Configuration, 4, 1);
pub const CONF_CHANNEL: Field = Field::new(Register::Configuration, 0, 3);

// IO register (8-bit)
pub const IO_EXC_DIRECTION: Field = Field::new(Register::Io, 2, 2);
pub const IO_EXC_CURRENT: Field = Field::new(Register::Io, 0, 2);

/// A typed value that lives in exactly one [`Field`].
pub trait FieldValue: Copy {
    const FIELD: Field;

    /// Raw field bits, right-aligned.
    fn bits(self) -> u32;
}

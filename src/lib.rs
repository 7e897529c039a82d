//! A multi-protocol hardware debugging core.
//!
//! A host drives the probe with a compact bus command language
//! (`[0x41 0x42:3 r:4]`), and the probe executes it against the selected
//! protocol personality: SPI, I2C, UART, CAN, 1-Wire, 2-Wire/SWD, 3-Wire,
//! Wiegand, LIN, smartcard, JTAG, NAND flash, MMC or NFC. A SUMP compatible
//! logic analyzer runs next to the interpreter and streams captured samples
//! back to the host.
//!
//! All hardware is reached through [embedded-hal] traits or small
//! collaborator traits, so the same code runs against a real board or a
//! simulation.
//!
//! # Layout
//!
//! * [`console::Console`] owns the session and the personality registry.
//! * [`interp`] executes token streams, [`dispatch`] switches personalities.
//! * [`i2c`], [`onewire`], [`swd`] and [`jtag`] are the bit-level protocol
//!   algorithms, built only on GPIO lines and a delay.
//! * [`capture`] is the SUMP logic analyzer.
//! * [`bbio`] is the binary scripting protocol over the SPI, I2C and UART
//!   personalities.
//!
//! [embedded-hal]: https://crates.io/crates/embedded-hal

#![forbid(unsafe_code)]

pub mod backend;
pub mod bbio;
mod cancel;
pub use cancel::{CancelToken, Worker};
pub mod capture;
pub mod console;
mod critical;
pub use critical::{BoundedSection, Preemption};
pub mod delay;
pub mod dispatch;
pub mod freq;
pub mod gpio;
pub mod i2c;
pub mod interp;
pub mod jtag;
mod link;
pub use link::HostLink;
pub mod mode;
pub mod onewire;
pub mod session;
pub mod swd;
pub mod token;
mod trigger;
pub use trigger::Trigger;

use gpio::PinUse;

/// Bit order used when shifting bytes onto a wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BitOrder {
    #[default]
    MsbFirst,
    LsbFirst,
}

/// Internal pull resistor applied to a claimed line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Pull {
    Up,
    Down,
    #[default]
    Floating,
}

impl Pull {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Pull::Up => "pull-up",
            Pull::Down => "pull-down",
            Pull::Floating => "floating",
        }
    }
}

/// Reverses the bit order of a byte.
pub const fn reverse_u8(value: u8) -> u8 {
    value.reverse_bits()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("Hardware error: {0}")]
    Hardware(&'static str),

    #[error("Operation timed out")]
    Timeout,

    #[error("Peripheral busy")]
    Busy,

    #[error("Invalid argument: {0}")]
    /// Rejected parameter or malformed command syntax.
    InvalidArgument(String),

    #[error("Operation not supported by this mode")]
    Unsupported,

    #[error("No acknowledge")]
    Nack,

    #[error("CRC mismatch")]
    Crc,

    #[error("No device responded")]
    NoDevice,

    #[error("Pin {pin} is used by {current:?}, can not use it as {purpose:?}")]
    PinInUse {
        pin: u8,
        purpose: PinUse,
        current: PinUse,
    },

    #[error("Pin {0} does not exist on this board")]
    PinNotValid(u8),
}

impl BusError {
    /// Stable numeric code printed by the interpreter (`WRITE error:<code>`).
    pub const fn code(&self) -> u32 {
        match self {
            BusError::Hardware(_) => 1,
            BusError::Busy => 2,
            BusError::Timeout => 3,
            BusError::InvalidArgument(_) => 4,
            BusError::Unsupported => 5,
            BusError::Nack => 6,
            BusError::Crc => 7,
            BusError::NoDevice => 8,
            BusError::PinInUse { .. } => 9,
            BusError::PinNotValid(_) => 10,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        BusError::InvalidArgument(reason.into())
    }
}

impl eh1::digital::Error for BusError {
    fn kind(&self) -> eh1::digital::ErrorKind {
        eh1::digital::ErrorKind::Other
    }
}

impl eh1::i2c::Error for BusError {
    fn kind(&self) -> eh1::i2c::ErrorKind {
        match self {
            BusError::Nack => {
                eh1::i2c::ErrorKind::NoAcknowledge(eh1::i2c::NoAcknowledgeSource::Unknown)
            }
            _ => eh1::i2c::ErrorKind::Other,
        }
    }
}

impl eh1::spi::Error for BusError {
    fn kind(&self) -> eh1::spi::ErrorKind {
        eh1::spi::ErrorKind::Other
    }
}

/// Writes formatted text to a console sink, ignoring sink errors.
///
/// Console output is best effort: a closed host link must not turn a bus
/// operation into a failure.
#[macro_export]
macro_rules! cprint {
    ($out:expr, $($arg:tt)*) => {{
        use ::core::fmt::Write as _;
        let _ = $out.write_fmt(format_args!($($arg)*));
    }};
}

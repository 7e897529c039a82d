//! Per-console protocol session state.
//!
//! The protocol parameters live in a tagged [`ProtoConfig`]: a personality
//! reads and writes its own variant through the generated accessors
//! (`ProtoConfig::spi_mut` ...), which reset the variant to its defaults if
//! the session currently holds another protocol's parameters.
use crate::{BitOrder, Pull};
use heapless::Vec;

/// Capacity of the transmit and receive buffers.
pub const BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiConfig {
    pub pull: Pull,
    pub frequency: u32,
    pub polarity: bool,
    pub phase: bool,
    pub bit_order: BitOrder,
}

impl Default for SpiConfig {
    fn default() -> Self {
        Self {
            pull: Pull::Floating,
            frequency: 320_000,
            polarity: false,
            phase: false,
            bit_order: BitOrder::MsbFirst,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct I2cConfig {
    pub pull: Pull,
    pub frequency: u32,
    /// A read left the master ACK/NACK of its last byte unsent.
    pub ack_pending: bool,
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            pull: Pull::Up,
            frequency: 100_000,
            ack_pending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

impl Parity {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Parity::None => "none",
            Parity::Even => "even",
            Parity::Odd => "odd",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartConfig {
    pub baudrate: u32,
    pub parity: Parity,
    pub stop_bits: u8,
    /// Receive timeout of a `r` operation, milliseconds.
    pub timeout_ms: u32,
    /// LIN framing (break detection) instead of plain UART.
    pub lin: bool,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            baudrate: 9600,
            parity: Parity::None,
            stop_bits: 1,
            timeout_ms: 2000,
            lin: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanConfig {
    pub speed: u32,
    /// Identifier used for transmitted frames.
    pub id: u32,
    /// Acceptance filter `(id, mask)`, `None` accepts everything.
    pub filter: Option<(u32, u32)>,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            speed: 500_000,
            id: 0,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneWireConfig {
    pub pull: Pull,
    pub bit_order: BitOrder,
}

impl Default for OneWireConfig {
    fn default() -> Self {
        Self {
            pull: Pull::Floating,
            bit_order: BitOrder::LsbFirst,
        }
    }
}

/// Shared by the 2-wire and 3-wire personalities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWireConfig {
    pub pull: Pull,
    pub frequency: u32,
    pub bit_order: BitOrder,
}

impl Default for RawWireConfig {
    fn default() -> Self {
        Self {
            pull: Pull::Floating,
            frequency: 1_000_000,
            bit_order: BitOrder::MsbFirst,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WiegandConfig {
    pub pull: Pull,
    pub pulse_width_us: u32,
    pub pulse_gap_us: u32,
    /// Wait for the first bit of a frame, microseconds.
    pub first_bit_timeout_us: u32,
    /// Idle time that ends a frame, microseconds.
    pub frame_timeout_us: u32,
}

impl Default for WiegandConfig {
    fn default() -> Self {
        Self {
            pull: Pull::Floating,
            pulse_width_us: 100,
            pulse_gap_us: 20_000,
            first_bit_timeout_us: 100_000_000,
            frame_timeout_us: 2_000_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Convention {
    #[default]
    Normal,
    Inverse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartcardConfig {
    pub baudrate: u32,
    pub prescaler: u8,
    pub guard_time: u8,
    pub convention: Convention,
    pub timeout_ms: u32,
}

impl Default for SmartcardConfig {
    fn default() -> Self {
        Self {
            baudrate: 9408,
            prescaler: 12,
            guard_time: 16,
            convention: Convention::Normal,
            timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JtagConfig {
    pub pull: Pull,
    pub frequency: u32,
    pub bit_order: BitOrder,
}

impl Default for JtagConfig {
    fn default() -> Self {
        Self {
            pull: Pull::Up,
            frequency: 1_000_000,
            bit_order: BitOrder::LsbFirst,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashConfig {
    /// Chip enable currently asserted.
    pub selected: bool,
    /// Bytes latched by `address <n>`, least significant first.
    pub address_bytes: u8,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            selected: false,
            address_bytes: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmcConfig {
    pub bus_width: u8,
}

impl Default for MmcConfig {
    fn default() -> Self {
        Self { bus_width: 1 }
    }
}

/// Air interface of the NFC front end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NfcProtocol {
    /// Proximity cards: MIFARE, NTAG, most payment cards.
    #[default]
    Iso14443A,
    /// Vicinity cards.
    Iso15693,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NfcConfig {
    pub field_on: bool,
    pub protocol: NfcProtocol,
    /// The front end appends a CRC to written frames.
    pub crc: bool,
}

macro_rules! proto_config {
    ($($variant:ident($config:ty) => $accessor:ident),* $(,)?) => {
        /// Protocol parameters of the session, one variant per personality.
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub enum ProtoConfig {
            #[default]
            HiZ,
            $($variant($config),)*
        }

        impl ProtoConfig {
            $(
                pub fn $accessor(&mut self) -> &mut $config {
                    if !matches!(self, ProtoConfig::$variant(_)) {
                        *self = ProtoConfig::$variant(Default::default());
                    }
                    match self {
                        ProtoConfig::$variant(config) => config,
                        _ => unreachable!(),
                    }
                }
            )*
        }
    };
}

proto_config! {
    Spi(SpiConfig) => spi_mut,
    I2c(I2cConfig) => i2c_mut,
    Uart(UartConfig) => uart_mut,
    Can(CanConfig) => can_mut,
    OneWire(OneWireConfig) => onewire_mut,
    RawWire(RawWireConfig) => rawwire_mut,
    Wiegand(WiegandConfig) => wiegand_mut,
    Smartcard(SmartcardConfig) => smartcard_mut,
    Jtag(JtagConfig) => jtag_mut,
    Flash(FlashConfig) => flash_mut,
    Mmc(MmcConfig) => mmc_mut,
    Nfc(NfcConfig) => nfc_mut,
}

/// The part of the session a personality configures.
///
/// A mode switch builds a fresh `ProtoState` for the new personality and
/// only installs it once `init` succeeded, so a rejected switch leaves the
/// previous state untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtoState {
    /// Selected device index, 0 based.
    pub dev_num: u8,
    pub config: ProtoConfig,
    /// Mandatory parameters have been supplied.
    pub valid: bool,
}

/// Per-console session.
#[derive(Debug, Default)]
pub struct Session {
    pub proto: ProtoState,
    /// Writes go through `write_read` (`{` ... `}`).
    pub wwr: bool,
    pub tx: Vec<u8, BUFFER_SIZE>,
    pub rx: Vec<u8, BUFFER_SIZE>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }
}

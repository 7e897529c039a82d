//! The contract every protocol personality implements.
use crate::session::ProtoState;
use crate::token::Token;
use crate::{BitOrder, BusError, CancelToken, HostLink, Pull};
use std::fmt;

/// Symbolic identifier of a personality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeId {
    HiZ,
    Spi,
    I2c,
    Uart,
    Can,
    OneWire,
    TwoWire,
    ThreeWire,
    Wiegand,
    Lin,
    Smartcard,
    Jtag,
    Flash,
    Mmc,
    Nfc,
}

impl ModeId {
    /// Keyword selecting the mode and prefix of its prompt.
    pub const fn name(self) -> &'static str {
        match self {
            ModeId::HiZ => "hiz",
            ModeId::Spi => "spi",
            ModeId::I2c => "i2c",
            ModeId::Uart => "uart",
            ModeId::Can => "can",
            ModeId::OneWire => "onewire",
            ModeId::TwoWire => "twowire",
            ModeId::ThreeWire => "threewire",
            ModeId::Wiegand => "wiegand",
            ModeId::Lin => "lin",
            ModeId::Smartcard => "smartcard",
            ModeId::Jtag => "jtag",
            ModeId::Flash => "flash",
            ModeId::Mmc => "mmc",
            ModeId::Nfc => "nfc",
        }
    }
}

/// Operations a personality supports.
///
/// The interpreter checks the matching flag before calling an operation;
/// a missing flag turns the bit-level operators into no-ops and the data
/// operators into `Unsupported` errors.
#[bitfield_struct::bitfield(u16, order = Lsb)]
#[derive(PartialEq, Eq)]
pub struct Capabilities {
    pub start: bool,
    pub stop: bool,
    pub write: bool,
    pub read: bool,
    pub write_read: bool,
    pub dump: bool,
    pub clock_high: bool,
    pub clock_low: bool,
    pub clock_pulse: bool,
    pub data_high: bool,
    pub data_low: bool,
    pub data_sample: bool,
    pub bit_read: bool,
    #[bits(3)]
    __: u8,
}

impl Capabilities {
    /// `[` `]` plus byte write and read.
    pub const fn bus() -> Self {
        Self::new()
            .with_start(true)
            .with_stop(true)
            .with_write(true)
            .with_read(true)
            .with_dump(true)
    }

    /// Every bit-level operator.
    pub const fn with_bit_ops(self) -> Self {
        self.with_clock_high(true)
            .with_clock_low(true)
            .with_clock_pulse(true)
            .with_data_high(true)
            .with_data_low(true)
            .with_data_sample(true)
            .with_bit_read(true)
    }
}

/// What an operation may touch besides the personality itself.
pub struct ModeCtx<'a> {
    pub proto: &'a mut ProtoState,
    /// Console output.
    pub out: &'a mut dyn fmt::Write,
    /// User abort, polled by every long running operation.
    pub abort: &'a CancelToken,
    /// Raw host link, used by pass-through bridges.
    pub link: Option<&'a mut (dyn HostLink + 'static)>,
}

/// A protocol personality.
///
/// `init` only parses and validates arguments into the session; hardware
/// is claimed in `setup` and released in `cleanup`, so a mode switch can
/// validate the new mode before tearing down the old one.
pub trait Personality: Send {
    fn id(&self) -> ModeId;

    fn name(&self) -> &'static str {
        self.id().name()
    }

    /// Mode-specific keywords accepted by [`Personality::exec`].
    fn grammar(&self) -> &'static [&'static str] {
        &[]
    }

    fn capabilities(&self) -> Capabilities;

    /// Installs defaults, parses `args`, and returns the number of tokens
    /// used.
    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError>;

    /// Claims and configures the hardware once the previous mode released
    /// its own.
    fn setup(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        Ok(())
    }

    /// Handles mode-specific keywords. `Ok(0)` ends the command.
    fn exec(&mut self, _ctx: &mut ModeCtx<'_>, _tokens: &[Token]) -> Result<usize, BusError> {
        Ok(0)
    }

    fn start(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn stop(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn write(&mut self, _ctx: &mut ModeCtx<'_>, _tx: &[u8]) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn read(&mut self, _ctx: &mut ModeCtx<'_>, _rx: &mut [u8]) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn write_read(
        &mut self,
        _ctx: &mut ModeCtx<'_>,
        _tx: &[u8],
        _rx: &mut [u8],
    ) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    /// Reads without printing, for `hd` and the trigger.
    fn dump(&mut self, _ctx: &mut ModeCtx<'_>, _rx: &mut [u8]) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    /// Writes one byte and reports whether the target acknowledged it.
    fn write_acked(&mut self, ctx: &mut ModeCtx<'_>, byte: u8) -> Result<bool, BusError> {
        self.write(ctx, &[byte]).map(|()| true)
    }

    /// Sends the ACK (`true`) or NACK still owed for the last byte read.
    fn send_ack(&mut self, _ctx: &mut ModeCtx<'_>, _ack: bool) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    /// Moves what was already received into `rx` without waiting and
    /// returns its length.
    fn receive(&mut self, _ctx: &mut ModeCtx<'_>, _rx: &mut [u8]) -> Result<usize, BusError> {
        Err(BusError::Unsupported)
    }

    fn clock_high(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn clock_low(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn clock_pulse(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn data_high(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn data_low(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn data_sample(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn bit_read(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    /// Releases the hardware claimed by `setup`. `ctx.proto` is the state
    /// this personality was running with.
    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {}

    fn prompt(&self, proto: &ProtoState) -> String {
        format!("{}{}> ", self.name(), proto.dev_num + 1)
    }

    /// Prints the current configuration.
    fn show(&self, _ctx: &mut ModeCtx<'_>) {}
}

/// Cursor over the argument tokens of `init` and `exec`.
pub struct Args<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl<'t> Args<'t> {
    pub fn new(tokens: &'t [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos)
    }

    /// The next token when it is a keyword.
    pub fn peek_word(&self) -> Option<&'t str> {
        match self.peek() {
            Some(Token::Word(word)) => Some(word.as_str()),
            _ => None,
        }
    }

    pub fn bump(&mut self) {
        self.pos += 1;
    }

    /// Number of tokens consumed so far.
    pub fn used(&self) -> usize {
        self.pos
    }

    /// Consumes the numeric argument of `keyword`.
    pub fn uint(&mut self, keyword: &str) -> Result<u32, BusError> {
        match self.peek() {
            Some(Token::Uint(value)) => {
                self.bump();
                Ok(*value)
            }
            _ => Err(BusError::invalid(format!("{keyword} expects a number"))),
        }
    }

    /// Consumes the keyword argument of `keyword`.
    pub fn word(&mut self, keyword: &str) -> Result<&'t str, BusError> {
        match self.peek_word() {
            Some(word) => {
                self.bump();
                Ok(word)
            }
            None => Err(BusError::invalid(format!("{keyword} expects a keyword"))),
        }
    }

    /// Consumes `up`, `down` or `floating` after `pull`.
    pub fn pull(&mut self) -> Result<Pull, BusError> {
        match self.word("pull")? {
            "up" => Ok(Pull::Up),
            "down" => Ok(Pull::Down),
            "floating" | "none" => Ok(Pull::Floating),
            other => Err(BusError::invalid(format!("unknown pull '{other}'"))),
        }
    }

    /// Consumes `msb-first`/`lsb-first` when present.
    pub fn bit_order(&mut self) -> Option<BitOrder> {
        let order = match self.peek_word()? {
            "msb-first" => BitOrder::MsbFirst,
            "lsb-first" => BitOrder::LsbFirst,
            _ => return None,
        };
        self.bump();
        Some(order)
    }

    /// Consumes a `device <n>` argument, 1 based, bounded by `count`.
    pub fn device(&mut self, count: usize) -> Result<u8, BusError> {
        let number = self.uint("device")?;
        if number == 0 || number as usize > count {
            return Err(BusError::invalid(format!(
                "device must be between 1 and {count}"
            )));
        }
        Ok((number - 1) as u8)
    }
}

pub(crate) fn bit_order_name(order: BitOrder) -> &'static str {
    match order {
        BitOrder::MsbFirst => "MSB first",
        BitOrder::LsbFirst => "LSB first",
    }
}

/// Prints `WRITE: 0x.. 0x..`.
pub(crate) fn print_bytes(out: &mut dyn fmt::Write, label: &str, bytes: &[u8]) {
    if bytes.len() == 1 {
        crate::cprint!(out, "{label}: 0x{:02X}\r\n", bytes[0]);
        return;
    }
    crate::cprint!(out, "{label}: ");
    for byte in bytes {
        crate::cprint!(out, "0x{byte:02X} ");
    }
    crate::cprint!(out, "\r\n");
}

/// Classic 16 bytes per row hex dump with an ASCII column.
pub(crate) fn print_hex(out: &mut dyn fmt::Write, data: &[u8]) {
    use std::fmt::Write as _;
    for row in data.chunks(16) {
        let mut hex = String::with_capacity(50);
        let mut ascii = String::with_capacity(16);
        for (i, &byte) in row.iter().enumerate() {
            let _ = write!(hex, "{byte:02X} ");
            if i == 7 {
                hex.push(' ');
            }
            ascii.push(if (0x20..0x7f).contains(&byte) {
                byte as char
            } else {
                '.'
            });
        }
        crate::cprint!(out, "{hex:<50}|  {ascii} \r\n");
    }
}

/// `400khz`, `1mhz`, `1.50mhz`.
pub(crate) fn format_freq(freq: u32) -> String {
    let (unit, suffix) = match freq {
        1_000_000_000.. => (1_000_000_000, "ghz"),
        1_000_000.. => (1_000_000, "mhz"),
        1_000.. => (1_000, "khz"),
        _ => return freq.to_string(),
    };
    let int_part = freq / unit;
    let dec_part = (freq % unit) / (unit / 100);
    if dec_part > 0 {
        format!("{int_part}.{dec_part:02}{suffix}")
    } else {
        format!("{int_part}{suffix}")
    }
}

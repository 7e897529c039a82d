//! Binary scripting protocol.
//!
//! A byte oriented front end to the SPI, I2C and UART personalities for
//! host scripts. The host enters it with twenty `0x00` bytes, picks a raw
//! mode with one opcode and then drives the bus with the opcodes of that
//! mode. Every raw mode goes through the registered [`Personality`], so
//! pins, session parameters and capabilities are the same as on the
//! interactive console.
//!
//! Replies are `0x01` for success and `0x00` for failure unless an opcode
//! says otherwise.
mod i2c;
mod spi;
mod uart;

use crate::backend::{Capabilities, ModeCtx, ModeId, Personality};
use crate::console::{Console, Discard};
use crate::{BusError, CancelToken, HostLink};
use std::io;

/// Consecutive `0x00` bytes that switch the console to binary mode.
pub const ENTRY_ZEROES: usize = 20;
/// `0x00` bytes a SUMP client sends before its id request.
pub const SUMP_ZEROES: usize = 5;
const SUMP_ID: u8 = 0x02;

/// Sent on entry and every time the host is back at mode selection.
pub const BBIO_ID: &[u8] = b"BBIO1";

/// Largest payload of a write-then-read command, either direction.
pub const MAX_TRANSFER: usize = 4096;

/// Received bytes forwarded per UART echo poll.
const ECHO_CHUNK: usize = 64;

const OK: u8 = 0x01;
const FAIL: u8 = 0x00;

mod op {
    pub const RESET: u8 = 0x00;
    pub const SPI: u8 = 0x01;
    pub const I2C: u8 = 0x02;
    pub const UART: u8 = 0x03;
    pub const RESET_HW: u8 = 0x0f;
    /// Inside a raw mode: repeat the mode header.
    pub const MODE_ID: u8 = 0x01;
}

/// What a raw host byte means before the line editor sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// An ordinary input byte.
    Byte(u8),
    /// Swallowed as part of an entry sequence.
    Pending,
    /// Hand the link to [`Console::bbio`].
    Bbio,
    /// A SUMP client asked for the analyzer id. The request is consumed:
    /// reply with [`crate::capture::SUMP_ID_REPLY`] before starting the
    /// capture engine.
    Sump,
}

/// Watches console input for the binary mode entry sequences.
#[derive(Debug, Default)]
pub struct EntryDetector {
    zeroes: usize,
}

impl EntryDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> Entry {
        match byte {
            0 => {
                self.zeroes += 1;
                if self.zeroes == ENTRY_ZEROES {
                    self.zeroes = 0;
                    Entry::Bbio
                } else {
                    Entry::Pending
                }
            }
            SUMP_ID if self.zeroes == SUMP_ZEROES => {
                self.zeroes = 0;
                Entry::Sump
            }
            _ => {
                self.zeroes = 0;
                Entry::Byte(byte)
            }
        }
    }
}

/// Personality a raw mode drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawMode {
    Spi,
    I2c,
    Uart,
}

impl RawMode {
    fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            op::SPI => Some(RawMode::Spi),
            op::I2C => Some(RawMode::I2c),
            op::UART => Some(RawMode::Uart),
            _ => None,
        }
    }

    fn id(self) -> ModeId {
        match self {
            RawMode::Spi => ModeId::Spi,
            RawMode::I2c => ModeId::I2c,
            RawMode::Uart => ModeId::Uart,
        }
    }

    fn header(self) -> &'static [u8] {
        match self {
            RawMode::Spi => spi::HEADER,
            RawMode::I2c => i2c::HEADER,
            RawMode::Uart => uart::HEADER,
        }
    }

    fn handle(self, raw: &mut Raw<'_>, opcode: u8) -> io::Result<()> {
        match self {
            RawMode::Spi => spi::handle(raw, opcode),
            RawMode::I2c => i2c::handle(raw, opcode),
            RawMode::Uart => uart::handle(raw, opcode),
        }
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "user abort")
}

/// Waits for the next host byte. `Interrupted` once `abort` is raised.
fn next_byte(link: &mut dyn HostLink, abort: &CancelToken) -> io::Result<u8> {
    loop {
        if abort.is_cancelled() {
            return Err(aborted());
        }
        if let Some(byte) = link.poll_byte() {
            return Ok(byte);
        }
    }
}

/// One raw mode session: the selected personality and the host link.
pub(crate) struct Raw<'a> {
    mode: &'a mut dyn Personality,
    ctx: ModeCtx<'a>,
    link: &'a mut dyn HostLink,
    /// Forward received bytes to the host while waiting for commands.
    echo: bool,
}

impl Raw<'_> {
    fn byte(&mut self) -> io::Result<u8> {
        loop {
            if self.ctx.abort.is_cancelled() {
                return Err(aborted());
            }
            if let Some(byte) = self.link.poll_byte() {
                return Ok(byte);
            }
            if self.echo {
                self.forward()?;
            }
        }
    }

    fn bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        for slot in buf.iter_mut() {
            *slot = self.byte()?;
        }
        Ok(())
    }

    fn reply(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.link.write_all(bytes)?;
        self.link.flush()
    }

    /// Replies `0x01` or `0x00`.
    fn status(&mut self, result: Result<(), BusError>) -> io::Result<()> {
        match result {
            Ok(()) => self.reply(&[OK]),
            Err(e) => {
                log::debug!("bbio {}: {e}", self.mode.name());
                self.reply(&[FAIL])
            }
        }
    }

    fn capabilities(&self) -> Capabilities {
        self.mode.capabilities()
    }

    /// Fails with `Unsupported` unless the personality offers the
    /// operation.
    fn require(&self, present: bool) -> Result<(), BusError> {
        if present {
            Ok(())
        } else {
            Err(BusError::Unsupported)
        }
    }

    /// Reopens the personality with the session parameters.
    fn reconfigure(&mut self) -> Result<(), BusError> {
        self.mode.cleanup(&mut self.ctx);
        self.mode.setup(&mut self.ctx)
    }

    /// Length header of the write-then-read commands: bytes to write and
    /// bytes to read, big endian. `None` past [`MAX_TRANSFER`].
    fn lengths(&mut self) -> io::Result<Option<(usize, usize)>> {
        let mut header = [0u8; 4];
        self.bytes(&mut header)?;
        let tx = u16::from_be_bytes([header[0], header[1]]) as usize;
        let rx = u16::from_be_bytes([header[2], header[3]]) as usize;
        Ok((tx <= MAX_TRANSFER && rx <= MAX_TRANSFER).then_some((tx, rx)))
    }

    fn forward(&mut self) -> io::Result<()> {
        let mut buf = [0u8; ECHO_CHUNK];
        match self.mode.receive(&mut self.ctx, &mut buf) {
            Ok(0) => {}
            Ok(n) => self.reply(&buf[..n])?,
            Err(e) => {
                log::warn!("bbio echo stopped: {e}");
                self.echo = false;
            }
        }
        Ok(())
    }
}

fn serve_raw(raw: &mut Raw<'_>, kind: RawMode) -> io::Result<()> {
    loop {
        match raw.byte()? {
            op::RESET => return Ok(()),
            op::MODE_ID => raw.reply(kind.header())?,
            opcode => kind.handle(raw, opcode)?,
        }
    }
}

impl Console {
    /// Hands the host link to the binary protocol until the host resets
    /// the board or the user button is pressed.
    pub fn bbio(&mut self) -> Result<(), BusError> {
        let mut link = self.link.take().ok_or(BusError::Unsupported)?;
        let result = self.serve_bbio(link.as_mut());
        self.link = Some(link);
        result
    }

    /// Runs the binary protocol over `link`. The console is back in `hiz`
    /// on return.
    pub fn serve_bbio(&mut self, link: &mut dyn HostLink) -> Result<(), BusError> {
        log::info!("binary mode entered");
        let result = self.select_raw(link);
        self.exit(&mut Discard);
        self.abort.reset();
        match result {
            Err(e) if e.kind() != io::ErrorKind::Interrupted => {
                log::warn!("binary mode ended: {e}");
                Err(BusError::Hardware("host link"))
            }
            _ => {
                log::info!("binary mode left");
                Ok(())
            }
        }
    }

    fn select_raw(&mut self, link: &mut dyn HostLink) -> io::Result<()> {
        link.write_all(BBIO_ID)?;
        link.flush()?;
        loop {
            let opcode = next_byte(link, &self.abort)?;
            match opcode {
                op::RESET => {}
                op::RESET_HW => return Ok(()),
                _ => {
                    let Some(kind) = RawMode::from_opcode(opcode) else {
                        log::trace!("bbio opcode {opcode:#04x} ignored");
                        continue;
                    };
                    if !self.raw_mode(kind, link)? {
                        continue;
                    }
                }
            }
            link.write_all(BBIO_ID)?;
            link.flush()?;
        }
    }

    /// Serves one raw mode until the host resets it. `false` when the
    /// personality is missing or could not claim its hardware.
    fn raw_mode(&mut self, kind: RawMode, link: &mut dyn HostLink) -> io::Result<bool> {
        let name = kind.id().name();
        let Some(index) = self.mode_index(name) else {
            log::warn!("bbio: no {name} personality registered");
            return Ok(false);
        };
        if let Err(e) = self.select(index, &[], &mut Discard) {
            log::warn!("bbio: {name} unavailable: {e}");
            return Ok(false);
        }
        log::debug!("bbio raw {name}");
        link.write_all(kind.header())?;
        link.flush()?;

        let mut discard = Discard;
        let (mode, ctx, _, _) = self.parts(&mut discard);
        let mut raw = Raw {
            mode,
            ctx,
            link,
            echo: false,
        };
        let result = serve_raw(&mut raw, kind);
        self.exit(&mut Discard);
        result.map(|()| true)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::console::test::console;
    use crate::link::mem::MemLink;

    /// Runs `script` through binary mode on a fresh link and returns what
    /// the console sent back.
    pub(crate) fn session(console: &mut Console, script: &[u8]) -> Vec<u8> {
        let mut link = MemLink::with_input(script);
        link.on_drain = Some(console.abort_token());
        console.serve_bbio(&mut link).unwrap();
        link.output
    }

    #[test]
    fn entry_sequences() {
        let mut detector = EntryDetector::new();
        assert_eq!(detector.push(b'a'), Entry::Byte(b'a'));
        for _ in 0..ENTRY_ZEROES - 1 {
            assert_eq!(detector.push(0), Entry::Pending);
        }
        assert_eq!(detector.push(0), Entry::Bbio);

        for _ in 0..SUMP_ZEROES {
            detector.push(0);
        }
        assert_eq!(detector.push(0x02), Entry::Sump);
        // a lone 0x02 is ordinary input
        assert_eq!(detector.push(0x02), Entry::Byte(0x02));

        for _ in 0..ENTRY_ZEROES - 1 {
            detector.push(0);
        }
        assert_eq!(detector.push(b'x'), Entry::Byte(b'x'));
        assert_eq!(detector.push(0), Entry::Pending);
    }

    #[test]
    fn reset_and_unknown_modes() {
        let (mut console, _) = console(16);
        // no SPI personality registered: the opcode is ignored
        let reply = session(&mut console, &[op::RESET, op::SPI, 0x42, op::RESET_HW, op::RESET]);
        assert_eq!(reply, b"BBIO1BBIO1");
        assert_eq!(console.mode_name(), "hiz");
    }

    #[test]
    fn console_command_needs_a_link() {
        let (mut console, _) = console(16);
        let mut out = String::new();
        assert_eq!(console.run_line("bbio", &mut out), Err(BusError::Unsupported));
    }
}

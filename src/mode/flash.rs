//! Raw parallel NAND flash access.
//!
//! The personality only sequences the latches; page geometry and ECC are
//! left to the user, who drives `command` and `address` cycles by hand and
//! moves data with the usual write and read operators.
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, print_bytes};
use crate::session::{FlashConfig, ProtoState};
use crate::token::Token;
use crate::BusError;
use eh1::delay::DelayNs;

const CMD_READ_ID: u8 = 0x90;
const CMD_READ_STATUS: u8 = 0x70;
const CMD_RESET: u8 = 0xff;

/// Bytes returned by READ ID.
const ID_LEN: usize = 5;

/// R/B# polls, one microsecond apart.
const READY_POLLS: u32 = 100_000;

const GRAMMAR: &[&str] = &["command", "address", "address-bytes", "id", "show"];

/// An 8-bit asynchronous NAND interface.
///
/// Every cycle method strobes WE# or RE# once; CE# is left alone.
pub trait NandFlash: Send {
    /// Configures the data bus and control lines, chip enable released.
    fn open(&mut self) -> Result<(), BusError>;

    /// Drives CE#, `true` asserting it (low).
    fn chip_enable(&mut self, active: bool);

    /// Latches `command` with CLE high.
    fn command(&mut self, command: u8);

    /// Latches one address byte with ALE high.
    fn address(&mut self, address: u8);

    fn write_data(&mut self, byte: u8);

    fn read_data(&mut self) -> u8;

    /// R/B# reads high.
    fn ready(&mut self) -> bool;

    fn close(&mut self) {}
}

fn configure(proto: &mut ProtoState, args: &mut Args<'_>) -> Result<(), BusError> {
    let config = proto.config.flash_mut();
    loop {
        match args.peek_word() {
            Some("address-bytes") => {
                args.bump();
                match args.uint("address-bytes")? {
                    count @ 1..=4 => config.address_bytes = count as u8,
                    _ => return Err(BusError::invalid("Address bytes must be between 1 and 4.")),
                }
            }
            _ => return Ok(()),
        }
    }
}

fn byte(args: &mut Args<'_>, keyword: &str) -> Result<u8, BusError> {
    u8::try_from(args.uint(keyword)?)
        .map_err(|_| BusError::invalid(format!("{keyword} expects a byte")))
}

pub struct FlashMode<F, D> {
    flash: F,
    delay: D,
    open: bool,
}

impl<F: NandFlash, D: DelayNs + Send> FlashMode<F, D> {
    pub fn new(flash: F, delay: D) -> Self {
        Self {
            flash,
            delay,
            open: false,
        }
    }

    fn ready(&self) -> Result<(), BusError> {
        if self.open {
            Ok(())
        } else {
            Err(super::not_ready("flash"))
        }
    }

    fn wait_ready(&mut self) -> Result<(), BusError> {
        for _ in 0..READY_POLLS {
            if self.flash.ready() {
                return Ok(());
            }
            self.delay.delay_us(1);
        }
        log::warn!("R/B# stuck low");
        Err(BusError::Timeout)
    }

    /// Latches `value` over `count` address cycles, least significant byte
    /// first. Returns the bytes sent.
    fn latch_address(&mut self, value: u32, count: u8) -> heapless::Vec<u8, 4> {
        let bytes: heapless::Vec<u8, 4> = value.to_le_bytes()[..count as usize]
            .iter()
            .copied()
            .collect();
        for &byte in &bytes {
            self.flash.address(byte);
        }
        bytes
    }

    /// READ ID then READ STATUS, each in its own chip enable window.
    fn identify(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let mut id = [0u8; ID_LEN];
        self.flash.chip_enable(true);
        self.flash.command(CMD_READ_ID);
        self.flash.address(0x00);
        // tWHR
        self.delay.delay_ns(60);
        for byte in &mut id {
            *byte = self.flash.read_data();
        }
        self.flash.chip_enable(false);

        self.flash.chip_enable(true);
        self.flash.command(CMD_READ_STATUS);
        self.delay.delay_ns(60);
        let status = self.flash.read_data();
        // leave CE# where the user put it
        self.flash.chip_enable(ctx.proto.config.flash_mut().selected);

        crate::cprint!(ctx.out, "IDCode : ");
        for byte in id {
            crate::cprint!(ctx.out, "{byte:02X} ");
        }
        crate::cprint!(ctx.out, "\r\nStatus register : {status:02X}\r\n");
        Ok(())
    }
}

impl<F: NandFlash, D: DelayNs + Send> Personality for FlashMode<F, D> {
    fn id(&self) -> ModeId {
        ModeId::Flash
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::bus()
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        configure(ctx.proto, &mut args)?;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.flash.open()?;
        self.open = true;
        ctx.proto.config.flash_mut().selected = false;
        self.flash.chip_enable(true);
        self.flash.command(CMD_RESET);
        self.flash.chip_enable(false);
        self.delay.delay_ms(1);
        self.wait_ready()
    }

    fn exec(&mut self, ctx: &mut ModeCtx<'_>, tokens: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(tokens);
        match args.peek_word() {
            Some("show") => {
                args.bump();
                if args.peek_word() == Some("pins") {
                    args.bump();
                    crate::cprint!(
                        ctx.out,
                        "CE: PB4\r\nRB: PB0\r\nWE: PB1\r\nRE: PB5\r\nAL: PB2\r\nCL: PB3\r\n"
                    );
                } else {
                    self.show(ctx);
                }
            }
            Some("command") => {
                args.bump();
                let command = byte(&mut args, "command")?;
                self.ready()?;
                self.flash.command(command);
                print_bytes(ctx.out, "COMMAND", &[command]);
                self.wait_ready()?;
            }
            Some("address") => {
                args.bump();
                let value = args.uint("address")?;
                self.ready()?;
                let count = ctx.proto.config.flash_mut().address_bytes;
                let sent = self.latch_address(value, count);
                print_bytes(ctx.out, "ADDRESS", &sent);
            }
            Some("id") => {
                args.bump();
                self.ready()?;
                self.identify(ctx)?;
            }
            _ => configure(ctx.proto, &mut args)?,
        }
        Ok(args.used())
    }

    fn start(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.ready()?;
        self.flash.chip_enable(true);
        ctx.proto.config.flash_mut().selected = true;
        crate::cprint!(ctx.out, "CE LOW\r\n");
        Ok(())
    }

    fn stop(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.ready()?;
        self.flash.chip_enable(false);
        ctx.proto.config.flash_mut().selected = false;
        crate::cprint!(ctx.out, "CE HIGH\r\n");
        Ok(())
    }

    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        self.ready()?;
        for &byte in tx {
            self.flash.write_data(byte);
        }
        print_bytes(ctx.out, "WRITE", tx);
        Ok(())
    }

    fn read(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        self.dump(ctx, rx)?;
        print_bytes(ctx.out, "READ", rx);
        Ok(())
    }

    fn dump(&mut self, _ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        self.ready()?;
        for byte in rx.iter_mut() {
            *byte = self.flash.read_data();
        }
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        if self.open {
            self.flash.chip_enable(false);
            self.flash.close();
            self.open = false;
        }
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let FlashConfig {
            selected,
            address_bytes,
        } = ctx.proto.config.flash_mut().clone();
        crate::cprint!(
            ctx.out,
            "Address bytes : {address_bytes}\r\nChip enable : {}\r\n",
            if selected { "low" } else { "high" }
        );
    }
}

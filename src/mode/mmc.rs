//! eMMC / MMC card inspection over the SDIO host.
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, print_hex};
use crate::session::ProtoState;
use crate::token::Token;
use crate::BusError;
use std::fmt;

pub const BLOCK_SIZE: usize = 512;

/// C_SIZE of a card whose capacity lives in EXT_CSD SEC_COUNT.
const C_SIZE_EXTENDED: u32 = 0xfff;
/// Offset of SEC_COUNT in EXT_CSD, little endian.
const EXT_CSD_SEC_COUNT: usize = 212;

const GRAMMAR: &[&str] = &["bus-width", "id", "cid", "csd", "block", "show"];

/// A 128-bit card register, most significant word first.
pub type CardRegister = [u32; 4];

/// An MMC card behind the board's SDIO host.
pub trait MmcCard: Send {
    /// Powers the card and runs identification at `bus_width` bits.
    fn open(&mut self, bus_width: u8) -> Result<(), BusError>;

    fn set_bus_width(&mut self, bus_width: u8) -> Result<(), BusError>;

    fn cid(&mut self) -> Result<CardRegister, BusError>;

    fn csd(&mut self) -> Result<CardRegister, BusError>;

    fn ext_csd(&mut self, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), BusError>;

    fn read_block(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), BusError>;

    fn close(&mut self) {}
}

/// Bits `high..=low` of a card register.
fn field(register: &CardRegister, high: u32, low: u32) -> u32 {
    let value = register
        .iter()
        .fold(0u128, |acc, &word| (acc << 32) | word as u128);
    let width = high - low + 1;
    ((value >> low) & ((1u128 << width) - 1)) as u32
}

/// Card capacity in 512 byte blocks.
fn block_count(csd: &CardRegister, ext_csd: &[u8; BLOCK_SIZE]) -> u64 {
    let c_size = field(csd, 73, 62);
    if c_size == C_SIZE_EXTENDED {
        let sec_count: [u8; 4] = ext_csd[EXT_CSD_SEC_COUNT..EXT_CSD_SEC_COUNT + 4]
            .try_into()
            .unwrap_or_default();
        return u32::from_le_bytes(sec_count) as u64;
    }
    let mult = 1u64 << (field(csd, 49, 47) + 2);
    let block_len = 1u64 << field(csd, 83, 80);
    (c_size as u64 + 1) * mult * block_len / BLOCK_SIZE as u64
}

fn print_register(out: &mut dyn fmt::Write, name: &str, register: &CardRegister) {
    crate::cprint!(
        out,
        "{name} : 0x{:08x} 0x{:08x} 0x{:08x} 0x{:08x}\r\n",
        register[0],
        register[1],
        register[2],
        register[3]
    );
}

fn configure(proto: &mut ProtoState, args: &mut Args<'_>) -> Result<(), BusError> {
    let config = proto.config.mmc_mut();
    loop {
        match args.peek_word() {
            Some("bus-width") => {
                args.bump();
                match args.uint("bus-width")? {
                    width @ (1 | 4) => config.bus_width = width as u8,
                    _ => return Err(BusError::invalid("Bus width must be 1 or 4.")),
                }
            }
            _ => return Ok(()),
        }
    }
}

pub struct MmcMode<C> {
    card: C,
    open: bool,
}

impl<C: MmcCard> MmcMode<C> {
    pub fn new(card: C) -> Self {
        Self { card, open: false }
    }

    fn ready(&self) -> Result<(), BusError> {
        if self.open {
            Ok(())
        } else {
            Err(super::not_ready("mmc"))
        }
    }

    fn identify(&mut self, out: &mut dyn fmt::Write) -> Result<(), BusError> {
        let cid = self.card.cid()?;
        print_register(out, "CID", &cid);
        let csd = self.card.csd()?;
        print_register(out, "CSD", &csd);
        let mut ext_csd = [0u8; BLOCK_SIZE];
        match self.card.ext_csd(&mut ext_csd) {
            Ok(()) => {
                crate::cprint!(out, "EXT_CSD : ");
                for byte in ext_csd {
                    crate::cprint!(out, "{byte:02x}");
                }
                crate::cprint!(out, "\r\n");
            }
            Err(e) => {
                crate::cprint!(out, "EXT_CSD error : {}\r\n", e.code());
                ext_csd = [0; BLOCK_SIZE];
            }
        }
        crate::cprint!(out, "Number of blocks: {}\r\n", block_count(&csd, &ext_csd));
        Ok(())
    }
}

impl<C: MmcCard> Personality for MmcMode<C> {
    fn id(&self) -> ModeId {
        ModeId::Mmc
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        configure(ctx.proto, &mut args)?;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let bus_width = ctx.proto.config.mmc_mut().bus_width;
        self.card.open(bus_width)?;
        self.open = true;
        self.show(ctx);
        Ok(())
    }

    fn exec(&mut self, ctx: &mut ModeCtx<'_>, tokens: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(tokens);
        match args.peek_word() {
            Some("show") => {
                args.bump();
                if args.peek_word() == Some("pins") {
                    args.bump();
                    crate::cprint!(ctx.out, "CLK: PC12\r\nCMD: PD2\r\nD0: PC8\r\n");
                } else {
                    self.show(ctx);
                }
            }
            Some("id") => {
                args.bump();
                self.ready()?;
                self.identify(ctx.out)?;
            }
            Some("cid") => {
                args.bump();
                self.ready()?;
                let cid = self.card.cid()?;
                print_register(ctx.out, "CID", &cid);
            }
            Some("csd") => {
                args.bump();
                self.ready()?;
                let csd = self.card.csd()?;
                print_register(ctx.out, "CSD", &csd);
            }
            Some("block") => {
                args.bump();
                let block = args.uint("block")?;
                self.ready()?;
                let mut buf = [0u8; BLOCK_SIZE];
                self.card.read_block(block, &mut buf)?;
                print_hex(ctx.out, &buf);
            }
            _ => {
                let mut staged = ctx.proto.clone();
                configure(&mut staged, &mut args)?;
                if staged != *ctx.proto {
                    self.ready()?;
                    self.card.set_bus_width(staged.config.mmc_mut().bus_width)?;
                    *ctx.proto = staged;
                }
            }
        }
        Ok(args.used())
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        if self.open {
            self.card.close();
            self.open = false;
        }
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let device = ctx.proto.dev_num + 1;
        let width = ctx.proto.config.mmc_mut().bus_width;
        crate::cprint!(ctx.out, "Device: MMC{device}\r\nBus width: {width} bits\r\n");
    }
}

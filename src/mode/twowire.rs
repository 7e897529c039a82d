use super::{claim, not_ready, show_pins};
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, bit_order_name, print_bytes};
use crate::gpio::{PinMode, PinUse, SharedBoard, UsedPin};
use crate::session::RawWireConfig;
use crate::swd::{self, MAX_BRUTE_PINS, RawWire, TwoWire};
use crate::token::Token;
use crate::{BitOrder, BusError, reverse_u8};
use eh1::delay::DelayNs;

pub const CLK_PIN: u8 = 10;
pub const IO_PIN: u8 = 11;
pub const MAX_FREQUENCY: u32 = 1_000_000;

const GRAMMAR: &[&str] = &[
    "frequency",
    "pull",
    "msb-first",
    "lsb-first",
    "idcode",
    "brute",
    "show",
];

type Wire<D> = TwoWire<UsedPin, UsedPin, D>;

/// Clock plus bidirectional data, with the SWD probes on top.
pub struct TwoWireMode<D> {
    board: SharedBoard,
    delay: D,
    /// `(clk, io)`, moved by a successful brute force.
    pins: (u8, u8),
    wire: Option<Wire<D>>,
}

impl<D: DelayNs + Clone + Send> TwoWireMode<D> {
    pub fn new(board: SharedBoard, delay: D) -> Self {
        Self {
            board,
            delay,
            pins: (CLK_PIN, IO_PIN),
            wire: None,
        }
    }

    fn wire(&mut self) -> Result<&mut Wire<D>, BusError> {
        self.wire.as_mut().ok_or_else(|| not_ready("twowire"))
    }

    fn connect(
        board: &SharedBoard,
        delay: &D,
        (clk, io): (u8, u8),
        config: &RawWireConfig,
    ) -> Result<Wire<D>, BusError> {
        let clk = claim(board, clk, PinUse::TwoWire, PinMode::PushPull, config.pull)?;
        let io = claim(board, io, PinUse::TwoWire, PinMode::PushPull, config.pull)?;
        TwoWire::new(clk, io, delay.clone(), config.frequency)
    }

    fn open(&mut self, config: &RawWireConfig) -> Result<(), BusError> {
        self.wire = None;
        self.wire = Some(Self::connect(&self.board, &self.delay, self.pins, config)?);
        Ok(())
    }

    fn write_u8(&mut self, order: BitOrder, byte: u8) -> Result<(), BusError> {
        let wire = self.wire()?;
        match order {
            BitOrder::LsbFirst => wire.write_u8(byte),
            BitOrder::MsbFirst => wire.write_u8(reverse_u8(byte)),
        }
    }

    fn read_u8(&mut self, order: BitOrder) -> Result<u8, BusError> {
        let byte = self.wire()?.read_u8()?;
        Ok(match order {
            BitOrder::LsbFirst => byte,
            BitOrder::MsbFirst => reverse_u8(byte),
        })
    }

    fn brute(&mut self, ctx: &mut ModeCtx<'_>, pins: u32) -> Result<(), BusError> {
        crate::cprint!(ctx.out, "Bruteforce on {pins} pins.\r\n");
        if pins < 2 || pins > MAX_BRUTE_PINS as u32 {
            crate::cprint!(ctx.out, "Cannot use more than {MAX_BRUTE_PINS} pins.\r\n");
            return Err(BusError::invalid("brute force pin count out of range"));
        }
        let config = ctx.proto.config.rawwire_mut().clone();
        self.wire = None;
        let (board, delay) = (&self.board, &self.delay);
        let found = swd::brute_force(pins as u8, ctx.abort, |clk, io| {
            Self::connect(board, delay, (clk, io), &config)
        });
        match found {
            Ok(Some(hit)) => {
                crate::cprint!(
                    ctx.out,
                    "Device found. IDCODE : 0x{:08X}\r\nCLK: {}\tIO: {}\r\n",
                    hit.idcode,
                    hit.clk,
                    hit.io
                );
                log::info!("swd target on clk {} io {}", hit.clk, hit.io);
                self.pins = (hit.clk, hit.io);
            }
            Ok(None) => log::info!("no swd target on {pins} pins"),
            Err(e) => log::warn!("brute force stopped: {e}"),
        }
        self.open(&config)
    }
}

fn configure(config: &mut RawWireConfig, args: &mut Args<'_>) -> Result<(), BusError> {
    loop {
        if let Some(order) = args.bit_order() {
            config.bit_order = order;
            continue;
        }
        match args.peek_word() {
            Some("pull") => {
                args.bump();
                config.pull = args.pull()?;
            }
            Some("frequency") => {
                args.bump();
                let frequency = args.uint("frequency")?;
                if frequency == 0 || frequency > MAX_FREQUENCY {
                    return Err(BusError::invalid("Frequency too high"));
                }
                config.frequency = frequency;
            }
            _ => return Ok(()),
        }
    }
}

pub(crate) fn show_rawwire(ctx: &mut ModeCtx<'_>, name: &str) {
    let device = ctx.proto.dev_num + 1;
    let config = ctx.proto.config.rawwire_mut();
    crate::cprint!(
        ctx.out,
        "Device: {name}{device}\r\nGPIO resistor: {}\r\nFrequency: {}Hz\r\nBit order: {}\r\n",
        config.pull.name(),
        config.frequency,
        bit_order_name(config.bit_order)
    );
}

impl<D: DelayNs + Clone + Send> Personality for TwoWireMode<D> {
    fn id(&self) -> ModeId {
        ModeId::TwoWire
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
            .with_write(true)
            .with_read(true)
            .with_dump(true)
            .with_bit_ops()
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        configure(ctx.proto.config.rawwire_mut(), &mut args)?;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let config = ctx.proto.config.rawwire_mut().clone();
        self.open(&config)
    }

    fn exec(&mut self, ctx: &mut ModeCtx<'_>, tokens: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(tokens);
        match args.peek_word() {
            Some("idcode") => {
                args.bump();
                match swd::read_idcode(self.wire()?)? {
                    Some(idcode) if idcode != 0 && idcode != u32::MAX => {
                        crate::cprint!(ctx.out, "IDCODE : 0x{idcode:08X}\r\n");
                    }
                    _ => log::info!("no swd answer"),
                }
            }
            Some("brute") => {
                args.bump();
                let pins = args.uint("brute")?;
                self.brute(ctx, pins)?;
            }
            Some("show") => {
                args.bump();
                if args.peek_word() == Some("pins") {
                    args.bump();
                    show_pins(ctx.out, &[("CLK", self.pins.0), ("IO", self.pins.1)]);
                } else {
                    self.show(ctx);
                }
            }
            _ => {
                let config = ctx.proto.config.rawwire_mut();
                configure(config, &mut args)?;
                let config = config.clone();
                self.open(&config)?;
            }
        }
        Ok(args.used())
    }

    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        let order = ctx.proto.config.rawwire_mut().bit_order;
        for &byte in tx {
            self.write_u8(order, byte)?;
        }
        print_bytes(ctx.out, "WRITE", tx);
        Ok(())
    }

    fn read(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        self.dump(ctx, rx)?;
        print_bytes(ctx.out, "READ", rx);
        Ok(())
    }

    fn dump(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        let order = ctx.proto.config.rawwire_mut().bit_order;
        for slot in rx.iter_mut() {
            *slot = self.read_u8(order)?;
        }
        Ok(())
    }

    fn clock_high(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.wire()?.clock_high()?;
        crate::cprint!(ctx.out, "CLK HIGH\r\n");
        Ok(())
    }

    fn clock_low(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.wire()?.clock_low()?;
        crate::cprint!(ctx.out, "CLK LOW\r\n");
        Ok(())
    }

    fn clock_pulse(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.wire()?.clock()?;
        crate::cprint!(ctx.out, "CLOCK PULSE\r\n");
        Ok(())
    }

    fn data_high(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.wire()?.data(true)?;
        crate::cprint!(ctx.out, "SDA HIGH\r\n");
        Ok(())
    }

    fn data_low(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.wire()?.data(false)?;
        crate::cprint!(ctx.out, "SDA LOW\r\n");
        Ok(())
    }

    fn data_sample(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let bit = self.wire()?.read_bit_clock()?;
        crate::cprint!(ctx.out, "READ: 0x{:02X}\r\n", bit as u8);
        Ok(())
    }

    fn bit_read(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let bit = self.wire()?.read_bit()?;
        crate::cprint!(ctx.out, "READ: 0x{:02X}\r\n", bit as u8);
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        self.wire = None;
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        show_rawwire(ctx, "twowire");
    }
}

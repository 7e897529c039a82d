use super::{claim, not_ready, show_pins};
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, format_freq};
use crate::gpio::{PinMode, PinUse, SharedBoard, UsedPin};
use crate::i2c::{SPEEDS, SoftI2c, half_clock_ns};
use crate::session::I2cConfig;
use crate::token::Token;
use crate::BusError;
use eh1::delay::DelayNs;

pub const SCL_PIN: u8 = 6;
pub const SDA_PIN: u8 = 7;

const GRAMMAR: &[&str] = &["frequency", "pull", "scan", "show"];

type Bus<D> = SoftI2c<UsedPin, UsedPin, D>;

/// Software I2C master on two open-drain board pins.
pub struct I2cMode<D> {
    board: SharedBoard,
    /// Handed to the bus on `setup`, back here on `cleanup`.
    delay: Option<D>,
    bus: Option<Bus<D>>,
}

impl<D: DelayNs + Send> I2cMode<D> {
    pub fn new(board: SharedBoard, delay: D) -> Self {
        Self {
            board,
            delay: Some(delay),
            bus: None,
        }
    }

    fn bus(&mut self) -> Result<&mut Bus<D>, BusError> {
        self.bus.as_mut().ok_or_else(|| not_ready("i2c"))
    }

    fn open(&mut self, config: &I2cConfig) -> Result<(), BusError> {
        self.close();
        let delay = self.delay.take().ok_or_else(|| not_ready("i2c"))?;
        let lines = claim(&self.board, SCL_PIN, PinUse::I2c, PinMode::OpenDrain, config.pull)
            .and_then(|scl| {
                let sda = claim(&self.board, SDA_PIN, PinUse::I2c, PinMode::OpenDrain, config.pull)?;
                Ok((scl, sda))
            });
        let (scl, sda) = match lines {
            Ok(lines) => lines,
            Err(e) => {
                self.delay = Some(delay);
                return Err(e);
            }
        };
        self.bus = Some(SoftI2c::new(scl, sda, delay, config.frequency)?);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(bus) = self.bus.take() {
            let (_, _, delay) = bus.release();
            self.delay = Some(delay);
        }
    }

    /// The master still owes the ACK/NACK of the last byte it read.
    fn settle_ack(&mut self, ctx: &mut ModeCtx<'_>, ack: bool) -> Result<bool, BusError> {
        let config = ctx.proto.config.i2c_mut();
        if !config.ack_pending {
            return Ok(false);
        }
        config.ack_pending = false;
        self.bus()?.send_ack(ack)?;
        Ok(true)
    }

    fn scan(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.settle_ack(ctx, true)?;
        let found = self.bus()?.scan(ctx.abort)?;
        for address in &found {
            crate::cprint!(
                ctx.out,
                "Device found at address 0x{address:02x} (0x{:02x} W / 0x{:02x} R)\r\n",
                address << 1,
                (address << 1) + 1
            );
        }
        if found.is_empty() {
            crate::cprint!(ctx.out, "No devices found.\r\n");
        }
        Ok(())
    }
}

fn configure(config: &mut I2cConfig, args: &mut Args<'_>) -> Result<(), BusError> {
    while let Some(word) = args.peek_word() {
        match word {
            "frequency" => {
                args.bump();
                let frequency = args.uint("frequency")?;
                if half_clock_ns(frequency).is_none() {
                    return Err(BusError::invalid("Invalid frequency."));
                }
                config.frequency = frequency;
            }
            "pull" => {
                args.bump();
                config.pull = args.pull()?;
            }
            _ => break,
        }
    }
    Ok(())
}

impl<D: DelayNs + Send> Personality for I2cMode<D> {
    fn id(&self) -> ModeId {
        ModeId::I2c
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::bus()
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        configure(ctx.proto.config.i2c_mut(), &mut args)?;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let config = ctx.proto.config.i2c_mut().clone();
        self.open(&config)
    }

    fn exec(&mut self, ctx: &mut ModeCtx<'_>, tokens: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(tokens);
        match args.peek_word() {
            Some("scan") => {
                args.bump();
                self.scan(ctx)?;
            }
            Some("show") => {
                args.bump();
                if args.peek_word() == Some("pins") {
                    args.bump();
                    show_pins(ctx.out, &[("SCL", SCL_PIN), ("SDA", SDA_PIN)]);
                } else {
                    self.show(ctx);
                }
            }
            _ => {
                let mut config = ctx.proto.config.i2c_mut().clone();
                configure(&mut config, &mut args)?;
                if config.pull != ctx.proto.config.i2c_mut().pull {
                    self.open(&config)?;
                } else {
                    self.bus()?.set_frequency(config.frequency)?;
                }
                *ctx.proto.config.i2c_mut() = config;
            }
        }
        Ok(args.used())
    }

    fn start(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        if self.settle_ack(ctx, false)? {
            crate::cprint!(ctx.out, "NACK\r\n");
        }
        self.bus()?.start()?;
        crate::cprint!(ctx.out, "I2C START\r\n");
        Ok(())
    }

    fn stop(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        if self.settle_ack(ctx, false)? {
            crate::cprint!(ctx.out, "NACK\r\n");
        }
        self.bus()?.stop()?;
        crate::cprint!(ctx.out, "I2C STOP\r\n");
        Ok(())
    }

    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        if self.settle_ack(ctx, true)? {
            crate::cprint!(ctx.out, "ACK\r\n");
        }
        let bus = self.bus()?;
        crate::cprint!(ctx.out, "WRITE: ");
        let mut result = Ok(());
        for &byte in tx {
            let acked = bus.write_u8(byte);
            crate::cprint!(ctx.out, "0x{byte:02X} ");
            match acked {
                Ok(true) => crate::cprint!(ctx.out, "ACK "),
                Ok(false) => crate::cprint!(ctx.out, "NACK "),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        crate::cprint!(ctx.out, "\r\n");
        result
    }

    fn read(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        for slot in rx.iter_mut() {
            if self.settle_ack(ctx, true)? {
                crate::cprint!(ctx.out, "ACK\r\n");
            }
            *slot = self.bus()?.read_u8()?;
            crate::cprint!(ctx.out, "READ: 0x{:02X} ", *slot);
            ctx.proto.config.i2c_mut().ack_pending = true;
        }
        Ok(())
    }

    fn dump(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        for slot in rx.iter_mut() {
            self.settle_ack(ctx, true)?;
            *slot = self.bus()?.read_u8()?;
            ctx.proto.config.i2c_mut().ack_pending = true;
        }
        Ok(())
    }

    fn write_acked(&mut self, ctx: &mut ModeCtx<'_>, byte: u8) -> Result<bool, BusError> {
        self.settle_ack(ctx, true)?;
        self.bus()?.write_u8(byte)
    }

    fn send_ack(&mut self, ctx: &mut ModeCtx<'_>, ack: bool) -> Result<(), BusError> {
        self.settle_ack(ctx, ack).map(drop)
    }

    fn cleanup(&mut self, ctx: &mut ModeCtx<'_>) {
        ctx.proto.config.i2c_mut().ack_pending = false;
        self.close();
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let config = ctx.proto.config.i2c_mut();
        crate::cprint!(
            ctx.out,
            "GPIO resistor: {}\r\nFrequency: {} (",
            config.pull.name(),
            format_freq(config.frequency)
        );
        let others: Vec<String> = SPEEDS
            .iter()
            .filter(|&&(speed, _)| speed != config.frequency)
            .map(|&(speed, _)| format_freq(speed))
            .collect();
        crate::cprint!(ctx.out, "{})\r\n", others.join(", "));
    }
}

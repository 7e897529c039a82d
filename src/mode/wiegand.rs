use super::{claim, not_ready, show_pins};
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, print_bytes};
use crate::gpio::{IoLine, PinMode, PinUse, SharedBoard, UsedPin, gpio_fault};
use crate::session::WiegandConfig;
use crate::token::Token;
use crate::{BusError, CancelToken};
use eh1::delay::DelayNs;

pub const D0_PIN: u8 = 8;
pub const D1_PIN: u8 = 9;

/// Longest frame kept by a read, in bits.
pub const MAX_FRAME_BITS: usize = 255;

/// Sampling interval of the receiver; the timeouts are counted in polls.
const POLL_US: u32 = 10;

const GRAMMAR: &[&str] = &["pulse", "gap", "pull", "show"];

/// D1 active (bit 1).
const SENSE_ONE: u8 = 0b10;

/// Wiegand transmitter/receiver on two open-drain lines.
///
/// Both lines idle high. A `1` is a low pulse on D1, a `0` a low pulse on
/// D0; a frame ends when both lines stay idle for the frame timeout.
struct Wiegand<L, D> {
    d0: L,
    d1: L,
    delay: D,
}

impl<L: IoLine, D: DelayNs> Wiegand<L, D> {
    fn release(self) -> D {
        self.delay
    }

    fn idle(&mut self) -> Result<(), BusError> {
        for line in [&mut self.d0, &mut self.d1] {
            line.set_as_output().map_err(gpio_fault)?;
            line.set_high().map_err(gpio_fault)?;
        }
        Ok(())
    }

    fn write_bit(&mut self, config: &WiegandConfig, bit: bool) -> Result<(), BusError> {
        let line = if bit { &mut self.d1 } else { &mut self.d0 };
        line.set_low().map_err(gpio_fault)?;
        self.delay.delay_us(config.pulse_width_us);
        let line = if bit { &mut self.d1 } else { &mut self.d0 };
        line.set_high().map_err(gpio_fault)?;
        self.delay.delay_us(config.pulse_gap_us);
        Ok(())
    }

    /// MSB first.
    fn write_u8(&mut self, config: &WiegandConfig, byte: u8) -> Result<(), BusError> {
        for i in (0..8).rev() {
            self.write_bit(config, byte >> i & 1 == 1)?;
        }
        Ok(())
    }

    /// Active lines on two bits, D1 in bit 1; both lines are active low.
    fn sense(&mut self) -> Result<u8, BusError> {
        let d1 = self.d1.is_low().map_err(gpio_fault)? as u8;
        let d0 = self.d0.is_low().map_err(gpio_fault)? as u8;
        Ok(d1 << 1 | d0)
    }

    /// Receives one frame into `bits`, one line sense per bit.
    ///
    /// Returns with an empty frame when nothing starts within the first bit
    /// timeout.
    fn read_frame(
        &mut self,
        config: &WiegandConfig,
        abort: &CancelToken,
        bits: &mut heapless::Vec<u8, MAX_FRAME_BITS>,
    ) -> Result<(), BusError> {
        bits.clear();
        self.d0.set_as_input().map_err(gpio_fault)?;
        self.d1.set_as_input().map_err(gpio_fault)?;

        let first_bit_polls = config.first_bit_timeout_us / POLL_US;
        let frame_polls = config.frame_timeout_us / POLL_US;

        let mut idle = 0;
        while self.sense()? == 0 {
            if abort.is_cancelled() || idle >= first_bit_polls {
                return Ok(());
            }
            idle += 1;
            self.delay.delay_us(POLL_US);
        }

        idle = 0;
        while bits.len() < MAX_FRAME_BITS && !abort.is_cancelled() {
            let sense = self.sense()?;
            if sense == 0 {
                if idle >= frame_polls {
                    break;
                }
                idle += 1;
                self.delay.delay_us(POLL_US);
                continue;
            }
            // capacity checked by the loop condition
            let _ = bits.push(sense);
            let mut held = 0;
            while self.sense()? != 0 && held < frame_polls && !abort.is_cancelled() {
                held += 1;
                self.delay.delay_us(POLL_US);
            }
            idle = 0;
        }
        log::debug!("wiegand frame of {} bits", bits.len());
        Ok(())
    }
}

pub struct WiegandMode<D> {
    board: SharedBoard,
    delay: Option<D>,
    bus: Option<Wiegand<UsedPin, D>>,
}

impl<D: DelayNs + Send> WiegandMode<D> {
    pub fn new(board: SharedBoard, delay: D) -> Self {
        Self {
            board,
            delay: Some(delay),
            bus: None,
        }
    }

    fn bus(&mut self) -> Result<&mut Wiegand<UsedPin, D>, BusError> {
        self.bus.as_mut().ok_or_else(|| not_ready("wiegand"))
    }

    fn open(&mut self, config: &WiegandConfig) -> Result<(), BusError> {
        self.close();
        let delay = self.delay.take().ok_or_else(|| not_ready("wiegand"))?;
        let lines = claim(&self.board, D0_PIN, PinUse::Wiegand, PinMode::OpenDrain, config.pull)
            .and_then(|d0| {
                let d1 = claim(&self.board, D1_PIN, PinUse::Wiegand, PinMode::OpenDrain, config.pull)?;
                Ok((d0, d1))
            });
        match lines {
            Ok((d0, d1)) => {
                self.bus = Some(Wiegand { d0, d1, delay });
                Ok(())
            }
            Err(e) => {
                self.delay = Some(delay);
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        if let Some(bus) = self.bus.take() {
            self.delay = Some(bus.release());
        }
    }

    fn send_bit(&mut self, ctx: &mut ModeCtx<'_>, bit: bool) -> Result<(), BusError> {
        let config = ctx.proto.config.wiegand_mut().clone();
        let bus = self.bus()?;
        bus.idle()?;
        bus.write_bit(&config, bit)?;
        crate::cprint!(ctx.out, "BIT {}\r\n", bit as u8);
        Ok(())
    }
}

fn configure(config: &mut WiegandConfig, args: &mut Args<'_>) -> Result<(), BusError> {
    while let Some(word) = args.peek_word() {
        match word {
            "pulse" => {
                args.bump();
                config.pulse_width_us = args.uint("pulse")?;
            }
            "gap" => {
                args.bump();
                config.pulse_gap_us = args.uint("gap")?;
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

impl<D: DelayNs + Send> Personality for WiegandMode<D> {
    fn id(&self) -> ModeId {
        ModeId::Wiegand
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
            .with_write(true)
            .with_read(true)
            .with_data_high(true)
            .with_data_low(true)
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        configure(ctx.proto.config.wiegand_mut(), &mut args)?;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let config = ctx.proto.config.wiegand_mut().clone();
        self.open(&config)
    }

    fn exec(&mut self, ctx: &mut ModeCtx<'_>, tokens: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(tokens);
        if args.peek_word() == Some("show") {
            args.bump();
            if args.peek_word() == Some("pins") {
                args.bump();
                show_pins(ctx.out, &[("D0", D0_PIN), ("D1", D1_PIN)]);
            } else {
                self.show(ctx);
            }
            return Ok(args.used());
        }
        let config = ctx.proto.config.wiegand_mut();
        let pull = config.pull;
        configure(config, &mut args)?;
        if config.pull != pull {
            let config = config.clone();
            self.open(&config)?;
        }
        Ok(args.used())
    }

    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        let config = ctx.proto.config.wiegand_mut().clone();
        let bus = self.bus()?;
        bus.idle()?;
        for &byte in tx {
            bus.write_u8(&config, byte)?;
        }
        print_bytes(ctx.out, "WRITE", tx);
        Ok(())
    }

    /// Receives one frame per requested byte; each byte of `rx` gets the
    /// bit count of its frame.
    fn read(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        let config = ctx.proto.config.wiegand_mut().clone();
        let bus = self.bus()?;
        let mut bits = heapless::Vec::new();
        for slot in rx.iter_mut() {
            bus.read_frame(&config, ctx.abort, &mut bits)?;
            *slot = bits.len() as u8;
            crate::cprint!(ctx.out, "READ: ");
            for &sense in &bits {
                crate::cprint!(ctx.out, "{} ", (sense == SENSE_ONE) as u8);
            }
            crate::cprint!(ctx.out, "\r\n");
        }
        Ok(())
    }

    fn data_high(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.send_bit(ctx, true)
    }

    fn data_low(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.send_bit(ctx, false)
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        self.close();
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let device = ctx.proto.dev_num + 1;
        let config = ctx.proto.config.wiegand_mut();
        crate::cprint!(
            ctx.out,
            "Device: wiegand{device}\r\nGPIO resistor: {}\r\nPulse timing: {}us\r\nPulse gap timing: {}us\r\n",
            config.pull.name(),
            config.pulse_width_us,
            config.pulse_gap_us
        );
    }
}

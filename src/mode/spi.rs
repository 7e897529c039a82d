use super::{claim, not_ready, show_pins};
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, bit_order_name, format_freq, print_bytes};
use crate::gpio::{PinMode, PinUse, SharedBoard, UsedPin};
use crate::session::{ProtoState, SpiConfig};
use crate::token::Token;
use crate::BusError;
use eh1::spi::SpiBus;
use std::fmt;

/// Clock rates reachable by each SPI peripheral.
pub const SPEEDS: [[u32; 8]; 2] = [
    [
        320_000, 650_000, 1_310_000, 2_620_000, 5_250_000, 10_500_000, 21_000_000, 42_000_000,
    ],
    [
        160_000, 320_000, 650_000, 1_310_000, 2_620_000, 5_250_000, 10_500_000, 21_000_000,
    ],
];

/// Software chip select of each device.
pub const CS_PINS: [u8; 2] = [0, 1];

const GRAMMAR: &[&str] = &[
    "device",
    "frequency",
    "polarity",
    "phase",
    "msb-first",
    "lsb-first",
    "pull",
    "show",
];

/// A hardware SPI peripheral driving SCK, MOSI and MISO.
///
/// The personality only toggles chip select itself.
pub trait SpiPort: SpiBus<u8, Error = BusError> + Send {
    /// Reprograms clock rate, polarity, phase and bit order.
    fn apply(&mut self, config: &SpiConfig) -> Result<(), BusError>;
}

/// SPI master over one of up to two peripherals.
pub struct SpiMode<P> {
    board: SharedBoard,
    ports: Vec<P>,
    /// `(device, chip select)` of the open peripheral.
    open: Option<(usize, UsedPin)>,
}

impl<P: SpiPort> SpiMode<P> {
    /// `ports[0]` is device 1, `ports[1]` device 2.
    pub fn new(board: SharedBoard, ports: impl IntoIterator<Item = P>) -> Self {
        let ports: Vec<P> = ports.into_iter().take(SPEEDS.len()).collect();
        Self {
            board,
            ports,
            open: None,
        }
    }

    fn port(&mut self) -> Result<(&mut P, &mut UsedPin), BusError> {
        let (device, cs) = self.open.as_mut().ok_or_else(|| not_ready("spi"))?;
        Ok((&mut self.ports[*device], cs))
    }

    fn open(&mut self, proto: &ProtoState) -> Result<(), BusError> {
        self.open = None;
        let device = proto.dev_num as usize;
        let config = proto.config.clone().spi_mut().clone();
        let port = self
            .ports
            .get_mut(device)
            .ok_or_else(|| BusError::invalid("SPI device must be 1 or 2."))?;
        port.apply(&config)?;
        // idles high: deselected
        let cs = claim(&self.board, CS_PINS[device], PinUse::Spi, PinMode::PushPull, config.pull)?;
        log::info!("spi{} at {}Hz", device + 1, config.frequency);
        self.open = Some((device, cs));
        Ok(())
    }

    fn configure(
        &self,
        proto: &mut ProtoState,
        args: &mut Args<'_>,
        out: &mut dyn fmt::Write,
    ) -> Result<(), BusError> {
        loop {
            if let Some(order) = args.bit_order() {
                proto.config.spi_mut().bit_order = order;
                continue;
            }
            match args.peek_word() {
                Some("device") => {
                    args.bump();
                    proto.dev_num = args
                        .device(self.ports.len())
                        .map_err(|_| BusError::invalid("SPI device must be 1 or 2."))?;
                    *proto.config.spi_mut() = SpiConfig {
                        frequency: SPEEDS[proto.dev_num as usize][0],
                        ..SpiConfig::default()
                    };
                    crate::cprint!(out, "Note: SPI parameters have been reset to default values.\r\n");
                }
                Some("frequency") => {
                    args.bump();
                    let frequency = args.uint("frequency")?;
                    if !SPEEDS[proto.dev_num as usize].contains(&frequency) {
                        return Err(BusError::invalid("Invalid frequency."));
                    }
                    proto.config.spi_mut().frequency = frequency;
                }
                Some("polarity") => {
                    args.bump();
                    proto.config.spi_mut().polarity = binary(args, "Polarity device must be 0 or 1.")?;
                }
                Some("phase") => {
                    args.bump();
                    proto.config.spi_mut().phase = binary(args, "Phase device must be 0 or 1.")?;
                }
                Some("pull") => {
                    args.bump();
                    proto.config.spi_mut().pull = args.pull()?;
                }
                _ => return Ok(()),
            }
        }
    }
}

fn binary(args: &mut Args<'_>, message: &str) -> Result<bool, BusError> {
    match args.uint("0 or 1")? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(BusError::invalid(message)),
    }
}

impl<P: SpiPort> Personality for SpiMode<P> {
    fn id(&self) -> ModeId {
        ModeId::Spi
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::bus().with_write_read(true)
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        if self.ports.is_empty() {
            return Err(BusError::NoDevice);
        }
        self.configure(ctx.proto, &mut args, ctx.out)?;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.open(ctx.proto)
    }

    fn exec(&mut self, ctx: &mut ModeCtx<'_>, tokens: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(tokens);
        if args.peek_word() == Some("show") {
            args.bump();
            if args.peek_word() == Some("pins") {
                args.bump();
                show_pins(ctx.out, &[("CS", CS_PINS[ctx.proto.dev_num as usize])]);
            } else {
                self.show(ctx);
            }
            return Ok(args.used());
        }
        let mut staged = ctx.proto.clone();
        self.configure(&mut staged, &mut args, ctx.out)?;
        self.open(&staged)?;
        *ctx.proto = staged;
        Ok(args.used())
    }

    fn start(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.port()?.1.set(false);
        crate::cprint!(ctx.out, "/CS ENABLED\r\n");
        Ok(())
    }

    fn stop(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.port()?.1.set(true);
        crate::cprint!(ctx.out, "/CS DISABLED\r\n");
        Ok(())
    }

    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        let (port, _) = self.port()?;
        port.write(tx)?;
        port.flush()?;
        print_bytes(ctx.out, "WRITE", tx);
        Ok(())
    }

    fn read(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        self.dump(ctx, rx)?;
        print_bytes(ctx.out, "READ", rx);
        Ok(())
    }

    fn write_read(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        let (port, _) = self.port()?;
        port.transfer(rx, tx)?;
        port.flush()?;
        for (out, input) in tx.iter().zip(rx.iter()) {
            crate::cprint!(ctx.out, "WRITE: 0x{out:02X} READ: 0x{input:02X}\r\n");
        }
        Ok(())
    }

    fn dump(&mut self, _ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        let (port, _) = self.port()?;
        port.read(rx)?;
        port.flush()
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        self.open = None;
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let device = ctx.proto.dev_num as usize;
        let config = ctx.proto.config.spi_mut();
        let others: Vec<String> = SPEEDS[device]
            .iter()
            .filter(|&&speed| speed != config.frequency)
            .map(|&speed| format_freq(speed))
            .collect();
        crate::cprint!(
            ctx.out,
            "Device: SPI{}\r\nGPIO resistor: {}\r\nMode: master\r\nFrequency: {} ({})\r\n",
            device + 1,
            config.pull.name(),
            format_freq(config.frequency),
            others.join(", ")
        );
        crate::cprint!(
            ctx.out,
            "Polarity: {}\r\nPhase: {}\r\nBit order: {}\r\n",
            config.polarity as u8,
            config.phase as u8,
            bit_order_name(config.bit_order)
        );
    }
}

use super::{claim, not_ready, show_pins};
use super::twowire::show_rawwire;
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, print_bytes};
use crate::delay::half_period_ns;
use crate::gpio::{PinMode, PinUse, SharedBoard, UsedPin, gpio_fault};
use crate::session::RawWireConfig;
use crate::token::Token;
use crate::{BitOrder, BusError};
use eh1::delay::DelayNs;
use eh1::digital::{InputPin, OutputPin};

pub const CLK_PIN: u8 = 3;
pub const SDI_PIN: u8 = 4;
pub const SDO_PIN: u8 = 5;
pub const MAX_FREQUENCY: u32 = 1_000_000;

const GRAMMAR: &[&str] = &["frequency", "pull", "msb-first", "lsb-first", "show"];

/// Clock, data out and data in, all unidirectional.
struct ThreeWire<CLK, SDO, SDI, D> {
    clk: CLK,
    sdo: SDO,
    sdi: SDI,
    delay: D,
    half_period_ns: u32,
    order: BitOrder,
}

impl<CLK, SDO, SDI, D> ThreeWire<CLK, SDO, SDI, D>
where
    CLK: OutputPin,
    SDO: OutputPin,
    SDI: InputPin,
    D: DelayNs,
{
    fn new(mut clk: CLK, mut sdo: SDO, sdi: SDI, delay: D, config: &RawWireConfig) -> Result<Self, BusError> {
        clk.set_low().map_err(gpio_fault)?;
        sdo.set_low().map_err(gpio_fault)?;
        Ok(Self {
            clk,
            sdo,
            sdi,
            delay,
            half_period_ns: half_period_ns(config.frequency),
            order: config.bit_order,
        })
    }

    fn release(self) -> D {
        self.delay
    }

    fn clock_high(&mut self) -> Result<(), BusError> {
        self.delay.delay_ns(self.half_period_ns);
        self.clk.set_high().map_err(gpio_fault)
    }

    fn clock_low(&mut self) -> Result<(), BusError> {
        self.delay.delay_ns(self.half_period_ns);
        self.clk.set_low().map_err(gpio_fault)
    }

    fn clock(&mut self) -> Result<(), BusError> {
        self.clock_high()?;
        self.clock_low()
    }

    fn data(&mut self, high: bool) -> Result<(), BusError> {
        if high {
            self.sdo.set_high().map_err(gpio_fault)
        } else {
            self.sdo.set_low().map_err(gpio_fault)
        }
    }

    fn read_bit(&mut self) -> Result<bool, BusError> {
        self.sdi.is_high().map_err(gpio_fault)
    }

    fn read_bit_clock(&mut self) -> Result<bool, BusError> {
        self.clock()?;
        self.read_bit()
    }

    /// Shifts `tx` out on SDO while sampling SDI after every clock.
    fn transfer_u8(&mut self, tx: u8) -> Result<u8, BusError> {
        let mut rx = 0;
        for i in 0..8 {
            let shift = match self.order {
                BitOrder::MsbFirst => 7 - i,
                BitOrder::LsbFirst => i,
            };
            self.data(tx >> shift & 1 == 1)?;
            rx |= (self.read_bit_clock()? as u8) << shift;
        }
        Ok(rx)
    }

    fn write_u8(&mut self, tx: u8) -> Result<(), BusError> {
        for i in 0..8 {
            let shift = match self.order {
                BitOrder::MsbFirst => 7 - i,
                BitOrder::LsbFirst => i,
            };
            self.data(tx >> shift & 1 == 1)?;
            self.clock()?;
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, BusError> {
        let mut rx = 0;
        for i in 0..8 {
            let shift = match self.order {
                BitOrder::MsbFirst => 7 - i,
                BitOrder::LsbFirst => i,
            };
            rx |= (self.read_bit_clock()? as u8) << shift;
        }
        Ok(rx)
    }
}

type Wire<D> = ThreeWire<UsedPin, UsedPin, UsedPin, D>;

pub struct ThreeWireMode<D> {
    board: SharedBoard,
    delay: Option<D>,
    wire: Option<Wire<D>>,
}

impl<D: DelayNs + Send> ThreeWireMode<D> {
    pub fn new(board: SharedBoard, delay: D) -> Self {
        Self {
            board,
            delay: Some(delay),
            wire: None,
        }
    }

    fn wire(&mut self) -> Result<&mut Wire<D>, BusError> {
        self.wire.as_mut().ok_or_else(|| not_ready("threewire"))
    }

    fn open(&mut self, config: &RawWireConfig) -> Result<(), BusError> {
        self.close();
        let delay = self.delay.take().ok_or_else(|| not_ready("threewire"))?;
        let board = &self.board;
        let lines = claim(board, CLK_PIN, PinUse::ThreeWire, PinMode::PushPull, config.pull)
            .and_then(|clk| {
                let sdi = claim(board, SDI_PIN, PinUse::ThreeWire, PinMode::Input, config.pull)?;
                let sdo = claim(board, SDO_PIN, PinUse::ThreeWire, PinMode::PushPull, config.pull)?;
                Ok((clk, sdi, sdo))
            });
        let (clk, sdi, sdo) = match lines {
            Ok(lines) => lines,
            Err(e) => {
                self.delay = Some(delay);
                return Err(e);
            }
        };
        self.wire = Some(ThreeWire::new(clk, sdo, sdi, delay, config)?);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(wire) = self.wire.take() {
            self.delay = Some(wire.release());
        }
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

impl<D: DelayNs + Send> Personality for ThreeWireMode<D> {
    fn id(&self) -> ModeId {
        ModeId::ThreeWire
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
            .with_write(true)
            .with_read(true)
            .with_write_read(true)
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
        if args.peek_word() == Some("show") {
            args.bump();
            if args.peek_word() == Some("pins") {
                args.bump();
                show_pins(
                    ctx.out,
                    &[("CLK", CLK_PIN), ("SDI", SDI_PIN), ("SDO", SDO_PIN)],
                );
            } else {
                self.show(ctx);
            }
            return Ok(args.used());
        }
        let config = ctx.proto.config.rawwire_mut();
        configure(config, &mut args)?;
        let config = config.clone();
        self.open(&config)?;
        Ok(args.used())
    }

    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        let wire = self.wire()?;
        for &byte in tx {
            wire.write_u8(byte)?;
        }
        print_bytes(ctx.out, "WRITE", tx);
        Ok(())
    }

    fn read(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        self.dump(ctx, rx)?;
        print_bytes(ctx.out, "READ", rx);
        Ok(())
    }

    fn write_read(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        let wire = self.wire()?;
        for (&out, slot) in tx.iter().zip(rx.iter_mut()) {
            *slot = wire.transfer_u8(out)?;
            crate::cprint!(ctx.out, "WRITE: 0x{out:02X} READ: 0x{:02X}\r\n", *slot);
        }
        Ok(())
    }

    fn dump(&mut self, _ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        let wire = self.wire()?;
        for slot in rx.iter_mut() {
            *slot = wire.read_u8()?;
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
        crate::cprint!(ctx.out, "SDO HIGH\r\n");
        Ok(())
    }

    fn data_low(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.wire()?.data(false)?;
        crate::cprint!(ctx.out, "SDO LOW\r\n");
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
        self.close();
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        show_rawwire(ctx, "threewire");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::console::Console;
    use crate::delay::NoDelay;
    use crate::gpio::sim::SimPort;
    use crate::mode::test::{run, selected};

    fn threewire(args: &str) -> (Console, SimPort) {
        selected(|board| ThreeWireMode::new(board, NoDelay), args)
    }

    fn sdo_levels(port: &SimPort) -> Vec<bool> {
        port.0
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(pin, _)| *pin == SDO_PIN)
            .map(|&(_, level)| level)
            .collect()
    }

    #[test]
    fn pins_and_show() {
        let (mut console, port) = threewire("frequency 500000");
        assert_eq!(port.mode(CLK_PIN), PinMode::PushPull);
        assert_eq!(port.mode(SDI_PIN), PinMode::Input);
        assert_eq!(port.mode(SDO_PIN), PinMode::PushPull);
        assert_eq!(
            run(&mut console, "show"),
            "Device: threewire1\r\nGPIO resistor: floating\r\nFrequency: 500000Hz\r\nBit order: MSB first\r\n"
        );
        assert_eq!(
            run(&mut console, "show pins"),
            "CLK: 3\r\nSDI: 4\r\nSDO: 5\r\n"
        );
    }

    #[test]
    fn write_honours_bit_order() {
        let (mut console, port) = threewire("lsb-first");
        port.0.lock().unwrap().writes.clear();
        assert_eq!(run(&mut console, "0x03"), "WRITE: 0x03\r\n");
        assert_eq!(
            sdo_levels(&port),
            [true, true, false, false, false, false, false, false]
        );
    }

    #[test]
    fn full_duplex_transfer() {
        let (mut console, port) = threewire("");
        port.drive(SDI_PIN, Some(true));
        assert_eq!(
            run(&mut console, "{ 0x5a 0x00 }"),
            "WRITE: 0x5A READ: 0xFF\r\nWRITE: 0x00 READ: 0xFF\r\n"
        );
        port.drive(SDI_PIN, Some(false));
        assert_eq!(run(&mut console, "r"), "READ: 0x00\r\n");
    }

    #[test]
    fn bit_operators() {
        let (mut console, port) = threewire("");
        assert_eq!(run(&mut console, "- /"), "SDO HIGH\r\nCLK HIGH\r\n");
        assert!(port.output(SDO_PIN) && port.output(CLK_PIN));
        assert_eq!(run(&mut console, "_ \\ ^"), "SDO LOW\r\nCLK LOW\r\nCLOCK PULSE\r\n");
        port.drive(SDI_PIN, Some(true));
        assert_eq!(run(&mut console, ". !"), "READ: 0x01\r\nREAD: 0x01\r\n");
        let mut out = String::new();
        assert!(console.run_line("frequency 2000000", &mut out).is_err());
    }
}

use super::{claim, not_ready, show_pins};
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, bit_order_name, print_bytes};
use crate::gpio::{PinMode, PinUse, SharedBoard, UsedPin};
use crate::onewire::{OneWire, OneWireBus, Search};
use crate::session::OneWireConfig;
use crate::token::Token;
use crate::{BitOrder, BusError, CancelToken, reverse_u8};
use core::fmt;
use eh1::delay::DelayNs;

pub const PIN: u8 = 11;

const GRAMMAR: &[&str] = &["pull", "msb-first", "lsb-first", "scan", "show"];

/// 1-Wire master on one open-drain pin.
pub struct OneWireMode<D> {
    board: SharedBoard,
    delay: Option<D>,
    bus: Option<OneWire<UsedPin, D>>,
}

impl<D: DelayNs + Send> OneWireMode<D> {
    pub fn new(board: SharedBoard, delay: D) -> Self {
        Self {
            board,
            delay: Some(delay),
            bus: None,
        }
    }

    fn bus(&mut self) -> Result<&mut OneWire<UsedPin, D>, BusError> {
        self.bus.as_mut().ok_or_else(|| not_ready("onewire"))
    }

    fn open(&mut self, config: &OneWireConfig) -> Result<(), BusError> {
        self.close();
        let delay = self.delay.take().ok_or_else(|| not_ready("onewire"))?;
        match claim(&self.board, PIN, PinUse::OneWire, PinMode::OpenDrain, config.pull) {
            Ok(pin) => {
                self.bus = Some(OneWire::new(pin, delay)?);
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
            self.delay = Some(bus.release().1);
        }
    }

    fn scan(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let bus = self.bus.as_mut().ok_or_else(|| not_ready("onewire"))?;
        scan(bus, ctx.out, ctx.abort)
    }

    fn ordered(config: &OneWireConfig, byte: u8) -> u8 {
        match config.bit_order {
            BitOrder::LsbFirst => byte,
            BitOrder::MsbFirst => reverse_u8(byte),
        }
    }
}

/// Lists every device on the bus. A ROM code failing its CRC is reported
/// and skipped.
fn scan<B: OneWireBus + ?Sized>(
    bus: &mut B,
    out: &mut dyn fmt::Write,
    abort: &CancelToken,
) -> Result<(), BusError> {
    let mut search = Search::new();
    crate::cprint!(out, "Discovered devices : ");
    while !abort.is_cancelled() {
        let rom = match search.next(bus) {
            Ok(Some(rom)) => rom,
            Ok(None) => break,
            Err(BusError::Crc) => {
                crate::cprint!(out, "\r\nCRC error : ");
                for byte in search.rom() {
                    crate::cprint!(out, "{byte:02X} ");
                }
                continue;
            }
            Err(e) => return Err(e),
        };
        crate::cprint!(out, "\r\n");
        for byte in rom {
            crate::cprint!(out, "{byte:02X} ");
        }
    }
    crate::cprint!(out, "\r\n");
    Ok(())
}

fn configure(config: &mut OneWireConfig, args: &mut Args<'_>) -> Result<(), BusError> {
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
            _ => return Ok(()),
        }
    }
}

impl<D: DelayNs + Send> Personality for OneWireMode<D> {
    fn id(&self) -> ModeId {
        ModeId::OneWire
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::bus()
            .with_data_high(true)
            .with_data_low(true)
            .with_bit_read(true)
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        configure(ctx.proto.config.onewire_mut(), &mut args)?;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let config = ctx.proto.config.onewire_mut().clone();
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
                    show_pins(ctx.out, &[("PIN", PIN)]);
                } else {
                    self.show(ctx);
                }
            }
            _ => {
                let config = ctx.proto.config.onewire_mut();
                let pull = config.pull;
                configure(config, &mut args)?;
                if config.pull != pull {
                    let config = config.clone();
                    self.open(&config)?;
                }
            }
        }
        Ok(args.used())
    }

    /// Reset pulse.
    fn start(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let presence = self.bus()?.reset()?;
        log::debug!("1-wire reset, presence {presence}");
        Ok(())
    }

    fn stop(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        Ok(())
    }

    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        let config = ctx.proto.config.onewire_mut().clone();
        let bus = self.bus()?;
        for &byte in tx {
            bus.write_u8(Self::ordered(&config, byte))?;
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
        let config = ctx.proto.config.onewire_mut().clone();
        let bus = self.bus()?;
        for slot in rx.iter_mut() {
            *slot = Self::ordered(&config, bus.read_u8()?);
        }
        Ok(())
    }

    fn data_high(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.bus()?.set_line(true)?;
        crate::cprint!(ctx.out, "PIN HIGH\r\n");
        Ok(())
    }

    fn data_low(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.bus()?.set_line(false)?;
        crate::cprint!(ctx.out, "PIN LOW\r\n");
        Ok(())
    }

    fn bit_read(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let bit = self.bus()?.read_bit()?;
        crate::cprint!(ctx.out, "READ: 0x{:02X}\r\n", bit as u8);
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        self.close();
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let device = ctx.proto.dev_num + 1;
        let config = ctx.proto.config.onewire_mut();
        crate::cprint!(
            ctx.out,
            "Device: onewire{device}\r\nGPIO resistor: {}\r\nBit order: {}\r\n",
            config.pull.name(),
            bit_order_name(config.bit_order)
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::console::Console;
    use crate::delay::NoDelay;
    use crate::gpio::sim::SimPort;
    use crate::mode::test::{run, selected};

    fn onewire(args: &str) -> (Console, SimPort) {
        selected(|board| OneWireMode::new(board, NoDelay), args)
    }

    #[test]
    fn pin_and_configuration() {
        let (mut console, port) = onewire("pull up msb-first");
        assert_eq!(console.prompt(), "onewire1> ");
        assert_eq!(port.mode(PIN), PinMode::OpenDrain);
        assert_eq!(
            run(&mut console, "show"),
            "Device: onewire1\r\nGPIO resistor: pull-up\r\nBit order: MSB first\r\n"
        );
        run(&mut console, "lsb-first");
        assert_eq!(
            run(&mut console, "show"),
            "Device: onewire1\r\nGPIO resistor: pull-up\r\nBit order: LSB first\r\n"
        );
        assert_eq!(run(&mut console, "show pins"), "PIN: 11\r\n");
    }

    #[test]
    fn empty_bus_scan() {
        let (mut console, _) = onewire("");
        // nothing pulls the line low: no presence pulse
        assert_eq!(run(&mut console, "scan"), "Discovered devices : \r\n");
    }

    #[test]
    fn scan_reports_bad_crc_and_goes_on() {
        use crate::onewire::test::{SimBus, with_crc};

        let good_a = with_crc([0x28, 0, 0, 0, 0, 0, 0, 0]);
        let mut bad = with_crc([0x28, 0, 0, 0, 0, 0, 0x01, 0]);
        bad[7] ^= 0x80;
        let good_b = with_crc([0x28, 0x80, 0, 0, 0, 0, 0, 0]);
        let mut bus = SimBus::new(vec![good_a, bad, good_b]);
        let mut out = String::new();
        scan(&mut bus, &mut out, &CancelToken::new()).unwrap();

        let hex = |rom: [u8; 8]| rom.iter().map(|b| format!("{b:02X} ")).collect::<String>();
        assert_eq!(
            out,
            format!(
                "Discovered devices : \r\n{}\r\nCRC error : {}\r\n{}\r\n",
                hex(good_a),
                hex(bad),
                hex(good_b)
            )
        );
    }

    #[test]
    fn write_slots() {
        let (mut console, port) = onewire("");
        port.0.lock().unwrap().writes.clear();
        assert_eq!(run(&mut console, "0x01"), "WRITE: 0x01\r\n");
        let writes: Vec<bool> = port
            .0
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(pin, _)| *pin == PIN)
            .map(|&(_, level)| level)
            .collect();
        // two register writes per slot, LSB first: one `1` slot, seven `0` slots
        assert_eq!(writes.len(), 16);
        assert!(writes.chunks(2).all(|slot| slot == [false, true]));
    }

    #[test]
    fn bit_operators() {
        let (mut console, port) = onewire("");
        assert_eq!(run(&mut console, "_"), "PIN LOW\r\n");
        assert!(!port.output(PIN));
        assert_eq!(run(&mut console, "-"), "PIN HIGH\r\n");
        assert!(port.output(PIN));
        port.drive(PIN, Some(false));
        assert_eq!(run(&mut console, "."), "READ: 0x00\r\n");
    }
}

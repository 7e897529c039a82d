use super::{claim, not_ready, show_pins};
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, print_bytes};
use crate::gpio::{PinMode, PinUse, SharedBoard, UsedPin};
use crate::jtag::Jtag;
use crate::session::JtagConfig;
use crate::token::Token;
use crate::BusError;
use eh1::delay::DelayNs;

/// Highest pin a JTAG line may be moved to.
pub const MAX_PIN: u8 = 11;
pub const MAX_FREQUENCY: u32 = 1_000_000;

/// Ones shifted into the instruction registers to load BYPASS everywhere.
const IR_FILL_BITS: usize = 1000;

const GRAMMAR: &[&str] = &[
    "idcode",
    "bypass",
    "tck",
    "tms",
    "tdi",
    "tdo",
    "pull",
    "frequency",
    "show",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pins {
    tck: u8,
    tms: u8,
    tdi: u8,
    tdo: u8,
}

impl Default for Pins {
    fn default() -> Self {
        Self {
            tck: 11,
            tms: 10,
            tdi: 8,
            tdo: 9,
        }
    }
}

type Tap<D> = Jtag<UsedPin, UsedPin, D>;

/// JTAG master with movable TCK/TMS/TDI/TDO lines.
pub struct JtagMode<D> {
    board: SharedBoard,
    delay: Option<D>,
    pins: Pins,
    tap: Option<Tap<D>>,
}

impl<D: DelayNs + Send> JtagMode<D> {
    pub fn new(board: SharedBoard, delay: D) -> Self {
        Self {
            board,
            delay: Some(delay),
            pins: Pins::default(),
            tap: None,
        }
    }

    fn tap(&mut self) -> Result<&mut Tap<D>, BusError> {
        self.tap.as_mut().ok_or_else(|| not_ready("jtag"))
    }

    fn claim_lines(&self, pull: crate::Pull) -> Result<[UsedPin; 4], BusError> {
        let Pins { tck, tms, tdi, tdo } = self.pins;
        let output = |pin| claim(&self.board, pin, PinUse::Jtag, PinMode::PushPull, pull);
        Ok([
            output(tck)?,
            output(tms)?,
            output(tdi)?,
            claim(&self.board, tdo, PinUse::Jtag, PinMode::Input, pull)?,
        ])
    }

    fn open(&mut self, config: &JtagConfig) -> Result<(), BusError> {
        self.close();
        let delay = self.delay.take().ok_or_else(|| not_ready("jtag"))?;
        match self.claim_lines(config.pull) {
            Ok([tck, tms, tdi, tdo]) => {
                self.tap = Some(Jtag::new(tck, tms, tdi, tdo, delay, config.frequency)?);
                Ok(())
            }
            Err(e) => {
                self.delay = Some(delay);
                Err(e)
            }
        }
    }

    fn close(&mut self) {
        if let Some(tap) = self.tap.take() {
            self.delay = Some(tap.release().4);
        }
    }

    fn idcode(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let chain = self.tap()?.scan_with(true)?;
        if chain.is_empty() {
            log::info!("no jtag device answered");
        }
        for idcode in chain.into_iter().flatten() {
            crate::cprint!(ctx.out, "Device found. IDCODE : {idcode:08X}\r\n");
        }
        Ok(())
    }

    fn bypass(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let count = self.tap()?.count_devices(IR_FILL_BITS)?;
        if count.is_none() {
            log::warn!("bypass bit never came back out of the chain");
        }
        crate::cprint!(ctx.out, "Number of devices found : {}\r\n", count.unwrap_or(0));
        Ok(())
    }
}

fn pin_argument(args: &mut Args<'_>, keyword: &str) -> Result<u8, BusError> {
    let pin = args.uint(keyword)?;
    if pin > MAX_PIN as u32 {
        return Err(BusError::invalid(format!(
            "Pin must be between 0 and {MAX_PIN}."
        )));
    }
    Ok(pin as u8)
}

fn configure(config: &mut JtagConfig, pins: &mut Pins, args: &mut Args<'_>) -> Result<(), BusError> {
    while let Some(word) = args.peek_word() {
        match word {
            "pull" => {
                args.bump();
                config.pull = args.pull()?;
            }
            "frequency" => {
                args.bump();
                let frequency = args.uint("frequency")?;
                if frequency == 0 || frequency > MAX_FREQUENCY {
                    return Err(BusError::invalid("Frequency too high"));
                }
                config.frequency = frequency;
            }
            "tck" | "tms" | "tdi" | "tdo" => {
                args.bump();
                let pin = pin_argument(args, word)?;
                match word {
                    "tck" => pins.tck = pin,
                    "tms" => pins.tms = pin,
                    "tdi" => pins.tdi = pin,
                    _ => pins.tdo = pin,
                }
            }
            _ => break,
        }
    }
    Ok(())
}

impl<D: DelayNs + Send> Personality for JtagMode<D> {
    fn id(&self) -> ModeId {
        ModeId::Jtag
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::bus().with_bit_ops()
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        let mut pins = Pins::default();
        configure(ctx.proto.config.jtag_mut(), &mut pins, &mut args)?;
        self.pins = pins;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let config = ctx.proto.config.jtag_mut().clone();
        self.open(&config)
    }

    fn exec(&mut self, ctx: &mut ModeCtx<'_>, tokens: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(tokens);
        match args.peek_word() {
            Some("idcode") => {
                args.bump();
                self.idcode(ctx)?;
            }
            Some("bypass") => {
                args.bump();
                self.bypass(ctx)?;
            }
            Some("show") => {
                args.bump();
                if args.peek_word() == Some("pins") {
                    args.bump();
                    let Pins { tck, tms, tdi, tdo } = self.pins;
                    show_pins(
                        ctx.out,
                        &[("TMS", tms), ("TCK", tck), ("TDI", tdi), ("TDO", tdo)],
                    );
                } else {
                    self.show(ctx);
                }
            }
            _ => {
                let mut config = ctx.proto.config.jtag_mut().clone();
                let mut pins = self.pins;
                configure(&mut config, &mut pins, &mut args)?;
                let current = ctx.proto.config.jtag_mut();
                if pins != self.pins || config.pull != current.pull {
                    let previous = (std::mem::replace(&mut self.pins, pins), current.clone());
                    if let Err(e) = self.open(&config) {
                        // put the lines back where they were
                        self.pins = previous.0;
                        self.open(&previous.1)?;
                        return Err(e);
                    }
                } else {
                    self.tap()?.set_frequency(config.frequency);
                }
                *ctx.proto.config.jtag_mut() = config;
            }
        }
        Ok(args.used())
    }

    fn start(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.tap()?.set_tms(true)?;
        crate::cprint!(ctx.out, "TMS HIGH\r\n");
        Ok(())
    }

    fn stop(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.tap()?.set_tms(false)?;
        crate::cprint!(ctx.out, "TMS LOW\r\n");
        Ok(())
    }

    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        let tap = self.tap()?;
        for &byte in tx {
            tap.write_u8(byte)?;
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
        let tap = self.tap()?;
        for slot in rx.iter_mut() {
            *slot = tap.read_u8()?;
        }
        Ok(())
    }

    fn clock_high(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.tap()?.clock_high()?;
        crate::cprint!(ctx.out, "CLK HIGH\r\n");
        Ok(())
    }

    fn clock_low(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.tap()?.clock_low()?;
        crate::cprint!(ctx.out, "CLK LOW\r\n");
        Ok(())
    }

    fn clock_pulse(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let tap = self.tap()?;
        tap.clock_high()?;
        tap.clock_low()?;
        crate::cprint!(ctx.out, "CLOCK PULSE\r\n");
        Ok(())
    }

    fn data_high(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.tap()?.set_tdi(true)?;
        crate::cprint!(ctx.out, "TDI HIGH\r\n");
        Ok(())
    }

    fn data_low(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.tap()?.set_tdi(false)?;
        crate::cprint!(ctx.out, "TDI LOW\r\n");
        Ok(())
    }

    fn data_sample(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let bit = self.tap()?.read_bit_clock()?;
        crate::cprint!(ctx.out, "READ: 0x{:02X}\r\n", bit as u8);
        Ok(())
    }

    fn bit_read(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let bit = self.tap()?.read_tdo()?;
        crate::cprint!(ctx.out, "READ: 0x{:02X}\r\n", bit as u8);
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        self.close();
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let device = ctx.proto.dev_num + 1;
        let config = ctx.proto.config.jtag_mut();
        crate::cprint!(
            ctx.out,
            "Device: JTAG{device}\r\nGPIO resistor: {}\r\nFrequency: {}Hz\r\n",
            config.pull.name(),
            config.frequency
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

    fn jtag(args: &str) -> (Console, SimPort) {
        selected(|board| JtagMode::new(board, NoDelay), args)
    }

    #[test]
    fn lines_and_show() {
        let (mut console, port) = jtag("");
        assert_eq!(console.prompt(), "jtag1> ");
        assert_eq!(port.mode(11), PinMode::PushPull);
        assert_eq!(port.mode(9), PinMode::Input);
        assert_eq!(
            run(&mut console, "show"),
            "Device: JTAG1\r\nGPIO resistor: pull-up\r\nFrequency: 1000000Hz\r\n"
        );
        run(&mut console, "tdo 3");
        assert_eq!(
            run(&mut console, "show pins"),
            "TMS: 10\r\nTCK: 11\r\nTDI: 8\r\nTDO: 3\r\n"
        );
        let board = console.board.lock().unwrap();
        assert_eq!(board.usage(9), None);
        assert_eq!(board.usage(3), Some(PinUse::Jtag));
    }

    #[test]
    fn bad_pin_is_rejected() {
        let (mut console, _) = jtag("");
        let mut out = String::new();
        assert!(console.run_line("tck 12", &mut out).is_err());
        assert!(console.run_line("tck 8", &mut out).is_err());
        assert_eq!(run(&mut console, "show pins"), "TMS: 10\r\nTCK: 11\r\nTDI: 8\r\nTDO: 9\r\n");
        assert_eq!(console.board.lock().unwrap().usage(11), Some(PinUse::Jtag));
    }

    #[test]
    fn open_chain() {
        let (mut console, port) = jtag("");
        // TDO pulled up: the bypass bit comes straight back
        assert_eq!(
            run(&mut console, "bypass"),
            "Number of devices found : 0\r\n"
        );
        assert_eq!(run(&mut console, "idcode"), "");
        port.drive(9, Some(false));
        assert_eq!(run(&mut console, "idcode"), "");
    }

    #[test]
    fn bit_operators() {
        let (mut console, port) = jtag("");
        assert_eq!(run(&mut console, "[ -"), "TMS HIGH\r\nTDI HIGH\r\n");
        assert!(port.output(10) && port.output(8));
        assert_eq!(run(&mut console, "] _"), "TMS LOW\r\nTDI LOW\r\n");
        assert!(!port.output(10) && !port.output(8));
        assert_eq!(run(&mut console, "/ \\ ^"), "CLK HIGH\r\nCLK LOW\r\nCLOCK PULSE\r\n");
        port.drive(9, Some(false));
        assert_eq!(run(&mut console, ". ! r"), "READ: 0x00\r\nREAD: 0x00\r\nREAD: 0x00\r\n");
        port.0.lock().unwrap().writes.clear();
        assert_eq!(run(&mut console, "0x01"), "WRITE: 0x01\r\n");
        let tdi: Vec<bool> = port
            .0
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|(pin, _)| *pin == 8)
            .map(|&(_, level)| level)
            .collect();
        assert_eq!(tdi, [true, false, false, false, false, false, false, false]);
    }
}

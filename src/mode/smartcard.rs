use super::uart::check_speed;
use super::{claim, not_ready, show_pins};
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, format_freq, print_bytes, print_hex};
use crate::gpio::{PinMode, PinUse, SharedBoard, UsedPin};
use crate::session::{Convention, ProtoState, SmartcardConfig};
use crate::token::Token;
use crate::{BusError, Pull, reverse_u8};
use eh1::delay::DelayNs;
use std::fmt;

/// Card reset line.
pub const RST_PIN: u8 = 2;

/// Longest possible Answer To Reset.
const ATR_MAX: usize = 33;

/// TS of a direct convention card.
const TS_DIRECT: u8 = 0x3b;
/// TS of an inverse convention card, as seen by a direct receiver.
const TS_INVERSE_RAW: u8 = 0x03;
const TS_INVERSE: u8 = 0x3f;

/// Clock rate conversion factor, indexed by the high nibble of TA1.
/// Zero marks reserved values.
const FI: [u32; 16] = [
    372, 372, 558, 744, 1116, 1488, 1860, 0, 0, 512, 768, 1024, 1536, 2048, 0, 0,
];
/// Baud rate adjustment factor, indexed by the low nibble of TA1.
const DI: [u32; 16] = [0, 1, 2, 4, 8, 16, 32, 64, 12, 20, 0, 0, 0, 0, 0, 0];
/// Maximum card clock for each FI value, kHz.
const FMAX_KHZ: [u32; 16] = [
    4_000, 5_000, 6_000, 8_000, 12_000, 16_000, 20_000, 0, 0, 5_000, 7_500, 10_000, 15_000,
    20_000, 0, 0,
];

const GRAMMAR: &[&str] = &[
    "speed",
    "prescaler",
    "guardtime",
    "convention",
    "normal",
    "inverse",
    "timeout",
    "atr",
    "query",
    "show",
];

/// An ISO 7816 smartcard interface: clock, half-duplex I/O, /VCC and
/// card detect. The reset line is a board pin driven by the personality.
pub trait Smartcard: Send {
    /// Programs clock prescaler, baud rate and guard time. Returns the
    /// baud rate reached.
    fn apply(&mut self, config: &SmartcardConfig) -> Result<u32, BusError>;

    fn write(&mut self, data: &[u8]) -> Result<(), BusError>;

    /// Fills `buf` until it is full or nothing arrived for `timeout_ms`.
    /// Returns the number of bytes received.
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, BusError>;

    /// Drives the active-low /VCC line; low powers the card.
    fn set_vcc(&mut self, high: bool) -> Result<(), BusError>;

    /// A card sits in the slot.
    fn card_detect(&mut self) -> bool;

    /// Clock supplied to the card, Hz.
    fn clock_hz(&self) -> u32;

    fn close(&mut self) {}
}

/// Maps a byte between inverse convention and the direct order the
/// receiver assumes. The mapping is its own inverse.
const fn inverse(byte: u8) -> u8 {
    reverse_u8(!byte)
}

fn convert(data: &mut [u8], convention: Convention) {
    if convention == Convention::Inverse {
        for byte in data {
            *byte = inverse(*byte);
        }
    }
}

/// Reads T0, the interface bytes, the historical bytes and TCK after TS.
fn read_atr_body(
    atr: &mut heapless::Vec<u8, ATR_MAX>,
    mut next: impl FnMut() -> Result<u8, BusError>,
) -> Result<(), BusError> {
    let push = |atr: &mut heapless::Vec<u8, ATR_MAX>, byte: u8| {
        atr.push(byte)
            .map_err(|_| BusError::invalid("ATR longer than 33 bytes"))
    };
    let t0 = next()?;
    push(atr, t0)?;
    let mut presence = t0 >> 4;
    let mut tck = false;
    loop {
        // TAi, TBi and TCi
        for bit in 0..3 {
            if presence & (1 << bit) != 0 {
                push(atr, next()?)?;
            }
        }
        if presence & 0x8 == 0 {
            break;
        }
        let td = next()?;
        push(atr, td)?;
        // any protocol other than T=0 adds a check byte
        tck |= td & 0x0f != 0;
        presence = td >> 4;
    }
    for _ in 0..t0 & 0x0f {
        push(atr, next()?)?;
    }
    if tck {
        push(atr, next()?)?;
    }
    Ok(())
}

fn configure(proto: &mut ProtoState, args: &mut Args<'_>) -> Result<bool, BusError> {
    let mut speed = false;
    loop {
        let config = proto.config.smartcard_mut();
        match args.peek_word() {
            Some("speed") => {
                args.bump();
                config.baudrate = args.uint("speed")?;
                speed = true;
            }
            Some("prescaler") => {
                args.bump();
                match args.uint("prescaler")? {
                    value @ 1..=31 => config.prescaler = value as u8,
                    _ => return Err(BusError::invalid("Prescaler must be between 1 and 31.")),
                }
            }
            Some("guardtime") => {
                args.bump();
                config.guard_time = u8::try_from(args.uint("guardtime")?)
                    .map_err(|_| BusError::invalid("Guard time must be between 0 and 255."))?;
            }
            Some("convention") => {
                args.bump();
                config.convention = match args.peek() {
                    Some(Token::Word(word)) if word == "normal" => Convention::Normal,
                    Some(Token::Word(word)) if word == "inverse" => Convention::Inverse,
                    Some(Token::Uint(0)) => Convention::Normal,
                    Some(Token::Uint(1)) => Convention::Inverse,
                    _ => {
                        return Err(BusError::invalid(
                            "Convention value must be (0 = normal) or (1 = inverse).",
                        ));
                    }
                };
                args.bump();
            }
            Some("timeout") => {
                args.bump();
                match args.uint("timeout")? {
                    ms @ 1..=30_000 => config.timeout_ms = ms,
                    _ => {
                        return Err(BusError::invalid(
                            "Timeout value must be set between 1 and 30000.",
                        ));
                    }
                }
            }
            _ => return Ok(speed),
        }
    }
}

/// ISO 7816 smartcard reader.
pub struct SmartcardMode<S, D> {
    board: SharedBoard,
    card: S,
    delay: D,
    rst: Option<UsedPin>,
}

impl<S: Smartcard, D: DelayNs + Send> SmartcardMode<S, D> {
    pub fn new(board: SharedBoard, card: S, delay: D) -> Self {
        Self {
            board,
            card,
            delay,
            rst: None,
        }
    }

    fn rst(&self) -> Result<&UsedPin, BusError> {
        self.rst.as_ref().ok_or_else(|| not_ready("smartcard"))
    }

    /// Programs the interface and claims RST, holding the card in reset.
    fn open(&mut self, config: &SmartcardConfig) -> Result<u32, BusError> {
        let actual = self.card.apply(config)?;
        if self.rst.is_none() {
            let rst = claim(&self.board, RST_PIN, PinUse::Smartcard, PinMode::PushPull, Pull::Floating)?;
            rst.set(false);
            self.rst = Some(rst);
        }
        log::info!("smartcard at {actual} bps, clock {}Hz", self.card.clock_hz());
        Ok(actual)
    }

    fn reopen(&mut self, out: &mut dyn fmt::Write, proto: &mut ProtoState, speed: bool) -> Result<(), BusError> {
        let config = proto.config.smartcard_mut();
        let requested = config.baudrate;
        let actual = self.open(config)?;
        let default = SmartcardConfig::default().baudrate;
        if speed && !check_speed(out, requested, actual, default) {
            config.baudrate = default;
            self.open(config)?;
        }
        Ok(())
    }

    fn read_byte(&mut self, timeout_ms: u32, convention: Convention) -> Result<u8, BusError> {
        let mut byte = [0u8];
        if self.card.read(&mut byte, timeout_ms)? == 0 {
            return Err(BusError::Timeout);
        }
        convert(&mut byte, convention);
        Ok(byte[0])
    }

    /// Powers and resets the card, then reads and prints its Answer To
    /// Reset. The convention announced by TS is applied to the session.
    fn atr(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let config = ctx.proto.config.smartcard_mut();
        config.convention = Convention::Normal;
        self.card.apply(config)?;
        let timeout = config.timeout_ms;

        self.rst()?.set(false);
        // RST low for at least 400 card clocks
        self.delay.delay_ms(1);
        self.card.set_vcc(false)?;
        self.rst()?.set(true);

        let mut ts = self.read_byte(timeout, Convention::Normal)?;
        if ts == 0 {
            ts = self.read_byte(timeout, Convention::Normal)?;
        }
        match ts {
            TS_INVERSE_RAW => {
                config.convention = Convention::Inverse;
                self.card.apply(config)?;
                crate::cprint!(ctx.out, "Auto-setting inverse convention\r\n");
                ts = TS_INVERSE;
            }
            TS_DIRECT => {}
            other => {
                crate::cprint!(
                    ctx.out,
                    "Non standard TS byte: {other:02X}\r\nTrying to read 8 more bytes\r\n"
                );
                let mut raw = [0u8; 9];
                raw[0] = other;
                let received = self.card.read(&mut raw[1..], 100)?;
                print_hex(ctx.out, &raw[..=received]);
                return Ok(());
            }
        }

        let convention = config.convention;
        let mut atr = heapless::Vec::<u8, ATR_MAX>::new();
        atr.push(ts).ok();
        read_atr_body(&mut atr, || self.read_byte(timeout, convention))?;
        log::debug!("ATR of {} bytes", atr.len());

        self.print_timing(ctx.out, &atr);
        print_hex(ctx.out, &atr);
        // T0 through TCK XOR to zero
        if atr_has_tck(&atr) && atr[1..].iter().fold(0u8, |acc, byte| acc ^ byte) != 0 {
            crate::cprint!(ctx.out, "Bad checksum\r\n");
        }
        Ok(())
    }

    fn print_timing(&self, out: &mut dyn fmt::Write, atr: &[u8]) {
        // TA1 follows T0 when bit 4 of T0 is set
        let ta1 = if atr[1] & 0x10 != 0 { atr[2] } else { 0x11 };
        let index = (ta1 >> 4) as usize;
        let (f, d, fmax_khz) = (FI[index], DI[(ta1 & 0x0f) as usize], FMAX_KHZ[index]);
        if f == 0 || d == 0 {
            log::warn!("TA1 {ta1:#04x} uses reserved values");
            return;
        }
        let etu = f / d;
        let clock = self.card.clock_hz();
        crate::cprint!(
            out,
            "Timing information:\r\nFi={f}, Di={d}, {etu} cycles/ETU\r\n{} bits/s at {}, {} bits/s for fMax={}\r\n",
            clock / etu,
            format_freq(clock),
            fmax_khz * 1000 / etu,
            format_freq(fmax_khz * 1000)
        );
    }
}

/// A TCK closes the ATR when any TDi announces a protocol other than T=0.
fn atr_has_tck(atr: &[u8]) -> bool {
    let mut pos = 1;
    loop {
        let presence = atr[pos] >> 4;
        let td = pos + (presence & 0x7).count_ones() as usize + 1;
        if presence & 0x8 == 0 || td >= atr.len() {
            return false;
        }
        if atr[td] & 0x0f != 0 {
            return true;
        }
        pos = td;
    }
}

impl<S: Smartcard, D: DelayNs + Send> Personality for SmartcardMode<S, D> {
    fn id(&self) -> ModeId {
        ModeId::Smartcard
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::bus()
            .with_write_read(true)
            .with_data_high(true)
            .with_data_low(true)
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        configure(ctx.proto, &mut args)?;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let config = ctx.proto.config.smartcard_mut().clone();
        self.open(&config)?;
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
                    crate::cprint!(ctx.out, "/VCC: PA5\r\nCD: PA7\r\nCLK: PA8\r\nTX: PB6\r\n");
                    show_pins(ctx.out, &[("RST", RST_PIN)]);
                } else {
                    self.show(ctx);
                }
                return Ok(args.used());
            }
            Some("query") => {
                args.bump();
                let present = self.card.card_detect();
                crate::cprint!(ctx.out, "CD={}\r\n", present as u8);
                return Ok(args.used());
            }
            Some("atr") => {
                args.bump();
                self.atr(ctx)?;
                return Ok(args.used());
            }
            _ => {}
        }
        let mut staged = ctx.proto.clone();
        let speed = configure(&mut staged, &mut args)?;
        if staged != *ctx.proto {
            if let Err(e) = self.reopen(ctx.out, &mut staged, speed) {
                let config = ctx.proto.config.smartcard_mut().clone();
                self.open(&config)?;
                return Err(e);
            }
            *ctx.proto = staged;
        }
        Ok(args.used())
    }

    fn start(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.rst()?.set(true);
        crate::cprint!(ctx.out, "RST UP\r\n");
        Ok(())
    }

    fn stop(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.rst()?.set(false);
        crate::cprint!(ctx.out, "RST DOWN\r\n");
        Ok(())
    }

    fn data_high(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.card.set_vcc(true)?;
        crate::cprint!(ctx.out, "/VCC UP\r\n");
        Ok(())
    }

    fn data_low(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.card.set_vcc(false)?;
        crate::cprint!(ctx.out, "/VCC DOWN\r\n");
        Ok(())
    }

    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        self.rst()?;
        let mut wire = tx.to_vec();
        convert(&mut wire, ctx.proto.config.smartcard_mut().convention);
        self.card.write(&wire)?;
        print_bytes(ctx.out, "WRITE", tx);
        Ok(())
    }

    fn read(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        self.rst()?;
        let config = ctx.proto.config.smartcard_mut();
        let received = self.card.read(rx, config.timeout_ms)?;
        convert(&mut rx[..received], config.convention);
        if received < rx.len() {
            crate::cprint!(ctx.out, "Timeout: {received}/{} bytes received\r\n", rx.len());
        }
        if received > 0 {
            print_bytes(ctx.out, "READ", &rx[..received]);
        }
        Ok(())
    }

    /// Half duplex: the whole command goes out before the answer is read.
    fn write_read(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        self.rst()?;
        let config = ctx.proto.config.smartcard_mut().clone();
        let mut wire = tx.to_vec();
        convert(&mut wire, config.convention);
        self.card.write(&wire)?;
        let received = self.card.read(rx, config.timeout_ms)?;
        convert(&mut rx[..received], config.convention);
        if received < rx.len() {
            return Err(BusError::Timeout);
        }
        for (out, input) in tx.iter().zip(rx.iter()) {
            crate::cprint!(ctx.out, "WRITE: 0x{out:02X} READ: 0x{input:02X}\r\n");
        }
        Ok(())
    }

    fn dump(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        self.rst()?;
        let config = ctx.proto.config.smartcard_mut();
        let received = self.card.read(rx, config.timeout_ms)?;
        convert(&mut rx[..received], config.convention);
        if received < rx.len() {
            return Err(BusError::Timeout);
        }
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        self.rst = None;
        self.card.close();
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let device = ctx.proto.dev_num + 1;
        let config = ctx.proto.config.smartcard_mut();
        crate::cprint!(
            ctx.out,
            "Device: SMARTCARD{device}\r\nSpeed: {} bps\r\nConvention: {}\r\n",
            config.baudrate,
            match config.convention {
                Convention::Normal => "normal",
                Convention::Inverse => "inverse",
            }
        );
        crate::cprint!(
            ctx.out,
            "Prescaler: {} / {}\r\nGuard time: {} ETU\r\nTimeout: {} msec\r\n",
            config.prescaler,
            format_freq(self.card.clock_hz()),
            config.guard_time,
            config.timeout_ms
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
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    const PCLK: u32 = 84_000_000;

    #[derive(Debug, Default)]
    struct Slot {
        config: Option<SmartcardConfig>,
        /// Bytes on the I/O line, as a direct receiver sees them.
        answer: VecDeque<u8>,
        sent: Vec<u8>,
        vcc_high: bool,
        present: bool,
    }

    #[derive(Clone, Default)]
    struct SimCard(Arc<Mutex<Slot>>);

    impl Smartcard for SimCard {
        fn apply(&mut self, config: &SmartcardConfig) -> Result<u32, BusError> {
            self.0.lock().unwrap().config = Some(config.clone());
            let clock = self.clock_hz();
            let etu = clock / config.baudrate.max(1);
            if etu == 0 {
                return Err(BusError::invalid("baud rate above the card clock"));
            }
            Ok(clock / etu)
        }

        fn write(&mut self, data: &[u8]) -> Result<(), BusError> {
            self.0.lock().unwrap().sent.extend_from_slice(data);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, BusError> {
            let mut slot = self.0.lock().unwrap();
            let count = buf.len().min(slot.answer.len());
            for (dst, src) in buf.iter_mut().zip(slot.answer.drain(..count)) {
                *dst = src;
            }
            Ok(count)
        }

        fn set_vcc(&mut self, high: bool) -> Result<(), BusError> {
            self.0.lock().unwrap().vcc_high = high;
            Ok(())
        }

        fn card_detect(&mut self) -> bool {
            self.0.lock().unwrap().present
        }

        fn clock_hz(&self) -> u32 {
            let prescaler = self
                .0
                .lock()
                .unwrap()
                .config
                .as_ref()
                .map_or(12, |config| config.prescaler as u32);
            PCLK / (2 * prescaler)
        }
    }

    fn reader(args: &str) -> (Console, SimPort, SimCard) {
        let card = SimCard::default();
        let handle = card.clone();
        let (console, port) = selected(move |board| SmartcardMode::new(board, card, NoDelay), args);
        (console, port, handle)
    }

    #[test]
    fn reset_line_and_power() {
        let (mut console, port, card) = reader("");
        assert_eq!(console.prompt(), "smartcard1> ");
        assert!(!port.output(RST_PIN));
        assert_eq!(run(&mut console, "["), "RST UP\r\n");
        assert!(port.output(RST_PIN));
        assert_eq!(run(&mut console, "]"), "RST DOWN\r\n");
        assert_eq!(run(&mut console, "-"), "/VCC UP\r\n");
        assert!(card.0.lock().unwrap().vcc_high);
        assert_eq!(run(&mut console, "_"), "/VCC DOWN\r\n");
        assert!(!card.0.lock().unwrap().vcc_high);
        assert_eq!(run(&mut console, "show pins"), "/VCC: PA5\r\nCD: PA7\r\nCLK: PA8\r\nTX: PB6\r\nRST: 2\r\n");
        card.0.lock().unwrap().present = true;
        assert_eq!(run(&mut console, "query"), "CD=1\r\n");
    }

    #[test]
    fn show_and_speed() {
        let (mut console, _, card) = reader("guardtime 2");
        assert_eq!(
            run(&mut console, "show"),
            "Device: SMARTCARD1\r\nSpeed: 9408 bps\r\nConvention: normal\r\n\
             Prescaler: 12 / 3.50mhz\r\nGuard time: 2 ETU\r\nTimeout: 1000 msec\r\n"
        );
        assert_eq!(
            run(&mut console, "speed 115200"),
            "Final speed: 116666 bps(1.26% err)\r\n"
        );
        assert_eq!(card.0.lock().unwrap().config.as_ref().unwrap().baudrate, 115_200);
        let mut out = String::new();
        assert!(console.run_line("prescaler 0", &mut out).is_err());
        assert!(console.run_line("convention 2", &mut out).is_err());
        assert!(console.run_line("guardtime 256", &mut out).is_err());
    }

    #[test]
    fn direct_atr_with_timing() {
        let (mut console, _, card) = reader("");
        // TA1 = 0x11, TC1 = 0, TD1 announces T=1, two historical bytes
        card.0
            .lock()
            .unwrap()
            .answer
            .extend([0x3b, 0xd2, 0x11, 0x00, 0x01, 0x41, 0x42, 0xc1]);
        let out = run(&mut console, "atr");
        assert!(out.starts_with(
            "Timing information:\r\nFi=372, Di=1, 372 cycles/ETU\r\n\
             9408 bits/s at 3.50mhz, 13440 bits/s for fMax=5mhz\r\n"
        ));
        assert!(out.contains("3B D2 11 00 01 41 42 C1"));
        assert!(!out.contains("Bad checksum"));
        assert!(!card.0.lock().unwrap().vcc_high);
    }

    #[test]
    fn bad_check_byte_is_reported() {
        let (mut console, _, card) = reader("");
        card.0
            .lock()
            .unwrap()
            .answer
            .extend([0x3b, 0xd2, 0x11, 0x00, 0x01, 0x41, 0x42, 0xc2]);
        assert!(run(&mut console, "atr").ends_with("Bad checksum\r\n"));
    }

    #[test]
    fn inverse_convention_is_detected() {
        let (mut console, _, card) = reader("");
        card.0
            .lock()
            .unwrap()
            .answer
            .extend([TS_INVERSE_RAW, inverse(0x00)]);
        let out = run(&mut console, "atr");
        assert!(out.starts_with("Auto-setting inverse convention\r\nTiming information:\r\n"));
        assert!(out.contains("3F 00"));
        assert!(run(&mut console, "show").contains("Convention: inverse"));

        card.0.lock().unwrap().answer.push_back(inverse(0x90));
        assert_eq!(run(&mut console, "0xa0 r"), "WRITE: 0xA0\r\nREAD: 0x90\r\n");
        assert_eq!(card.0.lock().unwrap().sent, [inverse(0xa0)]);
    }

    #[test]
    fn non_standard_ts() {
        let (mut console, _, card) = reader("");
        card.0.lock().unwrap().answer.extend([0x42, 0x01]);
        let out = run(&mut console, "atr");
        assert!(out.starts_with("Non standard TS byte: 42\r\nTrying to read 8 more bytes\r\n"));
        assert!(out.contains("42 01"));
    }

    #[test]
    fn silent_card_times_out() {
        let (mut console, _, _) = reader("");
        let mut out = String::new();
        assert_eq!(console.run_line("atr", &mut out), Err(BusError::Timeout));
    }
}

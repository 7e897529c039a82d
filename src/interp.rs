//! Executes a token stream against the current personality.
//!
//! Operators run left to right. A failed bus transfer is reported on the
//! console and the command goes on; a malformed expression (bad repeat
//! count, byte out of range, buffer overflow) ends the command with an
//! error.
use crate::backend::{ModeCtx, Personality, print_hex};
use crate::console::{Console, Discard};
use crate::session::BUFFER_SIZE;
use crate::token::Token;
use crate::BusError;
use eh1::delay::DelayNs as _;
use rand::RngCore as _;
use std::fmt;

/// `hd` reads in chunks of this size, a multiple of the 16 byte dump row.
const HEXDUMP_CHUNK: usize = 64;

impl Console {
    pub fn execute(&mut self, tokens: &[Token], out: &mut dyn fmt::Write) -> Result<(), BusError> {
        let mut t = 0;
        while t < tokens.len() {
            let used = self.step(&tokens[t..], out)?;
            if used == 0 {
                break;
            }
            t += used;
        }
        Ok(())
    }

    /// Runs the operator at the head of `tokens` and returns the number of
    /// tokens it used.
    fn step(&mut self, tokens: &[Token], out: &mut dyn fmt::Write) -> Result<usize, BusError> {
        let caps = self.registry[self.current].capabilities();
        match &tokens[0] {
            Token::Start | Token::StartRead => {
                self.session.wwr = tokens[0] == Token::StartRead;
                if caps.start() {
                    let (mode, mut ctx, _, _) = self.parts(out);
                    report(mode.start(&mut ctx), ctx.out);
                }
                Ok(1)
            }
            Token::Stop | Token::StopRead => {
                self.session.wwr = false;
                if caps.stop() {
                    let (mode, mut ctx, _, _) = self.parts(out);
                    report(mode.stop(&mut ctx), ctx.out);
                }
                Ok(1)
            }
            Token::ClockHigh => self.bit_op(caps.clock_high(), out, |m, c| m.clock_high(c)),
            Token::ClockLow => self.bit_op(caps.clock_low(), out, |m, c| m.clock_low(c)),
            Token::ClockPulse => self.bit_op(caps.clock_pulse(), out, |m, c| m.clock_pulse(c)),
            Token::DataHigh => self.bit_op(caps.data_high(), out, |m, c| m.data_high(c)),
            Token::DataLow => self.bit_op(caps.data_low(), out, |m, c| m.data_low(c)),
            Token::DataSample => self.bit_op(caps.data_sample(), out, |m, c| m.data_sample(c)),
            Token::BitRead => self.bit_op(caps.bit_read(), out, |m, c| m.bit_read(c)),
            Token::DelayUs => {
                let (us, used) = suffix_or_one(tokens);
                self.delay.delay_us(us);
                Ok(used)
            }
            Token::DelayMs => {
                let (ms, used) = suffix_or_one(tokens);
                crate::cprint!(out, "DELAY: {ms} ms\r\n");
                self.delay.delay_ms(ms);
                Ok(used)
            }
            Token::Read => self.read(tokens, out),
            Token::HexDump => self.hexdump(tokens, out),
            Token::Write => self.write(&tokens[1..], out).map(|used| used + 1),
            Token::Random | Token::Uint(_) | Token::Str(_) => self.write(tokens, out),
            Token::Trigger => self.trigger(&tokens[1..], out).map(|used| used + 1),
            Token::Aux => self.aux(&tokens[1..], out).map(|used| used + 1),
            Token::Exit => {
                self.exit(out);
                Ok(1)
            }
            Token::Word(word) => {
                if !self.grammar.contains(&word.as_str()) {
                    if let Some(result) = self.top_level(tokens, out) {
                        return result;
                    }
                    return Err(BusError::invalid(format!("unknown command '{word}'")));
                }
                let (mode, mut ctx, _, _) = self.parts(out);
                let used = mode.exec(&mut ctx, tokens);
                // `device <n>` and friends may change the prompt
                self.prompt = self.registry[self.current].prompt(&self.session.proto);
                used
            }
            Token::Suffix(_) => Err(BusError::invalid("repeat count without operand")),
        }
    }

    fn bit_op(
        &mut self,
        present: bool,
        out: &mut dyn fmt::Write,
        op: impl FnOnce(&mut dyn Personality, &mut ModeCtx<'_>) -> Result<(), BusError>,
    ) -> Result<usize, BusError> {
        if present {
            let (mode, mut ctx, _, _) = self.parts(out);
            report(op(mode, &mut ctx), ctx.out);
        }
        Ok(1)
    }

    /// Fills the transmit buffer from literals, `~` and strings, then
    /// writes it. `tokens` starts right after an optional `w`.
    fn write(&mut self, tokens: &[Token], out: &mut dyn fmt::Write) -> Result<usize, BusError> {
        let mut t = 0;
        let mut count = 1;
        if let Some(Token::Suffix(n)) = tokens.first() {
            if *n == 0 {
                return Err(BusError::invalid("repeat count must be at least 1"));
            }
            count = *n;
            t += 1;
        }
        self.session.tx.clear();
        match tokens.get(t) {
            Some(Token::Str(bytes)) => {
                t += 1;
                let repeat = match tokens.get(t) {
                    Some(Token::Suffix(n)) => {
                        t += 1;
                        *n
                    }
                    _ => 1,
                };
                for _ in 0..repeat {
                    if self.session.tx.extend_from_slice(bytes).is_err() {
                        crate::cprint!(out, "Repeat count exceeds buffer size.\r\n");
                        return Err(BusError::invalid("transmit buffer overflow"));
                    }
                }
            }
            Some(Token::Uint(_) | Token::Random) => t += self.chomp_bytes(&tokens[t..], out)?,
            _ => {}
        }
        if self.session.tx.is_empty() {
            return Err(BusError::invalid("nothing to write"));
        }

        let wwr = self.session.wwr;
        let caps = self.registry[self.current].capabilities();
        let (mode, mut ctx, tx, rx) = self.parts(out);
        for _ in 0..count {
            if wwr {
                let result = if caps.write_read() {
                    rx.clear();
                    rx.resize_default(tx.len()).ok();
                    mode.write_read(&mut ctx, tx, rx)
                } else {
                    Err(BusError::Unsupported)
                };
                if let Err(e) = result {
                    crate::cprint!(ctx.out, "WRITE/READ error:{}\r\n", e.code());
                }
            } else {
                let result = if caps.write() {
                    mode.write(&mut ctx, tx)
                } else {
                    Err(BusError::Unsupported)
                };
                if let Err(e) = result {
                    crate::cprint!(ctx.out, "WRITE error:{}\r\n", e.code());
                }
            }
        }
        Ok(t)
    }

    /// Collects a run of byte literals and `~`, each with an optional
    /// `:<n>` repeat.
    fn chomp_bytes(&mut self, tokens: &[Token], out: &mut dyn fmt::Write) -> Result<usize, BusError> {
        let mut t = 0;
        loop {
            let value = match tokens.get(t) {
                Some(Token::Uint(value)) => {
                    if *value > 0xff {
                        crate::cprint!(out, "Please specify one byte at a time.\r\n");
                        return Err(BusError::invalid(format!("{value:#x} is not a byte")));
                    }
                    *value as u8
                }
                Some(Token::Random) => self.rng.next_u32() as u8,
                _ => return Ok(t),
            };
            t += 1;
            let repeat = match tokens.get(t) {
                Some(Token::Suffix(n)) => {
                    t += 1;
                    *n as usize
                }
                _ => 1,
            };
            if repeat == 0 {
                return Err(BusError::invalid("repeat count must be at least 1"));
            }
            if self.session.tx.len() + repeat > BUFFER_SIZE {
                crate::cprint!(out, "Repeat count exceeds buffer size.\r\n");
                return Err(BusError::invalid("transmit buffer overflow"));
            }
            for _ in 0..repeat {
                self.session.tx.push(value).ok();
            }
        }
    }

    fn read(&mut self, tokens: &[Token], out: &mut dyn fmt::Write) -> Result<usize, BusError> {
        let (count, used) = suffix_or_one(tokens);
        let count = count as usize;
        if count == 0 || count > BUFFER_SIZE {
            return Err(BusError::invalid(format!(
                "read count must be between 1 and {BUFFER_SIZE}"
            )));
        }
        let caps = self.registry[self.current].capabilities();
        let (mode, mut ctx, _, rx) = self.parts(out);
        let result = if caps.read() {
            rx.clear();
            rx.resize_default(count).ok();
            mode.read(&mut ctx, rx)
        } else {
            Err(BusError::Unsupported)
        };
        if let Err(e) = result {
            crate::cprint!(ctx.out, "READ error:{}\r\n", e.code());
        }
        Ok(used)
    }

    fn hexdump(&mut self, tokens: &[Token], out: &mut dyn fmt::Write) -> Result<usize, BusError> {
        let (count, used) = suffix_or_one(tokens);
        let caps = self.registry[self.current].capabilities();
        let (mode, mut ctx, _, rx) = self.parts(out);
        let mut done = 0;
        while done < count as usize && !ctx.abort.is_cancelled() {
            let chunk = (count as usize - done).min(HEXDUMP_CHUNK);
            rx.clear();
            rx.resize_default(chunk).ok();
            let result = if caps.dump() {
                mode.dump(&mut ctx, rx)
            } else {
                Err(BusError::Unsupported)
            };
            match result {
                Ok(()) => print_hex(ctx.out, rx),
                Err(e) => crate::cprint!(ctx.out, "READ error:{}\r\n", e.code()),
            }
            done += chunk;
        }
        self.abort.reset();
        Ok(used)
    }

    fn trigger(&mut self, tokens: &[Token], out: &mut dyn fmt::Write) -> Result<usize, BusError> {
        if !self.registry[self.current].capabilities().dump() {
            return Err(BusError::Unsupported);
        }
        let Console {
            registry,
            current,
            session,
            abort,
            link,
            trigger,
            board,
            ..
        } = self;
        let mode = registry[*current].as_mut();
        let mut quiet = Discard;
        let mut ctx = ModeCtx {
            proto: &mut session.proto,
            out: &mut quiet,
            abort,
            link: link.as_deref_mut(),
        };
        let mut next_byte = || -> Result<u8, BusError> {
            let mut byte = [0u8];
            mode.dump(&mut ctx, &mut byte)?;
            Ok(byte[0])
        };
        let result = trigger.exec(tokens, out, board, abort, &mut next_byte);
        self.abort.reset();
        result
    }

    fn aux(&mut self, tokens: &[Token], out: &mut dyn fmt::Write) -> Result<usize, BusError> {
        match tokens.first() {
            Some(Token::Word(word)) if word == "on" => self.aux.write(&self.board, true)?,
            Some(Token::Word(word)) if word == "off" => self.aux.write(&self.board, false)?,
            Some(Token::Read) => {
                let level = self.aux.read(&self.board)?;
                crate::cprint!(out, "AUX: {}\r\n", level as u8);
            }
            _ => return Err(BusError::invalid("aux expects on, off or read")),
        }
        Ok(1)
    }
}

/// Reports a start/stop or bit operation failure without ending the
/// command.
fn report(result: Result<(), BusError>, out: &mut dyn fmt::Write) {
    if let Err(e) = result {
        crate::cprint!(out, "{e}\r\n");
    }
}

/// The `:<n>` argument of the operator at the head of `tokens`, 1 when
/// absent, and the number of tokens used.
fn suffix_or_one(tokens: &[Token]) -> (u32, usize) {
    match tokens.get(1) {
        Some(Token::Suffix(n)) => (*n, 2),
        _ => (1, 1),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{Capabilities, ModeId};
    use crate::console::test::console;
    use rand::rngs::mock::StepRng;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Start,
        Stop,
        Write(Vec<u8>),
        WriteRead(Vec<u8>),
        Read(usize),
        Dump(usize),
        Clock,
        Exec(String),
    }

    /// Records every operation; reads return an incrementing counter.
    struct Probe {
        caps: Capabilities,
        ops: Arc<Mutex<Vec<Op>>>,
        next: u8,
        fail_writes: bool,
    }

    impl Probe {
        fn push(&self, op: Op) {
            self.ops.lock().unwrap().push(op);
        }

        fn fill(&mut self, rx: &mut [u8]) {
            for byte in rx {
                *byte = self.next;
                self.next = self.next.wrapping_add(1);
            }
        }
    }

    impl Personality for Probe {
        fn id(&self) -> ModeId {
            ModeId::ThreeWire
        }

        fn grammar(&self) -> &'static [&'static str] {
            &["ping"]
        }

        fn capabilities(&self) -> Capabilities {
            self.caps
        }

        fn init(&mut self, _ctx: &mut ModeCtx<'_>, _args: &[Token]) -> Result<usize, BusError> {
            Ok(0)
        }

        fn exec(&mut self, _ctx: &mut ModeCtx<'_>, tokens: &[Token]) -> Result<usize, BusError> {
            if let Token::Word(word) = &tokens[0] {
                self.push(Op::Exec(word.clone()));
            }
            Ok(1)
        }

        fn start(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
            self.push(Op::Start);
            Ok(())
        }

        fn stop(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
            self.push(Op::Stop);
            Ok(())
        }

        fn write(&mut self, _ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
            self.push(Op::Write(tx.to_vec()));
            if self.fail_writes {
                return Err(BusError::Nack);
            }
            Ok(())
        }

        fn write_read(
            &mut self,
            _ctx: &mut ModeCtx<'_>,
            tx: &[u8],
            rx: &mut [u8],
        ) -> Result<(), BusError> {
            self.push(Op::WriteRead(tx.to_vec()));
            self.fill(rx);
            Ok(())
        }

        fn read(&mut self, _ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
            self.push(Op::Read(rx.len()));
            self.fill(rx);
            Ok(())
        }

        fn dump(&mut self, _ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
            self.push(Op::Dump(rx.len()));
            self.fill(rx);
            Ok(())
        }

        fn clock_pulse(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
            self.push(Op::Clock);
            Ok(())
        }
    }

    fn setup(caps: Capabilities) -> (Console, Arc<Mutex<Vec<Op>>>) {
        let (console, _) = console(16);
        let mut console = console.with_rng(StepRng::new(0x1234_5678, 0x0101));
        let ops = Arc::new(Mutex::new(Vec::new()));
        console.register(Probe {
            caps,
            ops: ops.clone(),
            next: 0,
            fail_writes: false,
        });
        let mut out = String::new();
        console.run_line("threewire", &mut out).unwrap();
        (console, ops)
    }

    fn ops(journal: &Arc<Mutex<Vec<Op>>>) -> Vec<Op> {
        std::mem::take(&mut *journal.lock().unwrap())
    }

    #[test]
    fn repeat_fills_exact_count() {
        let (mut console, journal) = setup(Capabilities::bus());
        let mut out = String::new();
        console.run_line("0x41:3 0x42", &mut out).unwrap();
        assert_eq!(ops(&journal), [Op::Write(vec![0x41, 0x41, 0x41, 0x42])]);

        console.run_line("0x55:256", &mut out).unwrap();
        assert_eq!(ops(&journal), [Op::Write(vec![0x55; 256])]);
    }

    #[test]
    fn bad_repeat_counts_end_the_command() {
        let (mut console, journal) = setup(Capabilities::bus());
        let mut out = String::new();
        assert!(console.run_line("0x41:0 [", &mut out).is_err());
        assert!(console.run_line("0x41:257 [", &mut out).is_err());
        assert!(out.contains("Repeat count exceeds buffer size.\r\n"));
        assert!(console.run_line("0x100", &mut out).is_err());
        assert!(out.contains("Please specify one byte at a time.\r\n"));
        assert_eq!(ops(&journal), []);
    }

    #[test]
    fn write_keyword_repeats_whole_transfer() {
        let (mut console, journal) = setup(Capabilities::bus());
        let mut out = String::new();
        console.run_line("w:2 1 2 ]", &mut out).unwrap();
        assert_eq!(
            ops(&journal),
            [Op::Write(vec![1, 2]), Op::Write(vec![1, 2]), Op::Stop]
        );
    }

    #[test]
    fn strings_and_random_bytes() {
        let (mut console, journal) = setup(Capabilities::bus());
        let mut out = String::new();
        console.run_line(r#""AB\x41\\end" ~ ~"#, &mut out).unwrap();
        assert_eq!(
            ops(&journal),
            [
                Op::Write(b"ABA\\end".to_vec()),
                Op::Write(vec![0x78, 0x79]),
            ]
        );
    }

    #[test]
    fn write_with_read_needs_the_capability() {
        let (mut console, journal) = setup(Capabilities::bus());
        let mut out = String::new();
        console.run_line("{ 0x9f }", &mut out).unwrap();
        assert_eq!(ops(&journal), [Op::Start, Op::Stop]);
        assert_eq!(out, "WRITE/READ error:5\r\n");

        let (mut console, journal) = setup(Capabilities::bus().with_write_read(true));
        console.run_line("{ 0x9f 0 0 ] 0x01", &mut out).unwrap();
        assert_eq!(
            ops(&journal),
            [
                Op::Start,
                Op::WriteRead(vec![0x9f, 0, 0]),
                Op::Stop,
                Op::Write(vec![1]),
            ]
        );
    }

    #[test]
    fn failed_write_reports_and_continues() {
        let (mut console, _) = console(16);
        let ops = Arc::new(Mutex::new(Vec::new()));
        console.register(Probe {
            caps: Capabilities::bus(),
            ops: ops.clone(),
            next: 0,
            fail_writes: true,
        });
        let mut out = String::new();
        console.run_line("threewire 0x01 r:2", &mut out).unwrap();
        assert_eq!(out, "WRITE error:6\r\n");
        assert_eq!(*ops.lock().unwrap(), [Op::Write(vec![1]), Op::Read(2)]);
    }

    #[test]
    fn read_bounds() {
        let (mut console, journal) = setup(Capabilities::bus());
        let mut out = String::new();
        console.run_line("r r:256", &mut out).unwrap();
        assert_eq!(ops(&journal), [Op::Read(1), Op::Read(256)]);
        assert!(console.run_line("r:257", &mut out).is_err());
        assert!(console.run_line("r:0", &mut out).is_err());
    }

    #[test]
    fn hexdump_in_chunks() {
        let (mut console, journal) = setup(Capabilities::bus());
        let mut out = String::new();
        console.run_line("hd:150", &mut out).unwrap();
        assert_eq!(ops(&journal), [Op::Dump(64), Op::Dump(64), Op::Dump(22)]);
        // 150 bytes, 16 per row
        assert_eq!(out.matches("\r\n").count(), 10);
        assert!(out.starts_with("00 01 02 03 04 05 06 07  08 09"));
    }

    #[test]
    fn missing_bit_operators_are_silent() {
        let (mut console, journal) = setup(Capabilities::bus().with_clock_pulse(true));
        let mut out = String::new();
        console.run_line("^ / \\ - _ ! . ^:1", &mut out).unwrap_err();
        // the trailing repeat count is a stray suffix once `^` ran
        assert_eq!(ops(&journal), [Op::Clock, Op::Clock]);
        assert_eq!(out, "");
    }

    #[test]
    fn mode_keywords_and_delays() {
        let (mut console, journal) = setup(Capabilities::bus());
        let mut out = String::new();
        console.run_line("ping &:10 %:2 ping", &mut out).unwrap();
        assert_eq!(
            ops(&journal),
            [Op::Exec("ping".into()), Op::Exec("ping".into())]
        );
        assert_eq!(out, "DELAY: 2 ms\r\n");
        assert!(console.run_line("pong", &mut out).is_err());
    }

    #[test]
    fn trigger_reads_through_dump() {
        let (mut console, journal) = setup(Capabilities::bus());
        let mut out = String::new();
        console
            .run_line(r#"trigger filter "\x03\x04" start"#, &mut out)
            .unwrap();
        assert!(out.ends_with("Triggered\r\n"));
        assert_eq!(ops(&journal), vec![Op::Dump(1); 5]);
    }
}

//! One interactive console: session, personality registry and the
//! collaborators shared by every mode.
use crate::backend::{Args, ModeCtx, Personality};
use crate::capture::Engine;
use crate::freq::{self, InputCapture};
use crate::gpio::{IoLine, PinMode, PinUse, SharedBoard, UsedPin};
use crate::mode::HiZ;
use crate::session::Session;
use crate::token::{Token, tokenize};
use crate::{BusError, CancelToken, HostLink, Pull, Trigger};
use eh1::delay::DelayNs;
use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fmt;

/// Board pin driven by `aux on|off`.
pub const AUX_PIN: u8 = 12;
/// Board pin pulsed by `trigger start`.
pub const TRIGGER_PIN: u8 = 13;

/// The AUX line, claimed on first use.
pub(crate) struct Aux {
    pub(crate) pin: u8,
    pub(crate) line: Option<UsedPin>,
}

impl Aux {
    fn line(&mut self, board: &SharedBoard) -> Result<&mut UsedPin, BusError> {
        let line = match self.line.take() {
            Some(line) => line,
            None => UsedPin::new(
                board.clone(),
                self.pin,
                PinUse::Aux,
                PinMode::PushPull,
                Pull::Floating,
            )?,
        };
        Ok(self.line.insert(line))
    }

    pub(crate) fn write(&mut self, board: &SharedBoard, high: bool) -> Result<(), BusError> {
        let line = self.line(board)?;
        line.set_as_output()?;
        line.set(high);
        Ok(())
    }

    pub(crate) fn read(&mut self, board: &SharedBoard) -> Result<bool, BusError> {
        let line = self.line(board)?;
        line.set_as_input()?;
        Ok(line.get())
    }
}

pub struct Console {
    pub(crate) session: Session,
    /// Index 0 is always the `hiz` personality.
    pub(crate) registry: Vec<Box<dyn Personality>>,
    pub(crate) current: usize,
    pub(crate) prompt: String,
    pub(crate) grammar: &'static [&'static str],
    /// The last mode switch was rejected.
    pub(crate) invalid: bool,
    pub(crate) board: SharedBoard,
    pub(crate) delay: Box<dyn DelayNs + Send>,
    pub(crate) rng: Box<dyn RngCore + Send>,
    pub(crate) aux: Aux,
    pub(crate) trigger: Trigger,
    pub(crate) abort: CancelToken,
    pub(crate) link: Option<Box<dyn HostLink>>,
    capture: Option<Engine>,
    freq: Option<Box<dyn InputCapture>>,
}

impl Console {
    pub fn new(board: SharedBoard, delay: impl DelayNs + Send + 'static) -> Self {
        let hiz = HiZ;
        let prompt = hiz.prompt(&Default::default());
        Self {
            session: Session::new(),
            registry: vec![Box::new(hiz)],
            current: 0,
            prompt,
            grammar: &[],
            invalid: false,
            board,
            delay: Box::new(delay),
            rng: Box::new(StdRng::from_entropy()),
            aux: Aux {
                pin: AUX_PIN,
                line: None,
            },
            trigger: Trigger::new(TRIGGER_PIN),
            abort: CancelToken::new(),
            link: None,
            capture: None,
            freq: None,
        }
    }

    /// Adds a personality; it is selected by its name or by its 1 based
    /// registration order.
    pub fn register(&mut self, mode: impl Personality + 'static) -> &mut Self {
        log::debug!("registered mode {}", mode.name());
        self.registry.push(Box::new(mode));
        self
    }

    pub fn with_link(mut self, link: impl HostLink + 'static) -> Self {
        self.link = Some(Box::new(link));
        self
    }

    pub fn with_capture(mut self, engine: Engine) -> Self {
        self.capture = Some(engine);
        self
    }

    pub fn with_input_capture(mut self, capture: impl InputCapture + 'static) -> Self {
        self.freq = Some(Box::new(capture));
        self
    }

    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Name of the current personality.
    pub fn mode_name(&self) -> &'static str {
        self.registry[self.current].name()
    }

    /// Keywords the current personality accepts besides the bus operators.
    pub fn grammar(&self) -> &'static [&'static str] {
        self.grammar
    }

    /// Whether the last mode switch was rejected, so the front end can
    /// restore the previous input line.
    pub fn is_invalid(&self) -> bool {
        self.invalid
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Signal raised by the user button.
    pub fn abort_token(&self) -> CancelToken {
        self.abort.clone()
    }

    /// Tokenizes and runs one command line.
    pub fn run_line(&mut self, line: &str, out: &mut dyn fmt::Write) -> Result<(), BusError> {
        let tokens = tokenize(line)?;
        self.execute(&tokens, out)
    }

    pub(crate) fn mode_index(&self, name: &str) -> Option<usize> {
        self.registry.iter().position(|mode| mode.name() == name)
    }

    /// Commands of the top level prompt. `None` when `tokens` is not one.
    pub(crate) fn top_level(
        &mut self,
        tokens: &[Token],
        out: &mut dyn fmt::Write,
    ) -> Option<Result<usize, BusError>> {
        let Some(Token::Word(word)) = tokens.first() else {
            return None;
        };
        let result = match word.as_str() {
            "mode" => {
                let mut args = Args::new(&tokens[1..]);
                match args.uint("mode") {
                    Ok(index) => self
                        .select(index as usize, &tokens[2..], out)
                        .map(|used| used + 2),
                    Err(e) => Err(e),
                }
            }
            "sump" => self.sump().map(|()| 1),
            "bbio" => self.bbio().map(|()| 1),
            "freq" => self.frequency(out).map(|()| 1),
            "baudrate" => self.baudrate(out).map(|()| 1),
            "hiz" => {
                self.exit(out);
                Ok(1)
            }
            name if self.mode_index(name).is_some_and(|index| index != 0) => self
                .select_by_name(name, &tokens[1..], out)
                .map(|used| used + 1),
            _ => return None,
        };
        Some(result)
    }

    /// Hands the host link to the logic analyzer until the user button
    /// is pressed.
    fn sump(&mut self) -> Result<(), BusError> {
        let (Some(engine), Some(link)) = (self.capture.as_mut(), self.link.as_deref_mut()) else {
            return Err(BusError::Unsupported);
        };
        let result = engine.run(link, &self.abort);
        self.abort.reset();
        result.map_err(|e| {
            log::warn!("sump session ended: {e}");
            BusError::Hardware("host link")
        })
    }

    fn frequency(&mut self, out: &mut dyn fmt::Write) -> Result<(), BusError> {
        let capture = self.freq.as_deref_mut().ok_or(BusError::Unsupported)?;
        let result = freq::measure(capture, &self.abort, freq::BASE_CLOCK_HZ);
        self.abort.reset();
        let measured = result?;
        crate::cprint!(
            out,
            "Frequency : {}Hz\r\nDuty : {}%\r\n",
            measured.frequency,
            measured.duty
        );
        Ok(())
    }

    fn baudrate(&mut self, out: &mut dyn fmt::Write) -> Result<(), BusError> {
        let capture = self.freq.as_deref_mut().ok_or(BusError::Unsupported)?;
        let result = freq::estimate_baudrate(capture, &self.abort, freq::BASE_CLOCK_HZ);
        self.abort.reset();
        crate::cprint!(out, "Estimated baudrate : {}\r\n", result?);
        Ok(())
    }

    /// Borrows the current personality together with its context and the
    /// transfer buffers.
    pub(crate) fn parts<'s>(
        &'s mut self,
        out: &'s mut dyn fmt::Write,
    ) -> (
        &'s mut dyn Personality,
        ModeCtx<'s>,
        &'s mut heapless::Vec<u8, { crate::session::BUFFER_SIZE }>,
        &'s mut heapless::Vec<u8, { crate::session::BUFFER_SIZE }>,
    ) {
        let Session { proto, tx, rx, .. } = &mut self.session;
        let ctx = ModeCtx {
            proto,
            out,
            abort: &self.abort,
            link: self.link.as_deref_mut(),
        };
        (self.registry[self.current].as_mut(), ctx, tx, rx)
    }
}

/// Console sink that drops everything, for reads whose output nobody sees.
pub(crate) struct Discard;

impl fmt::Write for Discard {
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}

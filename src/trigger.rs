use crate::backend::print_hex;
use crate::gpio::{PinMode, PinUse, SharedBoard, UsedPin};
use crate::session::BUFFER_SIZE;
use crate::token::Token;
use crate::{BusError, CancelToken, Pull};
use std::fmt;

/// Pulses a pin once the bytes read from the bus match a pattern.
pub struct Trigger {
    pin: u8,
    pattern: heapless::Vec<u8, BUFFER_SIZE>,
    /// Held after firing so the line stays high.
    output: Option<UsedPin>,
}

impl Trigger {
    pub fn new(pin: u8) -> Self {
        Self {
            pin,
            pattern: heapless::Vec::new(),
            output: None,
        }
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    pub fn set_pattern(&mut self, pattern: &[u8]) -> Result<(), BusError> {
        self.pattern = heapless::Vec::from_slice(pattern)
            .map_err(|_| BusError::invalid("trigger pattern exceeds buffer size"))?;
        Ok(())
    }

    fn show(&self, out: &mut dyn fmt::Write) {
        crate::cprint!(out, "Current trigger data :\r\n");
        print_hex(out, &self.pattern);
    }

    /// Executes `filter "<bytes>"`, `start` and `show [pins]`.
    ///
    /// `next_byte` reads one byte from the current personality. Returns the
    /// number of tokens used.
    pub fn exec(
        &mut self,
        tokens: &[Token],
        out: &mut dyn fmt::Write,
        board: &SharedBoard,
        abort: &CancelToken,
        next_byte: &mut dyn FnMut() -> Result<u8, BusError>,
    ) -> Result<usize, BusError> {
        let mut t = 0;
        while let Some(Token::Word(word)) = tokens.get(t) {
            t += 1;
            match word.as_str() {
                "filter" => {
                    let Some(Token::Str(pattern)) = tokens.get(t) else {
                        return Err(BusError::invalid("filter expects a quoted string"));
                    };
                    t += 1;
                    self.set_pattern(pattern)?;
                    self.show(out);
                }
                "start" => {
                    crate::cprint!(out, "Interrupt by pressing user button.\r\n\r\n");
                    if self.run(board, abort, next_byte)? {
                        crate::cprint!(out, "Triggered\r\n");
                    }
                }
                "show" => {
                    if matches!(tokens.get(t), Some(Token::Word(w)) if w == "pins") {
                        t += 1;
                        crate::cprint!(out, "Trigger pin : {}\r\n", self.pin);
                    } else {
                        self.show(out);
                    }
                }
                _ => return Ok(t - 1),
            }
        }
        Ok(t)
    }

    /// Reads bytes until the pattern went by, then drives the trigger pin
    /// high. `false` when aborted.
    pub fn run(
        &mut self,
        board: &SharedBoard,
        abort: &CancelToken,
        next_byte: &mut dyn FnMut() -> Result<u8, BusError>,
    ) -> Result<bool, BusError> {
        if self.pattern.is_empty() {
            return Err(BusError::invalid("no trigger filter set"));
        }
        self.output = None;
        let pin = UsedPin::new(
            board.clone(),
            self.pin,
            PinUse::Trigger,
            PinMode::PushPull,
            Pull::Floating,
        )?;
        pin.set(false);
        let fallback = prefix_table(&self.pattern);
        let mut matched = 0;
        while !abort.is_cancelled() {
            let byte = next_byte()?;
            while matched > 0 && byte != self.pattern[matched] {
                matched = fallback[matched - 1];
            }
            if byte == self.pattern[matched] {
                matched += 1;
            }
            if matched == self.pattern.len() {
                pin.set(true);
                log::debug!("trigger fired on pin {}", self.pin);
                self.output = Some(pin);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Lets go of the trigger line.
    pub fn release(&mut self) {
        self.output = None;
    }
}

/// For each prefix of `pattern`, the length of its longest proper prefix
/// that is also a suffix.
fn prefix_table(pattern: &[u8]) -> Vec<usize> {
    let mut table = vec![0; pattern.len()];
    let mut len = 0;
    for i in 1..pattern.len() {
        while len > 0 && pattern[i] != pattern[len] {
            len = table[len - 1];
        }
        if pattern[i] == pattern[len] {
            len += 1;
        }
        table[i] = len;
    }
    table
}

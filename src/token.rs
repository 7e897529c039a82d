//! Tokens of the bus command language and a reference tokenizer.
//!
//! The console front end normally produces the token stream. [`tokenize`]
//! accepts the same surface syntax so scripts and tests can drive the
//! interpreter directly:
//!
//! ```text
//! [ 0xa0 0x00 { r:4 ] &:10 "AB\x41" hd:128
//! ```
use crate::BusError;
use crate::session::BUFFER_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `[`
    Start,
    /// `]`
    Stop,
    /// `{`
    StartRead,
    /// `}`
    StopRead,
    /// `/`
    ClockHigh,
    /// `\`
    ClockLow,
    /// `^`
    ClockPulse,
    /// `-`
    DataHigh,
    /// `_`
    DataLow,
    /// `!`
    DataSample,
    /// `.`
    BitRead,
    /// `~`
    Random,
    /// `&`
    DelayUs,
    /// `%`
    DelayMs,
    /// `r`
    Read,
    /// `hd`
    HexDump,
    /// `w`
    Write,
    Trigger,
    Aux,
    Exit,
    /// Numeric literal, decimal, `0x` or `0b`.
    Uint(u32),
    /// `:<n>` attached to the previous token.
    Suffix(u32),
    /// Unescaped contents of a quoted string.
    Str(Vec<u8>),
    /// Any other word, interpreted by the current mode.
    Word(String),
}

/// Splits a command line into tokens.
pub fn tokenize(line: &str) -> Result<Vec<Token>, BusError> {
    let mut tokens = Vec::new();
    let mut chars = line.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let token = match c {
            '[' => Token::Start,
            ']' => Token::Stop,
            '{' => Token::StartRead,
            '}' => Token::StopRead,
            '/' => Token::ClockHigh,
            '\\' => Token::ClockLow,
            '^' => Token::ClockPulse,
            '-' => Token::DataHigh,
            '_' => Token::DataLow,
            '!' => Token::DataSample,
            '.' => Token::BitRead,
            '~' => Token::Random,
            '&' => Token::DelayUs,
            '%' => Token::DelayMs,
            '"' => {
                chars.next();
                let body_start = start + 1;
                let mut escaped = false;
                let mut end = None;
                for (idx, ch) in chars.by_ref() {
                    match ch {
                        '\\' if !escaped => escaped = true,
                        '"' if !escaped => {
                            end = Some(idx);
                            break;
                        }
                        _ => escaped = false,
                    }
                }
                let end = end.ok_or_else(|| BusError::invalid("unterminated string"))?;
                tokens.push(Token::Str(unescape(&line[body_start..end])?));
                push_suffix(&mut tokens, line, &mut chars)?;
                continue;
            }
            _ => {
                let end = word_end(line, start);
                let word = &line[start..end];
                while chars.peek().is_some_and(|&(idx, _)| idx < end) {
                    chars.next();
                }
                tokens.push(classify(word)?);
                push_suffix(&mut tokens, line, &mut chars)?;
                continue;
            }
        };
        chars.next();
        tokens.push(token);
        push_suffix(&mut tokens, line, &mut chars)?;
    }
    Ok(tokens)
}

/// Words stop at whitespace, a repeat suffix, brackets, quotes and the
/// single character operators that never appear inside a keyword.
fn word_end(line: &str, start: usize) -> usize {
    line[start..]
        .char_indices()
        .find(|&(_, c)| c.is_whitespace() || ":[]{}\"/\\^.!~&%".contains(c))
        .map_or(line.len(), |(offset, _)| start + offset)
}

fn push_suffix(
    tokens: &mut Vec<Token>,
    line: &str,
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
) -> Result<(), BusError> {
    let Some(&(colon, ':')) = chars.peek() else {
        return Ok(());
    };
    chars.next();
    let end = word_end(line, colon + 1);
    while chars.peek().is_some_and(|&(idx, _)| idx < end) {
        chars.next();
    }
    let count = parse_uint(&line[colon + 1..end])
        .ok_or_else(|| BusError::invalid(format!("bad repeat count '{}'", &line[colon + 1..end])))?;
    tokens.push(Token::Suffix(count));
    Ok(())
}

fn classify(word: &str) -> Result<Token, BusError> {
    if word.starts_with(|c: char| c.is_ascii_digit()) {
        return parse_uint(word)
            .map(Token::Uint)
            .ok_or_else(|| BusError::invalid(format!("bad number '{word}'")));
    }
    Ok(match word {
        "r" | "read" => Token::Read,
        "hd" | "hexdump" => Token::HexDump,
        "w" | "write" => Token::Write,
        "trigger" => Token::Trigger,
        "aux" => Token::Aux,
        "exit" => Token::Exit,
        _ => Token::Word(word.to_ascii_lowercase()),
    })
}

/// Parses `123`, `0x7b`, `0b1111011`, and the `k`/`m` multipliers used for
/// frequencies (`400k`, `1m`).
pub fn parse_uint(text: &str) -> Option<u32> {
    let lower = text.to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).ok();
    }
    if let Some(bin) = lower.strip_prefix("0b") {
        return u32::from_str_radix(bin, 2).ok();
    }
    let (digits, scale) = match lower.as_bytes().last()? {
        b'k' => (&lower[..lower.len() - 1], 1_000),
        b'm' => (&lower[..lower.len() - 1], 1_000_000),
        _ => (lower.as_str(), 1),
    };
    digits.parse::<u32>().ok()?.checked_mul(scale)
}

/// Decodes the body of a quoted string.
///
/// `\\` is a backslash and `\xHH` a raw byte; any other escape is rejected.
/// The result never exceeds the transmit buffer.
pub fn unescape(input: &str) -> Result<Vec<u8>, BusError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let byte = if bytes[i] == b'\\' {
            match bytes.get(i + 1) {
                Some(b'\\') => {
                    i += 2;
                    b'\\'
                }
                Some(b'x') => {
                    let hex = input
                        .get(i + 2..i + 4)
                        .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                        .ok_or_else(|| BusError::invalid("bad \\x escape"))?;
                    i += 4;
                    hex
                }
                _ => return Err(BusError::invalid("unknown escape sequence")),
            }
        } else {
            i += 1;
            bytes[i - 1]
        };
        if out.len() == BUFFER_SIZE {
            return Err(BusError::invalid("string exceeds buffer size"));
        }
        out.push(byte);
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn operators_end_a_number() {
        assert_eq!(
            tokenize(r"0x41/ 2\ 3^ 4. 5! 6&:2").unwrap(),
            vec![
                Token::Uint(0x41),
                Token::ClockHigh,
                Token::Uint(2),
                Token::ClockLow,
                Token::Uint(3),
                Token::ClockPulse,
                Token::Uint(4),
                Token::BitRead,
                Token::Uint(5),
                Token::DataSample,
                Token::Uint(6),
                Token::DelayUs,
                Token::Suffix(2),
            ]
        );
    }

    #[test]
    fn escaped_string() {
        assert_eq!(
            unescape(r"AB\x41\\end").unwrap(),
            [b'A', b'B', 0x41, b'\\', b'e', b'n', b'd']
        );
        assert!(unescape(r"\q").is_err());
        assert!(unescape(r"\x4").is_err());
        assert!(unescape(&"a".repeat(257)).is_err());
    }

    #[test]
    fn operators_and_suffixes() {
        let tokens = tokenize("[0xa0 0x41:3 r:4]{ } &:10 %:2 hd:128").unwrap();
        assert_eq!(
            tokens,
            [
                Token::Start,
                Token::Uint(0xa0),
                Token::Uint(0x41),
                Token::Suffix(3),
                Token::Read,
                Token::Suffix(4),
                Token::Stop,
                Token::StartRead,
                Token::StopRead,
                Token::DelayUs,
                Token::Suffix(10),
                Token::DelayMs,
                Token::Suffix(2),
                Token::HexDump,
                Token::Suffix(128),
            ]
        );
    }

    #[test]
    fn bit_operators() {
        let tokens = tokenize(r"/ \ ^ - _ ! . ~:2").unwrap();
        assert_eq!(
            tokens,
            [
                Token::ClockHigh,
                Token::ClockLow,
                Token::ClockPulse,
                Token::DataHigh,
                Token::DataLow,
                Token::DataSample,
                Token::BitRead,
                Token::Random,
                Token::Suffix(2),
            ]
        );
    }

    #[test]
    fn strings_and_words() {
        let tokens = tokenize(r#"w:2 "a\x22b" frequency 400k pull UP"#).unwrap();
        assert_eq!(
            tokens,
            [
                Token::Write,
                Token::Suffix(2),
                Token::Str(b"a\"b".to_vec()),
                Token::Word("frequency".into()),
                Token::Uint(400_000),
                Token::Word("pull".into()),
                Token::Word("up".into()),
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(parse_uint("0b1010"), Some(10));
        assert_eq!(parse_uint("0XFF"), Some(255));
        assert_eq!(parse_uint("1m"), Some(1_000_000));
        assert_eq!(parse_uint("12z"), None);
        assert!(tokenize("0x41:zz").is_err());
        assert!(tokenize("\"open").is_err());
    }
}

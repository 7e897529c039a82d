//! SUMP host command decoder.
//!
//! Opcodes below 0x80 are single bytes, the others carry four parameter
//! bytes, little-endian.

pub const SUMP_RESET: u8 = 0x00;
pub const SUMP_RUN: u8 = 0x01;
pub const SUMP_ID: u8 = 0x02;
pub const SUMP_DESC: u8 = 0x04;
pub const SUMP_XON: u8 = 0x11;
pub const SUMP_XOFF: u8 = 0x13;
pub const SUMP_DIV: u8 = 0x80;
pub const SUMP_CNT: u8 = 0x81;
pub const SUMP_FLAGS: u8 = 0x82;
pub const SUMP_TRIG_1: u8 = 0xc0;
pub const SUMP_TRIG_VALS_1: u8 = 0xc1;

/// Flags byte of the `0x82` command.
#[bitfield_struct::bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct SumpFlags {
    pub demux: bool,
    pub filter: bool,
    /// One bit per group of 8 channels, set = group disabled.
    #[bits(4)]
    pub disabled_groups: u8,
    pub external_clock: bool,
    pub inverted: bool,
}

impl SumpFlags {
    /// Enabled channel groups, bit 0 = channels 0..7.
    pub fn channel_groups(self) -> u8 {
        !self.disabled_groups() & 0x0f
    }
}

/// A decoded host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Reset,
    Run,
    Id,
    Describe,
    XOn,
    XOff,
    /// Raw 24-bit sample rate divider.
    Divider(u32),
    Counts { read_count: u32, delay_count: u32 },
    Flags(SumpFlags),
    TriggerMask { stage: usize, mask: u32 },
    TriggerValue { stage: usize, value: u32 },
    /// Anything else; the engine ignores it.
    Unknown(u8),
}

/// Byte-at-a-time decoder, so the caller can poll its abort signal between
/// host bytes.
#[derive(Debug, Default)]
pub struct Parser {
    opcode: Option<u8>,
    params: heapless::Vec<u8, 4>,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one host byte, returns a command once complete.
    pub fn push(&mut self, byte: u8) -> Option<Command> {
        let Some(opcode) = self.opcode else {
            if byte & 0x80 == 0 {
                return Some(short_command(byte));
            }
            self.opcode = Some(byte);
            self.params.clear();
            return None;
        };
        // capacity is 4 and the buffer is drained once full
        let _ = self.params.push(byte);
        if !self.params.is_full() {
            return None;
        }
        self.opcode = None;
        let p = [self.params[0], self.params[1], self.params[2], self.params[3]];
        Some(long_command(opcode, p))
    }
}

fn short_command(opcode: u8) -> Command {
    match opcode {
        SUMP_RESET => Command::Reset,
        SUMP_RUN => Command::Run,
        SUMP_ID => Command::Id,
        SUMP_DESC => Command::Describe,
        SUMP_XON => Command::XOn,
        SUMP_XOFF => Command::XOff,
        other => Command::Unknown(other),
    }
}

fn long_command(opcode: u8, p: [u8; 4]) -> Command {
    match opcode {
        SUMP_DIV => Command::Divider(u32::from_le_bytes([p[0], p[1], p[2], 0])),
        SUMP_CNT => Command::Counts {
            // both counts are in units of 4 samples
            read_count: (u16::from_le_bytes([p[0], p[1]]) as u32 + 1) << 2,
            delay_count: (u16::from_le_bytes([p[2], p[3]]) as u32) << 2,
        },
        SUMP_FLAGS => Command::Flags(SumpFlags::from_bits(p[0])),
        // 0xc0, 0xc4, 0xc8, 0xcc
        op if op & 0xf3 == SUMP_TRIG_1 => Command::TriggerMask {
            stage: ((op & 0x0c) >> 2) as usize,
            mask: u32::from_le_bytes(p),
        },
        // 0xc1, 0xc5, 0xc9, 0xcd
        op if op & 0xf3 == SUMP_TRIG_VALS_1 => Command::TriggerValue {
            stage: ((op & 0x0c) >> 2) as usize,
            value: u32::from_le_bytes(p),
        },
        other => Command::Unknown(other),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode(bytes: &[u8]) -> Vec<Command> {
        let mut parser = Parser::new();
        bytes.iter().filter_map(|&b| parser.push(b)).collect()
    }

    #[test]
    fn short_and_long_opcodes() {
        assert_eq!(
            decode(&[0x00, 0x02, 0x80, 49, 0, 0, 0, 0x04]),
            vec![Command::Reset, Command::Id, Command::Divider(49), Command::Describe]
        );
    }

    #[test]
    fn counts_are_multiples_of_four() {
        assert_eq!(
            decode(&[0x81, 0xff, 0x07, 0x00, 0x02]),
            vec![Command::Counts {
                read_count: 8192,
                delay_count: 2048
            }]
        );
    }

    #[test]
    fn trigger_stages() {
        let cmds = decode(&[0xc8, 0x01, 0x02, 0x03, 0x04, 0xcd, 0xff, 0, 0, 0]);
        assert_eq!(
            cmds,
            vec![
                Command::TriggerMask {
                    stage: 2,
                    mask: 0x0403_0201
                },
                Command::TriggerValue {
                    stage: 3,
                    value: 0xff
                },
            ]
        );
    }

    #[test]
    fn flags_select_channel_groups() {
        // groups 2 and 3 disabled
        let cmds = decode(&[0x82, 0b0011_0000, 0, 0, 0]);
        let Command::Flags(flags) = cmds[0] else {
            panic!("expected flags, got {cmds:?}");
        };
        assert_eq!(flags.channel_groups(), 0b0011);
        assert!(!flags.demux());
    }

    #[test]
    fn unknown_opcodes_keep_the_stream_aligned() {
        // 0xc2 is a trigger configuration, unsupported here
        assert_eq!(
            decode(&[0x03, 0xc2, 1, 2, 3, 4, 0x01]),
            vec![Command::Unknown(0x03), Command::Unknown(0xc2), Command::Run]
        );
    }
}

//! Raw UART: byte writes, line settings, and an echo of received data.
use super::{FAIL, OK, Raw};
use crate::BusError;
use crate::session::Parity;
use std::io;

pub(super) const HEADER: &[u8] = b"ART1";

const START_ECHO: u8 = 0x02;
const STOP_ECHO: u8 = 0x03;
/// Raw baud rate divisor, not offered.
const BAUD_RATE: u8 = 0x07;
/// `0b0001xxxx`: write `xxxx + 1` bytes, one status each.
const BULK_TRANSFER: u8 = 0x10;
const CONFIG_PERIPH: u8 = 0x40;
/// `0b0110xxxx`: speed from [`SPEEDS`].
const SET_SPEED: u8 = 0x60;
/// `0b100wxxyz`: `xx` parity, `y` two stop bits.
const CONFIG: u8 = 0x80;

/// Baud rate of each speed index; index 9 has none.
const SPEEDS: [Option<u32>; 11] = [
    Some(640),
    Some(1200),
    Some(2400),
    Some(4800),
    Some(9600),
    Some(19_200),
    Some(31_250),
    Some(38_400),
    Some(57_600),
    None,
    Some(115_200),
];

pub(super) fn handle(raw: &mut Raw<'_>, opcode: u8) -> io::Result<()> {
    match opcode {
        START_ECHO | STOP_ECHO => {
            raw.echo = opcode == START_ECHO;
            raw.reply(&[OK])
        }
        BAUD_RATE => raw.reply(&[FAIL]),
        BULK_TRANSFER..=0x1f => {
            for _ in 0..=(opcode - BULK_TRANSFER) {
                let byte = raw.byte()?;
                let result = raw.mode.write(&mut raw.ctx, &[byte]);
                raw.status(result)?;
            }
            Ok(())
        }
        CONFIG_PERIPH..=0x4f => raw.reply(&[OK]),
        SET_SPEED..=0x6f => {
            let result = set_speed(raw, (opcode - SET_SPEED) as usize);
            raw.status(result)
        }
        CONFIG..=0x9f => {
            let result = configure(raw, opcode - CONFIG);
            raw.status(result)
        }
        _ => {
            log::trace!("bbio uart opcode {opcode:#04x} ignored");
            Ok(())
        }
    }
}

fn set_speed(raw: &mut Raw<'_>, index: usize) -> Result<(), BusError> {
    let baudrate = SPEEDS
        .get(index)
        .copied()
        .flatten()
        .ok_or_else(|| BusError::invalid(format!("no UART speed {index}")))?;
    raw.ctx.proto.config.uart_mut().baudrate = baudrate;
    raw.reconfigure()
}

fn configure(raw: &mut Raw<'_>, bits: u8) -> Result<(), BusError> {
    let parity = match bits >> 2 & 0b11 {
        0 => Parity::None,
        1 => Parity::Even,
        2 => Parity::Odd,
        _ => return Err(BusError::invalid("no such parity")),
    };
    let config = raw.ctx.proto.config.uart_mut();
    config.parity = parity;
    config.stop_bits = if bits & 0b10 != 0 { 2 } else { 1 };
    raw.reconfigure()
}

#[cfg(test)]
mod test {
    use crate::bbio::test::session;
    use crate::console::Console;
    use crate::console::test::console;
    use crate::mode::UartMode;
    use crate::mode::uart::test::SimUart;
    use crate::session::Parity;

    fn uart() -> (Console, SimUart) {
        let (mut console, _) = console(16);
        let port = SimUart::default();
        console.register(UartMode::new([port.clone()]));
        (console, port)
    }

    fn reply(tail: &[u8]) -> Vec<u8> {
        let mut expected = b"BBIO1ART1".to_vec();
        expected.extend_from_slice(tail);
        expected
    }

    #[test]
    fn bulk_write_and_echo() {
        let (mut console, port) = uart();
        port.0.lock().unwrap().echo = true;
        let out = session(&mut console, &[0x03, 0x11, b'h', b'i', 0x02]);
        // each written byte is confirmed; the echo then drains what the
        // loopback received
        assert_eq!(out, reply(&[0x01, 0x01, 0x01, b'h', b'i']));
        assert_eq!(port.0.lock().unwrap().sent, b"hi");
    }

    #[test]
    fn received_bytes_wait_for_the_echo() {
        let (mut console, port) = uart();
        port.0.lock().unwrap().pending.extend([0x55, 0xaa]);
        let out = session(&mut console, &[0x03, 0x03, 0x10, 0x00]);
        assert_eq!(out, reply(&[0x01, 0x01]));
        assert_eq!(port.0.lock().unwrap().pending.len(), 2);
    }

    #[test]
    fn line_settings() {
        let (mut console, port) = uart();
        // 115200, then odd parity with two stop bits, then the holes
        let out = session(&mut console, &[0x03, 0x6a, 0x8a, 0x69, 0x8c, 0x07]);
        assert_eq!(out, reply(&[0x01, 0x01, 0x00, 0x00, 0x00]));
        let line = port.0.lock().unwrap();
        let config = line.config.clone().unwrap();
        assert_eq!(config.baudrate, 115_200);
        assert_eq!(config.parity, Parity::Odd);
        assert_eq!(config.stop_bits, 2);
    }
}

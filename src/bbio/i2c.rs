//! Raw I2C: bus conditions, single byte reads with explicit ACK, and
//! acknowledged writes.
use super::{FAIL, OK, Raw};
use crate::i2c::SPEEDS;
use crate::{BusError, Pull};
use std::io;

pub(super) const HEADER: &[u8] = b"I2C1";

const START: u8 = 0x02;
const STOP: u8 = 0x03;
const READ_BYTE: u8 = 0x04;
const ACK: u8 = 0x06;
const NACK: u8 = 0x07;
const WRITE_READ: u8 = 0x08;
const SNIFF: u8 = 0x0f;
/// `0b0001xxxx`: write `xxxx + 1` bytes, one ACK status each.
const BULK_WRITE: u8 = 0x10;
/// `0b0100wxyz`: `x` enables the pull-ups.
const CONFIG_PERIPH: u8 = 0x40;
/// `0b011000xx`: speed index.
const SET_SPEED: u8 = 0x60;

pub(super) fn handle(raw: &mut Raw<'_>, opcode: u8) -> io::Result<()> {
    match opcode {
        START => {
            let result = raw.mode.start(&mut raw.ctx);
            raw.status(result)
        }
        STOP => {
            let result = raw.mode.stop(&mut raw.ctx);
            raw.status(result)
        }
        READ_BYTE => {
            let mut byte = [0u8];
            if let Err(e) = raw.mode.dump(&mut raw.ctx, &mut byte) {
                log::debug!("bbio i2c read: {e}");
            }
            raw.reply(&byte)
        }
        ACK | NACK => {
            let result = raw.mode.send_ack(&mut raw.ctx, opcode == ACK);
            raw.status(result)
        }
        WRITE_READ => write_read(raw),
        SNIFF => raw.reply(&[FAIL]),
        BULK_WRITE..=0x1f => bulk_write(raw, (opcode - BULK_WRITE) as usize + 1),
        CONFIG_PERIPH..=0x4f => {
            raw.ctx.proto.config.i2c_mut().pull = if opcode & 0b100 != 0 {
                Pull::Up
            } else {
                Pull::Floating
            };
            let result = raw.reconfigure();
            raw.status(result)
        }
        SET_SPEED..=0x63 => {
            let (frequency, _) = SPEEDS[(opcode - SET_SPEED) as usize];
            raw.ctx.proto.config.i2c_mut().frequency = frequency;
            let result = raw.reconfigure();
            raw.status(result)
        }
        _ => {
            log::trace!("bbio i2c opcode {opcode:#04x} ignored");
            Ok(())
        }
    }
}

/// Every byte but the last read is acknowledged; the stop condition
/// sends the final NACK.
fn write_read(raw: &mut Raw<'_>) -> io::Result<()> {
    let Some((tx_len, rx_len)) = raw.lengths()? else {
        return raw.reply(&[FAIL]);
    };
    let mut tx = vec![0u8; tx_len];
    raw.bytes(&mut tx)?;
    let mut rx = vec![0u8; rx_len];

    let result = transaction(raw, &tx, &mut rx);
    let stopped = raw.mode.stop(&mut raw.ctx);
    match result.and(stopped) {
        Ok(()) => {
            raw.reply(&[OK])?;
            raw.reply(&rx)
        }
        Err(e) => {
            log::debug!("bbio i2c write-read: {e}");
            raw.reply(&[FAIL])
        }
    }
}

fn transaction(raw: &mut Raw<'_>, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
    raw.mode.start(&mut raw.ctx)?;
    for &byte in tx {
        if !raw.mode.write_acked(&mut raw.ctx, byte)? {
            return Err(BusError::Nack);
        }
    }
    if !rx.is_empty() {
        raw.mode.dump(&mut raw.ctx, rx)?;
    }
    Ok(())
}

/// The status byte goes out before the data; each byte then answers
/// `0x00` when acknowledged and `0x01` otherwise.
fn bulk_write(raw: &mut Raw<'_>, count: usize) -> io::Result<()> {
    raw.reply(&[OK])?;
    let mut tx = [0u8; 16];
    let tx = &mut tx[..count];
    raw.bytes(tx)?;
    for &byte in tx.iter() {
        let acked = match raw.mode.write_acked(&mut raw.ctx, byte) {
            Ok(acked) => acked,
            Err(e) => {
                log::debug!("bbio i2c write: {e}");
                false
            }
        };
        raw.reply(&[u8::from(!acked)])?;
    }
    Ok(())
}

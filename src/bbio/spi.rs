//! Raw SPI: chip select, write-then-read and bulk transfers.
use super::{FAIL, OK, Raw};
use crate::BusError;
use crate::mode::spi::SPEEDS;
use std::io;

pub(super) const HEADER: &[u8] = b"SPI1";

const CS_LOW: u8 = 0x02;
const CS_HIGH: u8 = 0x03;
const WRITE_READ: u8 = 0x04;
const WRITE_READ_NO_CS: u8 = 0x05;
const SNIFF_ALL: u8 = 0x0d;
const SNIFF_CS_HIGH: u8 = 0x0f;
/// `0b0001xxxx`: exchange `xxxx + 1` bytes.
const BULK_TRANSFER: u8 = 0x10;
/// `0b0100xxxy`: `y` is the chip select level.
const CONFIG_PERIPH: u8 = 0x40;
/// `0b01100xxx`: speed index of the current device.
const SET_SPEED: u8 = 0x60;
/// `0b1000xyzd`: `y` polarity, `z` clear for the second clock edge, `d`
/// clear for the second device.
const CONFIG: u8 = 0x80;

pub(super) fn handle(raw: &mut Raw<'_>, opcode: u8) -> io::Result<()> {
    match opcode {
        CS_LOW => {
            let result = chip_select(raw, true);
            raw.status(result)
        }
        CS_HIGH => {
            let result = chip_select(raw, false);
            raw.status(result)
        }
        WRITE_READ | WRITE_READ_NO_CS => write_read(raw, opcode == WRITE_READ),
        // sniffing takes both peripherals as slaves, which the personality
        // does not offer
        SNIFF_ALL..=SNIFF_CS_HIGH => raw.reply(&[FAIL]),
        BULK_TRANSFER..=0x1f => bulk(raw, (opcode - BULK_TRANSFER) as usize + 1),
        CONFIG_PERIPH..=0x4f => {
            let result = chip_select(raw, opcode & 0b1 == 0);
            raw.status(result)
        }
        SET_SPEED..=0x67 => {
            let result = set_speed(raw, (opcode - SET_SPEED) as usize);
            raw.status(result)
        }
        CONFIG..=0x8f => {
            let result = configure(raw, opcode - CONFIG);
            raw.status(result)
        }
        _ => {
            log::trace!("bbio spi opcode {opcode:#04x} ignored");
            Ok(())
        }
    }
}

fn chip_select(raw: &mut Raw<'_>, active: bool) -> Result<(), BusError> {
    if active {
        raw.require(raw.capabilities().start())?;
        raw.mode.start(&mut raw.ctx)
    } else {
        raw.require(raw.capabilities().stop())?;
        raw.mode.stop(&mut raw.ctx)
    }
}

fn write_read(raw: &mut Raw<'_>, select: bool) -> io::Result<()> {
    let Some((tx_len, rx_len)) = raw.lengths()? else {
        return raw.reply(&[FAIL]);
    };
    let mut tx = vec![0u8; tx_len];
    raw.bytes(&mut tx)?;
    let mut rx = vec![0u8; rx_len];

    let mut result = if select { chip_select(raw, true) } else { Ok(()) };
    if result.is_ok() && !tx.is_empty() {
        result = raw.mode.write(&mut raw.ctx, &tx);
    }
    if result.is_ok() && !rx.is_empty() {
        result = raw.mode.dump(&mut raw.ctx, &mut rx);
    }
    if select {
        let released = chip_select(raw, false);
        result = result.and(released);
    }
    match result {
        Ok(()) => {
            raw.reply(&[OK])?;
            raw.reply(&rx)
        }
        Err(e) => {
            log::debug!("bbio spi write-read: {e}");
            raw.reply(&[FAIL])
        }
    }
}

/// Full duplex exchange. The status byte goes out first, so a failed
/// exchange answers zeros.
fn bulk(raw: &mut Raw<'_>, count: usize) -> io::Result<()> {
    raw.reply(&[OK])?;
    let mut tx = [0u8; 16];
    let tx = &mut tx[..count];
    raw.bytes(tx)?;
    let mut rx = [0u8; 16];
    let rx = &mut rx[..count];
    if let Err(e) = raw.mode.write_read(&mut raw.ctx, tx, rx) {
        log::debug!("bbio spi bulk transfer: {e}");
        rx.fill(0);
    }
    raw.reply(rx)
}

fn set_speed(raw: &mut Raw<'_>, index: usize) -> Result<(), BusError> {
    let device = raw.ctx.proto.dev_num as usize;
    raw.ctx.proto.config.spi_mut().frequency = SPEEDS[device][index];
    raw.reconfigure()
}

fn configure(raw: &mut Raw<'_>, bits: u8) -> Result<(), BusError> {
    let device = usize::from(bits & 0b1 == 0);
    let proto = &mut *raw.ctx.proto;
    let previous = proto.dev_num as usize;
    let config = proto.config.spi_mut();
    // the speed index carries over to the other peripheral
    let index = SPEEDS[previous]
        .iter()
        .position(|&speed| speed == config.frequency)
        .unwrap_or(0);
    config.frequency = SPEEDS[device][index];
    config.polarity = bits & 0b100 != 0;
    config.phase = bits & 0b10 == 0;
    proto.dev_num = device as u8;
    raw.reconfigure()
}

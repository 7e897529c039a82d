//! 1-Wire bit timing, ROM search and CRC-8.
use crate::BusError;
use crate::gpio::gpio_fault;
use eh1::delay::DelayNs;
use eh1::digital::{InputPin, OutputPin};

/// ROM layer commands.
pub mod rom {
    pub const SEARCH: u8 = 0xf0;
    pub const READ: u8 = 0x33;
    pub const MATCH: u8 = 0x55;
    pub const SKIP: u8 = 0xcc;
    pub const ALARM_SEARCH: u8 = 0xec;
}

/// Slot level access to a 1-Wire bus.
///
/// Bytes go out LSB first.
pub trait OneWireBus {
    /// Reset pulse. `true` when at least one device answered with a presence pulse.
    fn reset(&mut self) -> Result<bool, BusError>;
    fn write_bit(&mut self, bit: bool) -> Result<(), BusError>;
    fn read_bit(&mut self) -> Result<bool, BusError>;

    fn write_u8(&mut self, byte: u8) -> Result<(), BusError> {
        for i in 0..8 {
            self.write_bit(byte >> i & 1 == 1)?;
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, BusError> {
        let mut byte = 0;
        for i in 0..8 {
            if self.read_bit()? {
                byte |= 1 << i;
            }
        }
        Ok(byte)
    }
}

/// Bit-banged 1-Wire master on an open-drain line.
pub struct OneWire<P, D> {
    pin: P,
    delay: D,
}

impl<P, D> OneWire<P, D>
where
    P: OutputPin + InputPin,
    D: DelayNs,
{
    pub fn new(mut pin: P, delay: D) -> Result<Self, BusError> {
        pin.set_high().map_err(gpio_fault)?;
        Ok(Self { pin, delay })
    }

    pub fn release(self) -> (P, D) {
        (self.pin, self.delay)
    }

    /// Drives (`false`) or releases (`true`) the line outside of a slot.
    pub fn set_line(&mut self, high: bool) -> Result<(), BusError> {
        if high {
            self.pin.set_high().map_err(gpio_fault)
        } else {
            self.pin.set_low().map_err(gpio_fault)
        }
    }

    /// Holds the line low for `low_us`, releases it for `high_us`.
    fn slot(&mut self, low_us: u32, high_us: u32) -> Result<(), BusError> {
        self.pin.set_low().map_err(gpio_fault)?;
        self.delay.delay_us(low_us);
        self.pin.set_high().map_err(gpio_fault)?;
        self.delay.delay_us(high_us);
        Ok(())
    }
}

impl<P, D> OneWireBus for OneWire<P, D>
where
    P: OutputPin + InputPin,
    D: DelayNs,
{
    fn reset(&mut self) -> Result<bool, BusError> {
        self.slot(480, 70)?;
        let presence = self.pin.is_low().map_err(gpio_fault)?;
        self.delay.delay_us(410);
        Ok(presence)
    }

    fn write_bit(&mut self, bit: bool) -> Result<(), BusError> {
        if bit {
            self.slot(6, 64)
        } else {
            self.slot(60, 10)
        }
    }

    fn read_bit(&mut self) -> Result<bool, BusError> {
        self.slot(6, 9)?;
        let bit = self.pin.is_high().map_err(gpio_fault)?;
        self.delay.delay_us(55);
        Ok(bit)
    }
}

const fn crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 { crc >> 1 ^ 0x8c } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Dallas/Maxim CRC-8 (x^8 + x^5 + x^4 + 1, reflected).
static CRC8_TABLE: [u8; 256] = crc8_table();

/// CRC-8 of `data`. A ROM code including its CRC byte sums to zero.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter()
        .fold(0, |crc, &byte| CRC8_TABLE[(crc ^ byte) as usize])
}

/// ROM search state, threaded across successive [`Search::next`] calls.
#[derive(Debug, Clone, Default)]
pub struct Search {
    rom: [u8; 8],
    last_discrepancy: u8,
    last_family_discrepancy: u8,
    last_device: bool,
}

impl Search {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the search at the first device of `family`.
    pub fn target_family(family: u8) -> Self {
        Self {
            rom: [family, 0, 0, 0, 0, 0, 0, 0],
            last_discrepancy: 64,
            last_family_discrepancy: 0,
            last_device: false,
        }
    }

    /// Skips the remaining devices of the current family.
    pub fn skip_family(&mut self) {
        self.last_discrepancy = self.last_family_discrepancy;
        self.last_family_discrepancy = 0;
        if self.last_discrepancy == 0 {
            self.last_device = true;
        }
    }

    fn restart(&mut self) {
        *self = Self::default();
    }

    /// Finds the next device. `Ok(None)` once every device was reported.
    ///
    /// A ROM code whose CRC does not check is rejected with
    /// [`BusError::Crc`]; the search state still moves past it so the next
    /// call continues with the following device. [`Search::rom`] holds the
    /// rejected code.
    pub fn next<B: OneWireBus + ?Sized>(&mut self, bus: &mut B) -> Result<Option<[u8; 8]>, BusError> {
        if self.last_device {
            self.restart();
            return Ok(None);
        }
        if !bus.reset()? {
            self.restart();
            return Ok(None);
        }
        bus.write_u8(rom::SEARCH)?;

        let mut last_zero = 0;
        for id_bit_number in 1..=64u8 {
            let id_bit = bus.read_bit()?;
            let cmp_id_bit = bus.read_bit()?;
            if id_bit && cmp_id_bit {
                // nobody answered this slot
                self.restart();
                return Ok(None);
            }
            let index = (id_bit_number - 1) as usize;
            let (byte, mask) = (index / 8, 1u8 << (index % 8));
            let direction = if id_bit != cmp_id_bit {
                id_bit
            } else if id_bit_number < self.last_discrepancy {
                self.rom[byte] & mask != 0
            } else {
                id_bit_number == self.last_discrepancy
            };
            if id_bit == cmp_id_bit && !direction {
                last_zero = id_bit_number;
                if last_zero < 9 {
                    self.last_family_discrepancy = last_zero;
                }
            }
            if direction {
                self.rom[byte] |= mask;
            } else {
                self.rom[byte] &= !mask;
            }
            bus.write_bit(direction)?;
        }

        if crc8(&self.rom) != 0 {
            log::warn!("1-Wire ROM {:02x?} failed its CRC", self.rom);
            self.advance(last_zero);
            return Err(BusError::Crc);
        }
        if self.rom[0] == 0 {
            self.restart();
            return Ok(None);
        }
        self.advance(last_zero);
        Ok(Some(self.rom))
    }

    fn advance(&mut self, last_zero: u8) {
        self.last_discrepancy = last_zero;
        self.last_device = last_zero == 0;
    }

    /// ROM code walked by the last [`Search::next`] call.
    pub fn rom(&self) -> [u8; 8] {
        self.rom
    }
}

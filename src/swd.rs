use crate::delay::half_period_ns;
use crate::gpio::{IoLine, gpio_fault};
use crate::{BusError, CancelToken};
use eh1::delay::DelayNs;
use eh1::digital::OutputPin;

/// JTAG-to-SWD switch sequence followed by a DPIDR read request, sent LSB first.
///
/// 48 clocks of line reset, the 16-bit `0xe79e` select code, another line
/// reset, two idle bytes, then request `0xa5` (DP read, address 0).
pub const JTAG_TO_SWD: [u8; 17] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7b, 0x9e, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x0f,
    0x00, 0xa5,
];

/// Highest pin count accepted by [`brute_force`].
pub const MAX_BRUTE_PINS: u8 = 12;

// Swd ACK (3 bits, shifted in first bit first)
// 100: OK, 010: WAIT, 001: FAULT
const REPONSE_SUCCESS: u8 = 0b100;

/// Bit-level access to a clock + bidirectional data line pair.
///
/// Bytes are LSB first.
pub trait RawWire {
    /// Drives `bit` on the data line and pulses the clock.
    fn send_bit(&mut self, bit: bool) -> Result<(), BusError>;
    /// Releases the data line, raises the clock, samples, lowers the clock.
    fn read_bit_clock(&mut self) -> Result<bool, BusError>;

    fn write_u8(&mut self, byte: u8) -> Result<(), BusError> {
        for i in 0..8 {
            self.send_bit(byte >> i & 1 == 1)?;
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8, BusError> {
        let mut byte = 0;
        for i in 0..8 {
            byte |= (self.read_bit_clock()? as u8) << i;
        }
        Ok(byte)
    }
}

/// Bit-banged two wire interface (clock + data).
pub struct TwoWire<CLK, IO, D> {
    clk: CLK,
    io: IO,
    delay: D,
    half_period_ns: u32,
}

impl<CLK, IO, D> TwoWire<CLK, IO, D>
where
    CLK: OutputPin,
    IO: IoLine,
    D: DelayNs,
{
    pub fn new(mut clk: CLK, mut io: IO, delay: D, frequency: u32) -> Result<Self, BusError> {
        clk.set_low().map_err(gpio_fault)?;
        io.set_low().map_err(gpio_fault)?;
        Ok(Self {
            clk,
            io,
            delay,
            half_period_ns: half_period_ns(frequency),
        })
    }

    pub fn set_frequency(&mut self, frequency: u32) {
        self.half_period_ns = half_period_ns(frequency);
        log::info!("two wire clock set to {frequency}Hz");
    }

    pub fn release(self) -> (CLK, IO, D) {
        (self.clk, self.io, self.delay)
    }

    pub fn clock_high(&mut self) -> Result<(), BusError> {
        self.delay.delay_ns(self.half_period_ns);
        self.clk.set_high().map_err(gpio_fault)
    }

    pub fn clock_low(&mut self) -> Result<(), BusError> {
        self.delay.delay_ns(self.half_period_ns);
        self.clk.set_low().map_err(gpio_fault)
    }

    pub fn clock(&mut self) -> Result<(), BusError> {
        self.clock_high()?;
        self.clock_low()
    }

    pub fn data(&mut self, high: bool) -> Result<(), BusError> {
        self.io.set_as_output().map_err(gpio_fault)?;
        if high {
            self.io.set_high().map_err(gpio_fault)
        } else {
            self.io.set_low().map_err(gpio_fault)
        }
    }

    /// Samples the data line without clocking.
    pub fn read_bit(&mut self) -> Result<bool, BusError> {
        self.io.set_as_input().map_err(gpio_fault)?;
        self.io.is_high().map_err(gpio_fault)
    }
}

impl<CLK, IO, D> RawWire for TwoWire<CLK, IO, D>
where
    CLK: OutputPin,
    IO: IoLine,
    D: DelayNs,
{
    fn send_bit(&mut self, bit: bool) -> Result<(), BusError> {
        self.data(bit)?;
        self.clock()
    }

    fn read_bit_clock(&mut self) -> Result<bool, BusError> {
        self.io.set_as_input().map_err(gpio_fault)?;
        self.clock_high()?;
        let bit = self.io.is_high().map_err(gpio_fault)?;
        self.clock_low()?;
        Ok(bit)
    }
}

/// Switches the target to SWD and reads its ID code.
///
/// `None` when the target did not answer with an OK acknowledge.
pub fn read_idcode<W: RawWire + ?Sized>(wire: &mut W) -> Result<Option<u32>, BusError> {
    for byte in JTAG_TO_SWD {
        wire.write_u8(byte)?;
    }
    let mut status = 0u8;
    for _ in 0..3 {
        status = status << 1 | wire.read_bit_clock()? as u8;
    }
    let mut idcode = 0u32;
    for i in 0..4 {
        idcode |= (wire.read_u8()? as u32) << (8 * i);
    }
    if status == REPONSE_SUCCESS {
        Ok(Some(idcode))
    } else {
        log::debug!("swd ack {status:#05b}");
        Ok(None)
    }
}

/// A pin assignment that answered the ID code probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwdPins {
    pub clk: u8,
    pub io: u8,
    pub idcode: u32,
}

/// Tries every ordered (clk, io) pair among the first `pins` pins.
///
/// `open` configures a wire on the given pair; it is dropped before the next
/// pair is tried. Returns the first pair whose ID code is neither zero nor
/// all ones, or `None` when nothing answered or `abort` was raised.
pub fn brute_force<W, F>(
    pins: u8,
    abort: &CancelToken,
    mut open: F,
) -> Result<Option<SwdPins>, BusError>
where
    W: RawWire,
    F: FnMut(u8, u8) -> Result<W, BusError>,
{
    if pins < 2 || pins > MAX_BRUTE_PINS {
        return Err(BusError::invalid(format!(
            "brute force needs 2 to {MAX_BRUTE_PINS} pins"
        )));
    }
    for clk in 0..pins {
        for io in 0..pins {
            if clk == io {
                continue;
            }
            if abort.is_cancelled() {
                return Ok(None);
            }
            let mut wire = open(clk, io)?;
            if let Some(idcode) = read_idcode(&mut wire)? {
                if idcode != 0 && idcode != u32::MAX {
                    return Ok(Some(SwdPins { clk, io, idcode }));
                }
            }
        }
    }
    Ok(None)
}

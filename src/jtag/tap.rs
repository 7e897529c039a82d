use super::{ChainDecoder, MAX_DEVICES};
use crate::delay::half_period_ns;
use crate::gpio::gpio_fault;
use crate::BusError;
use eh1::delay::DelayNs;
use eh1::digital::{InputPin, OutputPin};

// TMS sequences, first bit clocked first.
// five clocks with TMS high reach Test-Logic-Reset from any state.
const ANY2IDLE: &[bool] = &[true, true, true, true, true, false];
const IDLE2DR: &[bool] = &[true, false, false];
const IDLE2IR: &[bool] = &[true, true, false, false];
// Exit1 -> Update -> Run-Test/Idle
const EXIT2IDLE: &[bool] = &[true, false];

/// Bit-banged JTAG master.
///
/// TDI and TMS change while TCK is low and TDO is sampled just before the
/// rising edge.
pub struct Jtag<O, I, D> {
    tck: O,
    tms: O,
    tdi: O,
    tdo: I,
    delay: D,
    half_period_ns: u32,
}

impl<O, I, D> Jtag<O, I, D>
where
    O: OutputPin,
    I: InputPin,
    D: DelayNs,
{
    pub fn new(
        mut tck: O,
        tms: O,
        tdi: O,
        tdo: I,
        delay: D,
        frequency: u32,
    ) -> Result<Self, BusError> {
        // TCK must idle low
        tck.set_low().map_err(gpio_fault)?;
        Ok(Self {
            tck,
            tms,
            tdi,
            tdo,
            delay,
            half_period_ns: half_period_ns(frequency),
        })
    }

    pub fn set_frequency(&mut self, frequency: u32) {
        self.half_period_ns = half_period_ns(frequency);
        log::info!("jtag clock set to {frequency}Hz");
    }

    pub fn release(self) -> (O, O, O, I, D) {
        (self.tck, self.tms, self.tdi, self.tdo, self.delay)
    }

    /// One TCK cycle; returns TDO as seen before the rising edge.
    pub fn clock(&mut self, tms: bool, tdi: bool) -> Result<bool, BusError> {
        self.tms.set_state(tms.into()).map_err(gpio_fault)?;
        self.tdi.set_state(tdi.into()).map_err(gpio_fault)?;
        self.delay.delay_ns(self.half_period_ns);
        let tdo = self.tdo.is_high().map_err(gpio_fault)?;
        self.tck.set_high().map_err(gpio_fault)?;
        self.delay.delay_ns(self.half_period_ns);
        self.tck.set_low().map_err(gpio_fault)?;
        Ok(tdo)
    }

    pub fn clock_high(&mut self) -> Result<(), BusError> {
        self.delay.delay_ns(self.half_period_ns);
        self.tck.set_high().map_err(gpio_fault)
    }

    pub fn clock_low(&mut self) -> Result<(), BusError> {
        self.delay.delay_ns(self.half_period_ns);
        self.tck.set_low().map_err(gpio_fault)
    }

    pub fn set_tms(&mut self, high: bool) -> Result<(), BusError> {
        self.tms.set_state(high.into()).map_err(gpio_fault)
    }

    pub fn set_tdi(&mut self, high: bool) -> Result<(), BusError> {
        self.tdi.set_state(high.into()).map_err(gpio_fault)
    }

    /// Samples TDO without clocking.
    pub fn read_tdo(&mut self) -> Result<bool, BusError> {
        self.tdo.is_high().map_err(gpio_fault)
    }

    /// Raises TCK, samples TDO, lowers TCK.
    pub fn read_bit_clock(&mut self) -> Result<bool, BusError> {
        self.clock_high()?;
        let tdo = self.read_tdo()?;
        self.clock_low()?;
        Ok(tdo)
    }

    /// Shifts a byte out on TDI, LSB first, with TMS low.
    pub fn write_u8(&mut self, byte: u8) -> Result<(), BusError> {
        for i in 0..8 {
            self.clock(false, byte >> i & 1 == 1)?;
        }
        Ok(())
    }

    /// LSB first.
    pub fn read_u8(&mut self) -> Result<u8, BusError> {
        let mut byte = 0;
        for i in 0..8 {
            byte |= (self.read_bit_clock()? as u8) << i;
        }
        Ok(byte)
    }

    fn clock_tms(&mut self, path: &[bool]) -> Result<(), BusError> {
        for &tms in path {
            self.clock(tms, false)?;
        }
        Ok(())
    }

    /// Test-Logic-Reset, then Run-Test/Idle.
    pub fn goto_idle(&mut self) -> Result<(), BusError> {
        self.clock_tms(ANY2IDLE)
    }

    /// Resets the TAPs and walks to Shift-DR, where every device without an
    /// IDCODE register exposes its bypass bit.
    pub fn reset2dr(&mut self) -> Result<(), BusError> {
        self.clock_tms(ANY2IDLE)?;
        self.clock_tms(IDLE2DR)
    }

    /// Shifts `bits` through the current Shift state, leaving it on the
    /// last bit when `exit` is set.
    pub fn shift(&mut self, bits: &[bool], exit: bool) -> Result<Vec<bool>, BusError> {
        let mut tdo = Vec::with_capacity(bits.len());
        for (i, &bit) in bits.iter().enumerate() {
            let last = exit && i + 1 == bits.len();
            tdo.push(self.clock(last, bit)?);
        }
        Ok(tdo)
    }

    /// Reads the IDCODE chain while shifting `tdi` into Shift-DR.
    ///
    /// `None` entries are devices in bypass. Shifting ones ends the scan on
    /// the all-ones word that follows the chain.
    pub fn scan_with(&mut self, tdi: bool) -> Result<Vec<Option<u32>>, BusError> {
        self.reset2dr()?;
        let mut decoder = ChainDecoder::new();
        // longest chain plus the terminating word
        for _ in 0..(MAX_DEVICES + 1) * 32 {
            let tdo = self.clock(false, tdi)?;
            if decoder.push(tdo) {
                break;
            }
        }
        self.clock(true, tdi)?;
        self.clock_tms(EXIT2IDLE)?;
        let ids = decoder.finish();
        log::debug!("jtag chain: {ids:x?}");
        Ok(ids)
    }

    /// Counts the devices in the chain by loading BYPASS everywhere.
    ///
    /// `ir_bits` must cover the total instruction register length.
    pub fn count_devices(&mut self, ir_bits: usize) -> Result<Option<usize>, BusError> {
        self.goto_idle()?;
        self.clock_tms(IDLE2IR)?;
        self.shift(&vec![true; ir_bits.max(1)], true)?;
        self.clock_tms(EXIT2IDLE)?;
        self.clock_tms(IDLE2DR)?;
        // flush the bypass registers, then time a single one through them
        self.shift(&[false; MAX_DEVICES], false)?;
        let mut count = None;
        for i in 0..=MAX_DEVICES {
            if self.clock(false, true)? {
                count = Some(i);
                break;
            }
        }
        self.clock(true, false)?;
        self.clock_tms(EXIT2IDLE)?;
        Ok(count)
    }
}


#[cfg(test)]
mod test {
    use super::sim::{Chain, Device, Out, Role, Tdo};
    use super::*;
    use crate::delay::NoDelay;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn jtag(chain: &Rc<RefCell<Chain>>) -> Jtag<Out, Tdo, NoDelay> {
        Jtag::new(
            Out(chain.clone(), Role::Tck),
            Out(chain.clone(), Role::Tms),
            Out(chain.clone(), Role::Tdi),
            Tdo(chain.clone()),
            NoDelay,
            1_000_000,
        )
        .unwrap()
    }

    #[test]
    fn idcode_chain_with_bypass_device() {
        let chain = Chain::new(vec![
            Device::new(Some(0x4ba0_0477), 4),
            Device::new(None, 5),
            Device::new(Some(0x0640_4093), 6),
        ]);
        let mut jtag = jtag(&chain);
        let ids = jtag.scan_with(true).unwrap();
        assert_eq!(ids, vec![Some(0x4ba0_0477), None, Some(0x0640_4093)]);
        assert!(chain.borrow().in_idle());
    }

    #[test]
    fn zero_fill_drops_trailing_padding() {
        let chain = Chain::new(vec![Device::new(Some(0x1234_5677), 4)]);
        let ids = jtag(&chain).scan_with(false).unwrap();
        assert_eq!(ids, vec![Some(0x1234_5677)]);
    }

    #[test]
    fn bypass_counts_devices() {
        let chain = Chain::new(vec![
            Device::new(Some(0x4ba0_0477), 4),
            Device::new(None, 5),
            Device::new(Some(0x0640_4093), 6),
        ]);
        let mut jtag = jtag(&chain);
        assert_eq!(jtag.count_devices(64).unwrap(), Some(3));
        assert!(chain.borrow().in_idle());
    }

    #[test]
    fn empty_chain_reads_nothing() {
        let chain = Chain::new(vec![]);
        let ids = jtag(&chain).scan_with(true).unwrap();
        assert!(ids.is_empty());
    }
}

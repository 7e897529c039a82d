use crate::gpio::gpio_fault;
use crate::{BusError, CancelToken};
use eh1::delay::DelayNs;
use eh1::digital::{InputPin, OutputPin};
use eh1::i2c::{Operation, SevenBitAddress};

/// Supported bus speeds and their half-clock delay in nanoseconds.
pub const SPEEDS: [(u32, u32); 4] = [
    (50_000, 10_000),
    (100_000, 5_000),
    (400_000, 1_250),
    (1_000_000, 500),
];

/// Half-clock delay of a supported `frequency`.
pub fn half_clock_ns(frequency: u32) -> Option<u32> {
    SPEEDS
        .iter()
        .find(|&&(speed, _)| speed == frequency)
        .map(|&(_, delay)| delay)
}

/// First and last 7-bit address probed by [`SoftI2c::scan`].
const SCAN_RANGE: std::ops::RangeInclusive<u8> = 0x01..=0x77;

/// Bit-banged open-drain I2C master.
///
/// Both lines are open drain: `set_high` releases the line and the pull-up
/// brings it high. No clock stretching.
pub struct SoftI2c<SCL, SDA, D> {
    scl: SCL,
    sda: SDA,
    delay: D,
    half_clock_ns: u32,
    frequency: u32,
    /// A START was sent without its STOP; the next START is a repeated one.
    started: bool,
}

impl<SCL, SDA, D> SoftI2c<SCL, SDA, D>
where
    SCL: OutputPin,
    SDA: OutputPin + InputPin,
    D: DelayNs,
{
    pub fn new(scl: SCL, sda: SDA, delay: D, frequency: u32) -> Result<Self, BusError> {
        let half_clock_ns = half_clock_ns(frequency)
            .ok_or_else(|| BusError::invalid(format!("unsupported i2c frequency {frequency}Hz")))?;
        let mut this = Self {
            scl,
            sda,
            delay,
            half_clock_ns,
            frequency,
            started: false,
        };
        this.sda_float()?;
        this.scl_float()?;
        Ok(this)
    }

    pub fn set_frequency(&mut self, frequency: u32) -> Result<(), BusError> {
        self.half_clock_ns = half_clock_ns(frequency).ok_or_else(|| {
            log::warn!("i2c frequency {frequency}Hz is not in the speed table");
            BusError::invalid(format!("unsupported i2c frequency {frequency}Hz"))
        })?;
        self.frequency = frequency;
        log::info!("I2C frequency set to {frequency}Hz");
        Ok(())
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    pub fn release(self) -> (SCL, SDA, D) {
        (self.scl, self.sda, self.delay)
    }

    fn wait(&mut self) {
        self.delay.delay_ns(self.half_clock_ns);
    }

    fn scl_low(&mut self) -> Result<(), BusError> {
        self.scl.set_low().map_err(gpio_fault)
    }

    fn scl_float(&mut self) -> Result<(), BusError> {
        self.scl.set_high().map_err(gpio_fault)
    }

    fn sda_low(&mut self) -> Result<(), BusError> {
        self.sda.set_low().map_err(gpio_fault)
    }

    fn sda_float(&mut self) -> Result<(), BusError> {
        self.sda.set_high().map_err(gpio_fault)
    }

    fn sda_get(&mut self) -> Result<bool, BusError> {
        self.sda.is_high().map_err(gpio_fault)
    }

    /// START, or repeated START when the bus is already owned.
    pub fn start(&mut self) -> Result<(), BusError> {
        if self.started {
            self.sda_float()?;
            self.wait();
            self.scl_float()?;
            self.wait();
        }
        // both lines released (high) here
        self.sda_low()?;
        self.wait();
        self.scl_low()?;
        self.started = true;
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), BusError> {
        self.sda_low()?;
        self.wait();
        self.scl_float()?;
        self.wait();
        self.sda_float()?;
        self.wait();
        self.started = false;
        Ok(())
    }

    /// Shifts out one byte MSB first and returns whether the target ACKed.
    pub fn write_u8(&mut self, byte: u8) -> Result<bool, BusError> {
        for bit in (0..8).rev() {
            if byte >> bit & 1 == 1 {
                self.sda_float()?;
            } else {
                self.sda_low()?;
            }
            self.wait();
            self.scl_float()?;
            self.wait();
            self.scl_low()?;
        }
        // 9th clock: ACK from the target
        self.sda_float()?;
        self.wait();
        self.scl_float()?;
        self.wait();
        let nack = self.sda_get()?;
        self.scl_low()?;
        self.wait();
        Ok(!nack)
    }

    /// Shifts in one byte MSB first. The ACK/NACK is left to [`Self::send_ack`].
    pub fn read_u8(&mut self) -> Result<u8, BusError> {
        let mut data = 0u8;
        for _ in 0..8 {
            self.sda_float()?;
            self.wait();
            self.scl_float()?;
            self.wait();
            data = data << 1 | self.sda_get()? as u8;
            self.scl_low()?;
            self.wait();
        }
        Ok(data)
    }

    /// Master ACK (`true`) or NACK after a read byte.
    pub fn send_ack(&mut self, ack: bool) -> Result<(), BusError> {
        if ack {
            self.sda_low()?;
        } else {
            self.sda_float()?;
        }
        self.wait();
        self.scl_float()?;
        self.wait();
        self.scl_low()?;
        Ok(())
    }

    /// Addresses `address` for writing and reports whether it answered.
    pub fn probe(&mut self, address: u8) -> Result<bool, BusError> {
        self.start()?;
        let acked = self.write_u8(address << 1);
        self.stop()?;
        acked
    }

    /// Probes every 7-bit address, stopping early on abort.
    pub fn scan(&mut self, abort: &CancelToken) -> Result<Vec<u8>, BusError> {
        let mut found = Vec::new();
        for address in SCAN_RANGE {
            if abort.is_cancelled() {
                break;
            }
            if self.probe(address)? {
                log::debug!("i2c device at {address:#04x}");
                found.push(address);
            }
        }
        Ok(found)
    }

    fn run(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), BusError> {
        let mut previous_read = None;
        for i in 0..operations.len() {
            let is_read = matches!(operations[i], Operation::Read(_));
            let next_read = operations
                .get(i + 1)
                .map(|op| matches!(op, Operation::Read(_)));
            if previous_read != Some(is_read) {
                self.start()?;
                if !self.write_u8(address << 1 | is_read as u8)? {
                    return Err(BusError::Nack);
                }
            }
            match &mut operations[i] {
                Operation::Write(bytes) => {
                    for &byte in bytes.iter() {
                        if !self.write_u8(byte)? {
                            return Err(BusError::Nack);
                        }
                    }
                }
                Operation::Read(buffer) => {
                    let len = buffer.len();
                    for (j, slot) in buffer.iter_mut().enumerate() {
                        *slot = self.read_u8()?;
                        let last = j + 1 == len && next_read != Some(true);
                        self.send_ack(!last)?;
                    }
                }
            }
            previous_read = Some(is_read);
        }
        Ok(())
    }
}

impl<SCL, SDA, D> eh1::i2c::ErrorType for SoftI2c<SCL, SDA, D> {
    type Error = BusError;
}

impl<SCL, SDA, D> eh1::i2c::I2c<SevenBitAddress> for SoftI2c<SCL, SDA, D>
where
    SCL: OutputPin,
    SDA: OutputPin + InputPin,
    D: DelayNs,
{
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let result = self.run(address, operations);
        self.stop()?;
        result
    }
}

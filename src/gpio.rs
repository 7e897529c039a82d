use crate::{BusError, Pull};
use std::sync::{Arc, Mutex};

/// State tracker for each pin of the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinUse {
    Output,
    Input,
    Spi,
    I2c,
    OneWire,
    TwoWire,
    ThreeWire,
    Wiegand,
    Jtag,
    Smartcard,
    Aux,
    Trigger,
}

/// Electrical configuration of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    Input,
    PushPull,
    /// Driven low or released; a released line reads the bus level.
    OpenDrain,
}

/// Register level access to the board's GPIO port.
///
/// Implemented by the board glue; every method is infallible because a
/// GPIO register write can not fail once the pin exists.
pub trait GpioPort: Send {
    fn configure(&mut self, pin: u8, mode: PinMode, pull: Pull);
    fn write(&mut self, pin: u8, high: bool);
    fn read(&mut self, pin: u8) -> bool;
}

/// Pin bank of the probe.
/// Tracks which protocol owns each pin so two personalities never drive
/// the same line.
pub struct Board {
    port: Box<dyn GpioPort>,
    /// Protocol allocation status for each pin
    pins: Vec<Option<PinUse>>,
}

/// Thread-safe handle shared by every claimed pin.
pub type SharedBoard = Arc<Mutex<Board>>;

impl Board {
    pub fn new(port: impl GpioPort + 'static, pin_count: u8) -> Self {
        Self {
            port: Box::new(port),
            pins: vec![None; pin_count as usize],
        }
    }

    pub fn shared(self) -> SharedBoard {
        Arc::new(Mutex::new(self))
    }

    pub fn pin_count(&self) -> u8 {
        self.pins.len() as u8
    }

    /// Current owner of `pin`, `None` when free.
    pub fn usage(&self, pin: u8) -> Option<PinUse> {
        self.pins.get(pin as usize).copied().flatten()
    }

    /// Allocate a pin for a specific use.
    pub(crate) fn alloc_pin(&mut self, pin: u8, usage: PinUse) -> Result<(), BusError> {
        log::trace!("alloc pin {pin} for {usage:?}");
        let slot = self
            .pins
            .get_mut(pin as usize)
            .ok_or(BusError::PinNotValid(pin))?;
        if let Some(current) = *slot {
            return Err(BusError::PinInUse {
                pin,
                purpose: usage,
                current,
            });
        }
        *slot = Some(usage);
        Ok(())
    }

    /// Release a pin and park it as a floating input.
    pub(crate) fn free_pin(&mut self, pin: u8) {
        log::trace!("free pin {pin}");
        if let Some(slot) = self.pins.get_mut(pin as usize) {
            *slot = None;
            self.port.configure(pin, PinMode::Input, Pull::Floating);
        }
    }

    pub(crate) fn configure(&mut self, pin: u8, mode: PinMode, pull: Pull) {
        self.port.configure(pin, mode, pull);
    }

    pub(crate) fn write(&mut self, pin: u8, high: bool) {
        self.port.write(pin, high);
    }

    pub(crate) fn read(&mut self, pin: u8) -> bool {
        self.port.read(pin)
    }
}

/// Maps a GPIO driver error onto the bus taxonomy.
pub(crate) fn gpio_fault<E: eh1::digital::Error>(err: E) -> BusError {
    log::warn!("gpio fault: {:?}", err.kind());
    BusError::Hardware("gpio")
}

/// A line that can turn around between driving and sampling.
///
/// Bidirectional protocols (SWD, 1-Wire on push-pull boards) release the
/// line with [`IoLine::set_as_input`] before reading the target.
pub trait IoLine: eh1::digital::OutputPin + eh1::digital::InputPin {
    fn set_as_input(&mut self) -> Result<(), Self::Error>;
    fn set_as_output(&mut self) -> Result<(), Self::Error>;
}

/// A claimed board pin.
///
/// The claim is released, and the pin parked as a floating input, when the
/// value is dropped.
pub struct UsedPin {
    /// Thread-safe handle to the board
    mtx: SharedBoard,
    pin: u8,
    /// Mode restored by [`IoLine::set_as_output`]
    mode: PinMode,
    pull: Pull,
}

impl Drop for UsedPin {
    fn drop(&mut self) {
        let mut lock = self.mtx.lock().unwrap();
        lock.free_pin(self.pin);
    }
}

impl UsedPin {
    pub fn new(
        mtx: SharedBoard,
        pin: u8,
        usage: PinUse,
        mode: PinMode,
        pull: Pull,
    ) -> Result<Self, BusError> {
        let mut lock = mtx.lock().unwrap();
        lock.alloc_pin(pin, usage)?;
        if mode != PinMode::Input {
            // released/idle level before the driver is enabled
            lock.write(pin, true);
        }
        lock.configure(pin, mode, pull);
        drop(lock);
        Ok(UsedPin {
            mtx,
            pin,
            mode,
            pull,
        })
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub(crate) fn set(&self, high: bool) {
        let mut lock = self.mtx.lock().unwrap();
        lock.write(self.pin, high);
    }

    pub(crate) fn get(&self) -> bool {
        let mut lock = self.mtx.lock().unwrap();
        lock.read(self.pin)
    }

    pub fn set_pull(&mut self, pull: Pull) {
        self.pull = pull;
        let mut lock = self.mtx.lock().unwrap();
        lock.configure(self.pin, self.mode, pull);
    }
}

impl eh1::digital::ErrorType for UsedPin {
    type Error = BusError;
}

impl eh1::digital::OutputPin for UsedPin {
    fn set_low(&mut self) -> Result<(), BusError> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), BusError> {
        self.set(true);
        Ok(())
    }
}

impl eh1::digital::InputPin for UsedPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.get())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.get())
    }
}

impl IoLine for UsedPin {
    fn set_as_input(&mut self) -> Result<(), BusError> {
        let mut lock = self.mtx.lock().unwrap();
        lock.configure(self.pin, PinMode::Input, self.pull);
        Ok(())
    }

    fn set_as_output(&mut self) -> Result<(), BusError> {
        let mut lock = self.mtx.lock().unwrap();
        lock.configure(self.pin, self.mode, self.pull);
        Ok(())
    }
}

/// Simulated GPIO port shared by the unit tests.
#[cfg(test)]
pub(crate) mod sim {
    use super::{GpioPort, PinMode};
    use crate::Pull;
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    pub(crate) struct PortState {
        pub(crate) modes: Vec<(PinMode, Pull)>,
        pub(crate) outputs: Vec<bool>,
        /// Level forced by the outside world, `None` when nothing drives it.
        pub(crate) inputs: Vec<Option<bool>>,
        /// Every register write, in order.
        pub(crate) writes: Vec<(u8, bool)>,
    }

    #[derive(Clone)]
    pub(crate) struct SimPort(pub(crate) Arc<Mutex<PortState>>);

    impl SimPort {
        pub(crate) fn new(pins: usize) -> Self {
            SimPort(Arc::new(Mutex::new(PortState {
                modes: vec![(PinMode::Input, Pull::Floating); pins],
                outputs: vec![false; pins],
                inputs: vec![None; pins],
                writes: Vec::new(),
            })))
        }

        pub(crate) fn drive(&self, pin: u8, level: Option<bool>) {
            self.0.lock().unwrap().inputs[pin as usize] = level;
        }

        pub(crate) fn output(&self, pin: u8) -> bool {
            self.0.lock().unwrap().outputs[pin as usize]
        }

        pub(crate) fn mode(&self, pin: u8) -> PinMode {
            self.0.lock().unwrap().modes[pin as usize].0
        }
    }

    impl GpioPort for SimPort {
        fn configure(&mut self, pin: u8, mode: PinMode, pull: Pull) {
            self.0.lock().unwrap().modes[pin as usize] = (mode, pull);
        }

        fn write(&mut self, pin: u8, high: bool) {
            let mut state = self.0.lock().unwrap();
            state.outputs[pin as usize] = high;
            state.writes.push((pin, high));
        }

        fn read(&mut self, pin: u8) -> bool {
            let state = self.0.lock().unwrap();
            let (mode, pull) = state.modes[pin as usize];
            let external = state.inputs[pin as usize];
            match mode {
                PinMode::PushPull => state.outputs[pin as usize],
                PinMode::OpenDrain => state.outputs[pin as usize] && external.unwrap_or(true),
                PinMode::Input => external.unwrap_or(pull == Pull::Up),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::sim::SimPort;
    use super::*;
    use eh1::digital::{InputPin, OutputPin};

    #[test]
    fn claim_conflict_and_release() {
        let port = SimPort::new(8);
        let board = Board::new(port.clone(), 8).shared();
        let first = UsedPin::new(
            board.clone(),
            3,
            PinUse::I2c,
            PinMode::OpenDrain,
            Pull::Up,
        )
        .unwrap();
        let err = UsedPin::new(board.clone(), 3, PinUse::Spi, PinMode::PushPull, Pull::Floating)
            .err()
            .unwrap();
        assert_eq!(
            err,
            BusError::PinInUse {
                pin: 3,
                purpose: PinUse::Spi,
                current: PinUse::I2c
            }
        );
        drop(first);
        assert_eq!(board.lock().unwrap().usage(3), None);
        assert_eq!(port.mode(3), PinMode::Input);
        assert!(
            UsedPin::new(board, 3, PinUse::Spi, PinMode::PushPull, Pull::Floating).is_ok()
        );
    }

    #[test]
    fn pin_out_of_range() {
        let board = Board::new(SimPort::new(4), 4).shared();
        let err = UsedPin::new(board, 9, PinUse::Aux, PinMode::Input, Pull::Floating)
            .err()
            .unwrap();
        assert_eq!(err, BusError::PinNotValid(9));
    }

    #[test]
    fn open_drain_reads_bus_level() {
        let port = SimPort::new(4);
        let board = Board::new(port.clone(), 4).shared();
        let mut pin = UsedPin::new(board, 1, PinUse::OneWire, PinMode::OpenDrain, Pull::Up).unwrap();
        pin.set_high().unwrap();
        assert!(pin.is_high().unwrap());
        port.drive(1, Some(false));
        assert!(pin.is_low().unwrap());
        port.drive(1, None);
        pin.set_low().unwrap();
        assert!(pin.is_low().unwrap());
        assert!(!port.output(1));
    }

    #[test]
    fn io_line_turnaround() {
        let port = SimPort::new(4);
        let board = Board::new(port.clone(), 4).shared();
        let mut pin = UsedPin::new(board, 2, PinUse::TwoWire, PinMode::PushPull, Pull::Floating).unwrap();
        pin.set_as_input().unwrap();
        assert_eq!(port.mode(2), PinMode::Input);
        port.drive(2, Some(true));
        assert!(pin.is_high().unwrap());
        pin.set_as_output().unwrap();
        assert_eq!(port.mode(2), PinMode::PushPull);
    }
}

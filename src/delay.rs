//! Delay providers for the bit-bang engines.
use eh1::delay::DelayNs;
use std::time::Duration;

/// Blocking delay backed by the host scheduler.
///
/// Sub-microsecond requests are rounded up by the OS, which only stretches
/// the bit timing of the bit-bang protocols. All of them tolerate slow clocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct Delay;

impl DelayNs for Delay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(ns as u64));
    }
    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us as u64));
    }
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Delay that returns immediately, for simulated buses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// Half period in nanoseconds of a bit-bang clock running at `frequency_hz`.
pub(crate) fn half_period_ns(frequency_hz: u32) -> u32 {
    let frequency_hz = frequency_hz.max(1);
    (500_000_000 / frequency_hz).max(1)
}

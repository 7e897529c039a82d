//! Frequency, duty cycle and baud rate measurement on the input capture
//! timer.
use crate::{BusError, CancelToken};

/// Timer clock feeding the capture prescaler.
pub const BASE_CLOCK_HZ: u32 = 168_000_000;

/// Both capture registers lag the input edge by two timer ticks.
const CAPTURE_LATENCY: u32 = 2;
const MAX_SCALE: u16 = 1 << 15;
const BAUD_SAMPLES: usize = 10;
/// Captures tried per baud sample before giving up on a valid low time.
const BAUD_RETRIES: usize = 64;

/// Two channel input capture on one pin.
///
/// Channel 1 latches on every rising edge (period), channel 2 on the
/// falling edge (high time), both relative to the previous rising edge.
pub trait InputCapture: Send {
    fn init(&mut self, scale: u16) -> Result<(), BusError>;
    /// Waits for a full period; `Err(Timeout)` when `abort` fires first.
    fn sample(&mut self, abort: &CancelToken) -> Result<(), BusError>;
    fn period(&mut self) -> u32;
    fn high_time(&mut self) -> u32;
    fn deinit(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub frequency: u32,
    /// High time in percent of the period.
    pub duty: u32,
    /// Prescaler the capture settled on.
    pub scale: u16,
}

fn capture<C: InputCapture + ?Sized>(
    cap: &mut C,
    scale: u16,
    abort: &CancelToken,
) -> Result<(u32, u32), BusError> {
    cap.init(scale)?;
    cap.sample(abort)?;
    Ok((
        cap.period().saturating_add(CAPTURE_LATENCY),
        cap.high_time().saturating_add(CAPTURE_LATENCY),
    ))
}

/// Measures the signal, doubling the prescaler while the counter wraps
/// within one period.
pub fn measure<C: InputCapture + ?Sized>(
    cap: &mut C,
    abort: &CancelToken,
    base_clock: u32,
) -> Result<Measurement, BusError> {
    let mut scale = 1u16;
    let result = loop {
        let (period, high) = match capture(cap, scale, abort) {
            Ok(values) => values,
            Err(e) => break Err(e),
        };
        if high <= period {
            break Ok(Measurement {
                frequency: (base_clock as u64 / (scale as u64 * period as u64)) as u32,
                duty: (high as u64 * 100 / period as u64) as u32,
                scale,
            });
        }
        if scale == MAX_SCALE {
            log::warn!("input capture wraps at the largest prescaler");
            break Err(BusError::Timeout);
        }
        scale *= 2;
        log::debug!("autotuning input capture, scale {scale}");
    };
    cap.deinit();
    result
}

/// Estimates a UART baud rate from the shortest low pulse seen.
///
/// Keeps the fastest of ten estimates; a capture whose high time is not
/// below its period is discarded.
pub fn estimate_baudrate<C: InputCapture + ?Sized>(
    cap: &mut C,
    abort: &CancelToken,
    base_clock: u32,
) -> Result<u32, BusError> {
    let mut best = 0;
    for _ in 0..BAUD_SAMPLES {
        let mut estimate = None;
        for _ in 0..BAUD_RETRIES {
            let (period, high) = capture(cap, 1, abort).inspect_err(|_| cap.deinit())?;
            if high < period {
                estimate = Some(base_clock / (period - high));
                break;
            }
        }
        let Some(estimate) = estimate else {
            cap.deinit();
            return Err(BusError::Timeout);
        };
        best = best.max(estimate);
    }
    cap.deinit();
    Ok(best)
}

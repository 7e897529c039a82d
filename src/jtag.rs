//! Bit-banged JTAG: TAP navigation, IDCODE chain detection and device count.
mod detect;
mod tap;

pub use detect::ChainDecoder;
pub use tap::Jtag;

/// Longest chain [`Jtag::count_devices`] and [`Jtag::scan_with`] look at.
pub const MAX_DEVICES: usize = 32;

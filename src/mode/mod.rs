//! Protocol personalities.
//!
//! Every personality follows the same shape: `init` parses its arguments
//! into the session through a `configure` helper, `setup` claims the board
//! pins (or opens its collaborator), `exec` handles the mode keywords and
//! `cleanup` drops everything `setup` took.
mod can;
mod flash;
mod hiz;
pub(crate) mod i2c;
mod jtag;
mod lin;
mod mmc;
mod nfc;
mod onewire;
mod smartcard;
pub(crate) mod spi;
mod threewire;
mod twowire;
pub(crate) mod uart;
mod wiegand;

pub use can::{CanBus, CanFrame, CanMode, CanState};
pub use flash::{FlashMode, NandFlash};
pub use hiz::HiZ;
pub use i2c::I2cMode;
pub use jtag::JtagMode;
pub use lin::LinMode;
pub use mmc::{CardRegister, MmcCard, MmcMode};
pub use nfc::{NfcMode, NfcReader};
pub use onewire::OneWireMode;
pub use smartcard::{Smartcard, SmartcardMode};
pub use spi::{SpiMode, SpiPort};
pub use threewire::ThreeWireMode;
pub use twowire::TwoWireMode;
pub use uart::{Uart, UartMode, UartStatus};
pub use wiegand::WiegandMode;

use crate::BusError;
use crate::gpio::{PinMode, PinUse, SharedBoard, UsedPin};
use crate::Pull;
use std::fmt;

/// Claims `pin` for `usage`.
pub(crate) fn claim(
    board: &SharedBoard,
    pin: u8,
    usage: PinUse,
    mode: PinMode,
    pull: Pull,
) -> Result<UsedPin, BusError> {
    UsedPin::new(board.clone(), pin, usage, mode, pull)
}

/// Prints a `NAME: <pin>` line per line of the personality.
pub(crate) fn show_pins(out: &mut dyn fmt::Write, pins: &[(&str, u8)]) {
    for (name, pin) in pins {
        crate::cprint!(out, "{name}: {pin}\r\n");
    }
}

/// Error of an operation that needs `setup` to have run.
pub(crate) fn not_ready(mode: &'static str) -> BusError {
    log::warn!("{mode} used before setup");
    BusError::Hardware("mode not set up")
}

#[cfg(test)]
pub(crate) mod test {
    use crate::backend::Personality;
    use crate::console::Console;
    use crate::gpio::SharedBoard;
    use crate::gpio::sim::SimPort;

    /// A console with the personality built by `make` registered and
    /// selected with `args`.
    pub(crate) fn selected<M: Personality + 'static>(
        make: impl FnOnce(SharedBoard) -> M,
        args: &str,
    ) -> (Console, SimPort) {
        let (mut console, port) = crate::console::test::console(16);
        let mode = make(console.board.clone());
        let name = mode.name();
        console.register(mode);
        run(&mut console, &format!("{name} {args}"));
        (console, port)
    }

    /// Runs `line` and returns what it printed.
    pub(crate) fn run(console: &mut Console, line: &str) -> String {
        let mut out = String::new();
        console.run_line(line, &mut out).unwrap();
        out
    }
}

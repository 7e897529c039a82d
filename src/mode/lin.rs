use super::uart::{Serial, Uart};
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, print_bytes};
use crate::session::{ProtoState, UartConfig};
use crate::token::Token;
use crate::BusError;
use std::fmt;

/// Sync field following every break.
const SYNC: u8 = 0x55;

const GRAMMAR: &[&str] = &["device", "speed", "show"];

fn lin_defaults() -> UartConfig {
    UartConfig {
        lin: true,
        ..UartConfig::default()
    }
}

fn configure(
    proto: &mut ProtoState,
    args: &mut Args<'_>,
    devices: usize,
    out: &mut dyn fmt::Write,
) -> Result<(), BusError> {
    // a fresh session holds plain UART defaults
    proto.config.uart_mut().lin = true;
    loop {
        match args.peek_word() {
            Some("device") => {
                args.bump();
                proto.dev_num = args
                    .device(devices)
                    .map_err(|_| BusError::invalid("LIN device must be 1 or 2."))?;
                *proto.config.uart_mut() = lin_defaults();
                crate::cprint!(out, "Note: LIN parameters have been reset to default values.\r\n");
            }
            Some("speed") => {
                args.bump();
                match args.uint("speed")? {
                    0 => return Err(BusError::invalid("Speed must be at least 1 bps.")),
                    speed => proto.config.uart_mut().baudrate = speed,
                }
            }
            _ => return Ok(()),
        }
    }
}

/// LIN master: a UART in LIN mode whose `[` sends break and sync.
pub struct LinMode<U> {
    serial: Serial<U>,
}

impl<U: Uart> LinMode<U> {
    /// `ports[0]` is device 1, `ports[1]` device 2.
    pub fn new(ports: impl IntoIterator<Item = U>) -> Self {
        Self {
            serial: Serial::new("lin", ports),
        }
    }
}

impl<U: Uart> Personality for LinMode<U> {
    fn id(&self) -> ModeId {
        ModeId::Lin
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
            .with_start(true)
            .with_write(true)
            .with_read(true)
            .with_write_read(true)
            .with_dump(true)
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        if self.serial.devices() == 0 {
            return Err(BusError::NoDevice);
        }
        configure(ctx.proto, &mut args, self.serial.devices(), ctx.out)?;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.serial.open(ctx.proto)?;
        self.show(ctx);
        Ok(())
    }

    fn exec(&mut self, ctx: &mut ModeCtx<'_>, tokens: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(tokens);
        if args.peek_word() == Some("show") {
            args.bump();
            if args.peek_word() == Some("pins") {
                args.bump();
                self.serial.show_pins(ctx);
            } else {
                self.show(ctx);
            }
            return Ok(args.used());
        }
        let mut staged = ctx.proto.clone();
        configure(&mut staged, &mut args, self.serial.devices(), ctx.out)?;
        if staged != *ctx.proto {
            if let Err(e) = self.serial.open(&staged) {
                self.serial.open(ctx.proto)?;
                return Err(e);
            }
            *ctx.proto = staged;
        }
        Ok(args.used())
    }

    fn start(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        {
            let mut port = self.serial.port()?.lock().unwrap();
            port.send_break()?;
            port.write(&[SYNC])?;
        }
        crate::cprint!(ctx.out, "<BREAK>\r\n");
        print_bytes(ctx.out, "SYNC", &[SYNC]);
        Ok(())
    }

    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        self.serial.write(ctx, tx)
    }

    fn read(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        let timeout = ctx.proto.config.uart_mut().timeout_ms;
        self.serial.read(ctx, rx, timeout)
    }

    fn write_read(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        let timeout = ctx.proto.config.uart_mut().timeout_ms;
        self.serial.write_read(ctx, tx, rx, timeout)
    }

    fn dump(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        let timeout = ctx.proto.config.uart_mut().timeout_ms;
        self.serial.dump(ctx, rx, timeout)
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        self.serial.close();
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let device = ctx.proto.dev_num + 1;
        let speed = ctx.proto.config.uart_mut().baudrate;
        crate::cprint!(ctx.out, "Device: LIN{device}\r\nSpeed: {speed} bps\r\n");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mode::test::{run, selected};
    use crate::mode::uart::test::SimUart;

    #[test]
    fn break_and_sync_open_a_frame() {
        let port = SimUart::default();
        let handle = port.clone();
        let (mut console, _) = selected(move |_| LinMode::new([port]), "speed 19200");
        assert_eq!(console.prompt(), "lin1> ");
        let applied = handle.0.lock().unwrap().config.clone().unwrap();
        assert!(applied.lin);
        assert_eq!(applied.baudrate, 19_200);

        handle.0.lock().unwrap().pending.extend([0x12, 0x34]);
        assert_eq!(
            run(&mut console, "[ 0x3c r:2"),
            "<BREAK>\r\nSYNC: 0x55\r\nWRITE: 0x3C\r\nREAD: 0x12 0x34 \r\n"
        );
        let line = handle.0.lock().unwrap();
        assert_eq!(line.breaks, 1);
        assert_eq!(line.sent, [SYNC, 0x3c]);
    }

    #[test]
    fn show_and_device_range() {
        let (mut console, _) = selected(|_| LinMode::new([SimUart::default()]), "");
        assert_eq!(run(&mut console, "show"), "Device: LIN1\r\nSpeed: 9600 bps\r\n");
        assert_eq!(run(&mut console, "show pins"), "TX: PA9\r\nRX: PA10\r\n");
        let mut out = String::new();
        assert!(console.run_line("device 2", &mut out).is_err());
        assert!(console.run_line("speed 0", &mut out).is_err());
    }
}

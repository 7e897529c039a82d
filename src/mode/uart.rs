use super::not_ready;
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, print_bytes};
use crate::session::{Parity, ProtoState, UartConfig};
use crate::token::Token;
use crate::{BusError, Worker};
use std::fmt;
use std::io::Write as _;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

/// Pins of each serial device, fixed by the peripheral.
const PINS: [&str; 2] = ["TX: PA9\r\nRX: PA10\r\n", "TX: PA2\r\nRX: PA3\r\n"];

/// Largest chunk moved per bridge iteration.
const BRIDGE_CHUNK: usize = 64;

/// Receive timeout of the bridge reader, short enough to notice a cancel.
const BRIDGE_POLL_MS: u32 = 1;

/// Baud rate error above which a requested speed is rejected, percent.
const MAX_BAUD_ERROR: u32 = 5;

const GRAMMAR: &[&str] = &[
    "device",
    "speed",
    "parity",
    "none",
    "even",
    "odd",
    "stop-bits",
    "timeout",
    "bridge",
    "show",
];

/// Line status reported by a serial peripheral.
#[bitfield_struct::bitfield(u8, order = Lsb)]
#[derive(PartialEq, Eq)]
pub struct UartStatus {
    pub overrun: bool,
    pub framing: bool,
    pub parity: bool,
    pub noise: bool,
    /// A LIN break was detected on RX.
    pub lin_break: bool,
    #[bits(3)]
    __: u8,
}

impl UartStatus {
    /// Errors that leave the receiver in a state only a reinit clears.
    pub const fn is_fault(self) -> bool {
        self.overrun() || self.framing() || self.noise()
    }
}

/// A hardware serial port, used by the UART and LIN personalities.
pub trait Uart: Send {
    /// Programs the port. Returns the baud rate the divider actually
    /// reached.
    fn apply(&mut self, config: &UartConfig) -> Result<u32, BusError>;

    fn write(&mut self, data: &[u8]) -> Result<(), BusError>;

    /// Fills `buf` until it is full or nothing arrived for `timeout_ms`.
    /// Returns the number of bytes received.
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, BusError>;

    /// Returns and clears the pending line status.
    fn status(&mut self) -> UartStatus;

    /// Holds TX low for a LIN break.
    fn send_break(&mut self) -> Result<(), BusError> {
        Err(BusError::Unsupported)
    }

    fn close(&mut self) {}
}

/// Serial ports behind the UART and LIN personalities.
///
/// Ports sit behind `Arc<Mutex<..>>` so a bridge worker can read one
/// while the console thread writes to it.
pub(crate) struct Serial<U> {
    name: &'static str,
    ports: Vec<Arc<Mutex<U>>>,
    open: Option<usize>,
}

impl<U: Uart> Serial<U> {
    pub(crate) fn new(name: &'static str, ports: impl IntoIterator<Item = U>) -> Self {
        Self {
            name,
            ports: ports
                .into_iter()
                .take(PINS.len())
                .map(|port| Arc::new(Mutex::new(port)))
                .collect(),
            open: None,
        }
    }

    pub(crate) fn devices(&self) -> usize {
        self.ports.len()
    }

    pub(crate) fn port(&self) -> Result<&Arc<Mutex<U>>, BusError> {
        let device = self.open.ok_or_else(|| not_ready(self.name))?;
        Ok(&self.ports[device])
    }

    /// Opens `proto.dev_num` with the session parameters, closing the
    /// previously open device. Returns the baud rate reached.
    pub(crate) fn open(&mut self, proto: &ProtoState) -> Result<u32, BusError> {
        self.close();
        let device = proto.dev_num as usize;
        let config = proto.config.clone().uart_mut().clone();
        let port = self
            .ports
            .get(device)
            .ok_or_else(|| BusError::invalid("device must be 1 or 2."))?;
        let actual = port.lock().unwrap().apply(&config)?;
        log::info!("{}{} at {actual} bps", self.name, device + 1);
        self.open = Some(device);
        Ok(actual)
    }

    pub(crate) fn close(&mut self) {
        if let Some(device) = self.open.take() {
            self.ports[device].lock().unwrap().close();
            log::debug!("{}{} closed", self.name, device + 1);
        }
    }

    /// Reinitialises the port after an overrun, framing or noise error.
    fn recover(&self, port: &mut U, proto: &ProtoState) {
        let status = port.status();
        if status.parity() {
            log::warn!("{}: parity error", self.name);
        }
        if !status.is_fault() {
            return;
        }
        log::warn!("{}: bus fault {status:?}, reinitialising", self.name);
        port.close();
        if let Err(e) = port.apply(&proto.config.clone().uart_mut().clone()) {
            log::warn!("{}: reinit failed: {e}", self.name);
        }
    }

    pub(crate) fn write(&self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        let mut port = self.port()?.lock().unwrap();
        let result = port.write(tx);
        self.recover(&mut port, ctx.proto);
        result?;
        print_bytes(ctx.out, "WRITE", tx);
        Ok(())
    }

    /// Reads `rx`, reporting a short read before the bytes that arrived.
    pub(crate) fn read(&self, ctx: &mut ModeCtx<'_>, rx: &mut [u8], timeout_ms: u32) -> Result<(), BusError> {
        let mut port = self.port()?.lock().unwrap();
        let result = port.read(rx, timeout_ms);
        self.recover(&mut port, ctx.proto);
        let received = result?;
        if received < rx.len() {
            crate::cprint!(ctx.out, "Timeout: {received}/{} bytes received\r\n", rx.len());
        }
        if received > 0 {
            print_bytes(ctx.out, "READ", &rx[..received]);
        }
        Ok(())
    }

    pub(crate) fn dump(&self, ctx: &mut ModeCtx<'_>, rx: &mut [u8], timeout_ms: u32) -> Result<(), BusError> {
        let mut port = self.port()?.lock().unwrap();
        let result = port.read(rx, timeout_ms);
        self.recover(&mut port, ctx.proto);
        match result? {
            received if received == rx.len() => Ok(()),
            _ => Err(BusError::Timeout),
        }
    }

    /// Takes what already arrived, without waiting.
    pub(crate) fn receive(&self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<usize, BusError> {
        let mut port = self.port()?.lock().unwrap();
        let result = port.read(rx, 0);
        self.recover(&mut port, ctx.proto);
        result
    }

    /// Sends each byte and waits for the one it provoked.
    pub(crate) fn write_read(
        &self,
        ctx: &mut ModeCtx<'_>,
        tx: &[u8],
        rx: &mut [u8],
        timeout_ms: u32,
    ) -> Result<(), BusError> {
        let mut port = self.port()?.lock().unwrap();
        for (byte, slot) in tx.iter().zip(rx.iter_mut()) {
            let result = match port.write(&[*byte]) {
                Ok(()) => port.read(std::slice::from_mut(slot), timeout_ms),
                Err(e) => Err(e),
            };
            self.recover(&mut port, ctx.proto);
            if result? == 0 {
                return Err(BusError::Timeout);
            }
            crate::cprint!(ctx.out, "WRITE: 0x{byte:02X} READ: 0x{:02X}\r\n", *slot);
        }
        Ok(())
    }

    pub(crate) fn show_pins(&self, ctx: &mut ModeCtx<'_>) {
        crate::cprint!(ctx.out, "{}", PINS[ctx.proto.dev_num as usize]);
    }
}

/// Prints the divider error of a new speed and announces the fallback to
/// `default` when it is too far off.
///
/// Returns `false` when the fallback was taken and the port must be
/// reopened.
pub(crate) fn check_speed(out: &mut dyn fmt::Write, requested: u32, actual: u32, default: u32) -> bool {
    let error = if actual == 0 {
        u32::MAX
    } else {
        let ratio = (requested as u64 * 10_000 / actual as u64) as i64;
        (10_000 - ratio).unsigned_abs() as u32
    };
    let (int_part, dec_part) = (error / 100, error % 100);
    if actual < 1 || int_part > MAX_BAUD_ERROR {
        log::warn!("baud rate {requested} unreachable, got {actual}");
        crate::cprint!(
            out,
            "Invalid final baudrate({actual} bps/{int_part}.{dec_part:02}% err) restore default {default} bauds\r\n"
        );
        false
    } else {
        crate::cprint!(out, "Final speed: {actual} bps({int_part}.{dec_part:02}% err)\r\n");
        true
    }
}

/// Returns whether a new speed was requested.
fn configure(
    proto: &mut ProtoState,
    args: &mut Args<'_>,
    devices: usize,
    out: &mut dyn fmt::Write,
) -> Result<bool, BusError> {
    let mut speed = false;
    loop {
        match args.peek_word() {
            Some("device") => {
                args.bump();
                proto.dev_num = args
                    .device(devices)
                    .map_err(|_| BusError::invalid("UART device must be 1 or 2."))?;
                *proto.config.uart_mut() = UartConfig::default();
                crate::cprint!(out, "Note: UART parameters have been reset to default values.\r\n");
            }
            Some("speed") => {
                args.bump();
                proto.config.uart_mut().baudrate = args.uint("speed")?;
                speed = true;
            }
            Some("parity") => {
                args.bump();
                proto.config.uart_mut().parity = match args.word("parity")? {
                    "none" => Parity::None,
                    "even" => Parity::Even,
                    "odd" => Parity::Odd,
                    other => return Err(BusError::invalid(format!("unknown parity '{other}'"))),
                };
            }
            Some("stop-bits") => {
                args.bump();
                match args.uint("stop-bits")? {
                    bits @ (1 | 2) => proto.config.uart_mut().stop_bits = bits as u8,
                    _ => return Err(BusError::invalid("Stop bits must be 1 or 2.")),
                }
            }
            Some("timeout") => {
                args.bump();
                match args.uint("timeout")? {
                    ms @ 1..=30_000 => proto.config.uart_mut().timeout_ms = ms,
                    _ => {
                        return Err(BusError::invalid(
                            "Timeout value must be set between 1 and 30000.",
                        ));
                    }
                }
            }
            _ => return Ok(speed),
        }
    }
}

/// Asynchronous serial on one of up to two ports.
pub struct UartMode<U> {
    serial: Serial<U>,
}

impl<U: Uart + 'static> UartMode<U> {
    /// `ports[0]` is device 1, `ports[1]` device 2.
    pub fn new(ports: impl IntoIterator<Item = U>) -> Self {
        Self {
            serial: Serial::new("uart", ports),
        }
    }

    /// Opens `proto`, reporting the reached speed when `speed` is set.
    fn reopen(
        &mut self,
        out: &mut dyn fmt::Write,
        proto: &mut ProtoState,
        speed: bool,
    ) -> Result<(), BusError> {
        let requested = proto.config.uart_mut().baudrate;
        let actual = self.serial.open(proto)?;
        let default = UartConfig::default().baudrate;
        if speed && !check_speed(out, requested, actual, default) {
            proto.config.uart_mut().baudrate = default;
            self.serial.open(proto)?;
        }
        Ok(())
    }

    /// Passes bytes both ways between the host link and the port until
    /// the user button is pressed.
    fn bridge(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let port = self.serial.port()?.clone();
        let link = ctx.link.as_deref_mut().ok_or(BusError::Unsupported)?;
        crate::cprint!(ctx.out, "Interrupt by pressing user button.\r\n\r\n");

        let (received_tx, received) = mpsc::channel::<Vec<u8>>();
        let reader = port.clone();
        let worker = Worker::spawn("uart reader", move |token| {
            let mut buf = [0u8; BRIDGE_CHUNK];
            let mut total = 0usize;
            // one read even when cancelled before the first poll
            loop {
                let result = reader.lock().unwrap().read(&mut buf, BRIDGE_POLL_MS);
                match result {
                    Ok(0) => std::thread::yield_now(),
                    Ok(n) => {
                        total += n;
                        if received_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("uart bridge read: {e}"),
                }
                if token.is_cancelled() {
                    break;
                }
            }
            total
        })
        .map_err(|_| BusError::Hardware("bridge thread"))?;

        let mut sent = 0usize;
        while !ctx.abort.is_cancelled() {
            let mut idle = true;
            if let Some(byte) = link.poll_byte() {
                port.lock().unwrap().write(&[byte])?;
                sent += 1;
                idle = false;
            }
            while let Ok(chunk) = received.try_recv() {
                link.write_all(&chunk)
                    .map_err(|_| BusError::Hardware("host link"))?;
                idle = false;
            }
            if idle {
                std::thread::yield_now();
            }
        }
        let forwarded = worker.stop().unwrap_or_default();
        for chunk in received.try_iter() {
            link.write_all(&chunk)
                .map_err(|_| BusError::Hardware("host link"))?;
        }
        ctx.abort.reset();
        log::info!("uart bridge closed, {sent} bytes out, {forwarded} bytes in");
        Ok(())
    }
}

impl<U: Uart + 'static> Personality for UartMode<U> {
    fn id(&self) -> ModeId {
        ModeId::Uart
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
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
        match args.peek_word() {
            Some("show") => {
                args.bump();
                if args.peek_word() == Some("pins") {
                    args.bump();
                    self.serial.show_pins(ctx);
                } else {
                    self.show(ctx);
                }
                return Ok(args.used());
            }
            Some("bridge") => {
                args.bump();
                self.bridge(ctx)?;
                return Ok(args.used());
            }
            _ => {}
        }
        let mut staged = ctx.proto.clone();
        let speed = configure(&mut staged, &mut args, self.serial.devices(), ctx.out)?;
        if staged != *ctx.proto {
            if let Err(e) = self.reopen(ctx.out, &mut staged, speed) {
                // keep the port usable with the parameters it had
                self.serial.open(ctx.proto)?;
                return Err(e);
            }
            *ctx.proto = staged;
        }
        Ok(args.used())
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

    fn receive(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<usize, BusError> {
        self.serial.receive(ctx, rx)
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        self.serial.close();
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let device = ctx.proto.dev_num + 1;
        let config = ctx.proto.config.uart_mut();
        crate::cprint!(
            ctx.out,
            "Device: UART{device}\r\nSpeed: {} bps\r\nParity: {}\r\nStop bits: {}\r\nTimeout: {} msec\r\n",
            config.baudrate,
            config.parity.name(),
            config.stop_bits,
            config.timeout_ms
        );
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::HostLink;
    use crate::link::mem::MemLink;
    use crate::mode::test::{run, selected};
    use std::collections::VecDeque;
    use std::io;

    /// APB clock the simulated baud rate divider runs from.
    const PCLK: u32 = 84_000_000;

    #[derive(Debug, Default)]
    pub(crate) struct Line {
        pub(crate) config: Option<UartConfig>,
        /// Number of `apply` calls.
        pub(crate) applied: usize,
        pub(crate) sent: Vec<u8>,
        pub(crate) pending: VecDeque<u8>,
        /// Every written byte comes back on RX.
        pub(crate) echo: bool,
        pub(crate) status: UartStatus,
        pub(crate) breaks: usize,
    }

    /// Serial port with an integer baud rate divider and a scripted
    /// receive queue.
    #[derive(Clone, Default)]
    pub(crate) struct SimUart(pub(crate) Arc<Mutex<Line>>);

    impl Uart for SimUart {
        fn apply(&mut self, config: &UartConfig) -> Result<u32, BusError> {
            let divider = PCLK / config.baudrate.max(1);
            if divider == 0 {
                return Err(BusError::invalid("baud rate above the peripheral clock"));
            }
            let mut line = self.0.lock().unwrap();
            line.config = Some(config.clone());
            line.applied += 1;
            Ok(PCLK / divider)
        }

        fn write(&mut self, data: &[u8]) -> Result<(), BusError> {
            let mut line = self.0.lock().unwrap();
            line.sent.extend_from_slice(data);
            if line.echo {
                line.pending.extend(data);
            }
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, BusError> {
            let mut line = self.0.lock().unwrap();
            let mut received = 0;
            for slot in buf.iter_mut() {
                let Some(byte) = line.pending.pop_front() else {
                    break;
                };
                *slot = byte;
                received += 1;
            }
            Ok(received)
        }

        fn status(&mut self) -> UartStatus {
            std::mem::take(&mut self.0.lock().unwrap().status)
        }

        fn send_break(&mut self) -> Result<(), BusError> {
            self.0.lock().unwrap().breaks += 1;
            Ok(())
        }
    }

    /// Host link the test keeps a handle on after the console took it.
    #[derive(Clone)]
    struct Host(Arc<Mutex<MemLink>>);

    impl io::Write for Host {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl HostLink for Host {
        fn poll_byte(&mut self) -> Option<u8> {
            self.0.lock().unwrap().poll_byte()
        }
    }

    fn uart(args: &str) -> (crate::console::Console, SimUart) {
        let port = SimUart::default();
        let handle = port.clone();
        let (console, _) = selected(move |_| UartMode::new([port, SimUart::default()]), args);
        (console, handle)
    }

    #[test]
    fn defaults_and_show() {
        let (mut console, port) = uart("");
        assert_eq!(console.prompt(), "uart1> ");
        assert_eq!(port.0.lock().unwrap().config, Some(UartConfig::default()));
        assert_eq!(
            run(&mut console, "show"),
            "Device: UART1\r\nSpeed: 9600 bps\r\nParity: none\r\nStop bits: 1\r\nTimeout: 2000 msec\r\n"
        );
        assert_eq!(run(&mut console, "show pins"), "TX: PA9\r\nRX: PA10\r\n");
    }

    #[test]
    fn parameters_reach_the_port() {
        let (mut console, port) = uart("parity even stop-bits 2");
        assert_eq!(
            run(&mut console, "speed 5000000"),
            "Final speed: 5250000 bps(4.77% err)\r\n"
        );
        let applied = port.0.lock().unwrap().config.clone().unwrap();
        assert_eq!(applied.parity, Parity::Even);
        assert_eq!(applied.stop_bits, 2);
        assert_eq!(applied.baudrate, 5_000_000);

        assert_eq!(
            run(&mut console, "speed 30000000"),
            "Invalid final baudrate(42000000 bps/28.58% err) restore default 9600 bauds\r\n"
        );
        assert_eq!(port.0.lock().unwrap().config.as_ref().unwrap().baudrate, 9600);
        assert!(run(&mut console, "show").contains("Speed: 9600 bps"));

        let mut out = String::new();
        assert!(console.run_line("stop-bits 3", &mut out).is_err());
        assert!(console.run_line("timeout 0", &mut out).is_err());
        assert!(console.run_line("device 3", &mut out).is_err());
    }

    #[test]
    fn transfers_and_short_reads() {
        let (mut console, port) = uart("");
        port.0.lock().unwrap().pending.extend([0x4f, 0x4b]);
        assert_eq!(
            run(&mut console, "0x41 0x54 r:3"),
            "WRITE: 0x41 0x54 \r\nTimeout: 2/3 bytes received\r\nREAD: 0x4F 0x4B \r\n"
        );
        assert_eq!(port.0.lock().unwrap().sent, [0x41, 0x54]);

        port.0.lock().unwrap().echo = true;
        assert_eq!(
            run(&mut console, "{ 0x55 0xaa }"),
            "WRITE: 0x55 READ: 0x55\r\nWRITE: 0xAA READ: 0xAA\r\n"
        );
    }

    #[test]
    fn fault_reinitialises_the_port() {
        let (mut console, port) = uart("");
        let before = port.0.lock().unwrap().applied;
        port.0.lock().unwrap().status = UartStatus::new().with_overrun(true);
        port.0.lock().unwrap().pending.push_back(0x31);
        assert_eq!(run(&mut console, "r"), "READ: 0x31\r\n");
        assert_eq!(port.0.lock().unwrap().applied, before + 1);

        port.0.lock().unwrap().status = UartStatus::new().with_parity(true);
        run(&mut console, "0x00");
        assert_eq!(port.0.lock().unwrap().applied, before + 1);
    }

    #[test]
    fn second_device_resets_parameters() {
        let (mut console, _) = uart("speed 115200");
        assert_eq!(
            run(&mut console, "device 2"),
            "Note: UART parameters have been reset to default values.\r\n"
        );
        assert_eq!(console.prompt(), "uart2> ");
        assert!(run(&mut console, "show").starts_with("Device: UART2\r\nSpeed: 9600 bps"));
        assert_eq!(run(&mut console, "show pins"), "TX: PA2\r\nRX: PA3\r\n");
    }

    #[test]
    fn bridge_passes_bytes_both_ways() {
        let (console, port) = uart("");
        port.0.lock().unwrap().pending.extend(b"OK\r\n");
        let host = Host(Arc::new(Mutex::new(MemLink::with_input(b"AT\r"))));
        host.0.lock().unwrap().on_drain = Some(console.abort_token());
        let mut console = console.with_link(host.clone());

        assert_eq!(
            run(&mut console, "bridge"),
            "Interrupt by pressing user button.\r\n\r\n"
        );
        assert_eq!(port.0.lock().unwrap().sent, b"AT\r");
        assert_eq!(host.0.lock().unwrap().output, b"OK\r\n");
        assert!(!console.abort_token().is_cancelled());
    }

    #[test]
    fn bridge_needs_a_host_link() {
        let (mut console, _) = uart("");
        let mut out = String::new();
        assert_eq!(console.run_line("bridge", &mut out), Err(BusError::Unsupported));
    }
}

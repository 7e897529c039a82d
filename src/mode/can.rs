use super::not_ready;
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality};
use crate::session::{CanConfig, ProtoState};
use crate::token::Token;
use crate::{BusError, Worker};
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PINS: [&str; 2] = ["TX: PB9\r\nRX: PB8\r\n", "TX: PB6\r\nRX: PB5\r\n"];

/// Largest standard (11 bit) identifier.
const MAX_STD_ID: u32 = 0x7ff;
/// Largest extended (29 bit) identifier.
const MAX_EXT_ID: u32 = 0x1fff_ffff;

const GRAMMAR: &[&str] = &[
    "device", "speed", "id", "filter", "off", "mask", "sniff", "show", "pins",
];

/// Error state of the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CanState {
    #[default]
    ErrorActive,
    ErrorPassive,
    BusOff,
}

/// A classic CAN frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub extended: bool,
    /// Remote transmission request.
    pub remote: bool,
    pub data: heapless::Vec<u8, 8>,
}

impl CanFrame {
    /// A data frame; identifiers above 11 bits make it extended.
    pub fn new(id: u32, data: &[u8]) -> Result<Self, BusError> {
        if id > MAX_EXT_ID {
            return Err(BusError::invalid(format!("CAN id {id:#x} exceeds 29 bits")));
        }
        Ok(Self {
            id,
            extended: id > MAX_STD_ID,
            remote: false,
            data: heapless::Vec::from_slice(data)
                .map_err(|()| BusError::invalid("a CAN frame carries at most 8 bytes"))?,
        })
    }

    /// Lawicel SLCAN text of the frame, without the trailing `\r`.
    pub fn to_slcan(&self) -> String {
        let kind = match (self.remote, self.extended) {
            (false, false) => 't',
            (true, false) => 'r',
            (false, true) => 'T',
            (true, true) => 'R',
        };
        let mut text = if self.extended {
            format!("{kind}{:08X}{}", self.id, self.data.len())
        } else {
            format!("{kind}{:03X}{}", self.id, self.data.len())
        };
        for byte in &self.data {
            text.push_str(&format!("{byte:02X}"));
        }
        text
    }

    /// Parses an SLCAN transmit command (`t`, `r`, `T` or `R`).
    pub fn from_slcan(text: &[u8]) -> Result<Self, BusError> {
        let malformed = || BusError::invalid("malformed SLCAN frame");
        let (remote, extended) = match text.first() {
            Some(b't') => (false, false),
            Some(b'r') => (true, false),
            Some(b'T') => (false, true),
            Some(b'R') => (true, true),
            _ => return Err(malformed()),
        };
        let id_len = if extended { 8 } else { 3 };
        let hex = |digits: &[u8]| -> Result<u32, BusError> {
            let digits = std::str::from_utf8(digits).map_err(|_| malformed())?;
            u32::from_str_radix(digits, 16).map_err(|_| malformed())
        };
        let id = hex(text.get(1..1 + id_len).ok_or_else(malformed)?)?;
        let dlc = hex(text.get(1 + id_len..2 + id_len).ok_or_else(malformed)?)? as usize;
        if dlc > 8 || (!extended && id > MAX_STD_ID) || id > MAX_EXT_ID {
            return Err(malformed());
        }
        let mut data = heapless::Vec::new();
        if !remote {
            let payload = text.get(2 + id_len..2 + id_len + 2 * dlc).ok_or_else(malformed)?;
            for pair in payload.chunks(2) {
                data.push(hex(pair)? as u8).map_err(|_| malformed())?;
            }
        }
        Ok(Self {
            id,
            extended,
            remote,
            data,
        })
    }
}

/// A CAN controller.
///
/// Controllers open in listen-only mode: they neither acknowledge nor
/// transmit until switched to normal operation.
pub trait CanBus: Send {
    /// Programs bit rate and acceptance filter, listen-only.
    fn apply(&mut self, config: &CanConfig) -> Result<(), BusError>;

    fn set_listen_only(&mut self, listen_only: bool) -> Result<(), BusError>;

    fn transmit(&mut self, frame: &CanFrame) -> Result<(), BusError>;

    /// Next frame of the receive FIFO, `None` when it is empty.
    fn receive(&mut self) -> Result<Option<CanFrame>, BusError>;

    fn state(&mut self) -> CanState;

    fn close(&mut self) {}
}

/// Reinitialises a controller that went error-passive or bus-off.
fn recover<B: CanBus + ?Sized>(bus: &mut B, config: &CanConfig, listen_only: bool) {
    let state = bus.state();
    if state == CanState::ErrorActive {
        return;
    }
    log::warn!("can: controller {state:?}, reinitialising");
    bus.close();
    let result = bus
        .apply(config)
        .and_then(|()| bus.set_listen_only(listen_only));
    if let Err(e) = result {
        log::warn!("can: reinit failed: {e}");
    }
}

fn print_frame(out: &mut dyn fmt::Write, frame: &CanFrame) {
    if frame.extended {
        crate::cprint!(out, "EID: 0x{:08X} ", frame.id);
    } else {
        crate::cprint!(out, "SID: 0x{:03X} ", frame.id);
    }
    crate::cprint!(
        out,
        "DLC: 0x{:02X} RTR: 0x{:02X} DATA: ",
        frame.data.len(),
        frame.remote as u8
    );
    for byte in &frame.data {
        crate::cprint!(out, "{byte:02X}");
    }
    crate::cprint!(out, "\r\n");
}

fn configure(
    proto: &mut ProtoState,
    args: &mut Args<'_>,
    devices: usize,
    out: &mut dyn fmt::Write,
) -> Result<(), BusError> {
    loop {
        match args.peek_word() {
            Some("device") => {
                args.bump();
                proto.dev_num = args
                    .device(devices)
                    .map_err(|_| BusError::invalid("CAN device must be 1 or 2."))?;
                *proto.config.can_mut() = CanConfig::default();
                crate::cprint!(out, "Note: CAN parameters have been reset to default values.\r\n");
            }
            Some("speed") => {
                args.bump();
                match args.uint("speed")? {
                    speed @ 10_000..=1_000_000 => proto.config.can_mut().speed = speed,
                    _ => {
                        return Err(BusError::invalid(
                            "Speed must be between 10000 and 1000000 bps.",
                        ));
                    }
                }
            }
            Some("id") => {
                args.bump();
                let id = args.uint("id")?;
                if id > MAX_EXT_ID {
                    return Err(BusError::invalid("ID must fit in 29 bits."));
                }
                proto.config.can_mut().id = id;
                crate::cprint!(out, "ID set to 0x{id:X}\r\n");
            }
            Some("filter") => {
                args.bump();
                let config = proto.config.can_mut();
                let (id, mask) = config.filter.unwrap_or((0, 0));
                config.filter = match args.word("filter")? {
                    "off" => None,
                    "id" => Some((args.uint("filter id")?, mask)),
                    "mask" => Some((id, args.uint("filter mask")?)),
                    other => {
                        return Err(BusError::invalid(format!("unknown filter setting '{other}'")));
                    }
                };
            }
            _ => return Ok(()),
        }
    }
}

/// CAN node on one of up to two controllers.
pub struct CanMode<B> {
    ports: Vec<Arc<Mutex<B>>>,
    open: Option<usize>,
    /// The open controller does not acknowledge nor transmit.
    listen_only: bool,
}

impl<B: CanBus + 'static> CanMode<B> {
    /// `ports[0]` is device 1, `ports[1]` device 2.
    pub fn new(ports: impl IntoIterator<Item = B>) -> Self {
        Self {
            ports: ports
                .into_iter()
                .take(PINS.len())
                .map(|port| Arc::new(Mutex::new(port)))
                .collect(),
            open: None,
            listen_only: true,
        }
    }

    fn port(&self) -> Result<&Arc<Mutex<B>>, BusError> {
        let device = self.open.ok_or_else(|| not_ready("can"))?;
        Ok(&self.ports[device])
    }

    fn open(&mut self, proto: &ProtoState) -> Result<(), BusError> {
        self.close();
        let device = proto.dev_num as usize;
        let config = proto.config.clone().can_mut().clone();
        let port = self
            .ports
            .get(device)
            .ok_or_else(|| BusError::invalid("CAN device must be 1 or 2."))?;
        port.lock().unwrap().apply(&config)?;
        log::info!("can{} at {} bps, listen-only", device + 1, config.speed);
        self.open = Some(device);
        self.listen_only = true;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(device) = self.open.take() {
            self.ports[device].lock().unwrap().close();
        }
    }

    /// Prints received frames until the user button is pressed.
    fn sniff(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let reader = self.port()?.clone();
        let config = ctx.proto.config.can_mut().clone();
        let listen_only = self.listen_only;
        crate::cprint!(ctx.out, "Interrupt by pressing user button.\r\n");

        let (frames_tx, frames) = mpsc::channel::<CanFrame>();
        let worker = Worker::spawn("can sniffer", move |token| {
            let mut count = 0usize;
            while !token.is_cancelled() {
                let result = {
                    let mut bus = reader.lock().unwrap();
                    let result = bus.receive();
                    recover(&mut *bus, &config, listen_only);
                    result
                };
                match result {
                    Ok(Some(frame)) => {
                        count += 1;
                        if frames_tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => std::thread::yield_now(),
                    Err(e) => log::warn!("can sniff: {e}"),
                }
            }
            count
        })
        .map_err(|_| BusError::Hardware("sniffer thread"))?;

        while !ctx.abort.is_cancelled() {
            if let Ok(frame) = frames.recv_timeout(Duration::from_millis(1)) {
                crate::cprint!(ctx.out, "{}\r\n", frame.to_slcan());
            }
        }
        let count = worker.stop().unwrap_or_default();
        for frame in frames.try_iter() {
            crate::cprint!(ctx.out, "{}\r\n", frame.to_slcan());
        }
        ctx.abort.reset();
        log::info!("can sniff stopped after {count} frames");
        Ok(())
    }

    fn show_filter(ctx: &mut ModeCtx<'_>) {
        match ctx.proto.config.can_mut().filter {
            Some((id, mask)) => {
                crate::cprint!(ctx.out, "ID : 0x{id:08X}\r\nMask: 0x{mask:08X}\r\n");
            }
            None => crate::cprint!(ctx.out, "Filter: off\r\n"),
        }
    }
}

impl<B: CanBus + 'static> Personality for CanMode<B> {
    fn id(&self) -> ModeId {
        ModeId::Can
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new().with_write(true).with_read(true)
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        if self.ports.is_empty() {
            return Err(BusError::NoDevice);
        }
        configure(ctx.proto, &mut args, self.ports.len(), ctx.out)?;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.open(ctx.proto)
    }

    fn exec(&mut self, ctx: &mut ModeCtx<'_>, tokens: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(tokens);
        match args.peek_word() {
            Some("show") => {
                args.bump();
                match args.peek_word() {
                    Some("pins") => {
                        args.bump();
                        crate::cprint!(ctx.out, "{}", PINS[ctx.proto.dev_num as usize]);
                    }
                    Some("filter") => {
                        args.bump();
                        Self::show_filter(ctx);
                    }
                    _ => self.show(ctx),
                }
                return Ok(args.used());
            }
            Some("sniff") => {
                args.bump();
                self.sniff(ctx)?;
                return Ok(args.used());
            }
            _ => {}
        }
        let mut staged = ctx.proto.clone();
        configure(&mut staged, &mut args, self.ports.len(), ctx.out)?;
        if staged != *ctx.proto {
            if let Err(e) = self.open(&staged) {
                self.open(ctx.proto)?;
                return Err(e);
            }
            *ctx.proto = staged;
        }
        Ok(args.used())
    }

    /// Sends `tx` as an SLCAN frame when it spells one, else as data
    /// frames of up to 8 bytes with the configured identifier.
    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        let config = ctx.proto.config.can_mut().clone();
        let port = self.port()?.clone();
        let mut bus = port.lock().unwrap();
        if self.listen_only {
            crate::cprint!(ctx.out, "Switching to normal bus operation\r\n");
            bus.set_listen_only(false)?;
            self.listen_only = false;
        }
        let frames = match CanFrame::from_slcan(tx) {
            Ok(frame) => vec![frame],
            Err(_) => tx
                .chunks(8)
                .map(|chunk| CanFrame::new(config.id, chunk))
                .collect::<Result<Vec<_>, _>>()?,
        };
        for frame in &frames {
            let result = bus.transmit(frame);
            recover(&mut *bus, &config, self.listen_only);
            result?;
            print_frame(ctx.out, frame);
        }
        Ok(())
    }

    /// Prints one received frame and copies its payload into `rx`.
    fn read(&mut self, ctx: &mut ModeCtx<'_>, rx: &mut [u8]) -> Result<(), BusError> {
        let config = ctx.proto.config.can_mut().clone();
        let mut bus = self.port()?.lock().unwrap();
        let result = bus.receive();
        recover(&mut *bus, &config, self.listen_only);
        let frame = result?.ok_or(BusError::Timeout)?;
        print_frame(ctx.out, &frame);
        for (slot, byte) in rx.iter_mut().zip(&frame.data) {
            *slot = *byte;
        }
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        self.close();
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let device = ctx.proto.dev_num + 1;
        let config = ctx.proto.config.can_mut();
        crate::cprint!(
            ctx.out,
            "Device: CAN{device}\r\nSpeed: {} bps\r\nID: 0x{:X}\r\nMode: {}\r\n",
            config.speed,
            config.id,
            if self.listen_only { "listen-only" } else { "normal" }
        );
    }
}

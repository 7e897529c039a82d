//! NFC reader on an RF front end such as the TRF7970A.
//!
//! The front end handles modulation, framing and CRC; the personality runs
//! the card-facing protocols on top of raw frame exchanges.
use crate::backend::{Args, Capabilities, ModeCtx, ModeId, Personality, print_bytes};
use crate::session::{NfcConfig, NfcProtocol, ProtoState};
use crate::token::Token;
use crate::BusError;
use std::fmt;

/// Largest frame exchanged with a card.
const FRAME_MAX: usize = 64;

/// 7-bit short frame waking idle ISO 14443-A cards.
const REQA: u8 = 0x26;
/// Anticollision / select commands of cascade levels 1 to 3.
const SEL: [u8; 3] = [0x93, 0x95, 0x97];
/// NVB of an anticollision frame carrying no UID bits.
const NVB_ANTICOLLISION: u8 = 0x20;
/// NVB of a SELECT carrying the full UID part.
const NVB_SELECT: u8 = 0x70;
/// First UID byte of a part that continues on the next cascade level.
const CASCADE_TAG: u8 = 0x88;
/// SAK bit set while the UID is incomplete.
const SAK_CASCADE: u8 = 0x04;
const HLTA: [u8; 2] = [0x50, 0x00];

/// High data rate, inventory, one slot.
const INVENTORY_FLAGS: u8 = 0x26;
const INVENTORY: u8 = 0x01;
/// Response flag announcing an error code.
const RESPONSE_ERROR: u8 = 0x01;

const GRAMMAR: &[&str] = &["iso14443a", "iso15693", "crc", "bits", "scan", "show"];

/// An NFC analog front end.
pub trait NfcReader: Send {
    fn open(&mut self) -> Result<(), BusError>;

    /// Programs the air interface.
    fn set_protocol(&mut self, protocol: NfcProtocol) -> Result<(), BusError>;

    /// Switches the 13.56 MHz carrier.
    fn set_field(&mut self, on: bool) -> Result<(), BusError>;

    /// Sends the `bits` low bits of `byte` as a short frame, without CRC.
    /// Returns the length of the answer stored in `rx`.
    fn transceive_bits(&mut self, byte: u8, bits: u8, rx: &mut [u8]) -> Result<usize, BusError>;

    /// Sends `tx`, followed by its CRC when `crc` is set. Returns the
    /// length of the answer stored in `rx`, CRC stripped.
    fn transceive(&mut self, tx: &[u8], crc: bool, rx: &mut [u8]) -> Result<usize, BusError>;

    fn close(&mut self) {}
}

/// What a successful ISO 14443-A anticollision loop learns about a card.
#[derive(Debug, PartialEq, Eq)]
struct Iso14443aCard {
    atqa: [u8; 2],
    uid: heapless::Vec<u8, 10>,
    sak: u8,
}

fn protocol_name(protocol: NfcProtocol) -> &'static str {
    match protocol {
        NfcProtocol::Iso14443A => "ISO 14443-A",
        NfcProtocol::Iso15693 => "ISO 15693",
    }
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

fn configure(proto: &mut ProtoState, args: &mut Args<'_>) -> Result<(), BusError> {
    let config = proto.config.nfc_mut();
    loop {
        match args.peek_word() {
            Some("iso14443a") => {
                args.bump();
                config.protocol = NfcProtocol::Iso14443A;
            }
            Some("iso15693") => {
                args.bump();
                config.protocol = NfcProtocol::Iso15693;
            }
            Some("crc") => {
                args.bump();
                config.crc = match args.word("crc")? {
                    "on" => true,
                    "off" => false,
                    other => return Err(BusError::invalid(format!("crc expects on or off, not '{other}'"))),
                };
            }
            _ => return Ok(()),
        }
    }
}

/// Answers of no card at all.
fn silent<T>(result: Result<T, BusError>) -> Result<Option<T>, BusError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(BusError::Timeout) => Ok(None),
        Err(e) => Err(e),
    }
}

pub struct NfcMode<R> {
    reader: R,
    open: bool,
}

impl<R: NfcReader> NfcMode<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            open: false,
        }
    }

    fn ready(&self) -> Result<(), BusError> {
        if self.open {
            Ok(())
        } else {
            Err(super::not_ready("nfc"))
        }
    }

    /// REQA, then anticollision and select down the cascade levels until
    /// the SAK reports a complete UID. Leaves the card halted.
    fn select_14443a(&mut self) -> Result<Option<Iso14443aCard>, BusError> {
        let mut rx = [0u8; FRAME_MAX];
        let Some(len) = silent(self.reader.transceive_bits(REQA, 7, &mut rx))? else {
            return Ok(None);
        };
        if len < 2 {
            return Ok(None);
        }
        let atqa = [rx[0], rx[1]];

        let mut uid = heapless::Vec::new();
        let mut sak = 0;
        for sel in SEL {
            let len = self.reader.transceive(&[sel, NVB_ANTICOLLISION], false, &mut rx)?;
            if len < 5 {
                log::warn!("short anticollision answer on {sel:#04x}");
                return Err(BusError::Nack);
            }
            let mut part = [0u8; 5];
            part.copy_from_slice(&rx[..5]);
            // BCC is the XOR of the four UID bytes
            if part[..4].iter().fold(0, |acc, byte| acc ^ byte) != part[4] {
                return Err(BusError::Crc);
            }

            let mut select = [sel, NVB_SELECT, 0, 0, 0, 0, 0];
            select[2..].copy_from_slice(&part);
            if self.reader.transceive(&select, true, &mut rx)? == 0 {
                return Err(BusError::Nack);
            }
            sak = rx[0];

            let bytes = if part[0] == CASCADE_TAG && sak & SAK_CASCADE != 0 {
                &part[1..4]
            } else {
                &part[..4]
            };
            uid.extend_from_slice(bytes).map_err(|_| BusError::Hardware("UID too long"))?;
            if sak & SAK_CASCADE == 0 {
                break;
            }
        }

        // a halted card stays silent
        if let Err(e) = self.reader.transceive(&HLTA, true, &mut rx) {
            log::debug!("HLTA: {e}");
        }
        Ok(Some(Iso14443aCard { atqa, uid, sak }))
    }

    fn scan_14443a(&mut self, out: &mut dyn fmt::Write) -> Result<(), BusError> {
        match self.select_14443a()? {
            Some(card) => {
                crate::cprint!(out, "ATQA: {:02X} {:02X}\r\nUID: ", card.atqa[0], card.atqa[1]);
                for byte in &card.uid {
                    crate::cprint!(out, "{byte:02X} ");
                }
                crate::cprint!(out, "\r\nSAK: {:02X}\r\n", card.sak);
            }
            None => crate::cprint!(out, "No tag found\r\n"),
        }
        Ok(())
    }

    /// Single slot INVENTORY; the UID travels least significant byte first.
    fn scan_15693(&mut self, out: &mut dyn fmt::Write) -> Result<(), BusError> {
        let mut rx = [0u8; FRAME_MAX];
        let request = [INVENTORY_FLAGS, INVENTORY, 0x00];
        let len = match silent(self.reader.transceive(&request, true, &mut rx))? {
            Some(len) if len > 0 => len,
            _ => {
                crate::cprint!(out, "No tag found\r\n");
                return Ok(());
            }
        };
        if rx[0] & RESPONSE_ERROR != 0 {
            let code = if len > 1 { rx[1] } else { 0 };
            crate::cprint!(out, "Error response: {code:02X}\r\n");
            return Err(BusError::Nack);
        }
        if len < 10 {
            return Err(BusError::Hardware("short inventory answer"));
        }
        crate::cprint!(out, "DSFID: {:02X}\r\nUID: ", rx[1]);
        for byte in rx[2..10].iter().rev() {
            crate::cprint!(out, "{byte:02X} ");
        }
        crate::cprint!(out, "\r\n");
        Ok(())
    }

    fn scan(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        let NfcConfig {
            field_on, protocol, ..
        } = ctx.proto.config.nfc_mut().clone();
        if !field_on {
            self.reader.set_field(true)?;
        }
        let result = match protocol {
            NfcProtocol::Iso14443A => self.scan_14443a(ctx.out),
            NfcProtocol::Iso15693 => self.scan_15693(ctx.out),
        };
        if !field_on {
            self.reader.set_field(false)?;
        }
        result
    }

    fn print_answer(out: &mut dyn fmt::Write, rx: &[u8]) {
        if rx.is_empty() {
            crate::cprint!(out, "No answer\r\n");
        } else {
            print_bytes(out, "READ", rx);
        }
    }
}

impl<R: NfcReader> Personality for NfcMode<R> {
    fn id(&self) -> ModeId {
        ModeId::Nfc
    }

    fn grammar(&self) -> &'static [&'static str] {
        GRAMMAR
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
            .with_start(true)
            .with_stop(true)
            .with_write(true)
    }

    fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
        let mut args = Args::new(args);
        configure(ctx.proto, &mut args)?;
        ctx.proto.valid = true;
        Ok(args.used())
    }

    fn setup(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.reader.open()?;
        self.open = true;
        let config = ctx.proto.config.nfc_mut();
        config.field_on = false;
        self.reader.set_protocol(config.protocol)?;
        self.reader.set_field(false)?;
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
                    crate::cprint!(
                        ctx.out,
                        "CS: PC1\r\nSCK: PB10\r\nMISO: PC2\r\nMOSI: PC3\r\nIRQ: PA1\r\n"
                    );
                } else {
                    self.show(ctx);
                }
            }
            Some("scan") => {
                args.bump();
                self.ready()?;
                self.scan(ctx)?;
            }
            Some("bits") => {
                args.bump();
                let byte = u8::try_from(args.uint("bits")?)
                    .map_err(|_| BusError::invalid("bits expects a byte"))?;
                let count = match args.uint("bits")? {
                    count @ 1..=7 => count as u8,
                    _ => return Err(BusError::invalid("Short frames carry 1 to 7 bits.")),
                };
                self.ready()?;
                let mut rx = [0u8; FRAME_MAX];
                let len = self.reader.transceive_bits(byte, count, &mut rx)?;
                crate::cprint!(ctx.out, "WRITE: 0x{byte:02X} ({count} bits)\r\n");
                Self::print_answer(ctx.out, &rx[..len]);
            }
            _ => {
                let mut staged = ctx.proto.clone();
                configure(&mut staged, &mut args)?;
                let protocol = staged.config.nfc_mut().protocol;
                if protocol != ctx.proto.config.nfc_mut().protocol {
                    self.ready()?;
                    self.reader.set_protocol(protocol)?;
                }
                *ctx.proto = staged;
            }
        }
        Ok(args.used())
    }

    fn start(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.ready()?;
        self.reader.set_field(true)?;
        ctx.proto.config.nfc_mut().field_on = true;
        crate::cprint!(ctx.out, "RF ON\r\n");
        Ok(())
    }

    fn stop(&mut self, ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
        self.ready()?;
        self.reader.set_field(false)?;
        ctx.proto.config.nfc_mut().field_on = false;
        crate::cprint!(ctx.out, "RF OFF\r\n");
        Ok(())
    }

    fn write(&mut self, ctx: &mut ModeCtx<'_>, tx: &[u8]) -> Result<(), BusError> {
        self.ready()?;
        let crc = ctx.proto.config.nfc_mut().crc;
        let mut rx = [0u8; FRAME_MAX];
        let len = self.reader.transceive(tx, crc, &mut rx)?;
        print_bytes(ctx.out, "WRITE", tx);
        Self::print_answer(ctx.out, &rx[..len]);
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut ModeCtx<'_>) {
        if self.open {
            if let Err(e) = self.reader.set_field(false) {
                log::warn!("nfc: field left on: {e}");
            }
            self.reader.close();
            self.open = false;
        }
    }

    fn show(&self, ctx: &mut ModeCtx<'_>) {
        let config = ctx.proto.config.nfc_mut();
        crate::cprint!(
            ctx.out,
            "Protocol: {}\r\nRF field: {}\r\nCRC: {}\r\n",
            protocol_name(config.protocol),
            on_off(config.field_on),
            on_off(config.crc)
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::console::Console;
    use crate::mode::test::{run, selected};
    use std::sync::{Arc, Mutex};

    /// A card in the field, answering the frames a reader sends it.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Tag {
        /// ISO 14443-A card with a 4, 7 or 10 byte UID.
        Proximity { atqa: [u8; 2], uid: Vec<u8>, sak: u8 },
        Vicinity { dsfid: u8, uid: [u8; 8] },
    }

    #[derive(Debug, Default)]
    struct Front {
        protocol: Option<NfcProtocol>,
        field: bool,
        field_switches: usize,
        tag: Option<Tag>,
        frames: Vec<(Vec<u8>, bool)>,
        halted: bool,
    }

    #[derive(Clone, Default)]
    struct SimReader(Arc<Mutex<Front>>);

    fn bcc(part: &[u8]) -> u8 {
        part.iter().fold(0, |acc, byte| acc ^ byte)
    }

    /// UID part answered on `level`, cascade tag included.
    fn uid_part(uid: &[u8], level: usize) -> [u8; 4] {
        let cascaded = uid.len() > 4 + 3 * level;
        let start = 3 * level;
        if cascaded {
            [CASCADE_TAG, uid[start], uid[start + 1], uid[start + 2]]
        } else {
            [uid[start], uid[start + 1], uid[start + 2], uid[start + 3]]
        }
    }

    impl NfcReader for SimReader {
        fn open(&mut self) -> Result<(), BusError> {
            Ok(())
        }

        fn set_protocol(&mut self, protocol: NfcProtocol) -> Result<(), BusError> {
            self.0.lock().unwrap().protocol = Some(protocol);
            Ok(())
        }

        fn set_field(&mut self, on: bool) -> Result<(), BusError> {
            let mut front = self.0.lock().unwrap();
            front.field = on;
            front.field_switches += 1;
            if !on {
                front.halted = false;
            }
            Ok(())
        }

        fn transceive_bits(&mut self, byte: u8, bits: u8, rx: &mut [u8]) -> Result<usize, BusError> {
            let mut front = self.0.lock().unwrap();
            front.frames.push((vec![byte, bits], false));
            match &front.tag {
                Some(Tag::Proximity { atqa, .. }) if front.field && !front.halted && byte == REQA => {
                    rx[..2].copy_from_slice(atqa);
                    Ok(2)
                }
                _ => Err(BusError::Timeout),
            }
        }

        fn transceive(&mut self, tx: &[u8], crc: bool, rx: &mut [u8]) -> Result<usize, BusError> {
            let mut front = self.0.lock().unwrap();
            front.frames.push((tx.to_vec(), crc));
            if !front.field {
                return Err(BusError::Timeout);
            }
            match front.tag.clone() {
                Some(Tag::Proximity { uid, sak, .. }) => {
                    if tx == HLTA {
                        front.halted = true;
                        return Err(BusError::Timeout);
                    }
                    let level = SEL.iter().position(|&sel| sel == tx[0]).ok_or(BusError::Timeout)?;
                    let part = uid_part(&uid, level);
                    if tx[1] == NVB_ANTICOLLISION {
                        rx[..4].copy_from_slice(&part);
                        rx[4] = bcc(&part);
                        return Ok(5);
                    }
                    assert_eq!(tx[2..6], part);
                    rx[0] = if part[0] == CASCADE_TAG { SAK_CASCADE } else { sak };
                    Ok(1)
                }
                Some(Tag::Vicinity { dsfid, uid }) if tx[1] == INVENTORY => {
                    rx[0] = 0;
                    rx[1] = dsfid;
                    rx[2..10].copy_from_slice(&uid);
                    Ok(10)
                }
                Some(Tag::Vicinity { .. }) => {
                    rx[..2].copy_from_slice(&[RESPONSE_ERROR, 0x01]);
                    Ok(2)
                }
                None => Err(BusError::Timeout),
            }
        }
    }

    fn reader(args: &str) -> (Console, SimReader) {
        let reader = SimReader::default();
        let handle = reader.clone();
        let (console, _) = selected(move |_| NfcMode::new(reader), args);
        (console, handle)
    }

    #[test]
    fn field_follows_brackets() {
        let (mut console, front) = reader("");
        assert_eq!(console.prompt(), "nfc1> ");
        assert_eq!(front.0.lock().unwrap().protocol, Some(NfcProtocol::Iso14443A));
        assert_eq!(run(&mut console, "["), "RF ON\r\n");
        assert!(front.0.lock().unwrap().field);
        assert_eq!(run(&mut console, "show"), "Protocol: ISO 14443-A\r\nRF field: on\r\nCRC: off\r\n");
        assert_eq!(run(&mut console, "]"), "RF OFF\r\n");
        assert!(!front.0.lock().unwrap().field);
    }

    #[test]
    fn single_size_uid() {
        let (mut console, front) = reader("");
        front.0.lock().unwrap().tag = Some(Tag::Proximity {
            atqa: [0x04, 0x00],
            uid: vec![0xde, 0xad, 0xbe, 0xef],
            sak: 0x08,
        });
        assert_eq!(
            run(&mut console, "scan"),
            "ATQA: 04 00\r\nUID: DE AD BE EF \r\nSAK: 08\r\n"
        );
        let front = front.0.lock().unwrap();
        // setup, then on and off around the scan
        assert!(!front.field);
        assert_eq!(front.field_switches, 3);
        assert_eq!(front.frames.last(), Some(&(HLTA.to_vec(), true)));
    }

    #[test]
    fn double_size_uid_cascades() {
        let (mut console, front) = reader("");
        front.0.lock().unwrap().tag = Some(Tag::Proximity {
            atqa: [0x44, 0x00],
            uid: vec![0x04, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66],
            sak: 0x00,
        });
        run(&mut console, "[");
        assert_eq!(
            run(&mut console, "scan"),
            "ATQA: 44 00\r\nUID: 04 11 22 33 44 55 66 \r\nSAK: 00\r\n"
        );
        let front = front.0.lock().unwrap();
        assert!(front.halted);
        let selects: Vec<u8> = front
            .frames
            .iter()
            .filter(|(frame, crc)| *crc && frame.len() == 7)
            .map(|(frame, _)| frame[0])
            .collect();
        assert_eq!(selects, [0x93, 0x95]);
    }

    #[test]
    fn empty_field() {
        let (mut console, _) = reader("");
        assert_eq!(run(&mut console, "scan"), "No tag found\r\n");
        let (mut console, _) = reader("iso15693");
        assert_eq!(run(&mut console, "scan"), "No tag found\r\n");
    }

    #[test]
    fn vicinity_inventory() {
        let (mut console, front) = reader("");
        front.0.lock().unwrap().tag = Some(Tag::Vicinity {
            dsfid: 0x00,
            uid: [0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0xe0],
        });
        run(&mut console, "iso15693 crc on");
        assert_eq!(front.0.lock().unwrap().protocol, Some(NfcProtocol::Iso15693));
        assert_eq!(
            run(&mut console, "scan"),
            "DSFID: 00\r\nUID: E0 02 03 04 05 06 07 08 \r\n"
        );
        run(&mut console, "[");
        assert_eq!(
            run(&mut console, "0x26 0x20"),
            "WRITE: 0x26 0x20 \r\nREAD: 0x01 0x01 \r\n"
        );
        assert_eq!(front.0.lock().unwrap().frames.last(), Some(&(vec![0x26, 0x20], true)));
    }

    #[test]
    fn raw_short_frame() {
        let (mut console, front) = reader("");
        front.0.lock().unwrap().tag = Some(Tag::Proximity {
            atqa: [0x04, 0x00],
            uid: vec![1, 2, 3, 4],
            sak: 0x08,
        });
        run(&mut console, "[");
        assert_eq!(
            run(&mut console, "bits 0x26 7"),
            "WRITE: 0x26 (7 bits)\r\nREAD: 0x04 0x00 \r\n"
        );
        let mut out = String::new();
        assert!(console.run_line("bits 0x26 8", &mut out).is_err());
        assert!(console.run_line("crc maybe", &mut out).is_err());
    }
}

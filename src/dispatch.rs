//! Personality switching.
//!
//! A switch validates the new personality before touching the old one:
//! `init` runs against a staged [`ProtoState`], and only once it accepted
//! its arguments does the previous personality release its hardware.
use crate::backend::ModeCtx;
use crate::console::Console;
use crate::session::ProtoState;
use crate::token::Token;
use crate::BusError;
use std::fmt;

impl Console {
    /// Switches to the personality registered at `index` (1 based) and
    /// returns the number of argument tokens it used.
    ///
    /// A rejected switch leaves the current personality and its session
    /// untouched. When the new personality fails to claim its hardware the
    /// console falls back to `hiz`.
    pub fn select(
        &mut self,
        index: usize,
        args: &[Token],
        out: &mut dyn fmt::Write,
    ) -> Result<usize, BusError> {
        if index == 0 || index >= self.registry.len() {
            self.invalid = true;
            return Err(BusError::invalid(format!("unknown mode {index}")));
        }

        let mut staged = ProtoState::default();
        let init = {
            let mut ctx = ModeCtx {
                proto: &mut staged,
                out: &mut *out,
                abort: &self.abort,
                link: self.link.as_deref_mut(),
            };
            self.registry[index].init(&mut ctx, args)
        };
        let used = match init {
            Ok(used) => used,
            Err(e) => {
                log::warn!("{} rejected its arguments: {e}", self.registry[index].name());
                self.invalid = true;
                return Err(e);
            }
        };

        self.release_current(out);
        self.install(index, staged);

        let setup = {
            let (mode, mut ctx, _, _) = self.parts(&mut *out);
            mode.setup(&mut ctx)
        };
        if let Err(e) = setup {
            log::warn!("{} setup failed: {e}", self.mode_name());
            self.release_current(out);
            self.install(0, ProtoState::default());
            return Err(e);
        }
        log::info!("mode {} selected", self.mode_name());
        Ok(used)
    }

    /// Resolves a mode keyword and switches to it.
    pub fn select_by_name(
        &mut self,
        name: &str,
        args: &[Token],
        out: &mut dyn fmt::Write,
    ) -> Result<usize, BusError> {
        let index = self.mode_index(name).ok_or_else(|| {
            self.invalid = true;
            BusError::invalid(format!("unknown mode '{name}'"))
        })?;
        self.select(index, args, out)
    }

    /// Leaves the current personality for `hiz`.
    pub fn exit(&mut self, out: &mut dyn fmt::Write) {
        if self.current == 0 {
            return;
        }
        log::info!("leaving mode {}", self.mode_name());
        self.release_current(out);
        self.install(0, ProtoState::default());
    }

    fn release_current(&mut self, out: &mut dyn fmt::Write) {
        self.trigger.release();
        let (mode, mut ctx, _, _) = self.parts(out);
        mode.cleanup(&mut ctx);
    }

    fn install(&mut self, index: usize, proto: ProtoState) {
        let mode = &self.registry[index];
        self.prompt = mode.prompt(&proto);
        self.grammar = mode.grammar();
        self.current = index;
        self.invalid = false;
        self.session.proto = proto;
        self.session.wwr = false;
        self.session.tx.clear();
        self.session.rx.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{Capabilities, ModeId, Personality};
    use crate::console::test::console;
    use crate::gpio::{PinMode, PinUse, SharedBoard, UsedPin};
    use crate::Pull;
    use std::sync::{Arc, Mutex};

    type Journal = Arc<Mutex<Vec<String>>>;

    /// Claims two pins in `setup` and records every hook.
    struct Recorder {
        id: ModeId,
        board: SharedBoard,
        pins: [u8; 2],
        claimed: Vec<UsedPin>,
        journal: Journal,
        reject_init: bool,
    }

    impl Recorder {
        fn new(id: ModeId, board: SharedBoard, pins: [u8; 2], journal: &Journal) -> Self {
            Self {
                id,
                board,
                pins,
                claimed: Vec::new(),
                journal: journal.clone(),
                reject_init: false,
            }
        }

        fn log(&self, event: &str) {
            let entry = format!("{} {event}", self.id.name());
            self.journal.lock().unwrap().push(entry);
        }
    }

    impl Personality for Recorder {
        fn id(&self) -> ModeId {
            self.id
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::bus()
        }

        fn init(&mut self, ctx: &mut ModeCtx<'_>, args: &[Token]) -> Result<usize, BusError> {
            self.log("init");
            if self.reject_init {
                return Err(BusError::invalid("rejected"));
            }
            ctx.proto.dev_num = 1;
            Ok(args.len())
        }

        fn setup(&mut self, _ctx: &mut ModeCtx<'_>) -> Result<(), BusError> {
            self.log("setup");
            for pin in self.pins {
                let line = UsedPin::new(
                    self.board.clone(),
                    pin,
                    PinUse::Output,
                    PinMode::PushPull,
                    Pull::Floating,
                )?;
                self.claimed.push(line);
            }
            Ok(())
        }

        fn cleanup(&mut self, ctx: &mut ModeCtx<'_>) {
            self.log(&format!("cleanup dev {}", ctx.proto.dev_num));
            self.claimed.clear();
        }
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn previous_mode_releases_before_next_claims() {
        let (mut console, _) = console(8);
        let journal = journal();
        let board = console.board.clone();
        console.register(Recorder::new(ModeId::Spi, board.clone(), [1, 2], &journal));
        console.register(Recorder::new(ModeId::I2c, board.clone(), [1, 3], &journal));
        let mut out = String::new();

        console.run_line("spi", &mut out).unwrap();
        assert_eq!(console.prompt(), "spi2> ");
        console.run_line("i2c", &mut out).unwrap();
        assert_eq!(console.mode_name(), "i2c");
        assert_eq!(
            *journal.lock().unwrap(),
            ["spi init", "spi setup", "i2c init", "spi cleanup dev 1", "i2c setup"]
        );
        let board = board.lock().unwrap();
        assert_eq!(board.usage(1), Some(PinUse::Output));
        assert_eq!(board.usage(2), None);
        assert_eq!(board.usage(3), Some(PinUse::Output));
    }

    #[test]
    fn rejected_init_keeps_current_mode() {
        let (mut console, _) = console(8);
        let journal = journal();
        let board = console.board.clone();
        console.register(Recorder::new(ModeId::Spi, board.clone(), [1, 2], &journal));
        let mut faulty = Recorder::new(ModeId::Uart, board, [4, 5], &journal);
        faulty.reject_init = true;
        console.register(faulty);
        let mut out = String::new();

        console.run_line("mode 1", &mut out).unwrap();
        assert!(console.run_line("mode 2", &mut out).is_err());
        assert!(console.is_invalid());
        assert_eq!(console.mode_name(), "spi");
        assert_eq!(console.session().proto.dev_num, 1);
        assert!(console.run_line("mode 7", &mut out).is_err());
        assert_eq!(console.mode_name(), "spi");
        assert_eq!(*journal.lock().unwrap(), ["spi init", "spi setup", "uart init"]);
    }

    #[test]
    fn failed_setup_falls_back_to_hiz() {
        let (mut console, _) = console(8);
        let journal = journal();
        let board = console.board.clone();
        // pin 9 does not exist on an 8 pin board
        console.register(Recorder::new(ModeId::Jtag, board, [0, 9], &journal));
        let mut out = String::new();

        assert_eq!(
            console.run_line("jtag", &mut out),
            Err(BusError::PinNotValid(9))
        );
        assert_eq!(console.mode_name(), "hiz");
        assert_eq!(console.prompt(), "> ");
        assert_eq!(console.board.lock().unwrap().usage(0), None);
    }

    #[test]
    fn exit_returns_to_hiz() {
        let (mut console, _) = console(8);
        let journal = journal();
        let board = console.board.clone();
        console.register(Recorder::new(ModeId::Can, board, [6, 7], &journal));
        let mut out = String::new();
        console.run_line("can", &mut out).unwrap();
        console.run_line("exit", &mut out).unwrap();
        assert_eq!(console.mode_name(), "hiz");
        assert_eq!(console.session().proto, ProtoState::default());
        assert_eq!(console.board.lock().unwrap().usage(6), None);
    }

    #[test]
    fn hiz_by_name_leaves_the_mode() {
        let (mut console, _) = console(8);
        let journal = journal();
        let board = console.board.clone();
        console.register(Recorder::new(ModeId::Can, board, [6, 7], &journal));
        let mut out = String::new();
        console.run_line("hiz", &mut out).unwrap();
        assert_eq!(console.mode_name(), "hiz");
        console.run_line("can", &mut out).unwrap();
        console.run_line("hiz", &mut out).unwrap();
        assert_eq!(console.mode_name(), "hiz");
        assert_eq!(console.board.lock().unwrap().usage(6), None);
    }
}

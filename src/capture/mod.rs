//! SUMP compatible logic analyzer.
//!
//! The engine samples a 16-bit port on every timer overflow into an 8192
//! sample ring, waits for the stage 0 trigger, captures the post-trigger
//! window and streams the samples back newest first.
mod parser;
mod ring;

pub use parser::{Command, Parser, SumpFlags};
pub use ring::{Ring, STATES_LEN};

use crate::{BoundedSection, CancelToken, HostLink, Preemption};
use std::io;

/// Reply to the `0x02` identify command.
pub const SUMP_ID_REPLY: &[u8; 4] = b"1ALS";

/// Reply to the `0x04` metadata command.
pub const SUMP_DESCRIPTION: &[u8] = &[
    // device name
    0x01, b'H', b'y', b'd', b'r', b'a', b'B', b'u', b's', 0x00,
    // sample memory: 8192
    0x21, 0x00, 0x00, 0x20, 0x00,
    // sample rate: 2MHz
    0x23, 0x00, 0x1e, 0x84, 0x80,
    // number of probes: 16
    0x40, 0x10,
    // protocol version: 2
    0x41, 0x02,
    0x00,
];

/// Timer overflowing once per sample period.
pub trait SampleTimer: Send {
    fn init(&mut self, prescaler: u32);
    fn set_prescaler(&mut self, prescaler: u32);
    fn start(&mut self);
    fn stop(&mut self);
    /// Busy waits for the next overflow and clears the flag.
    fn wait_overflow(&mut self);
    fn deinit(&mut self) {}
}

/// The 16 probe inputs, read in one access.
pub trait SamplePort: Send {
    /// Switches the probes to inputs with pull-downs.
    fn init(&mut self) {}
    fn sample(&mut self) -> u16;
    fn deinit(&mut self) {}
}

/// Scaling constants of the sample clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SumpConfig {
    /// Host divider units per timer tick.
    pub divider_scale: u32,
    /// Added to the host divider before scaling.
    pub divider_bias: u32,
    /// Samples the armed wait may take before giving up.
    pub arm_budget: usize,
}

impl Default for SumpConfig {
    fn default() -> Self {
        Self {
            divider_scale: 50,
            divider_bias: 1,
            // 10s at the 2MHz top rate
            arm_budget: 20_000_000,
        }
    }
}

impl SumpConfig {
    /// Sample divider for the raw 24-bit host value.
    pub fn divider(&self, raw: u32) -> u32 {
        (raw + self.divider_bias) / self.divider_scale.max(1) + 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureState {
    #[default]
    Idle,
    Armed,
    Triggered,
}

/// Capture parameters set by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    pub trigger_masks: [u32; 4],
    pub trigger_values: [u32; 4],
    pub read_count: u32,
    pub delay_count: u32,
    pub divider: u32,
    /// Enabled channel groups, bit 0 = channels 0..7.
    pub channels: u8,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            trigger_masks: [0; 4],
            trigger_values: [0; 4],
            read_count: 0,
            delay_count: 0,
            divider: 1,
            channels: 0b0011,
        }
    }
}

impl CaptureConfig {
    /// Timer prescaler for the current divider.
    pub fn prescaler(&self) -> u32 {
        2 * self.divider
    }
}

/// Outcome of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    /// Samples stored, trigger wait included.
    pub samples: usize,
    /// Whether the trigger fired before abort or the arm budget ran out.
    pub triggered: bool,
}

pub struct Engine {
    port: Box<dyn SamplePort>,
    timer: Box<dyn SampleTimer>,
    preemption: Box<dyn Preemption + Send>,
    sump: SumpConfig,
    config: CaptureConfig,
    state: CaptureState,
    ring: Ring,
    parser: Parser,
    /// States entered, oldest first, reset on every run.
    transitions: Vec<CaptureState>,
}

impl Engine {
    pub fn new(
        port: impl SamplePort + 'static,
        timer: impl SampleTimer + 'static,
        preemption: impl Preemption + Send + 'static,
        sump: SumpConfig,
    ) -> Self {
        Self {
            port: Box::new(port),
            timer: Box::new(timer),
            preemption: Box::new(preemption),
            sump,
            config: CaptureConfig::default(),
            state: CaptureState::Idle,
            ring: Ring::new(),
            parser: Parser::new(),
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// States the last run went through.
    pub fn transitions(&self) -> &[CaptureState] {
        &self.transitions
    }

    fn enter(&mut self, state: CaptureState) {
        Self::record(&mut self.state, &mut self.transitions, state);
    }

    fn record(current: &mut CaptureState, transitions: &mut Vec<CaptureState>, state: CaptureState) {
        log::trace!("capture {:?} -> {state:?}", current);
        *current = state;
        transitions.push(state);
    }

    /// Serves host commands until `abort` is raised.
    ///
    /// The probes and the timer are owned by the engine for the whole call
    /// and released on return.
    pub fn run<L: HostLink + ?Sized>(&mut self, link: &mut L, abort: &CancelToken) -> io::Result<()> {
        log::info!("sump capture started, interrupt with the user button");
        self.config = CaptureConfig::default();
        self.state = CaptureState::Idle;
        self.parser = Parser::new();
        self.port.init();
        self.timer.init(self.config.prescaler());
        let result = self.serve(link, abort);
        self.timer.stop();
        self.timer.deinit();
        self.port.deinit();
        log::info!("sump capture stopped");
        result
    }

    fn serve<L: HostLink + ?Sized>(&mut self, link: &mut L, abort: &CancelToken) -> io::Result<()> {
        while !abort.is_cancelled() {
            let Some(byte) = link.poll_byte() else {
                continue;
            };
            if let Some(cmd) = self.parser.push(byte) {
                self.handle(cmd, link, abort)?;
            }
        }
        Ok(())
    }

    /// Applies one host command, writing any reply to `out`.
    pub fn handle<W: io::Write + ?Sized>(
        &mut self,
        cmd: Command,
        out: &mut W,
        abort: &CancelToken,
    ) -> io::Result<()> {
        match cmd {
            Command::Reset | Command::XOn | Command::XOff => {}
            Command::Id => out.write_all(SUMP_ID_REPLY)?,
            Command::Describe => out.write_all(SUMP_DESCRIPTION)?,
            Command::Run => {
                let stats = self.capture(abort);
                log::debug!("capture {stats:?}");
                if stats.triggered {
                    self.read_back(out)?;
                }
            }
            Command::Divider(raw) => {
                self.config.divider = self.sump.divider(raw);
                self.timer.set_prescaler(self.config.prescaler());
                log::debug!("sump divider {raw} -> {}", self.config.divider);
            }
            Command::Counts {
                read_count,
                delay_count,
            } => {
                self.config.read_count = read_count;
                self.config.delay_count = delay_count;
            }
            Command::Flags(flags) => self.config.channels = flags.channel_groups(),
            Command::TriggerMask { stage, mask } => self.config.trigger_masks[stage] = mask,
            Command::TriggerValue { stage, value } => self.config.trigger_values[stage] = value,
            Command::Unknown(opcode) => log::trace!("sump opcode {opcode:#04x} ignored"),
        }
        out.flush()
    }

    /// Arms, waits for the trigger, captures the post-trigger window and
    /// goes back to idle.
    pub fn capture(&mut self, abort: &CancelToken) -> CaptureStats {
        self.transitions.clear();
        self.ring.rewind();
        self.enter(CaptureState::Armed);
        let value = self.config.trigger_values[0];
        let mask = self.config.trigger_masks[0];
        let delay = self.config.delay_count as usize;
        let mut samples = 0;

        let budget = self.sump.arm_budget.saturating_add(delay);
        let mut section = BoundedSection::enter(self.preemption.as_mut(), budget);
        self.timer.start();
        let mut triggered = false;
        while section.step() {
            if abort.is_cancelled() {
                break;
            }
            self.timer.wait_overflow();
            let sample = self.port.sample();
            self.ring.push(sample);
            samples += 1;
            if (sample as u32 ^ value) & mask == 0 {
                triggered = true;
                break;
            }
        }
        if triggered {
            Self::record(&mut self.state, &mut self.transitions, CaptureState::Triggered);
            for _ in 0..delay {
                if !section.step() {
                    break;
                }
                self.timer.wait_overflow();
                self.ring.push(self.port.sample());
                samples += 1;
            }
        }
        drop(section);
        self.timer.stop();
        self.enter(CaptureState::Idle);
        CaptureStats { samples, triggered }
    }

    /// Sends `read_count` samples, newest first, one byte per enabled
    /// channel group. Counts past the ring size stop at [`STATES_LEN`].
    fn read_back<W: io::Write + ?Sized>(&mut self, out: &mut W) -> io::Result<()> {
        let channels = self.config.channels;
        let mut bytes = Vec::with_capacity(self.config.read_count as usize * 4);
        for sample in self.ring.latest(self.config.read_count as usize) {
            let [low, high] = sample.to_le_bytes();
            for (group, byte) in [low, high, 0, 0].into_iter().enumerate() {
                if channels & 1 << group != 0 {
                    bytes.push(byte);
                }
            }
        }
        out.write_all(&bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::link::mem::MemLink;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays a script of port levels, then holds the last one.
    struct ScriptPort {
        levels: VecDeque<u16>,
        last: u16,
        reads: Arc<Mutex<usize>>,
    }

    impl SamplePort for ScriptPort {
        fn sample(&mut self) -> u16 {
            *self.reads.lock().unwrap() += 1;
            if let Some(level) = self.levels.pop_front() {
                self.last = level;
            }
            self.last
        }
    }

    #[derive(Default)]
    struct TimerLog {
        prescalers: Vec<u32>,
        overflows: usize,
        running: bool,
    }

    struct FakeTimer(Arc<Mutex<TimerLog>>);

    impl SampleTimer for FakeTimer {
        fn init(&mut self, prescaler: u32) {
            self.0.lock().unwrap().prescalers.push(prescaler);
        }
        fn set_prescaler(&mut self, prescaler: u32) {
            self.0.lock().unwrap().prescalers.push(prescaler);
        }
        fn start(&mut self) {
            self.0.lock().unwrap().running = true;
        }
        fn stop(&mut self) {
            self.0.lock().unwrap().running = false;
        }
        fn wait_overflow(&mut self) {
            let mut log = self.0.lock().unwrap();
            assert!(log.running, "timer polled while stopped");
            log.overflows += 1;
        }
    }

    struct Rig {
        engine: Engine,
        reads: Arc<Mutex<usize>>,
        timer: Arc<Mutex<TimerLog>>,
    }

    fn rig(levels: &[u16], sump: SumpConfig) -> Rig {
        let reads = Arc::new(Mutex::new(0));
        let timer = Arc::new(Mutex::new(TimerLog::default()));
        let port = ScriptPort {
            levels: levels.iter().copied().collect(),
            last: 0,
            reads: reads.clone(),
        };
        Rig {
            engine: Engine::new(port, FakeTimer(timer.clone()), (), sump),
            reads,
            timer,
        }
    }

    #[test]
    fn triggers_on_first_matching_sample() {
        let mut rig = rig(&[0x00, 0x01, 0x12, 0x05, 0x15, 0x05], SumpConfig::default());
        rig.engine.config.trigger_masks[0] = 0x0f;
        rig.engine.config.trigger_values[0] = 0x05;
        rig.engine.config.delay_count = 3;
        let stats = rig.engine.capture(&CancelToken::new());
        assert_eq!(
            stats,
            CaptureStats {
                samples: 4 + 3,
                triggered: true
            }
        );
        assert_eq!(
            rig.engine.transitions(),
            &[CaptureState::Armed, CaptureState::Triggered, CaptureState::Idle]
        );
        assert_eq!(rig.engine.state(), CaptureState::Idle);
        assert_eq!(*rig.reads.lock().unwrap(), 7);
        assert_eq!(rig.timer.lock().unwrap().overflows, 7);
        assert_eq!(rig.engine.ring.index(), 7);
    }

    #[test]
    fn arm_budget_bounds_the_wait() {
        let sump = SumpConfig {
            arm_budget: 100,
            ..SumpConfig::default()
        };
        let mut rig = rig(&[0x00], sump);
        rig.engine.config.trigger_masks[0] = 0x01;
        rig.engine.config.trigger_values[0] = 0x01;
        let stats = rig.engine.capture(&CancelToken::new());
        assert!(!stats.triggered);
        assert_eq!(stats.samples, 100);
        assert_eq!(
            rig.engine.transitions(),
            &[CaptureState::Armed, CaptureState::Idle]
        );
        assert!(!rig.timer.lock().unwrap().running);
    }

    #[test]
    fn abort_stops_the_armed_wait() {
        let mut rig = rig(&[0x00], SumpConfig::default());
        rig.engine.config.trigger_masks[0] = 0x01;
        rig.engine.config.trigger_values[0] = 0x01;
        let abort = CancelToken::new();
        abort.cancel();
        let stats = rig.engine.capture(&abort);
        assert_eq!(stats.samples, 0);
        assert!(!stats.triggered);
    }

    #[test]
    fn read_back_is_bounded_by_the_ring() {
        let mut rig = rig(&[0x0001], SumpConfig::default());
        // the largest count the host can ask for
        rig.engine.config.read_count = 262_144;
        rig.engine.config.channels = 0b0001;
        let mut out = Vec::new();
        rig.engine.read_back(&mut out).unwrap();
        assert_eq!(out.len(), STATES_LEN);
    }

    #[test]
    fn divider_scaling() {
        let sump = SumpConfig::default();
        assert_eq!(sump.divider(49), 2);
        assert_eq!(sump.divider(0), 1);
        assert_eq!(sump.divider(99), 3);

        let mut rig = rig(&[], sump);
        rig.engine
            .handle(Command::Divider(49), &mut Vec::new(), &CancelToken::new())
            .unwrap();
        assert_eq!(rig.engine.config().divider, 2);
        assert_eq!(rig.timer.lock().unwrap().prescalers, vec![4]);
    }

    #[test]
    fn host_session() {
        let mut rig = rig(&[0x0102, 0x0304, 0x0506], SumpConfig::default());
        let abort = CancelToken::new();
        let mut link = MemLink::with_input(&[
            0x00, 0x00, 0x02, 0x04,
            // read 4 samples, no post-trigger delay
            0x81, 0x00, 0x00, 0x00, 0x00,
            // groups 2 and 3 disabled
            0x82, 0b0011_0000, 0x00, 0x00, 0x00,
            // trigger when bit 2 of the low byte is set
            0xc0, 0x04, 0x00, 0x00, 0x00,
            0xc1, 0x04, 0x00, 0x00, 0x00,
            0x01,
        ]);
        link.on_drain = Some(abort.clone());
        rig.engine.run(&mut link, &abort).unwrap();

        let mut expected = b"1ALS".to_vec();
        expected.extend_from_slice(SUMP_DESCRIPTION);
        // 0x0304 is the first match; the ring walks back past slot 0 into
        // slots never written
        expected.extend_from_slice(&[0x04, 0x03, 0x02, 0x01, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(link.output, expected);
        assert_eq!(rig.engine.config().read_count, 4);
        assert_eq!(rig.engine.config().channels, 0b0011);
        assert_eq!(rig.engine.state(), CaptureState::Idle);
    }
}

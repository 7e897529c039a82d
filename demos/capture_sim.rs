//! Runs one SUMP capture against a simulated probe port.
//!
//! Channel 0..7 carry a free running counter, channels 8..15 random noise.
//! The scripted host arms a trigger on channel 7 going high and prints the
//! samples it gets back.
//!
//! ```bash
//! RUST_LOG=debug cargo run --example capture_sim
//! ```

use std::collections::VecDeque;
use std::io;

use busprobe::capture::{Engine, SampleTimer, SamplePort, SumpConfig};
use busprobe::{CancelToken, HostLink};
use itertools::Itertools;
use rand::Rng;

struct CounterPort {
    tick: u8,
}

impl SamplePort for CounterPort {
    fn sample(&mut self) -> u16 {
        self.tick = self.tick.wrapping_add(1);
        let noise: u8 = rand::thread_rng().r#gen();
        u16::from_le_bytes([self.tick, noise])
    }
}

/// Overflows as fast as the engine asks.
struct FreeTimer;

impl SampleTimer for FreeTimer {
    fn init(&mut self, prescaler: u32) {
        log::debug!("timer init, prescaler {prescaler}");
    }
    fn set_prescaler(&mut self, prescaler: u32) {
        log::debug!("timer prescaler {prescaler}");
    }
    fn start(&mut self) {}
    fn stop(&mut self) {}
    fn wait_overflow(&mut self) {}
}

/// Plays a fixed host script and stops the engine once it ran dry.
struct ScriptedHost {
    script: VecDeque<u8>,
    received: Vec<u8>,
    done: CancelToken,
}

impl io::Write for ScriptedHost {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.received.extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl HostLink for ScriptedHost {
    fn poll_byte(&mut self) -> Option<u8> {
        let byte = self.script.pop_front();
        if byte.is_none() {
            self.done.cancel();
        }
        byte
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let script: Vec<u8> = [
        // reset, identify
        &[0x00, 0x02][..],
        // divider 99: 1MHz
        &[0x80, 99, 0, 0, 0],
        // read 16 * 4 samples, 8 * 4 after the trigger
        &[0x81, 15, 0, 8, 0],
        // channels 0..15
        &[0x82, 0b0011_0000, 0, 0, 0],
        // stage 0: channel 7 high
        &[0xc0, 0x80, 0, 0, 0],
        &[0xc1, 0x80, 0, 0, 0],
        // run
        &[0x01],
    ]
    .concat();

    let abort = CancelToken::new();
    let mut host = ScriptedHost {
        script: script.into(),
        received: Vec::new(),
        done: abort.clone(),
    };
    let mut engine = Engine::new(CounterPort { tick: 0 }, FreeTimer, (), SumpConfig::default());
    engine.run(&mut host, &abort)?;

    let (id, samples) = host.received.split_at(4);
    println!("id: {}", String::from_utf8_lossy(id));
    println!("divider: {}", engine.config().divider);
    for row in &samples.iter().tuples::<(_, _)>().chunks(8) {
        println!(
            "{}",
            row.map(|(low, high)| format!("{low:02x}/{high:02x}")).join(" ")
        );
    }
    Ok(())
}

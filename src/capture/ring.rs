/// Number of samples kept by the capture engine.
pub const STATES_LEN: usize = 8192;
const MASK: usize = STATES_LEN - 1;
const _: () = assert!(STATES_LEN.is_power_of_two());

/// Sample memory: a power of two ring written forwards, read backwards.
pub struct Ring {
    buffer: Box<[u16]>,
    index: usize,
}

impl Default for Ring {
    fn default() -> Self {
        Self::new()
    }
}

impl Ring {
    pub fn new() -> Self {
        Self {
            buffer: vec![0; STATES_LEN].into_boxed_slice(),
            index: 0,
        }
    }

    /// Rewinds the write index; old samples stay until overwritten.
    pub fn rewind(&mut self) {
        self.index = 0;
    }

    /// Slot the next sample goes to.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn push(&mut self, sample: u16) {
        self.buffer[self.index] = sample;
        self.index = (self.index + 1) & MASK;
    }

    /// Up to `count` samples, newest first, wrapping below slot 0. Never
    /// more than the ring holds.
    pub fn latest(&self, count: usize) -> impl Iterator<Item = u16> + '_ {
        let start = self.index;
        (1..=count.min(STATES_LEN)).map(move |back| self.buffer[start.wrapping_sub(back) & MASK])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_wraps_with_sample_count() {
        let mut ring = Ring::new();
        for k in 0..STATES_LEN + 5 {
            assert_eq!(ring.index(), k % STATES_LEN);
            ring.push(k as u16);
        }
        assert_eq!(ring.index(), 5);
    }

    #[test]
    fn latest_walks_backwards_across_zero() {
        let mut ring = Ring::new();
        for k in 0..STATES_LEN + 2 {
            ring.push(k as u16);
        }
        let newest: Vec<u16> = ring.latest(4).collect();
        assert_eq!(newest, vec![8193, 8192, 8191, 8190]);
    }

    #[test]
    fn latest_stops_at_ring_size() {
        let mut ring = Ring::new();
        for k in 0..STATES_LEN {
            ring.push(k as u16);
        }
        let all: Vec<u16> = ring.latest(4 * STATES_LEN).collect();
        assert_eq!(all.len(), STATES_LEN);
        assert_eq!(all.first(), Some(&(STATES_LEN as u16 - 1)));
        assert_eq!(all.last(), Some(&0));
    }
}

// Seeded generator handed to network construction.
//
// Not cryptographically secure. Every random weight in a network is derived
// from draws on this generator, so two networks built from the same seed
// and configuration start out identical.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 { 0x9E3779B97F4A7C15 } else { seed };
        Self { state: seed }
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Two fresh draws, used as the seed of one device-side random fill.
    #[inline]
    pub fn seed_pair(&mut self) -> [u32; 2] {
        [self.next_u32(), self.next_u32()]
    }
}

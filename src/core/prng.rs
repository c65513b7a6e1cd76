// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It is used only for start-level jitter, tie-breaking and pretrial randomization,
// and it is seedable so sessions can be replayed exactly.

/// Random capability injected into measurements, the scheduler and the trial machine.
pub trait RandomSource {
    fn next_u32(&mut self) -> u32;

    /// Uniform in [0,1).
    #[inline]
    fn next_f32_01(&mut self) -> f32 {
        let x = self.next_u32();
        (x as f32) / (u32::MAX as f32 + 1.0)
    }

    #[inline]
    fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    /// Uniform in [low, high).
    #[inline]
    fn gen_range_usize(&mut self, low: usize, high: usize) -> usize {
        if high <= low {
            return low;
        }
        let span = (high - low) as u32;
        let v = self.next_u32() % span;
        low + v as usize
    }

    /// Uniform in [-n, n].
    #[inline]
    fn gen_symmetric_i64(&mut self, n: u32) -> i64 {
        if n == 0 {
            return 0;
        }
        let span = 2 * n as u64 + 1;
        (self.next_u32() as u64 % span) as i64 - n as i64
    }

    /// Pick one element of a non-empty slice.
    #[inline]
    fn choose<T: Copy>(&mut self, items: &[T]) -> Option<T> {
        if items.is_empty() {
            return None;
        }
        Some(items[self.gen_range_usize(0, items.len())])
    }
}

impl<R: RandomSource + ?Sized> RandomSource for &mut R {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        (**self).next_u32()
    }
}

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

    /// Seed from the wall clock; used when an experiment file gives no seed.
    #[cfg(feature = "std")]
    pub fn from_entropy() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::new(nanos ^ 0x2545_F491_4F6C_DD1D)
    }

    pub fn state(&self) -> u64 {
        self.state
    }

    /// Independent child stream (one per session).
    pub fn fork(&mut self) -> Prng {
        Prng::new(self.next_u64())
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
}

impl RandomSource for Prng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }
}

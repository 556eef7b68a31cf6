//! Seeded, per-process RNG (A7): transaction-id generation and RFC 5227
//! probe/backoff jitter.
//!
//! §3 calls out that `rng_state` is "seeded per-process; never shared across
//! forked workers" — this crate no longer forks (§9), but the same
//! constraint still means each `Rng` is owned by one `ClientState` and never
//! cloned into a shared handle.

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};

/// Transaction-id and jitter source for one running client.
pub struct Rng {
    inner: StdRng,
}

impl Rng {
    /// Seed from the wall clock (§4.3: "Wall-clock is used only for the xid
    /// seed on the first packet").
    pub fn from_wall_clock() -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0xA5A5_5A5A_1234_5678);
        Self::from_seed(seed)
    }

    /// Deterministic seed, for tests.
    pub fn from_seed(seed: u64) -> Self {
        Rng {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    /// A fresh 32-bit transaction id.
    pub fn xid(&mut self) -> u32 {
        self.inner.random()
    }

    /// Uniform jitter in `[min, max]` milliseconds (RFC 5227 probe
    /// intervals, §4.5).
    pub fn jitter_ms(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        self.inner.random_range(min..=max)
    }

    /// Signed jitter in `[-bound, +bound]` milliseconds, for the INIT
    /// backoff's "random jitter ±1 s" (§4.6).
    pub fn signed_jitter_ms(&mut self, bound_ms: i64) -> i64 {
        if bound_ms <= 0 {
            return 0;
        }
        self.inner.random_range(-bound_ms..=bound_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_bounds() {
        let mut rng = Rng::from_seed(42);
        for _ in 0..200 {
            let v = rng.jitter_ms(1000, 2000);
            assert!((1000..=2000).contains(&v));
        }
    }

    #[test]
    fn signed_jitter_stays_in_bounds() {
        let mut rng = Rng::from_seed(7);
        for _ in 0..200 {
            let v = rng.signed_jitter_ms(1000);
            assert!((-1000..=1000).contains(&v));
        }
    }

    #[test]
    fn same_seed_is_deterministic() {
        let mut a = Rng::from_seed(99);
        let mut b = Rng::from_seed(99);
        assert_eq!(a.xid(), b.xid());
        assert_eq!(a.jitter_ms(0, 1000), b.jitter_ms(0, 1000));
    }
}

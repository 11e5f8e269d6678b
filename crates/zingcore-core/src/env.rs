//! Environment abstraction for deterministic testing.
//!
//! Decouples `sys/info` and timer logic from real system clocks and entropy
//! sources, so the event loop and `sys/info` capability can be driven
//! deterministically in simulation tests and from real OS resources in
//! production, behind the same interface.
use std::time::Duration;

/// Abstract environment providing monotonic time and randomness.
///
/// Implementations must guarantee `now()` never goes backwards and that
/// `random_bytes` is cryptographically secure in production.
pub trait Environment: Clone + Send + Sync + 'static {
    /// The instant type used by this environment (real or virtual).
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock (`CLOCK_REALTIME`-equivalent) time as nanoseconds
    /// since the Unix epoch.
    fn realtime_ns(&self) -> u64;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generate a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0_u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}

/// The production [`Environment`]: real monotonic clock, OS entropy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn realtime_ns(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

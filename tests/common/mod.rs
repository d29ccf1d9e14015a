//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};

use lineserve::ServerConfig;

pub const DEADLINE: Duration = Duration::from_secs(10);

/// Loopback config on an ephemeral port.
pub fn loopback() -> ServerConfig {
    ServerConfig::builder().host("127.0.0.1").port(0).build()
}

/// Polls `condition` until it holds, failing the test after [`DEADLINE`].
pub fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Linear congruential generator; deterministic chunk sizes without a rand
/// dependency.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(2862933555777941757).wrapping_add(3037000493))
    }

    pub fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    /// Uniform-ish value in `1..=max`.
    pub fn size(&mut self, max: usize) -> usize {
        (self.next() as usize % max) + 1
    }
}

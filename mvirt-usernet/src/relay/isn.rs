//! Initial sequence number selection for relayed TCP connections.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Deserialize;

/// ISN used by the legacy fixed policy
pub const LEGACY_FIXED_ISN: u32 = 10_000_000;

/// Added per connection on top of the clock so back-to-back SYNs differ
const CONNECTION_STRIDE: u32 = 64_000;

/// How the stack picks the server-side ISN for a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsnPolicy {
    /// Always the same value. Guessable, kept for reproducible traces.
    Fixed(u32),
    /// RFC 793 style clock: seeded at startup, ticks every 4 µs.
    #[default]
    Clock,
}

impl IsnPolicy {
    pub fn legacy() -> Self {
        IsnPolicy::Fixed(LEGACY_FIXED_ISN)
    }
}

/// Hands out ISNs according to an [`IsnPolicy`].
#[derive(Debug)]
pub struct IsnGenerator {
    policy: IsnPolicy,
    epoch: Instant,
    seed: u32,
    connections: AtomicU32,
}

impl IsnGenerator {
    pub fn new(policy: IsnPolicy) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        // Fold the wall clock into 32 bits
        let seed = (nanos as u32) ^ ((nanos >> 32) as u32).rotate_left(13);

        Self {
            policy,
            epoch: Instant::now(),
            seed,
            connections: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> IsnPolicy {
        self.policy
    }

    pub fn next_isn(&self) -> u32 {
        match self.policy {
            IsnPolicy::Fixed(isn) => isn,
            IsnPolicy::Clock => {
                let ticks = (self.epoch.elapsed().as_micros() / 4) as u32;
                let n = self.connections.fetch_add(1, Ordering::Relaxed);
                self.seed
                    .wrapping_add(ticks)
                    .wrapping_add(n.wrapping_mul(CONNECTION_STRIDE))
            }
        }
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::collections::HashMap;

use crate::constants::RATE_LIMITER_GC_MS;
use crate::endpoint::Endpoint;

struct Bucket {
    tokens: f64,
    last_update: i64,
}

/// Per-source token buckets for unauthenticated traffic.
///
/// HELLO, PRESENTATION and SESSION_REQUEST handling (and any malformed
/// datagram) consume a token from the sender's bucket; an empty bucket means
/// the message is silently dropped. Buckets refill at the configured rate
/// and are garbage-collected after a minute of silence.
pub struct RateLimiter {
    rate_per_second: f64,
    burst: f64,
    buckets: HashMap<Endpoint, Bucket>,
}

/// A cold bucket must hold a complete handshake burst: HELLO_REQUEST,
/// PRESENTATION, and SESSION_REQUEST arrive within one round trip.
const MIN_BURST: f64 = 4.0;

impl RateLimiter {
    pub fn new(messages_per_second: u32) -> Self {
        let rate = f64::from(messages_per_second.max(1));
        Self { rate_per_second: rate, burst: rate.max(MIN_BURST), buckets: HashMap::new() }
    }

    /// Take one token for `source`. Returns false when the message must be
    /// dropped.
    pub fn allow(&mut self, source: Endpoint, now: i64) -> bool {
        let bucket = self.buckets.entry(source).or_insert(Bucket { tokens: self.burst, last_update: now });
        let elapsed = (now - bucket.last_update).max(0) as f64 / 1_000.0;
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_second).min(self.burst);
        bucket.last_update = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn collect_garbage(&mut self, now: i64) {
        self.buckets.retain(|_, b| (now - b.last_update) < RATE_LIMITER_GC_MS);
    }

    #[cfg(test)]
    fn tracked_sources(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn ep(port: u16) -> Endpoint {
        Endpoint::normalize(SocketAddr::from(([192, 0, 2, 1], port)))
    }

    #[test]
    fn burst_then_sustained_rate() {
        let mut rl = RateLimiter::new(1);
        // The handshake burst drains the cold bucket...
        for i in 0..4 {
            assert!(rl.allow(ep(1), i));
        }
        // ...after which the configured 1/s rate applies.
        assert!(!rl.allow(ep(1), 100));
        assert!(!rl.allow(ep(1), 900));
        assert!(rl.allow(ep(1), 1_100));
        assert!(!rl.allow(ep(1), 1_200));
    }

    #[test]
    fn sources_are_independent() {
        let mut rl = RateLimiter::new(1);
        for i in 0..4 {
            assert!(rl.allow(ep(1), i));
        }
        assert!(!rl.allow(ep(1), 10));
        assert!(rl.allow(ep(2), 10));
    }

    #[test]
    fn refill_caps_at_burst() {
        let mut rl = RateLimiter::new(1);
        for i in 0..4 {
            assert!(rl.allow(ep(1), i));
        }
        // A long silence must not bank more than the burst size.
        for i in 0..4 {
            assert!(rl.allow(ep(1), 3_600_000 + i));
        }
        assert!(!rl.allow(ep(1), 3_600_010));
    }

    #[test]
    fn idle_buckets_are_collected() {
        let mut rl = RateLimiter::new(1);
        rl.allow(ep(1), 0);
        rl.allow(ep(2), 55_000);
        rl.collect_garbage(60_500);
        assert_eq!(rl.tracked_sources(), 1);
        rl.collect_garbage(200_000);
        assert_eq!(rl.tracked_sources(), 0);
    }
}

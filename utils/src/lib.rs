/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod gate;
pub mod pool;

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;

lazy_static! {
    static ref START: Instant = Instant::now();
}

/// Monotonic milliseconds since an arbitrary process-local origin.
#[inline(always)]
pub fn ms_monotonic() -> i64 {
    Instant::now().duration_since(*START).as_millis() as i64
}

/// Milliseconds since the Unix epoch from the real-time clock.
#[inline(always)]
pub fn ms_since_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as i64)
}

/// Translate a monotonic deadline into a sleep duration from now (zero if already due).
#[inline(always)]
pub fn ms_until(deadline: i64) -> Duration {
    Duration::from_millis((deadline - ms_monotonic()).max(0) as u64)
}

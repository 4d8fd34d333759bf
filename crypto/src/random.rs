/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use rand::rngs::OsRng;
use rand::RngCore;

/// Fill a buffer from the operating system CSPRNG.
#[inline(always)]
pub fn fill_bytes_secure(dest: &mut [u8]) {
    OsRng.fill_bytes(dest);
}

#[inline(always)]
pub fn next_u32_secure() -> u32 {
    OsRng.next_u32()
}

#[inline(always)]
pub fn next_u64_secure() -> u64 {
    OsRng.next_u64()
}

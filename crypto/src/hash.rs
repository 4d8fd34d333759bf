/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

use crate::CryptoError;

pub const SHA256_HASH_SIZE: usize = 32;
pub const SHA384_HASH_SIZE: usize = 48;
pub const HMAC_SHA256_TAG_SIZE: usize = 32;

#[inline]
pub fn sha256(data: &[u8]) -> [u8; SHA256_HASH_SIZE] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

#[inline]
pub fn sha384(data: &[u8]) -> [u8; SHA384_HASH_SIZE] {
    let mut h = Sha384::new();
    h.update(data);
    h.finalize().into()
}

/// HMAC-SHA256 over a message, keyed with arbitrary-length key material.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; HMAC_SHA256_TAG_SIZE] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time HMAC-SHA256 verification.
pub fn hmac_sha256_verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<(), CryptoError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.verify_slice(tag).map_err(|_| CryptoError::VerificationFailed)
}

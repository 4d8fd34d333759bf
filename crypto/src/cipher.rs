/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::fmt;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aes::Aes256;
use aes_gcm::{AeadInPlace, AesGcm, KeyInit};
use serde::{Deserialize, Serialize};

use crate::secret::Secret;
use crate::CryptoError;

pub const GCM_TAG_SIZE: usize = 16;
pub const GCM_IV_SIZE: usize = 16;

/// AES-256-GCM parameterized with the protocol's 16-byte IV.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// A negotiated AEAD profile. The tag values are the wire encoding.
///
/// Both registered suites use AES-256-GCM for the record layer; they differ
/// in the signature algorithm expected from the peer's certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum CipherSuite {
    /// ECDHE key agreement, RSA certificate signatures, AES-256-GCM.
    EcdheRsaAes256GcmSha384,
    /// ECDHE key agreement, ECDSA certificate signatures, AES-256-GCM.
    EcdheEcdsaAes256GcmSha384,
}

impl CipherSuite {
    pub const fn wire_tag(self) -> u8 {
        match self {
            Self::EcdheRsaAes256GcmSha384 => 0x01,
            Self::EcdheEcdsaAes256GcmSha384 => 0x02,
        }
    }

    pub const fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::EcdheRsaAes256GcmSha384),
            0x02 => Some(Self::EcdheEcdsaAes256GcmSha384),
            _ => None,
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EcdheRsaAes256GcmSha384 => f.write_str("ECDHE-RSA-AES256-GCM-SHA384"),
            Self::EcdheEcdsaAes256GcmSha384 => f.write_str("ECDHE-ECDSA-AES256-GCM-SHA384"),
        }
    }
}

/// An AEAD instance keyed for one direction of a session.
///
/// The key schedule is run once at session install; the initialized cipher
/// is then reused for every datagram of that session.
pub struct SessionCipher {
    gcm: Aes256Gcm16,
}

impl SessionCipher {
    pub fn new(_suite: CipherSuite, key: &Secret<32>) -> Self {
        Self { gcm: Aes256Gcm16::new(GenericArray::from_slice(key.as_bytes())) }
    }

    /// Encrypt `buffer` in place and return the authentication tag.
    pub fn seal_detached(&self, iv: &[u8; GCM_IV_SIZE], aad: &[u8], buffer: &mut [u8]) -> [u8; GCM_TAG_SIZE] {
        let tag = self
            .gcm
            .encrypt_in_place_detached(GenericArray::from_slice(iv), aad, buffer)
            .expect("AES-GCM encryption is infallible for in-bound lengths");
        tag.into()
    }

    /// Authenticate and decrypt `buffer` in place.
    pub fn open_detached(
        &self,
        iv: &[u8; GCM_IV_SIZE],
        aad: &[u8],
        buffer: &mut [u8],
        tag: &[u8],
    ) -> Result<(), CryptoError> {
        if tag.len() != GCM_TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        self.gcm
            .decrypt_in_place_detached(GenericArray::from_slice(iv), aad, buffer, GenericArray::from_slice(tag))
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SessionCipher {
        SessionCipher::new(CipherSuite::EcdheEcdsaAes256GcmSha384, &Secret([0x42_u8; 32]))
    }

    #[test]
    fn seal_open_roundtrip() {
        let c = cipher();
        let iv = [9_u8; GCM_IV_SIZE];
        let mut buf = b"an ethernet frame".to_vec();
        let tag = c.seal_detached(&iv, b"aad", &mut buf);
        assert_ne!(&buf, b"an ethernet frame");
        c.open_detached(&iv, b"aad", &mut buf, &tag).unwrap();
        assert_eq!(&buf, b"an ethernet frame");
    }

    #[test]
    fn tampered_tag_rejected() {
        let c = cipher();
        let iv = [9_u8; GCM_IV_SIZE];
        let mut buf = b"payload".to_vec();
        let mut tag = c.seal_detached(&iv, b"", &mut buf);
        tag[0] ^= 1;
        assert!(c.open_detached(&iv, b"", &mut buf, &tag).is_err());
    }

    #[test]
    fn aad_is_bound() {
        let c = cipher();
        let iv = [1_u8; GCM_IV_SIZE];
        let mut buf = b"payload".to_vec();
        let tag = c.seal_detached(&iv, b"header-a", &mut buf);
        assert!(c.open_detached(&iv, b"header-b", &mut buf, &tag).is_err());
    }

    #[test]
    fn wire_tags_roundtrip() {
        for suite in [CipherSuite::EcdheRsaAes256GcmSha384, CipherSuite::EcdheEcdsaAes256GcmSha384] {
            assert_eq!(CipherSuite::from_wire_tag(suite.wire_tag()), Some(suite));
        }
        assert_eq!(CipherSuite::from_wire_tag(0x00), None);
        assert_eq!(CipherSuite::from_wire_tag(0x03), None);
    }
}

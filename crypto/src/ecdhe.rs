/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::fmt;

use elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::CryptoError;

/// A named curve usable for ephemeral key agreement. Tag values are the
/// wire encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum EllipticCurve {
    Secp256r1,
    Secp384r1,
    Secp521r1,
}

impl EllipticCurve {
    pub const fn wire_tag(self) -> u8 {
        match self {
            Self::Secp256r1 => 0x01,
            Self::Secp384r1 => 0x02,
            Self::Secp521r1 => 0x03,
        }
    }

    pub const fn from_wire_tag(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Secp256r1),
            0x02 => Some(Self::Secp384r1),
            0x03 => Some(Self::Secp521r1),
            _ => None,
        }
    }

    /// Length of an uncompressed SEC1 point on this curve.
    pub const fn public_key_size(self) -> usize {
        match self {
            Self::Secp256r1 => 65,
            Self::Secp384r1 => 97,
            Self::Secp521r1 => 133,
        }
    }
}

impl fmt::Display for EllipticCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secp256r1 => f.write_str("secp256r1"),
            Self::Secp384r1 => f.write_str("secp384r1"),
            Self::Secp521r1 => f.write_str("secp521r1"),
        }
    }
}

/// An ephemeral ECDHE keypair generated for one session negotiation and
/// consumed by it.
pub enum EphemeralKeyPair {
    Secp256r1(p256::ecdh::EphemeralSecret),
    Secp384r1(p384::ecdh::EphemeralSecret),
    Secp521r1(p521::ecdh::EphemeralSecret),
}

impl EphemeralKeyPair {
    pub fn generate(curve: EllipticCurve) -> Self {
        match curve {
            EllipticCurve::Secp256r1 => Self::Secp256r1(p256::ecdh::EphemeralSecret::random(&mut OsRng)),
            EllipticCurve::Secp384r1 => Self::Secp384r1(p384::ecdh::EphemeralSecret::random(&mut OsRng)),
            EllipticCurve::Secp521r1 => Self::Secp521r1(p521::ecdh::EphemeralSecret::random(&mut OsRng)),
        }
    }

    pub fn curve(&self) -> EllipticCurve {
        match self {
            Self::Secp256r1(_) => EllipticCurve::Secp256r1,
            Self::Secp384r1(_) => EllipticCurve::Secp384r1,
            Self::Secp521r1(_) => EllipticCurve::Secp521r1,
        }
    }

    /// Uncompressed SEC1 encoding of the public key.
    pub fn public_key_bytes(&self) -> Vec<u8> {
        match self {
            Self::Secp256r1(s) => s.public_key().to_encoded_point(false).as_bytes().to_vec(),
            Self::Secp384r1(s) => s.public_key().to_encoded_point(false).as_bytes().to_vec(),
            Self::Secp521r1(s) => s.public_key().to_encoded_point(false).as_bytes().to_vec(),
        }
    }

    /// Complete the key agreement against the peer's SEC1-encoded public key.
    ///
    /// Fails if the peer's bytes are not a valid point on this keypair's
    /// curve, which covers both corruption and a curve mismatch.
    pub fn agree(&self, peer_public: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        match self {
            Self::Secp256r1(s) => {
                let pk = p256::PublicKey::from_sec1_bytes(peer_public).map_err(|_| CryptoError::InvalidPublicKey)?;
                Ok(Zeroizing::new(s.diffie_hellman(&pk).raw_secret_bytes().to_vec()))
            }
            Self::Secp384r1(s) => {
                let pk = p384::PublicKey::from_sec1_bytes(peer_public).map_err(|_| CryptoError::InvalidPublicKey)?;
                Ok(Zeroizing::new(s.diffie_hellman(&pk).raw_secret_bytes().to_vec()))
            }
            Self::Secp521r1(s) => {
                let pk = p521::PublicKey::from_sec1_bytes(peer_public).map_err(|_| CryptoError::InvalidPublicKey)?;
                Ok(Zeroizing::new(s.diffie_hellman(&pk).raw_secret_bytes().to_vec()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_matches_on_each_curve() {
        for curve in [EllipticCurve::Secp256r1, EllipticCurve::Secp384r1, EllipticCurve::Secp521r1] {
            let a = EphemeralKeyPair::generate(curve);
            let b = EphemeralKeyPair::generate(curve);
            assert_eq!(a.public_key_bytes().len(), curve.public_key_size());
            let sa = a.agree(&b.public_key_bytes()).unwrap();
            let sb = b.agree(&a.public_key_bytes()).unwrap();
            assert_eq!(*sa, *sb);
        }
    }

    #[test]
    fn curve_mismatch_is_rejected() {
        let a = EphemeralKeyPair::generate(EllipticCurve::Secp256r1);
        let b = EphemeralKeyPair::generate(EllipticCurve::Secp384r1);
        assert!(a.agree(&b.public_key_bytes()).is_err());
    }

    #[test]
    fn garbage_point_is_rejected() {
        let a = EphemeralKeyPair::generate(EllipticCurve::Secp256r1);
        assert!(a.agree(&[4_u8; 65]).is_err());
        assert!(a.agree(&[]).is_err());
    }
}

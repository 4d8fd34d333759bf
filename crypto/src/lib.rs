/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod cipher;
pub mod ecdhe;
pub mod hash;
pub mod kdf;
pub mod random;
pub mod secret;
pub mod sign;
pub mod x509;

use std::fmt;

/// Errors from cryptographic primitives.
///
/// Callers generally map these onto a protocol-level authentication or
/// parameter error; the distinction here is for logging.
pub enum CryptoError {
    /// A DER structure (certificate, public key, signature) failed to parse.
    InvalidEncoding,

    /// A key has the wrong length or type for the requested operation.
    InvalidKey,

    /// A signature or MAC did not verify.
    VerificationFailed,

    /// AEAD open failed (tag mismatch).
    DecryptionFailed,

    /// The peer's public key is not a valid point on the negotiated curve.
    InvalidPublicKey,

    /// An algorithm required by a certificate is not supported.
    UnsupportedAlgorithm,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEncoding => f.write_str("InvalidEncoding"),
            Self::InvalidKey => f.write_str("InvalidKey"),
            Self::VerificationFailed => f.write_str("VerificationFailed"),
            Self::DecryptionFailed => f.write_str("DecryptionFailed"),
            Self::InvalidPublicKey => f.write_str("InvalidPublicKey"),
            Self::UnsupportedAlgorithm => f.write_str("UnsupportedAlgorithm"),
        }
    }
}

impl fmt::Debug for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for CryptoError {}

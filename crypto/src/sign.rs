/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Host message signatures.
//!
//! SESSION_REQUEST and SESSION bodies are signed with the host's long-term
//! key. RSA keys sign PKCS#1 v1.5 over SHA-384; ECDSA keys sign with their
//! curve's matched digest and emit DER-encoded signatures.

use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use sha2::{Sha256, Sha384, Sha512};

use crate::CryptoError;

/// What kind of public key a certificate carries, which decides the
/// compatible cipher suites.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KeyKind {
    Rsa,
    Ecdsa,
}

/// The local host's signature private key.
pub enum HostSigningKey {
    Rsa(rsa::pkcs1v15::SigningKey<Sha384>),
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    P521(p521::ecdsa::SigningKey),
}

impl HostSigningKey {
    /// Load a private key from PKCS#8 DER, accepting RSA and the three
    /// supported NIST curves.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        if let Ok(key) = rsa::RsaPrivateKey::from_pkcs8_der(der) {
            return Ok(Self::Rsa(rsa::pkcs1v15::SigningKey::new(key)));
        }
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Ok(Self::P256(key));
        }
        if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Ok(Self::P384(key));
        }
        if let Ok(key) = p521::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Ok(Self::P521(key));
        }
        Err(CryptoError::InvalidKey)
    }

    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Rsa(_) => KeyKind::Rsa,
            _ => KeyKind::Ecdsa,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Self::Rsa(key) => key.sign(message).to_vec(),
            Self::P256(key) => {
                let sig: p256::ecdsa::Signature = key.sign(message);
                sig.to_der().to_vec()
            }
            Self::P384(key) => {
                let sig: p384::ecdsa::Signature = key.sign(message);
                sig.to_der().to_vec()
            }
            Self::P521(key) => {
                let sig: p521::ecdsa::Signature = key.sign(message);
                sig.to_der().to_vec()
            }
        }
    }
}

/// A peer's signature public key, extracted from its certificate.
pub enum CertificateVerifier {
    Rsa(rsa::RsaPublicKey),
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    P521(p521::ecdsa::VerifyingKey),
}

impl CertificateVerifier {
    pub fn kind(&self) -> KeyKind {
        match self {
            Self::Rsa(_) => KeyKind::Rsa,
            _ => KeyKind::Ecdsa,
        }
    }

    /// Verify a protocol message signature produced by HostSigningKey::sign.
    pub fn verify_message(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        match self {
            Self::Rsa(key) => {
                let sig = rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| CryptoError::InvalidEncoding)?;
                rsa::pkcs1v15::VerifyingKey::<Sha384>::new(key.clone())
                    .verify(message, &sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            Self::P256(key) => {
                let sig = p256::ecdsa::Signature::from_der(signature).map_err(|_| CryptoError::InvalidEncoding)?;
                key.verify(message, &sig).map_err(|_| CryptoError::VerificationFailed)
            }
            Self::P384(key) => {
                let sig = p384::ecdsa::Signature::from_der(signature).map_err(|_| CryptoError::InvalidEncoding)?;
                key.verify(message, &sig).map_err(|_| CryptoError::VerificationFailed)
            }
            Self::P521(key) => {
                let sig = p521::ecdsa::Signature::from_der(signature).map_err(|_| CryptoError::InvalidEncoding)?;
                key.verify(message, &sig).map_err(|_| CryptoError::VerificationFailed)
            }
        }
    }

    /// Verify an X.509 signature (a TBSCertificate under the algorithm the
    /// certificate names). Only digest/key combinations that certificates in
    /// the wild actually use are accepted.
    pub fn verify_x509(&self, algorithm: X509SignatureAlgorithm, tbs: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        use X509SignatureAlgorithm::*;
        match (self, algorithm) {
            (Self::Rsa(key), RsaSha256) => {
                let sig = rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| CryptoError::InvalidEncoding)?;
                rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone())
                    .verify(tbs, &sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            (Self::Rsa(key), RsaSha384) => {
                let sig = rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| CryptoError::InvalidEncoding)?;
                rsa::pkcs1v15::VerifyingKey::<Sha384>::new(key.clone())
                    .verify(tbs, &sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            (Self::Rsa(key), RsaSha512) => {
                let sig = rsa::pkcs1v15::Signature::try_from(signature).map_err(|_| CryptoError::InvalidEncoding)?;
                rsa::pkcs1v15::VerifyingKey::<Sha512>::new(key.clone())
                    .verify(tbs, &sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            (Self::P256(key), EcdsaSha256) => {
                let sig = p256::ecdsa::Signature::from_der(signature).map_err(|_| CryptoError::InvalidEncoding)?;
                key.verify(tbs, &sig).map_err(|_| CryptoError::VerificationFailed)
            }
            (Self::P384(key), EcdsaSha384) => {
                let sig = p384::ecdsa::Signature::from_der(signature).map_err(|_| CryptoError::InvalidEncoding)?;
                key.verify(tbs, &sig).map_err(|_| CryptoError::VerificationFailed)
            }
            (Self::P521(key), EcdsaSha512) => {
                let sig = p521::ecdsa::Signature::from_der(signature).map_err(|_| CryptoError::InvalidEncoding)?;
                key.verify(tbs, &sig).map_err(|_| CryptoError::VerificationFailed)
            }
            _ => Err(CryptoError::UnsupportedAlgorithm),
        }
    }
}

/// X.509 signature algorithms we can check, decoded from the certificate's
/// AlgorithmIdentifier by the x509 module.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum X509SignatureAlgorithm {
    RsaSha256,
    RsaSha384,
    RsaSha512,
    EcdsaSha256,
    EcdsaSha384,
    EcdsaSha512,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn ecdsa_sign_verify_roundtrip() {
        let key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let verifier = CertificateVerifier::P256(*key.verifying_key());
        let host = HostSigningKey::P256(key);
        assert_eq!(host.kind(), KeyKind::Ecdsa);

        let sig = host.sign(b"session request body");
        verifier.verify_message(b"session request body", &sig).unwrap();
        assert!(verifier.verify_message(b"tampered body", &sig).is_err());
    }

    #[test]
    fn truncated_der_signature_is_rejected() {
        let key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let verifier = CertificateVerifier::P256(*key.verifying_key());
        let host = HostSigningKey::P256(key);
        let sig = host.sign(b"body");
        assert!(verifier.verify_message(b"body", &sig[..sig.len() - 1]).is_err());
    }
}

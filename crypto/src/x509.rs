/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::fmt;

use rsa::pkcs1::DecodeRsaPublicKey;
use x509_parser::oid_registry::{
    OID_EC_P256, OID_KEY_TYPE_EC_PUBLIC_KEY, OID_NIST_EC_P384, OID_NIST_EC_P521, OID_PKCS1_RSAENCRYPTION,
    OID_PKCS1_SHA256WITHRSA, OID_PKCS1_SHA384WITHRSA, OID_PKCS1_SHA512WITHRSA, OID_SIG_ECDSA_WITH_SHA256,
    OID_SIG_ECDSA_WITH_SHA384, OID_SIG_ECDSA_WITH_SHA512,
};
use x509_parser::prelude::*;

use crate::hash::sha256;
use crate::sign::{CertificateVerifier, KeyKind, X509SignatureAlgorithm};
use crate::CryptoError;

/// An X.509 certificate held as DER.
///
/// The fields needed on hot paths (name comparison, fingerprint lookups) are
/// extracted once at construction; everything else re-parses the DER on
/// demand.
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    subject_raw: Vec<u8>,
    issuer_raw: Vec<u8>,
    subject_display: String,
    fingerprint: [u8; 32],
}

impl Certificate {
    pub fn from_der(der: Vec<u8>) -> Result<Self, CryptoError> {
        let (rem, parsed) = parse_x509_certificate(&der).map_err(|_| CryptoError::InvalidEncoding)?;
        if !rem.is_empty() {
            return Err(CryptoError::InvalidEncoding);
        }
        let subject_raw = parsed.tbs_certificate.subject.as_raw().to_vec();
        let issuer_raw = parsed.tbs_certificate.issuer.as_raw().to_vec();
        let subject_display = parsed.tbs_certificate.subject.to_string();
        drop(parsed);
        let fingerprint = sha256(&der);
        Ok(Self { der, subject_raw, issuer_raw, subject_display, fingerprint })
    }

    #[inline]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// SHA-256 of the DER encoding; the identity used in CONTACT lookups.
    #[inline]
    pub fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    #[inline]
    pub fn subject(&self) -> &str {
        &self.subject_display
    }

    /// True when both certificates name the same subject and issuer, the
    /// precondition for pairing a signature and an encryption certificate.
    pub fn same_subject_and_issuer(&self, other: &Certificate) -> bool {
        self.subject_raw == other.subject_raw && self.issuer_raw == other.issuer_raw
    }

    /// True when `issuer` could have issued this certificate (name chaining
    /// only; signature checking is `verify_signed_by`).
    pub fn issued_by(&self, issuer: &Certificate) -> bool {
        self.issuer_raw == issuer.subject_raw
    }

    /// Extract the signature public key.
    pub fn verifier(&self) -> Result<CertificateVerifier, CryptoError> {
        let (_, parsed) = parse_x509_certificate(&self.der).map_err(|_| CryptoError::InvalidEncoding)?;
        let spki = parsed.public_key();
        let key_bytes: &[u8] = spki.subject_public_key.data.as_ref();
        let alg = &spki.algorithm;
        if alg.algorithm == OID_PKCS1_RSAENCRYPTION {
            let key = rsa::RsaPublicKey::from_pkcs1_der(key_bytes).map_err(|_| CryptoError::InvalidEncoding)?;
            Ok(CertificateVerifier::Rsa(key))
        } else if alg.algorithm == OID_KEY_TYPE_EC_PUBLIC_KEY {
            let curve = alg
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .ok_or(CryptoError::UnsupportedAlgorithm)?;
            if curve == OID_EC_P256 {
                p256::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                    .map(CertificateVerifier::P256)
                    .map_err(|_| CryptoError::InvalidEncoding)
            } else if curve == OID_NIST_EC_P384 {
                p384::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                    .map(CertificateVerifier::P384)
                    .map_err(|_| CryptoError::InvalidEncoding)
            } else if curve == OID_NIST_EC_P521 {
                p521::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                    .map(CertificateVerifier::P521)
                    .map_err(|_| CryptoError::InvalidEncoding)
            } else {
                Err(CryptoError::UnsupportedAlgorithm)
            }
        } else {
            Err(CryptoError::UnsupportedAlgorithm)
        }
    }

    pub fn key_kind(&self) -> Result<KeyKind, CryptoError> {
        self.verifier().map(|v| v.kind())
    }

    /// Check this certificate's signature against an issuer certificate.
    pub fn verify_signed_by(&self, issuer: &Certificate) -> Result<(), CryptoError> {
        let (_, parsed) = parse_x509_certificate(&self.der).map_err(|_| CryptoError::InvalidEncoding)?;
        let oid = &parsed.signature_algorithm.algorithm;
        let algorithm = if *oid == OID_PKCS1_SHA256WITHRSA {
            X509SignatureAlgorithm::RsaSha256
        } else if *oid == OID_PKCS1_SHA384WITHRSA {
            X509SignatureAlgorithm::RsaSha384
        } else if *oid == OID_PKCS1_SHA512WITHRSA {
            X509SignatureAlgorithm::RsaSha512
        } else if *oid == OID_SIG_ECDSA_WITH_SHA256 {
            X509SignatureAlgorithm::EcdsaSha256
        } else if *oid == OID_SIG_ECDSA_WITH_SHA384 {
            X509SignatureAlgorithm::EcdsaSha384
        } else if *oid == OID_SIG_ECDSA_WITH_SHA512 {
            X509SignatureAlgorithm::EcdsaSha512
        } else {
            return Err(CryptoError::UnsupportedAlgorithm);
        };
        let tbs = parsed.tbs_certificate.as_ref();
        let signature: &[u8] = parsed.signature_value.data.as_ref();
        issuer.verifier()?.verify_x509(algorithm, tbs, signature)
    }

    /// True when the certificate's validity window contains the present time.
    pub fn is_currently_valid(&self) -> bool {
        parse_x509_certificate(&self.der)
            .map(|(_, parsed)| parsed.validity().is_valid_at(x509_parser::time::ASN1Time::now()))
            .unwrap_or(false)
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificate({}, {})", self.subject_display, hex::encode(&self.fingerprint[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_der_is_rejected() {
        assert!(Certificate::from_der(vec![0x30, 0x03, 0x01, 0x01, 0xff]).is_err());
        assert!(Certificate::from_der(Vec::new()).is_err());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        // Even a structurally valid prefix must consume the whole input.
        assert!(Certificate::from_der(vec![0x30, 0x00, 0xaa]).is_err());
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use fscp_crypto::hash::hmac_sha256;
use fscp_crypto::kdf::derive_psk;
use fscp_crypto::secret::Secret;
use fscp_crypto::sign::HostSigningKey;
use fscp_crypto::x509::Certificate;

use crate::constants::{DEFAULT_PSK_ITERATIONS, DEFAULT_PSK_SALT};
use crate::error::Error;

/// The local node's long-term identity: a signature certificate and key,
/// optionally a distinct encryption certificate and key, and/or a
/// passphrase-derived pre-shared key.
///
/// An identity is usable when it holds at least one of {certificates+key,
/// PSK}. PSK-only nodes cannot present certificates; they authenticate key
/// agreement with an HMAC in place of a certificate signature.
pub struct IdentityStore {
    sig_cert: Option<Certificate>,
    sig_key: Option<HostSigningKey>,
    enc_cert: Option<Certificate>,
    enc_key: Option<HostSigningKey>,
    psk: Option<Secret<32>>,
}

impl IdentityStore {
    /// Build an identity from a signature certificate and its PKCS#8 DER
    /// private key, plus an optional distinct encryption pair.
    ///
    /// The private key must match the certificate; a mismatch is an error,
    /// as is an encryption certificate with a different subject or issuer.
    pub fn from_certificates(
        sig_cert: Certificate,
        sig_key_pkcs8: &[u8],
        enc_pair: Option<(Certificate, &[u8])>,
    ) -> Result<Self, Error> {
        let sig_key = HostSigningKey::from_pkcs8_der(sig_key_pkcs8).map_err(|_| Error::InvalidParameter)?;
        check_key_matches(&sig_cert, &sig_key)?;

        let (enc_cert, enc_key) = match enc_pair {
            Some((cert, key_der)) => {
                if !sig_cert.same_subject_and_issuer(&cert) {
                    return Err(Error::InvalidParameter);
                }
                let key = HostSigningKey::from_pkcs8_der(key_der).map_err(|_| Error::InvalidParameter)?;
                check_key_matches(&cert, &key)?;
                (Some(cert), Some(key))
            }
            None => (None, None),
        };

        Ok(Self { sig_cert: Some(sig_cert), sig_key: Some(sig_key), enc_cert, enc_key, psk: None })
    }

    /// Build a PSK-only identity from a passphrase with the default PBKDF2
    /// parameters (2000 iterations, salt "freelan").
    pub fn from_passphrase(passphrase: &[u8]) -> Self {
        Self::from_passphrase_with(passphrase, DEFAULT_PSK_SALT, DEFAULT_PSK_ITERATIONS)
    }

    pub fn from_passphrase_with(passphrase: &[u8], salt: &[u8], iterations: u32) -> Self {
        Self {
            sig_cert: None,
            sig_key: None,
            enc_cert: None,
            enc_key: None,
            psk: Some(derive_psk(passphrase, salt, iterations)),
        }
    }

    /// Add a PSK to a certificate identity; it is mixed into session key
    /// derivation.
    pub fn with_passphrase(mut self, passphrase: &[u8], salt: &[u8], iterations: u32) -> Self {
        self.psk = Some(derive_psk(passphrase, salt, iterations));
        self
    }

    pub fn is_valid(&self) -> bool {
        (self.sig_cert.is_some() && self.sig_key.is_some()) || self.psk.is_some()
    }

    #[inline]
    pub fn has_certificates(&self) -> bool {
        self.sig_cert.is_some()
    }

    #[inline]
    pub fn signature_certificate(&self) -> Option<&Certificate> {
        self.sig_cert.as_ref()
    }

    /// The encryption certificate, falling back to the signature
    /// certificate.
    #[inline]
    pub fn encryption_certificate(&self) -> Option<&Certificate> {
        self.enc_cert.as_ref().or(self.sig_cert.as_ref())
    }

    #[inline]
    pub fn has_distinct_encryption_certificate(&self) -> bool {
        self.enc_cert.is_some()
    }

    /// The encryption private key, falling back to the signature key.
    #[inline]
    pub fn encryption_key(&self) -> Option<&HostSigningKey> {
        self.enc_key.as_ref().or(self.sig_key.as_ref())
    }

    #[inline]
    pub fn psk(&self) -> Option<&Secret<32>> {
        self.psk.as_ref()
    }

    /// Sign a key-agreement message body: certificate signature when we
    /// have a key, HMAC over the PSK otherwise.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, Error> {
        if let Some(key) = &self.sig_key {
            Ok(key.sign(message))
        } else if let Some(psk) = &self.psk {
            Ok(hmac_sha256(psk.as_bytes(), message).to_vec())
        } else {
            Err(Error::IdentityRequired)
        }
    }
}

fn check_key_matches(cert: &Certificate, key: &HostSigningKey) -> Result<(), Error> {
    const PROBE: &[u8] = b"fscp identity key check";
    let signature = key.sign(PROBE);
    cert.verifier()
        .and_then(|v| v.verify_message(PROBE, &signature))
        .map_err(|_| Error::InvalidParameter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psk_identity_is_valid_and_signs() {
        let id = IdentityStore::from_passphrase(b"a strong passphrase");
        assert!(id.is_valid());
        assert!(!id.has_certificates());
        let sig = id.sign(b"body").unwrap();
        assert_eq!(sig.len(), 32);
        // Same passphrase, same tag; different passphrase, different tag.
        let id2 = IdentityStore::from_passphrase(b"a strong passphrase");
        assert_eq!(id2.sign(b"body").unwrap(), sig);
        let id3 = IdentityStore::from_passphrase(b"another passphrase");
        assert_ne!(id3.sign(b"body").unwrap(), sig);
    }

    #[test]
    fn empty_identity_is_invalid() {
        let id = IdentityStore { sig_cert: None, sig_key: None, enc_cert: None, enc_key: None, psk: None };
        assert!(!id.is_valid());
        assert!(id.sign(b"x").is_err());
    }
}

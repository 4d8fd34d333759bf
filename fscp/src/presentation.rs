/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::fmt;

use fscp_crypto::x509::Certificate;

use crate::error::Error;

/// SHA-256 of a certificate's DER encoding; the identity exchanged in
/// CONTACT_REQUEST/CONTACT payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertHash(pub [u8; 32]);

impl fmt::Display for CertHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for CertHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertHash({})", hex::encode(&self.0[..8]))
    }
}

/// What we remember about a peer after a PRESENTATION exchange: its
/// signature certificate and, optionally, a distinct encryption
/// certificate.
///
/// The encryption certificate is carried and stored but the signature
/// certificate is used for everything on the wire; the split exists so a
/// future suite can separate the roles without a data-model change.
#[derive(Clone)]
pub struct PresentationStore {
    sig_cert: Certificate,
    enc_cert: Option<Certificate>,
}

impl PresentationStore {
    /// Both certificates must name the same subject and issuer.
    pub fn new(sig_cert: Certificate, enc_cert: Option<Certificate>) -> Result<Self, Error> {
        if let Some(enc) = &enc_cert {
            if !sig_cert.same_subject_and_issuer(enc) {
                return Err(Error::InvalidParameter);
            }
        }
        Ok(Self { sig_cert, enc_cert })
    }

    #[inline]
    pub fn signature_certificate(&self) -> &Certificate {
        &self.sig_cert
    }

    /// The encryption certificate, falling back to the signature
    /// certificate when no distinct one was presented.
    #[inline]
    pub fn encryption_certificate(&self) -> &Certificate {
        self.enc_cert.as_ref().unwrap_or(&self.sig_cert)
    }

    #[inline]
    pub fn has_distinct_encryption_certificate(&self) -> bool {
        self.enc_cert.is_some()
    }

    #[inline]
    pub fn cert_hash(&self) -> CertHash {
        CertHash(*self.sig_cert.fingerprint())
    }

    /// True when the stored pair differs from a newly received one.
    pub fn differs_from(&self, sig_cert: &Certificate, enc_cert: Option<&Certificate>) -> bool {
        self.sig_cert != *sig_cert || self.enc_cert.as_ref() != enc_cert
    }
}

impl fmt::Debug for PresentationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PresentationStore({}, {})", self.sig_cert.subject(), self.cert_hash())
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Directional session state.
//!
//! A session is a one-way keyed context: the side that derived it for
//! sending calls it its local session, the other side holds the mirror
//! image as its remote session. Two of them make a bidirectional channel.

use fscp_crypto::cipher::{CipherSuite, SessionCipher, GCM_IV_SIZE, GCM_TAG_SIZE};
use fscp_crypto::ecdhe::EllipticCurve;
use fscp_crypto::kdf::SessionKeyMaterial;
use fscp_crypto::secret::Secret;

use crate::constants::HEADER_SIZE;
use crate::error::Error;
use crate::messages::{self, SecureEnvelopeRef, SecureKind, ENVELOPE_AAD_SIZE};

/// Summary of an established channel, handed to the session-established
/// callback and returned by request_session.
#[derive(Clone, Copy, Debug)]
pub struct SessionInfo {
    pub local_session_number: u32,
    pub remote_session_number: u32,
    pub cipher_suite: CipherSuite,
    pub elliptic_curve: EllipticCurve,
}

pub struct SessionStore {
    session_number: u32,
    /// Outbound: the last sequence number used. Inbound: the highest
    /// sequence number accepted. Both start at zero; the first datagram of
    /// a session carries sequence number 1.
    sequence_number: u32,
    cipher_suite: CipherSuite,
    elliptic_curve: EllipticCurve,
    /// Unused by the GCM suites; carried for the CBC+HMAC construction the
    /// suite table reserves room for.
    #[allow(dead_code)]
    signature_key: Secret<32>,
    base_iv: [u8; GCM_IV_SIZE],
    cipher: SessionCipher,
    created_at: i64,
}

impl SessionStore {
    pub fn new(
        session_number: u32,
        cipher_suite: CipherSuite,
        elliptic_curve: EllipticCurve,
        material: SessionKeyMaterial,
        now: i64,
    ) -> Self {
        let cipher = SessionCipher::new(cipher_suite, &material.encryption_key);
        Self {
            session_number,
            sequence_number: 0,
            cipher_suite,
            elliptic_curve,
            signature_key: material.signature_key,
            base_iv: material.base_iv,
            cipher,
            created_at: now,
        }
    }

    #[inline(always)]
    pub fn session_number(&self) -> u32 {
        self.session_number
    }

    #[inline(always)]
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    #[inline(always)]
    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    #[inline(always)]
    pub fn elliptic_curve(&self) -> EllipticCurve {
        self.elliptic_curve
    }

    #[inline(always)]
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// An outbound session is old once it has aged past the rekey threshold
    /// or burned through the preemptive sequence-number budget.
    pub fn is_old(&self, now: i64, max_age: i64, max_sequence_number: u32) -> bool {
        (now - self.created_at) >= max_age || self.sequence_number >= max_sequence_number
    }

    /// The per-datagram IV: the session base IV with the big-endian
    /// sequence number XORed into its tail.
    fn sequence_iv(&self, sequence_number: u32) -> [u8; GCM_IV_SIZE] {
        let mut iv = self.base_iv;
        let seq = sequence_number.to_be_bytes();
        for i in 0..4 {
            iv[GCM_IV_SIZE - 4 + i] ^= seq[i];
        }
        iv
    }

    /// Encrypt a payload into a complete datagram, consuming the next
    /// sequence number. A (session, sequence) pair is never reused: once
    /// the counter is exhausted this session refuses to send.
    pub fn seal(&mut self, kind: SecureKind, channel: u8, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        if self.sequence_number == u32::MAX {
            return Err(Error::KeyLifetimeExceeded);
        }
        let payload_len = ENVELOPE_AAD_SIZE - HEADER_SIZE + plaintext.len() + GCM_TAG_SIZE;
        if payload_len > crate::constants::MAX_PAYLOAD_SIZE {
            return Err(Error::DataTooLarge);
        }
        let sequence_number = self.sequence_number + 1;

        let mut buf = Vec::with_capacity(ENVELOPE_AAD_SIZE + plaintext.len() + GCM_TAG_SIZE);
        messages::begin_message(&mut buf, kind.message_type());
        buf.extend_from_slice(&self.session_number.to_be_bytes());
        buf.extend_from_slice(&sequence_number.to_be_bytes());
        buf.push(channel);
        buf.extend_from_slice(plaintext);

        // The final length is known up front, so the whole header can be in
        // the AAD.
        buf[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        let mut aad = [0_u8; ENVELOPE_AAD_SIZE];
        aad.copy_from_slice(&buf[..ENVELOPE_AAD_SIZE]);

        let iv = self.sequence_iv(sequence_number);
        let tag = self.cipher.seal_detached(&iv, &aad, &mut buf[ENVELOPE_AAD_SIZE..]);
        buf.extend_from_slice(&tag);

        self.sequence_number = sequence_number;
        Ok(buf)
    }

    /// Authenticate and decrypt an inbound envelope.
    ///
    /// Replays (sequence number at or below the high-water mark) are
    /// reported as such so the caller can drop them without charging the
    /// peer's fault counter. The mark only advances after the tag checks
    /// out, so garbage cannot burn sequence numbers.
    pub fn open(&mut self, envelope: &SecureEnvelopeRef<'_>) -> Result<Vec<u8>, Error> {
        if envelope.session_number != self.session_number {
            return Err(Error::InvalidParameter);
        }
        if envelope.sequence_number <= self.sequence_number {
            return Err(Error::Replayed);
        }

        let iv = self.sequence_iv(envelope.sequence_number);
        let mut plaintext = envelope.ciphertext.to_vec();
        self.cipher
            .open_detached(&iv, envelope.aad, &mut plaintext, envelope.tag)
            .map_err(|_| Error::FailedAuthentication)?;

        self.sequence_number = envelope.sequence_number;
        Ok(plaintext)
    }
}

/// The two directions of a channel with one peer. Stores are replaced
/// wholesale on rekey, never mutated in place.
#[derive(Default)]
pub struct SessionPair {
    pub local: Option<SessionStore>,
    pub remote: Option<SessionStore>,
}

impl SessionPair {
    pub fn has_local_session(&self) -> bool {
        self.local.is_some()
    }

    pub fn has_remote_session(&self) -> bool {
        self.remote.is_some()
    }

    /// Install a freshly negotiated pair, returning the previous remote
    /// session so the caller can keep it through the reordering grace
    /// window.
    pub fn install(&mut self, local: SessionStore, remote: SessionStore) -> Option<SessionStore> {
        self.local = Some(local);
        let previous_remote = self.remote.replace(remote);
        previous_remote
    }

    pub fn clear(&mut self) {
        self.local = None;
        self.remote = None;
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use crate::secret::Secret;

pub const SESSION_KEY_SIZE: usize = 32;
pub const SESSION_IV_SIZE: usize = 16;

/// Total HKDF-Expand output per direction: signature key, encryption key,
/// base IV, plus a reserved tail that is derived and discarded.
const SESSION_SCHEDULE_SIZE: usize = 96;

/// Keys and IV for one direction of a session.
pub struct SessionKeyMaterial {
    pub signature_key: Secret<SESSION_KEY_SIZE>,
    pub encryption_key: Secret<SESSION_KEY_SIZE>,
    pub base_iv: [u8; SESSION_IV_SIZE],
}

/// Derive the key schedule for the direction identified by
/// (sender session number, receiver session number).
///
/// Both ends of a channel run this twice, once per direction, swapping the
/// session-number order. The pre-shared key, when configured, is appended to
/// the input keying material so that key agreement also binds knowledge of
/// the passphrase.
pub fn derive_session_keys(
    shared_secret: &[u8],
    psk: Option<&Secret<32>>,
    sender_session_number: u32,
    receiver_session_number: u32,
) -> SessionKeyMaterial {
    let mut salt = [0_u8; 8];
    salt[..4].copy_from_slice(&sender_session_number.to_be_bytes());
    salt[4..].copy_from_slice(&receiver_session_number.to_be_bytes());

    let hk = if let Some(psk) = psk {
        let mut ikm = Vec::with_capacity(shared_secret.len() + 32);
        ikm.extend_from_slice(shared_secret);
        ikm.extend_from_slice(psk.as_bytes());
        Hkdf::<Sha256>::new(Some(&salt), &ikm)
    } else {
        Hkdf::<Sha256>::new(Some(&salt), shared_secret)
    };

    let mut okm = [0_u8; SESSION_SCHEDULE_SIZE];
    hk.expand(&salt, &mut okm).expect("96 bytes is a valid HKDF-SHA256 output length");

    let mut material = SessionKeyMaterial {
        signature_key: Secret::from_bytes(&okm[..32]).unwrap(),
        encryption_key: Secret::from_bytes(&okm[32..64]).unwrap(),
        base_iv: [0_u8; SESSION_IV_SIZE],
    };
    material.base_iv.copy_from_slice(&okm[64..80]);
    material
}

/// Derive a 32-byte pre-shared key from a passphrase with
/// PBKDF2-HMAC-SHA256.
pub fn derive_psk(passphrase: &[u8], salt: &[u8], iterations: u32) -> Secret<32> {
    let mut out = [0_u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase, salt, iterations, &mut out);
    Secret(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_differ() {
        let shared = [7_u8; 48];
        let ab = derive_session_keys(&shared, None, 1, 9);
        let ba = derive_session_keys(&shared, None, 9, 1);
        assert_ne!(ab.encryption_key, ba.encryption_key);
        assert_ne!(ab.signature_key, ba.signature_key);
        assert_ne!(ab.base_iv, ba.base_iv);
    }

    #[test]
    fn both_sides_agree_per_direction() {
        let shared = [3_u8; 48];
        let at_sender = derive_session_keys(&shared, None, 4, 2);
        let at_receiver = derive_session_keys(&shared, None, 4, 2);
        assert_eq!(at_sender.encryption_key, at_receiver.encryption_key);
        assert_eq!(at_sender.base_iv, at_receiver.base_iv);
    }

    #[test]
    fn psk_changes_schedule() {
        let shared = [3_u8; 48];
        let without = derive_session_keys(&shared, None, 1, 2);
        let with = derive_session_keys(&shared, Some(&Secret([9_u8; 32])), 1, 2);
        assert_ne!(without.encryption_key, with.encryption_key);
    }

    #[test]
    fn psk_is_deterministic() {
        let a = derive_psk(b"correct horse", b"freelan", 2000);
        let b = derive_psk(b"correct horse", b"freelan", 2000);
        let c = derive_psk(b"correct horse", b"freelan", 2001);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}

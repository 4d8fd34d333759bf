/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use fscp_crypto::cipher::CipherSuite;
use fscp_crypto::ecdhe::EllipticCurve;

/// Wire protocol version carried in every datagram header.
pub const PROTOCOL_VERSION: u8 = 3;

/// Default FSCP UDP port.
pub const DEFAULT_PORT: u16 = 12000;

/// Fixed datagram header: version, message type, big-endian payload length.
pub const HEADER_SIZE: usize = 4;

/// Payload length is a u16, which bounds every message body.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Capability lists advertised in SESSION_REQUEST are preference-ordered;
/// the first common entry wins.
pub const DEFAULT_CIPHER_SUITES: [CipherSuite; 2] =
    [CipherSuite::EcdheRsaAes256GcmSha384, CipherSuite::EcdheEcdsaAes256GcmSha384];

pub const DEFAULT_ELLIPTIC_CURVES: [EllipticCurve; 3] =
    [EllipticCurve::Secp256r1, EllipticCurve::Secp384r1, EllipticCurve::Secp521r1];

/// HELLO correlation deadline.
pub const DEFAULT_HELLO_TIMEOUT_MS: i64 = 3_000;

/// How long a SESSION_REQUEST may remain unanswered before its waiters see
/// a timeout.
pub const DEFAULT_SESSION_REQUEST_TIMEOUT_MS: i64 = 5_000;

/// A peer with no inbound traffic for this long is expired. Keep-alives go
/// out every third of it.
pub const DEFAULT_INACTIVITY_TIMEOUT_MS: i64 = 30_000;

/// Wall-clock age after which an outbound session is considered old and a
/// rekey is attempted.
pub const DEFAULT_MAX_SESSION_AGE_MS: i64 = 60_000;

/// Preemptive rekey threshold on the outbound sequence number, far below
/// the u32 wrap.
pub const DEFAULT_MAX_SEQUENCE_NUMBER: u32 = 1 << 31;

/// Consecutive authentication failures from a peer before its sessions are
/// torn down and a fresh handshake is forced.
pub const DEFAULT_MAX_AUTH_FAILURES: u32 = 4;

/// Token-bucket rate for unauthenticated messages per source endpoint.
pub const DEFAULT_MAX_UNAUTHENTICATED_MESSAGES_PER_SECOND: u32 = 1;

/// Idle rate-limiter buckets are garbage-collected after this long.
pub const RATE_LIMITER_GC_MS: i64 = 60_000;

/// Minimum spacing between rekey attempts toward the same peer.
pub const REKEY_ATTEMPT_INTERVAL_MS: i64 = 2_000;

/// Granularity of the background service pass (keep-alive, expiry, GC).
/// Exact deadlines (HELLO, session requests) are tracked separately.
pub const SERVICE_INTERVAL_MS: i64 = 250;

/// KEEP_ALIVE plaintext is random padding of this size so keep-alives do not
/// stand out by length.
pub const KEEP_ALIVE_PADDING_SIZE: usize = 16;

/// Memory pool defaults for datagram buffers.
pub const DEFAULT_POOL_BLOCK_SIZE: usize = 65_536;
pub const DEFAULT_POOL_BLOCK_COUNT: usize = 32;

/// PBKDF2 parameters for passphrase-derived pre-shared keys.
pub const DEFAULT_PSK_SALT: &[u8] = b"freelan";
pub const DEFAULT_PSK_ITERATIONS: u32 = 2_000;

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use fscp_crypto::CryptoError;

pub enum Error {
    /// Datagram was not well formed (short header, bad length, unknown type).
    InvalidPacket,

    /// Datagram carried a protocol version other than 3.
    UnknownProtocolVersion,

    /// An invalid parameter was supplied to the function.
    InvalidParameter,

    /// A signature, MAC, or AEAD check failed.
    FailedAuthentication,

    /// Message ignored by the unauthenticated-traffic rate limiter.
    RateLimited,

    /// Sequence number at or below the session's high-water mark; the
    /// datagram is a replay or arrived too late and is dropped without
    /// penalizing the peer.
    Replayed,

    /// The peer and we share no cipher suite or no elliptic curve.
    NegotiationFailed,

    /// Attempt to send on a channel without an established session.
    SessionNotEstablished,

    /// Outbound sequence numbers for the current session are exhausted and
    /// rekeying has not yet replaced it.
    KeyLifetimeExceeded,

    /// The local identity lacks what the operation needs (e.g. introducing
    /// without certificates, or no certificate/PSK at all).
    IdentityRequired,

    /// The peer has no acceptable presentation record.
    PresentationRequired,

    /// Data object is too large for a single datagram.
    DataTooLarge,

    /// A deadline elapsed before the peer answered.
    Timeout,

    /// The operation was cancelled (e.g. cancel_all_greetings).
    Cancelled,

    /// The server is closed; no further operations are possible.
    Closed,

    /// An I/O error from the socket layer that cannot be retried silently.
    Io(std::io::Error),
}

impl From<std::io::Error> for Error {
    #[cold]
    #[inline(never)]
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CryptoError> for Error {
    #[cold]
    #[inline(never)]
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidEncoding | CryptoError::UnsupportedAlgorithm => Self::InvalidPacket,
            CryptoError::InvalidKey => Self::InvalidParameter,
            CryptoError::VerificationFailed | CryptoError::DecryptionFailed | CryptoError::InvalidPublicKey => {
                Self::FailedAuthentication
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPacket => f.write_str("InvalidPacket"),
            Self::UnknownProtocolVersion => f.write_str("UnknownProtocolVersion"),
            Self::InvalidParameter => f.write_str("InvalidParameter"),
            Self::FailedAuthentication => f.write_str("FailedAuthentication"),
            Self::RateLimited => f.write_str("RateLimited"),
            Self::Replayed => f.write_str("Replayed"),
            Self::NegotiationFailed => f.write_str("NegotiationFailed"),
            Self::SessionNotEstablished => f.write_str("SessionNotEstablished"),
            Self::KeyLifetimeExceeded => f.write_str("KeyLifetimeExceeded"),
            Self::IdentityRequired => f.write_str("IdentityRequired"),
            Self::PresentationRequired => f.write_str("PresentationRequired"),
            Self::DataTooLarge => f.write_str("DataTooLarge"),
            Self::Timeout => f.write_str("Timeout"),
            Self::Cancelled => f.write_str("Cancelled"),
            Self::Closed => f.write_str("Closed"),
            Self::Io(e) => write!(f, "Io({})", e),
        }
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::error::Error for Error {}

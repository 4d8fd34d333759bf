/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use serde::{Deserialize, Serialize};

use fscp_crypto::cipher::CipherSuite;
use fscp_crypto::ecdhe::EllipticCurve;

use crate::constants::*;
use crate::endpoint::IpNet;

/// Tunable behavior of a server. This is plain data: whatever configuration
/// system the application uses can deserialize one and hand it to
/// Server::open.
#[derive(Serialize, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    /// HELLO correlation deadline in milliseconds.
    pub hello_timeout: i64,

    /// How long a session negotiation may stay unanswered, in milliseconds.
    pub session_request_timeout: i64,

    /// A peer with no inbound traffic for this long (milliseconds) is
    /// expired; keep-alives are emitted every third of it.
    pub inactivity_timeout: i64,

    /// Outbound session age (milliseconds) that triggers a rekey.
    pub max_session_age: i64,

    /// Outbound sequence number that triggers a preemptive rekey.
    pub max_sequence_number: u32,

    /// Consecutive authentication failures before the channel is torn down
    /// and renegotiated.
    pub max_auth_failures: u32,

    /// Default acceptance for inbound HELLO when no callback is installed
    /// (the callback also receives this as its default argument).
    pub accept_hello_messages_default: bool,

    /// Default acceptance for inbound SESSION_REQUEST.
    pub accept_session_request_messages_default: bool,

    /// Whether to serve CONTACT_REQUEST messages.
    pub accept_contact_requests: bool,

    /// Whether to act on inbound CONTACT messages.
    pub accept_contacts: bool,

    /// Send our PRESENTATION automatically when a greeted peer answers, and
    /// reply in kind to a new presentation.
    pub auto_introduce: bool,

    /// Preference-ordered cipher-suite capability list.
    pub cipher_suite_capabilities: Vec<CipherSuite>,

    /// Preference-ordered elliptic-curve capability list.
    pub elliptic_curve_capabilities: Vec<EllipticCurve>,

    /// Token-bucket rate for unauthenticated messages per source.
    pub max_unauthenticated_messages_per_second: u32,

    /// CIDR blocks never contacted on CONTACT hints.
    pub never_contact: Vec<IpNet>,

    /// Datagram buffer pool geometry.
    pub pool_block_size: usize,
    pub pool_block_count: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            hello_timeout: DEFAULT_HELLO_TIMEOUT_MS,
            session_request_timeout: DEFAULT_SESSION_REQUEST_TIMEOUT_MS,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT_MS,
            max_session_age: DEFAULT_MAX_SESSION_AGE_MS,
            max_sequence_number: DEFAULT_MAX_SEQUENCE_NUMBER,
            max_auth_failures: DEFAULT_MAX_AUTH_FAILURES,
            accept_hello_messages_default: true,
            accept_session_request_messages_default: true,
            accept_contact_requests: true,
            accept_contacts: true,
            auto_introduce: true,
            cipher_suite_capabilities: DEFAULT_CIPHER_SUITES.to_vec(),
            elliptic_curve_capabilities: DEFAULT_ELLIPTIC_CURVES.to_vec(),
            max_unauthenticated_messages_per_second: DEFAULT_MAX_UNAUTHENTICATED_MESSAGES_PER_SECOND,
            never_contact: Vec::new(),
            pool_block_size: DEFAULT_POOL_BLOCK_SIZE,
            pool_block_count: DEFAULT_POOL_BLOCK_COUNT,
        }
    }
}

impl ServerSettings {
    /// Keep-alive cadence: a third of the inactivity timeout.
    pub fn keep_alive_period(&self) -> i64 {
        (self.inactivity_timeout / 3).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let s = ServerSettings::default();
        assert_eq!(s.hello_timeout, 3_000);
        assert_eq!(s.max_unauthenticated_messages_per_second, 1);
        assert_eq!(s.cipher_suite_capabilities.len(), 2);
        assert_eq!(s.elliptic_curve_capabilities.len(), 3);
        assert_eq!(s.keep_alive_period(), 10_000);
    }
}

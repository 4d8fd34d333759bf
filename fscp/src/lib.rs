/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! FreeLAN Secure Channel Protocol.
//!
//! FSCP establishes authenticated, encrypted channels between peers over
//! UDP: a HELLO liveness probe, a PRESENTATION certificate exchange, a
//! signed SESSION_REQUEST/SESSION ECDHE key agreement, and an
//! AEAD-protected envelope for DATA, KEEP_ALIVE and the CONTACT discovery
//! messages, with strict-monotonic replay defense and in-place rekeying.
//!
//! The entry point is [Server]: open it on a socket address with an
//! [IdentityStore], [ServerSettings], and a set of [Handlers], then drive
//! peers with `greet`, `introduce_to`, `request_session` and `send_data`.

pub mod constants;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod messages;
pub mod peer;
pub mod presentation;
pub mod rate_limit;
pub mod server;
pub mod session;
pub mod settings;

pub use endpoint::{Endpoint, IpNet};
pub use error::Error;
pub use identity::IdentityStore;
pub use presentation::{CertHash, PresentationStore};
pub use server::{Handlers, Server, SessionLossReason};
pub use session::SessionInfo;
pub use settings::ServerSettings;

pub use fscp_crypto::cipher::CipherSuite;
pub use fscp_crypto::ecdhe::EllipticCurve;
pub use fscp_crypto::x509::Certificate;

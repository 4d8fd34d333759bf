/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Shared fixtures for the integration tests: throwaway identities, servers
//! wired to event channels, and a recording UDP proxy for adversarial
//! scenarios.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use p256::ecdsa::signature::Signer;
use p256::pkcs8::EncodePrivateKey;
use rand::rngs::OsRng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use fscp::server::Handlers;
use fscp::{Certificate, Endpoint, IdentityStore, Server, ServerSettings, SessionInfo, SessionLossReason};

// ---- minimal DER certificate builder ----
//
// Just enough X.509 to exercise the real certificate paths: a v3
// self-signed certificate over a fresh P-256 key, signed ecdsa-with-SHA256.

const OID_ECDSA_WITH_SHA256: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x04, 0x03, 0x02];
const OID_EC_PUBLIC_KEY: &[u8] = &[0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
const OID_PRIME256V1: &[u8] = &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
const OID_COMMON_NAME: &[u8] = &[0x06, 0x03, 0x55, 0x04, 0x03];

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
    }
    out.extend_from_slice(content);
    out
}

fn name(cn: &str) -> Vec<u8> {
    let mut attr = OID_COMMON_NAME.to_vec();
    attr.extend_from_slice(&tlv(0x0c, cn.as_bytes()));
    tlv(0x30, &tlv(0x31, &tlv(0x30, &attr)))
}

fn utc_time(s: &str) -> Vec<u8> {
    tlv(0x17, s.as_bytes())
}

/// Generate a fresh P-256 key and a self-signed certificate for it.
/// Returns (certificate DER, private key PKCS#8 DER).
pub fn self_signed_certificate(cn: &str) -> (Vec<u8>, Vec<u8>) {
    let signing_key = p256::ecdsa::SigningKey::random(&mut OsRng);
    let key_pkcs8 = signing_key.to_pkcs8_der().unwrap().as_bytes().to_vec();
    let point = signing_key.verifying_key().to_encoded_point(false);

    let version = tlv(0xa0, &tlv(0x02, &[0x02]));
    let serial = tlv(0x02, &[0x01]);
    let signature_algorithm = tlv(0x30, OID_ECDSA_WITH_SHA256);
    let subject = name(cn);
    let mut validity = utc_time("250101000000Z");
    validity.extend_from_slice(&utc_time("491231235959Z"));
    let validity = tlv(0x30, &validity);

    let mut spki_algorithm = OID_EC_PUBLIC_KEY.to_vec();
    spki_algorithm.extend_from_slice(OID_PRIME256V1);
    let mut bit_string = vec![0x00];
    bit_string.extend_from_slice(point.as_bytes());
    let mut spki = tlv(0x30, &spki_algorithm);
    spki.extend_from_slice(&tlv(0x03, &bit_string));
    let spki = tlv(0x30, &spki);

    let mut tbs = Vec::new();
    tbs.extend_from_slice(&version);
    tbs.extend_from_slice(&serial);
    tbs.extend_from_slice(&signature_algorithm);
    tbs.extend_from_slice(&subject); // issuer == subject: self-signed
    tbs.extend_from_slice(&validity);
    tbs.extend_from_slice(&subject);
    tbs.extend_from_slice(&spki);
    let tbs = tlv(0x30, &tbs);

    let signature: p256::ecdsa::Signature = signing_key.sign(&tbs);
    let mut signature_bits = vec![0x00];
    signature_bits.extend_from_slice(signature.to_der().as_bytes());

    let mut cert = tbs;
    cert.extend_from_slice(&signature_algorithm);
    cert.extend_from_slice(&tlv(0x03, &signature_bits));
    (tlv(0x30, &cert), key_pkcs8)
}

/// A certificate identity plus the public certificate to seed peers with.
pub fn cert_identity(cn: &str) -> (IdentityStore, Certificate) {
    let (der, key_pkcs8) = self_signed_certificate(cn);
    let cert = Certificate::from_der(der).unwrap();
    let identity = IdentityStore::from_certificates(cert.clone(), &key_pkcs8, None).unwrap();
    (identity, cert)
}

// ---- servers wired to event channels ----

pub struct Events {
    pub established: mpsc::UnboundedReceiver<(Endpoint, SessionInfo)>,
    pub lost: mpsc::UnboundedReceiver<(Endpoint, SessionLossReason)>,
    pub data: mpsc::UnboundedReceiver<(Endpoint, u8, Vec<u8>)>,
    pub presentations: mpsc::UnboundedReceiver<(Endpoint, bool)>,
}

pub fn wired_handlers() -> (Handlers, Events) {
    let (established_tx, established) = mpsc::unbounded_channel();
    let (lost_tx, lost) = mpsc::unbounded_channel();
    let (data_tx, data) = mpsc::unbounded_channel();
    let (presentation_tx, presentations) = mpsc::unbounded_channel();

    let mut handlers = Handlers::default();
    handlers.session_established = Some(Box::new(move |ep, info: &SessionInfo| {
        let _ = established_tx.send((ep, *info));
    }));
    handlers.session_lost = Some(Box::new(move |ep, reason| {
        let _ = lost_tx.send((ep, reason));
    }));
    handlers.data_received = Some(Box::new(move |ep, channel, payload: &[u8]| {
        let _ = data_tx.send((ep, channel, payload.to_vec()));
    }));
    handlers.presentation_received = Some(Box::new(move |ep, _sig: &Certificate, _enc: Option<&Certificate>, is_new| {
        let _ = presentation_tx.send((ep, is_new));
        true
    }));
    (handlers, Events { established, lost, data, presentations })
}

pub async fn start_node(identity: IdentityStore, settings: ServerSettings) -> (Server, SocketAddr, Events) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (handlers, events) = wired_handlers();
    let server = Server::open("127.0.0.1:0".parse().unwrap(), identity, settings, handlers)
        .await
        .expect("server open");
    let addr = server.local_addr();
    (server, addr, events)
}

// ---- a recording, optionally tampering UDP proxy ----
//
// Both nodes address the proxy instead of each other, so it can observe,
// capture and re-inject datagrams like an on-path adversary would.

pub struct Proxy {
    pub addr: SocketAddr,
    socket: Arc<UdpSocket>,
    b_addr: SocketAddr,
    captured: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Proxy {
    /// Start a proxy in front of `b_addr`. Datagrams of type
    /// `capture_type` flowing toward B are recorded; the first datagram of
    /// type `tamper_type` toward B gets its last byte flipped.
    pub async fn start(b_addr: SocketAddr, capture_type: Option<u8>, tamper_type: Option<u8>) -> Proxy {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let captured = Arc::new(Mutex::new(Vec::new()));

        let task_socket = socket.clone();
        let task_captured = captured.clone();
        tokio::spawn(async move {
            let mut a_addr: Option<SocketAddr> = None;
            let mut tampered = false;
            let mut buf = vec![0_u8; 65_536];
            loop {
                let (len, src) = match task_socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(_) => break,
                };
                let mut data = buf[..len].to_vec();
                if src == b_addr {
                    if let Some(a) = a_addr {
                        let _ = task_socket.send_to(&data, a).await;
                    }
                } else {
                    a_addr = Some(src);
                    if data.len() > 1 {
                        if capture_type == Some(data[1]) {
                            task_captured.lock().unwrap().push(data.clone());
                        }
                        if !tampered && tamper_type == Some(data[1]) {
                            let n = data.len() - 1;
                            data[n] ^= 0x01;
                            tampered = true;
                        }
                    }
                    let _ = task_socket.send_to(&data, b_addr).await;
                }
            }
        });

        Proxy { addr, socket, b_addr, captured }
    }

    pub fn captured_count(&self) -> usize {
        self.captured.lock().unwrap().len()
    }

    /// Re-inject a captured datagram toward B, from the address B believes
    /// is the original sender.
    pub async fn replay_to_b(&self, index: usize) {
        let datagram = self.captured.lock().unwrap().get(index).cloned().expect("captured datagram");
        let _ = self.socket.send_to(&datagram, self.b_addr).await;
    }
}

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

mod common;

use std::time::Duration;

use tokio::time::timeout;

use fscp::{IdentityStore, ServerSettings, SessionLossReason};

use common::{cert_identity, start_node};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn age_based_rekey_keeps_data_flowing() {
    let (id_a, cert_a) = cert_identity("rekey-a");
    let (id_b, cert_b) = cert_identity("rekey-b");

    let mut settings_a = ServerSettings::default();
    settings_a.max_session_age = 500;
    let (a, a_addr, mut ea) = start_node(id_a, settings_a).await;
    let (b, b_addr, mut eb) = start_node(id_b, ServerSettings::default()).await;
    a.set_presentation(b_addr, cert_b, None).await.unwrap();
    b.set_presentation(a_addr, cert_a, None).await.unwrap();

    let first = a.request_session(b_addr).await.expect("initial session");
    let (_, info_a1) = timeout(WAIT, ea.established.recv()).await.unwrap().unwrap();
    let (_, _info_b1) = timeout(WAIT, eb.established.recv()).await.unwrap().unwrap();
    assert_eq!(info_a1.local_session_number, first.local_session_number);

    // Send across the rekey threshold; every payload must arrive.
    let mut sent = 0_u32;
    for i in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        a.send_data(b_addr, 0, format!("frame-{}", i).into_bytes()).await.unwrap();
        sent += 1;
    }

    // The aged session was replaced underneath the traffic.
    let (_, info_a2) = timeout(WAIT, ea.established.recv()).await.unwrap().unwrap();
    let (_, info_b2) = timeout(WAIT, eb.established.recv()).await.unwrap().unwrap();
    assert!(info_a2.local_session_number > info_a1.local_session_number);
    assert!(info_b2.remote_session_number > first.local_session_number);

    let mut received = 0_u32;
    while received < sent {
        let (_, _, payload) = timeout(WAIT, eb.data.recv()).await.unwrap().unwrap();
        assert!(payload.starts_with(b"frame-"));
        received += 1;
    }
    assert_eq!(received, sent);
}

#[tokio::test]
async fn inactivity_expires_the_peer_and_reports_loss() {
    let mut settings_a = ServerSettings::default();
    settings_a.inactivity_timeout = 1_200;
    let (a, _, mut ea) = start_node(IdentityStore::from_passphrase(b"expiry secret"), settings_a).await;
    let (b, b_addr, _eb) = start_node(IdentityStore::from_passphrase(b"expiry secret"), ServerSettings::default()).await;

    a.request_session(b_addr).await.expect("session");
    let _ = timeout(WAIT, ea.established.recv()).await.unwrap().unwrap();

    // Take B off the air; A's keep-alives go unanswered until the
    // inactivity timeout removes the peer.
    b.close().await;

    let (ep, reason) = timeout(WAIT, ea.lost.recv()).await.unwrap().unwrap();
    assert_eq!(ep.socket_addr(), b_addr);
    assert_eq!(reason, SessionLossReason::InactivityTimeout);
}

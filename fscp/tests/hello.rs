/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use fscp::{Error, IdentityStore, ServerSettings};

use common::start_node;

fn psk() -> IdentityStore {
    IdentityStore::from_passphrase(b"hello test passphrase")
}

#[tokio::test]
async fn greet_measures_round_trip() {
    let (a, _, _ea) = start_node(psk(), ServerSettings::default()).await;
    let (_b, b_addr, _eb) = start_node(psk(), ServerSettings::default()).await;

    let rtt = a.greet(b_addr, Duration::from_secs(1)).await.expect("greet");
    assert!(rtt < Duration::from_secs(1));
}

#[tokio::test]
async fn greet_against_dark_endpoint_times_out() {
    let (a, _, _ea) = start_node(psk(), ServerSettings::default()).await;

    // Bind and immediately drop a socket to get a port nobody listens on.
    let dark = {
        let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        s.local_addr().unwrap()
    };

    let started = Instant::now();
    let result = a.greet(dark, Duration::from_millis(150)).await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn refused_hello_is_never_answered() {
    let (a, _, _ea) = start_node(psk(), ServerSettings::default()).await;
    let mut settings = ServerSettings::default();
    settings.accept_hello_messages_default = false;
    let (_b, b_addr, _eb) = start_node(psk(), settings).await;

    let result = a.greet(b_addr, Duration::from_millis(200)).await;
    assert!(matches!(result, Err(Error::Timeout)));
}

#[tokio::test]
async fn hello_accept_default_can_be_flipped_at_runtime() {
    let (a, _, _ea) = start_node(psk(), ServerSettings::default()).await;
    let (b, b_addr, _eb) = start_node(psk(), ServerSettings::default()).await;

    b.set_accept_hello_messages_default(false).await.unwrap();
    assert!(matches!(a.greet(b_addr, Duration::from_millis(200)).await, Err(Error::Timeout)));

    b.set_accept_hello_messages_default(true).await.unwrap();
    assert!(a.greet(b_addr, Duration::from_secs(1)).await.is_ok());
}

#[tokio::test]
async fn cancel_all_greetings_aborts_pending() {
    let (a, _, _ea) = start_node(psk(), ServerSettings::default()).await;
    let a = Arc::new(a);

    let dark = {
        let s = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        s.local_addr().unwrap()
    };

    let a2 = a.clone();
    let pending = tokio::spawn(async move { a2.greet(dark, Duration::from_secs(30)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.cancel_all_greetings().await.unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
}

#[tokio::test]
async fn operations_fail_after_close() {
    let (a, _, _ea) = start_node(psk(), ServerSettings::default()).await;
    let (b, b_addr, _eb) = start_node(psk(), ServerSettings::default()).await;
    let _ = b;

    a.close().await;
    assert!(matches!(a.greet(b_addr, Duration::from_secs(1)).await, Err(Error::Closed)));
    assert!(matches!(a.send_data(b_addr, 0, b"x".to_vec()).await, Err(Error::Closed)));
}

//! Recovery behavior: transport loss, backoff bounds, store recovery.

mod common;

use common::*;
use tern::{CallEndReason, ClientEvent, RegistrationState};
use sip_msg::Method;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn transport_drop_mid_call_recovers_registration() {
    let (mut bed, mut conn) = registered_testbed().await;
    let _invite = connect_outgoing_call(&mut bed, &mut conn).await;

    let dropped_at = Instant::now();
    conn.close("connection reset").await;

    // the call dies with a network error and the binding is gone
    let mut saw_call_end = false;
    let mut saw_state_none = false;

    while !(saw_call_end && saw_state_none) {
        match next_event(&mut bed.events).await {
            ClientEvent::CallEnded { reason, .. } => {
                assert_eq!(reason, CallEndReason::NetworkError);
                saw_call_end = true;
            }
            ClientEvent::RegistrationStateChanged { state, .. } => {
                if state == RegistrationState::None {
                    saw_state_none = true;
                }
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    // the controller re-opens a transport and re-registers, but only
    // after the stability delay
    let mut new_conn = bed.net.accept().await;

    assert!(
        Instant::now() - dropped_at >= Duration::from_secs(3),
        "reconnected before the stability delay"
    );

    let register = new_conn.recv().await;
    assert_eq!(register.line.request_method(), Some(&Method::REGISTER));

    new_conn.send(register_ok(&register, 3600)).await;

    let state = bed.client.wait_for_registration(&bed.key).await.unwrap();
    assert!(state.is_registered());
}

#[tokio::test(start_paused = true)]
async fn backoff_bounds_and_give_up() {
    let (mut bed, conn) = registered_testbed().await;

    // every future connect fails
    bed.net
        .connector
        .fail_connects
        .store(u32::MAX, Ordering::SeqCst);
    bed.net.connector.connect_times.lock().clear();

    conn.close("gone").await;

    // five attempts, then the account is parked as failed
    let mut failures = 0;
    while failures < 5 {
        if let ClientEvent::RegistrationStateChanged {
            state: RegistrationState::Failed { .. },
            ..
        } = next_event(&mut bed.events).await
        {
            failures += 1;
        }
    }

    let times = bed.net.connector.connect_times.lock().clone();
    assert_eq!(times.len(), 5);

    // delay between attempt n and n+1 is in
    // [2 * 2^(n-1), 2 * 2^(n-1) + 2] seconds, capped at 30
    for n in 1..=4u32 {
        let delay = times[n as usize] - times[n as usize - 1];

        let lower = Duration::from_secs(2 * 2u64.pow(n - 1)).min(Duration::from_secs(30));
        let upper =
            Duration::from_secs(2 * 2u64.pow(n - 1) + 2).min(Duration::from_secs(30));

        assert!(
            delay >= lower && delay <= upper,
            "attempt {n}: delay {delay:?} outside [{lower:?}, {upper:?}]"
        );
    }

    // no further attempts without an external trigger
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(bed.net.connector.connect_times.lock().len(), 5);

    // a forced reconnect is such a trigger
    bed.net.connector.fail_connects.store(0, Ordering::SeqCst);
    bed.client.force_reconnect();

    let mut new_conn = bed.net.accept().await;
    let register = new_conn.recv().await;
    new_conn.send(register_ok(&register, 3600)).await;

    let state = bed.client.wait_for_registration(&bed.key).await.unwrap();
    assert!(state.is_registered());
}

#[tokio::test(start_paused = true)]
async fn network_loss_and_restore() {
    let (mut bed, _conn) = registered_testbed().await;

    bed.client.set_network_available(false);

    loop {
        if let ClientEvent::RegistrationStateChanged { state, .. } =
            next_event(&mut bed.events).await
        {
            if state == RegistrationState::None {
                break;
            }
        }
    }

    let restored_at = Instant::now();
    bed.client.set_network_available(true);

    let mut new_conn = bed.net.accept().await;
    assert!(Instant::now() - restored_at >= Duration::from_secs(3));

    let register = new_conn.recv().await;
    new_conn.send(register_ok(&register, 3600)).await;

    let state = bed.client.wait_for_registration(&bed.key).await.unwrap();
    assert!(state.is_registered());
}

#[tokio::test(start_paused = true)]
async fn accounts_recover_from_store_after_restart() {
    let mut net = MockNetHandle::new();
    let media = Arc::new(MockMedia::default());
    let store = Arc::new(MockStore::default());

    store.accounts.lock().push(alice());

    // fresh process: no accounts in memory, only in the store
    let (client, mut events) = tern::Client::builder()
        .connector(net.connector.clone())
        .media(media)
        .store(store)
        .build();

    client.set_network_available(false);
    client.set_network_available(true);

    let mut conn = net.accept().await;
    let register = conn.recv().await;
    assert_eq!(register.line.request_method(), Some(&Method::REGISTER));

    conn.send(register_ok(&register, 3600)).await;

    loop {
        if let ClientEvent::RegistrationStateChanged { account, state } =
            next_event(&mut events).await
        {
            if state.is_registered() {
                assert_eq!(account.as_str(), "alice@example.com");
                break;
            }
        }
    }
}

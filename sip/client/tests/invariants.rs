//! Cross-cutting protocol invariants.

mod common;

use common::*;
use tern::ClientEvent;
use sip_msg::header::typed::CSeq;
use sip_msg::{Method, MessageLine, Name};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn refresh_fires_inside_the_margin_window() {
    let mut net = MockNetHandle::new();
    let media = std::sync::Arc::new(MockMedia::default());

    let (client, _events) = tern::Client::builder()
        .connector(net.connector.clone())
        .media(media)
        .build();

    let _key = client.register(alice()).unwrap();

    let mut conn = net.accept().await;
    let register = conn.recv().await;

    // grant 100s: margin = min(60, 10) = 10, refresh due at 90s
    let granted_at = Instant::now();
    conn.send(register_ok(&register, 100)).await;

    let refresh = conn.recv().await;
    assert_eq!(refresh.line.request_method(), Some(&Method::REGISTER));

    let elapsed = Instant::now() - granted_at;
    assert!(
        elapsed >= Duration::from_secs(40) && elapsed < Duration::from_secs(100),
        "refresh after {elapsed:?}, expected inside the expiry minus margin window"
    );
    // with a 100s grant specifically, the margin is 10s
    assert!(
        elapsed >= Duration::from_secs(89) && elapsed <= Duration::from_secs(91),
        "refresh after {elapsed:?}, expected at ~90s"
    );

    // CSeq keeps increasing on the shared sequence
    let first: CSeq = register.headers.get_named().unwrap();
    let second: CSeq = refresh.headers.get_named().unwrap();
    assert_eq!(second.cseq, first.cseq + 1);

    // only ever one REGISTER in flight: nothing else was sent meanwhile
    conn.send(register_ok(&refresh, 100)).await;
}

#[tokio::test(start_paused = true)]
async fn second_invite_is_answered_busy() {
    let (mut bed, mut conn) = registered_testbed().await;

    conn.send(incoming_invite("bob", "alice", "example.com", "first-call"))
        .await;

    let _trying = conn.recv().await;
    assert!(matches!(
        next_call_event(&mut bed.events).await,
        ClientEvent::IncomingCall(_)
    ));
    let _ringing = conn.recv().await;

    // a second INVITE while the first is still ringing
    conn.send(incoming_invite("carol", "alice", "example.com", "second-call"))
        .await;

    let busy = conn.recv().await;
    let MessageLine::Status(line) = &busy.line else {
        panic!("expected a response to the second INVITE");
    };
    assert_eq!(line.code.into_u16(), 486);
    assert_eq!(
        busy.headers.get(&Name::CALL_ID).map(|v| v.as_ref()),
        Some("second-call")
    );

    // the busy response is a final response and carries a to-tag
    assert!(busy.headers.get(&Name::TO).unwrap().contains(";tag="));

    // the first call is unaffected
    assert!(bed.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn duplicate_2xx_is_reacknowledged_without_media() {
    let (mut bed, mut conn) = registered_testbed().await;
    let invite = connect_outgoing_call(&mut bed, &mut conn).await;

    assert_eq!(bed.media.call_count("apply_answer"), 1);

    // the server retransmits the 200
    conn.send(response_for(
        &invite,
        200,
        "OK",
        Some("bob-tag"),
        &[
            ("Contact", "<sip:bob@proxy.example.com>".to_string()),
            ("Content-Type", "application/sdp".to_string()),
        ],
        SDP_ANSWER,
    ))
    .await;

    let ack = conn.recv().await;
    assert_eq!(ack.line.request_method(), Some(&Method::ACK));

    // media engine was not consulted again
    assert_eq!(bed.media.call_count("apply_answer"), 1);
}

#[tokio::test(start_paused = true)]
async fn dtmf_digits_are_paced() {
    let (mut bed, mut conn) = registered_testbed().await;
    let _invite = connect_outgoing_call(&mut bed, &mut conn).await;

    bed.client.send_dtmf(&bed.key, "1#").unwrap();

    let first = conn.recv().await;
    assert_eq!(first.line.request_method(), Some(&Method::INFO));
    assert_eq!(
        first.headers.get(&Name::CONTENT_TYPE).map(|v| v.as_ref()),
        Some("application/dtmf-relay")
    );
    assert_eq!(first.body.as_ref(), b"Signal=1\r\nDuration=160\r\n");

    let answered_at = Instant::now();
    conn.send(response_for(&first, 200, "OK", None, &[], ""))
        .await;

    let second = conn.recv().await;
    assert_eq!(second.body.as_ref(), b"Signal=#\r\nDuration=160\r\n");

    // inter-digit gap of duration + 40ms
    assert!(
        Instant::now() - answered_at >= Duration::from_millis(200),
        "second digit sent too early"
    );

    conn.send(response_for(&second, 200, "OK", None, &[], ""))
        .await;

    // both INFOs ride the dialog's CSeq sequence
    let first_cseq: CSeq = first.headers.get_named().unwrap();
    let second_cseq: CSeq = second.headers.get_named().unwrap();
    assert!(second_cseq.cseq > first_cseq.cseq);
}

#[tokio::test(start_paused = true)]
async fn registering_the_same_account_twice_is_rejected() {
    let mut net = MockNetHandle::new();
    let media = std::sync::Arc::new(MockMedia::default());

    let (client, _events) = tern::Client::builder()
        .connector(net.connector.clone())
        .media(media)
        .build();

    client.register(alice()).unwrap();

    assert!(matches!(
        client.register(alice()),
        Err(tern::ClientError::DuplicateAccount(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn unregister_sends_zero_expiry() {
    let (bed, mut conn) = registered_testbed().await;

    let client = bed.client.clone();
    let key = bed.key.clone();
    let unregister = tokio::spawn(async move { client.unregister(&key).await });

    let remove = conn.recv().await;
    assert_eq!(remove.line.request_method(), Some(&Method::REGISTER));
    assert_eq!(
        remove.headers.get(&Name::EXPIRES).map(|v| v.as_ref()),
        Some("0")
    );

    conn.send(register_ok(&remove, 0)).await;

    unregister.await.unwrap().unwrap();

    // the account is gone
    assert!(bed.client.registration_state(&bed.key).is_none());
}

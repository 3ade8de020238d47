//! End to end call and registration scenarios against the in-memory
//! server harness.

mod common;

use common::*;
use tern::{CallEndReason, ClientEvent, RegistrationState};
use sip_msg::header::typed::CSeq;
use sip_msg::{Method, Name};
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn happy_outgoing_call() {
    let (mut bed, mut conn) = registered_testbed().await;

    let invite = connect_outgoing_call(&mut bed, &mut conn).await;

    // INVITE carried the offer created by the media engine
    assert_eq!(
        invite.headers.get(&Name::CONTENT_TYPE).map(|v| v.as_ref()),
        Some("application/sdp")
    );
    assert_eq!(invite.body.as_ref(), SDP_OFFER.as_bytes());
    assert_eq!(bed.media.call_count("create_offer"), 1);
    assert_eq!(bed.media.call_count("apply_answer"), 1);

    // hang up
    bed.client.end_call(&bed.key).unwrap();

    let bye = conn.recv().await;
    assert_eq!(bye.line.request_method(), Some(&Method::BYE));

    let invite_cseq: CSeq = invite.headers.get_named().unwrap();
    let bye_cseq: CSeq = bye.headers.get_named().unwrap();
    assert!(bye_cseq.cseq > invite_cseq.cseq);

    conn.send(response_for(&bye, 200, "OK", None, &[], "")).await;

    match next_call_event(&mut bed.events).await {
        ClientEvent::CallEnded { reason, .. } => {
            assert_eq!(reason, CallEndReason::NormalHangup)
        }
        other => panic!("expected CallEnded, got {other:?}"),
    }

    // the finished call went into the call history
    tokio::task::yield_now().await;
    assert_eq!(bed.store.call_log.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn digest_challenged_registration() {
    let mut net = MockNetHandle::new();
    let media = Arc::new(MockMedia::default());

    let (client, _events) = tern::Client::builder()
        .connector(net.connector.clone())
        .media(media)
        .build();

    let key = client.register(alice()).unwrap();

    let mut conn = net.accept().await;
    let first = conn.recv().await;
    assert!(!first.headers.contains(&Name::AUTHORIZATION));

    conn.send(response_for(
        &first,
        401,
        "Unauthorized",
        None,
        &[(
            "WWW-Authenticate",
            "Digest realm=\"example.com\", nonce=\"abc\", qop=\"auth\"".to_string(),
        )],
        "",
    ))
    .await;

    let second = conn.recv().await;
    assert_eq!(second.line.request_method(), Some(&Method::REGISTER));

    // same Call-ID, CSeq incremented by one
    assert_eq!(
        first.headers.get(&Name::CALL_ID),
        second.headers.get(&Name::CALL_ID)
    );
    let first_cseq: CSeq = first.headers.get_named().unwrap();
    let second_cseq: CSeq = second.headers.get_named().unwrap();
    assert_eq!(second_cseq.cseq, first_cseq.cseq + 1);

    let authorization: sip_msg::header::typed::DigestResponse =
        second.headers.get_type(&Name::AUTHORIZATION).unwrap();

    assert_eq!(authorization.username, "alice");
    assert_eq!(authorization.realm, "example.com");
    assert_eq!(authorization.nonce, "abc");

    let qop = authorization.qop_response.expect("qop=auth was offered");
    assert_eq!(qop.nc, 1);
    assert!(!qop.cnonce.is_empty());

    // response = MD5(HA1:nonce:nc:cnonce:auth:HA2) with the cnonce the
    // client picked
    let ha1 = format!("{:x}", md5::compute(b"alice:example.com:secret"));
    let ha2 = format!(
        "{:x}",
        md5::compute(format!("REGISTER:{}", authorization.uri))
    );
    let expected = format!(
        "{:x}",
        md5::compute(format!("{ha1}:abc:00000001:{}:auth:{ha2}", qop.cnonce))
    );
    assert_eq!(authorization.response, expected.as_str());

    conn.send(register_ok(&second, 3600)).await;

    let state = client.wait_for_registration(&key).await.unwrap();
    assert!(matches!(state, RegistrationState::Ok { .. }));
}

#[tokio::test(start_paused = true)]
async fn incoming_call_deflected() {
    let (mut bed, mut conn) = registered_testbed().await;

    conn.send(incoming_invite("spam", "alice", "example.com", "spam-call-1"))
        .await;

    // 100 right away, 180 after media preparation
    let trying = conn.recv().await;
    assert!(matches!(trying.line, sip_msg::MessageLine::Status(ref line) if line.code.into_u16() == 100));

    assert!(matches!(
        next_call_event(&mut bed.events).await,
        ClientEvent::IncomingCall(_)
    ));

    let ringing = conn.recv().await;
    assert!(matches!(ringing.line, sip_msg::MessageLine::Status(ref line) if line.code.into_u16() == 180));

    bed.client
        .deflect_call(&bed.key, "sip:vm@example.com")
        .unwrap();

    let refer = conn.recv().await;
    assert_eq!(refer.line.request_method(), Some(&Method::REFER));
    assert_eq!(
        refer.headers.get(&Name::REFER_TO).map(|v| v.as_ref()),
        Some("<sip:vm@example.com>")
    );

    conn.send(response_for(&refer, 202, "Accepted", None, &[], ""))
        .await;

    // the pending INVITE is closed out
    let decline = conn.recv().await;
    assert!(matches!(decline.line, sip_msg::MessageLine::Status(ref line) if line.code.into_u16() == 603));

    match next_call_event(&mut bed.events).await {
        ClientEvent::CallEnded { reason, .. } => {
            assert_eq!(reason, CallEndReason::Deflected)
        }
        other => panic!("expected CallEnded, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn hold_resume_round_trip() {
    let (mut bed, mut conn) = registered_testbed().await;
    let invite = connect_outgoing_call(&mut bed, &mut conn).await;
    let invite_cseq: CSeq = invite.headers.get_named().unwrap();

    // hold
    bed.client.hold(&bed.key).unwrap();

    let reinvite = conn.recv().await;
    assert_eq!(reinvite.line.request_method(), Some(&Method::INVITE));
    let reinvite_cseq: CSeq = reinvite.headers.get_named().unwrap();
    assert!(reinvite_cseq.cseq > invite_cseq.cseq);

    let body = std::str::from_utf8(&reinvite.body).unwrap();
    assert!(body.contains("a=sendonly"), "re-INVITE body: {body}");

    conn.send(response_for(
        &reinvite,
        200,
        "OK",
        None,
        &[("Content-Type", "application/sdp".to_string())],
        SDP_ANSWER,
    ))
    .await;

    let ack = conn.recv().await;
    assert_eq!(ack.line.request_method(), Some(&Method::ACK));
    let ack_cseq: CSeq = ack.headers.get_named().unwrap();
    assert_eq!(ack_cseq.cseq, reinvite_cseq.cseq);

    assert_eq!(bed.media.call_count("set_hold:true"), 1);

    // resume
    bed.client.resume(&bed.key).unwrap();

    let resume = conn.recv().await;
    assert_eq!(resume.line.request_method(), Some(&Method::INVITE));
    let resume_cseq: CSeq = resume.headers.get_named().unwrap();
    assert!(resume_cseq.cseq > reinvite_cseq.cseq);

    let body = std::str::from_utf8(&resume.body).unwrap();
    assert!(body.contains("a=sendrecv"), "re-INVITE body: {body}");

    conn.send(response_for(
        &resume,
        200,
        "OK",
        None,
        &[("Content-Type", "application/sdp".to_string())],
        SDP_ANSWER,
    ))
    .await;

    let ack = conn.recv().await;
    assert_eq!(ack.line.request_method(), Some(&Method::ACK));

    assert_eq!(bed.media.call_count("set_hold:false"), 1);
}

#[tokio::test(start_paused = true)]
async fn remote_hangup() {
    let (mut bed, mut conn) = registered_testbed().await;
    let invite = connect_outgoing_call(&mut bed, &mut conn).await;

    conn.send(in_dialog_request(&invite, "BYE", 10, "bob-tag"))
        .await;

    // the BYE is answered and the call ends
    let response = conn.recv().await;
    assert!(matches!(response.line, sip_msg::MessageLine::Status(ref line) if line.code.into_u16() == 200));

    match next_call_event(&mut bed.events).await {
        ClientEvent::CallEnded { reason, .. } => {
            assert_eq!(reason, CallEndReason::NormalHangup)
        }
        other => panic!("expected CallEnded, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn incoming_call_accept_and_cancel() {
    let (mut bed, mut conn) = registered_testbed().await;

    conn.send(incoming_invite("bob", "alice", "example.com", "call-cancel"))
        .await;

    let _trying = conn.recv().await;
    assert!(matches!(
        next_call_event(&mut bed.events).await,
        ClientEvent::IncomingCall(_)
    ));
    let ringing = conn.recv().await;
    let to = ringing.headers.get(&Name::TO).unwrap().to_string();
    assert!(to.contains(";tag="), "180 must carry a to-tag: {to}");

    // peer gives up before we answer
    let cancel = format!(
        "CANCEL sip:alice@example.com SIP/2.0\r\n\
         Via: SIP/2.0/TCP proxy.example.com;branch=z9hG4bKsrvcall-cancel\r\n\
         From: <sip:bob@example.com>;tag=remote-call-cancel\r\n\
         To: <sip:alice@example.com>\r\n\
         Call-ID: call-cancel\r\n\
         CSeq: 1 CANCEL\r\n\
         Content-Length: 0\r\n\r\n"
    );
    conn.send(cancel).await;

    // 200 to the CANCEL and 487 to the INVITE, in order
    let cancel_ok = conn.recv().await;
    assert!(matches!(cancel_ok.line, sip_msg::MessageLine::Status(ref line) if line.code.into_u16() == 200));

    let terminated = conn.recv().await;
    assert!(matches!(terminated.line, sip_msg::MessageLine::Status(ref line) if line.code.into_u16() == 487));

    match next_call_event(&mut bed.events).await {
        ClientEvent::CallEnded { reason, .. } => {
            assert_eq!(reason, CallEndReason::Cancelled)
        }
        other => panic!("expected CallEnded, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn incoming_call_hangup_sends_bye() {
    let (mut bed, mut conn) = registered_testbed().await;

    conn.send(incoming_invite("bob", "alice", "example.com", "call-hangup"))
        .await;

    let _trying = conn.recv().await;
    assert!(matches!(
        next_call_event(&mut bed.events).await,
        ClientEvent::IncomingCall(_)
    ));
    let ringing = conn.recv().await;
    let our_to = ringing.headers.get(&Name::TO).unwrap().to_string();
    assert!(our_to.contains(";tag="));

    // hanging up while still ringing sends a BYE within the early dialog
    bed.client.end_call(&bed.key).unwrap();

    let bye = conn.recv().await;
    assert_eq!(bye.line.request_method(), Some(&Method::BYE));

    // the BYE rides the dialog established by our 180: From is our side
    // of that dialog, To is the caller with their tag
    assert_eq!(
        bye.headers.get(&Name::FROM).map(|v| v.as_ref()),
        Some(our_to.as_str())
    );
    assert!(bye.headers.get(&Name::TO).unwrap().contains("tag=remote-call-hangup"));

    conn.send(response_for(&bye, 200, "OK", None, &[], "")).await;

    match next_call_event(&mut bed.events).await {
        ClientEvent::CallEnded { reason, .. } => {
            assert_eq!(reason, CallEndReason::NormalHangup)
        }
        other => panic!("expected CallEnded, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_outgoing_call_times_out() {
    let (mut bed, mut conn) = registered_testbed().await;

    bed.client
        .make_call(&bed.key, "sip:bob@example.com")
        .unwrap();

    let invite = conn.recv().await;
    assert_eq!(invite.line.request_method(), Some(&Method::INVITE));

    // no response of any kind: the INVITE timer ends the call with
    // Timeout, not NoAnswer (that one is reserved for 408/480)
    match next_call_event(&mut bed.events).await {
        ClientEvent::CallEnded { reason, .. } => {
            assert_eq!(reason, CallEndReason::Timeout)
        }
        other => panic!("expected CallEnded, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn incoming_call_accepted() {
    let (mut bed, mut conn) = registered_testbed().await;

    conn.send(incoming_invite("bob", "alice", "example.com", "call-accept"))
        .await;

    let _trying = conn.recv().await;
    assert!(matches!(
        next_call_event(&mut bed.events).await,
        ClientEvent::IncomingCall(_)
    ));
    let _ringing = conn.recv().await;

    bed.client.accept_call(&bed.key).unwrap();

    let ok = conn.recv().await;
    let sip_msg::MessageLine::Status(line) = &ok.line else {
        panic!("expected the 200 to the INVITE");
    };
    assert_eq!(line.code.into_u16(), 200);
    assert_eq!(ok.body.as_ref(), SDP_ANSWER.as_bytes());
    assert_eq!(bed.media.call_count("create_answer"), 1);

    assert!(matches!(
        next_call_event(&mut bed.events).await,
        ClientEvent::CallConnected(_)
    ));
}

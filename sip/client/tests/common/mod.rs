//! In-memory SIP server harness for driving the engine end to end.

// not every test binary uses every helper
#![allow(dead_code)]

use bytes::Bytes;
use bytesstr::BytesStr;
use tern::{
    AccountConfig, AccountStore, CallLogEntry, ClientEvent, MediaEngine, MediaError,
    RegistrationState, StoreError,
};
use parking_lot::Mutex;
use sip_core::transport::{Connector, MessageTransport, TpHandle, TransportEvent, TransportEvents};
use sip_msg::msg::Message;
use sip_msg::Name;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const SDP_OFFER: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\nm=audio 4000 RTP/AVP 0\r\na=sendrecv\r\n";
pub const SDP_ANSWER: &str = "v=0\r\no=- 2 2 IN IP4 0.0.0.0\r\nm=audio 4002 RTP/AVP 0\r\na=sendrecv\r\n";
pub const SDP_HOLD: &str = "v=0\r\no=- 3 3 IN IP4 0.0.0.0\r\nm=audio 4000 RTP/AVP 0\r\na=sendonly\r\n";

// === transport ===

#[derive(Debug)]
struct MockTransport {
    outgoing: mpsc::UnboundedSender<String>,
}

#[async_trait::async_trait]
impl MessageTransport for MockTransport {
    async fn send(&self, message: &str) -> io::Result<()> {
        self.outgoing
            .send(message.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server side closed"))
    }

    async fn close(&self, _code: u16, _reason: &str) {}
}

/// Cap on every wait in the harness. Most tests run under a paused
/// clock where pending timers auto-advance, so this has to sit above
/// the longest virtual delay a test legitimately spans (the 180s
/// INVITE timeout) or the cap itself would fire first.
pub const HARNESS_TIMEOUT: Duration = Duration::from_secs(600);

/// Server side of one accepted connection
pub struct ServerConn {
    pub outgoing: mpsc::UnboundedReceiver<String>,
    pub inject: mpsc::Sender<TransportEvent>,
}

impl ServerConn {
    /// Next message the client sent over this connection
    pub async fn recv(&mut self) -> Message {
        let raw = timeout(HARNESS_TIMEOUT, self.outgoing.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("connection dropped");

        Message::parse(&Bytes::from(raw)).expect("client sent an unparsable message")
    }

    /// Push a raw message to the client
    pub async fn send(&self, raw: String) {
        self.inject
            .send(TransportEvent::Message(BytesStr::from(raw)))
            .await
            .expect("client side dropped");
    }

    /// Close the connection from the server side
    pub async fn close(&self, reason: &str) {
        let _ = self
            .inject
            .send(TransportEvent::Closed {
                reason: BytesStr::from(reason.to_string()),
            })
            .await;
    }
}

/// Connector producing in-memory connections, optionally failing a
/// number of connect attempts
pub struct MockNet {
    conns: mpsc::UnboundedSender<ServerConn>,
    pub fail_connects: AtomicU32,
    pub connect_times: Mutex<Vec<tokio::time::Instant>>,
}

pub struct MockNetHandle {
    pub connector: Arc<MockNet>,
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

impl MockNetHandle {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        Self {
            connector: Arc::new(MockNet {
                conns: tx,
                fail_connects: AtomicU32::new(0),
                connect_times: Mutex::new(Vec::new()),
            }),
            accepted: rx,
        }
    }

    /// Wait for the engine to open the next connection
    pub async fn accept(&mut self) -> ServerConn {
        timeout(HARNESS_TIMEOUT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}

#[async_trait::async_trait]
impl Connector for MockNet {
    async fn connect(&self, _url: &str) -> io::Result<(TpHandle, TransportEvents)> {
        self.connect_times.lock().push(tokio::time::Instant::now());

        if self.fail_connects.load(Ordering::SeqCst) > 0 {
            self.fail_connects.fetch_sub(1, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no route to host",
            ));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (evt_tx, evt_rx) = mpsc::channel(64);

        let conn = ServerConn {
            outgoing: out_rx,
            inject: evt_tx,
        };

        self.conns.send(conn).expect("test dropped the net handle");

        Ok((TpHandle::new(MockTransport { outgoing: out_tx }), evt_rx))
    }
}

// === media engine ===

#[derive(Default)]
pub struct MockMedia {
    /// Every call into the engine, for asserting what was (not) invoked
    pub calls: Mutex<Vec<String>>,
}

impl MockMedia {
    pub fn call_count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == name).count()
    }
}

#[async_trait::async_trait]
impl MediaEngine for MockMedia {
    async fn initialize(&self) -> Result<(), MediaError> {
        self.calls.lock().push("initialize".into());
        Ok(())
    }

    async fn create_offer(&self) -> Result<BytesStr, MediaError> {
        self.calls.lock().push("create_offer".into());
        Ok(BytesStr::from_static(SDP_OFFER))
    }

    async fn create_answer(&self, _remote_sdp: &str) -> Result<BytesStr, MediaError> {
        self.calls.lock().push("create_answer".into());
        Ok(BytesStr::from_static(SDP_ANSWER))
    }

    async fn apply_answer(&self, _remote_sdp: &str) -> Result<(), MediaError> {
        self.calls.lock().push("apply_answer".into());
        Ok(())
    }

    async fn set_hold(&self, hold: bool) -> Result<BytesStr, MediaError> {
        self.calls.lock().push(format!("set_hold:{hold}"));

        Ok(BytesStr::from_static(if hold { SDP_HOLD } else { SDP_OFFER }))
    }

    async fn set_muted(&self, muted: bool) {
        self.calls.lock().push(format!("set_muted:{muted}"));
    }

    async fn dispose(&self) {
        self.calls.lock().push("dispose".into());
    }
}

// === store ===

#[derive(Default)]
pub struct MockStore {
    pub accounts: Mutex<Vec<AccountConfig>>,
    pub registration_updates: Mutex<Vec<(String, RegistrationState)>>,
    pub call_log: Mutex<Vec<CallLogEntry>>,
}

#[async_trait::async_trait]
impl AccountStore for MockStore {
    async fn list_registered_accounts(&self) -> Result<Vec<AccountConfig>, StoreError> {
        Ok(self.accounts.lock().clone())
    }

    async fn upsert_account(&self, account: &AccountConfig) -> Result<(), StoreError> {
        self.accounts.lock().push(account.clone());
        Ok(())
    }

    async fn update_registration_state(
        &self,
        key: &tern::AccountKey,
        state: &RegistrationState,
    ) -> Result<(), StoreError> {
        self.registration_updates
            .lock()
            .push((key.to_string(), state.clone()));
        Ok(())
    }

    async fn append_call_log(&self, entry: &CallLogEntry) -> Result<(), StoreError> {
        self.call_log.lock().push(entry.clone());
        Ok(())
    }
}

// === server side message building ===

fn header<'m>(msg: &'m Message, name: &Name) -> &'m str {
    msg.headers
        .get(name)
        .map(|v| v.as_ref())
        .unwrap_or_default()
}

/// Build a response echoing the transaction headers of `request`.
/// `to_tag` is appended to To when the request's To has none.
pub fn response_for(request: &Message, code: u16, reason: &str, to_tag: Option<&str>, extra_headers: &[(&str, String)], body: &str) -> String {
    let via = header(request, &Name::VIA);
    let from = header(request, &Name::FROM);
    let call_id = header(request, &Name::CALL_ID);
    let cseq = header(request, &Name::CSEQ);

    let mut to = header(request, &Name::TO).to_string();
    if let Some(tag) = to_tag {
        if !to.contains(";tag=") {
            to = format!("{to};tag={tag}");
        }
    }

    let mut out = format!(
        "SIP/2.0 {code} {reason}\r\nVia: {via}\r\nFrom: {from}\r\nTo: {to}\r\nCall-ID: {call_id}\r\nCSeq: {cseq}\r\n"
    );

    for (name, value) in extra_headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }

    out.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    out
}

/// 200 response to a REGISTER granting `expires`
pub fn register_ok(request: &Message, expires: u32) -> String {
    response_for(
        request,
        200,
        "OK",
        Some("reg-tag"),
        &[("Expires", expires.to_string())],
        "",
    )
}

/// An INVITE from the server to the client
pub fn incoming_invite(from_user: &str, to_user: &str, domain: &str, call_id: &str) -> String {
    let body = SDP_OFFER;

    format!(
        "INVITE sip:{to_user}@{domain} SIP/2.0\r\n\
         Via: SIP/2.0/TCP proxy.{domain};branch=z9hG4bKsrv{call_id}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:{from_user}@{domain}>;tag=remote-{call_id}\r\n\
         To: <sip:{to_user}@{domain}>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:{from_user}@proxy.{domain}>\r\n\
         Content-Type: application/sdp\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

/// A request within the dialog established by the client's request
/// `sent` (the server acts as the peer)
pub fn in_dialog_request(sent: &Message, method: &str, cseq: u32, to_tag: &str) -> String {
    let from = header(sent, &Name::TO);
    let to = header(sent, &Name::FROM);
    let call_id = header(sent, &Name::CALL_ID);

    let from = if from.contains(";tag=") {
        from.to_string()
    } else {
        format!("{from};tag={to_tag}")
    };

    format!(
        "{method} sip:client@client.invalid SIP/2.0\r\n\
         Via: SIP/2.0/TCP proxy.example.com;branch=z9hG4bKsrv{method}{cseq}\r\n\
         Max-Forwards: 70\r\n\
         From: {from}\r\n\
         To: {to}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {cseq} {method}\r\n\
         Content-Length: 0\r\n\r\n"
    )
}

// === assertions ===

/// Receive the next event, failing the test once the harness cap hits
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    timeout(HARNESS_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("client dropped")
}

/// Skip registration state events until something else shows up
pub async fn next_call_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    loop {
        match next_event(events).await {
            ClientEvent::RegistrationStateChanged { .. } => continue,
            event => return event,
        }
    }
}

// === test bed ===

pub struct TestBed {
    pub client: tern::Client,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
    pub net: MockNetHandle,
    pub media: Arc<MockMedia>,
    pub store: Arc<MockStore>,
    pub key: tern::AccountKey,
}

/// Client with one registered account and the server side of its
/// connection
pub async fn registered_testbed() -> (TestBed, ServerConn) {
    let mut net = MockNetHandle::new();
    let media = Arc::new(MockMedia::default());
    let store = Arc::new(MockStore::default());

    let (cl, events) = tern::Client::builder()
        .connector(net.connector.clone())
        .media(media.clone())
        .store(store.clone())
        .build();

    let key = cl.register(alice()).expect("fresh account");

    let mut conn = net.accept().await;
    let register = conn.recv().await;
    assert_eq!(register.line.request_method(), Some(&sip_msg::Method::REGISTER));

    conn.send(register_ok(&register, 3600)).await;

    let bed = TestBed {
        client: cl,
        events,
        net,
        media,
        store,
        key,
    };

    let state = bed
        .client
        .wait_for_registration(&bed.key)
        .await
        .expect("account exists");
    assert!(state.is_registered(), "expected Ok, got {state:?}");

    (bed, conn)
}

/// Drive an outgoing call to bob up to `Connected`, returning the INVITE
/// the client sent
pub async fn connect_outgoing_call(bed: &mut TestBed, conn: &mut ServerConn) -> Message {
    bed.client
        .make_call(&bed.key, "sip:bob@example.com")
        .expect("account exists");

    let invite = conn.recv().await;
    assert_eq!(invite.line.request_method(), Some(&sip_msg::Method::INVITE));

    conn.send(response_for(&invite, 100, "Trying", None, &[], ""))
        .await;
    conn.send(response_for(&invite, 180, "Ringing", Some("bob-tag"), &[], ""))
        .await;

    assert!(matches!(
        next_call_event(&mut bed.events).await,
        ClientEvent::CallRinging(_)
    ));

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
    assert_eq!(ack.line.request_method(), Some(&sip_msg::Method::ACK));

    assert!(matches!(
        next_call_event(&mut bed.events).await,
        ClientEvent::CallConnected(_)
    ));

    invite
}

pub fn alice() -> AccountConfig {
    AccountConfig {
        username: "alice".into(),
        domain: "example.com".into(),
        password: Some("secret".into()),
        ha1: None,
        display_name: None,
        transport_url: "wss://edge.example.com/sip".into(),
        push_token: Some("push-token-1".into()),
        push_provider: Some("fcm".into()),
        expiry: None,
    }
}

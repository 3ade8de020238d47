use crate::transaction::{ClientInvTsx, ClientTsx, ServerInvTsx, ServerTsx, Transactions, TsxKey, TsxResponse};
use crate::transport::TpHandle;
use crate::{BaseHeaders, Error, Result};
use bytes::Bytes;
use bytesstr::BytesStr;
use sip_msg::header::typed::{CSeq, Via};
use sip_msg::msg::{Message, MessageLine, RequestLine, StatusLine};
use sip_msg::{Headers, Method, Name, Request, Response, StatusCode};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// A request received outside of any transaction, to be handled by the
/// account that owns the connection
#[derive(Debug)]
pub struct IncomingRequest {
    pub line: RequestLine,
    pub base_headers: BaseHeaders,
    pub headers: Headers,
    pub body: Bytes,
    pub tsx_key: TsxKey,
}

/// Per-connection hub tying the transport to the transaction layer.
///
/// Cheap to clone. Messages that match no transaction are handed to the
/// receiver returned by [`Endpoint::new`], in receive order.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

struct Inner {
    transport: TpHandle,

    /// Transport token used in Via headers, e.g. `TCP` or `WSS`
    transport_name: BytesStr,
    /// The `sent-by` host placed in Via headers
    sent_by: BytesStr,

    transactions: Transactions,
    upstream: mpsc::UnboundedSender<IncomingRequest>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("transport", &self.inner.transport)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Wrap a freshly opened transport.
    ///
    /// The returned receiver yields requests which match no transaction
    /// and must be consumed by the connection owner.
    pub fn new<T, S>(
        transport: TpHandle,
        transport_name: T,
        sent_by: S,
    ) -> (Self, mpsc::UnboundedReceiver<IncomingRequest>)
    where
        T: Into<BytesStr>,
        S: Into<BytesStr>,
    {
        let (upstream, upstream_rx) = mpsc::unbounded_channel();

        let endpoint = Self {
            inner: Arc::new(Inner {
                transport,
                transport_name: transport_name.into(),
                sent_by: sent_by.into(),
                transactions: Transactions::default(),
                upstream,
            }),
        };

        (endpoint, upstream_rx)
    }

    pub fn sent_by(&self) -> &BytesStr {
        &self.inner.sent_by
    }

    pub fn transport_name(&self) -> &BytesStr {
        &self.inner.transport_name
    }

    pub fn transport(&self) -> &TpHandle {
        &self.inner.transport
    }

    /// Create a Via header for the given transaction key
    pub fn create_via(&self, tsx_key: &TsxKey) -> Via {
        Via::new(
            self.inner.transport_name.clone(),
            self.inner.sent_by.clone(),
            tsx_key.branch.clone(),
        )
    }

    /// Send a non-INVITE request, returning the transaction which MUST be
    /// used to drive it
    pub async fn send_request(&self, request: Request) -> Result<ClientTsx> {
        ClientTsx::send(self.clone(), request).await
    }

    /// Send an INVITE request, returning the transaction which MUST be
    /// used to drive it. `timeout` bounds the wait for a final response.
    pub async fn send_invite(&self, request: Request, timeout: Duration) -> Result<ClientInvTsx> {
        ClientInvTsx::send(self.clone(), request, timeout).await
    }

    /// Cancel an in-flight INVITE transaction.
    ///
    /// The CANCEL mirrors the INVITE's request uri, routing headers and
    /// CSeq number and reuses its Via branch (RFC 3261 Section 9.1).
    pub async fn send_cancel(&self, invite: &Request, invite_key: TsxKey) -> Result<ClientTsx> {
        debug_assert_eq!(invite.line.method, Method::INVITE);

        let mut cancel = Request::new(Method::CANCEL, invite.line.uri.clone());

        for name in [Name::FROM, Name::TO, Name::CALL_ID, Name::ROUTE] {
            invite.headers.clone_into(&mut cancel.headers, &name);
        }

        let cseq: CSeq = invite.headers.get_named()?;
        cancel
            .headers
            .insert_named(&CSeq::new(cseq.cseq, Method::CANCEL));
        cancel.headers.insert(Name::MAX_FORWARDS, "70");

        let key = TsxKey {
            branch: invite_key.branch,
            method: Method::CANCEL,
        };

        ClientTsx::send_with_key(self.clone(), cancel, key).await
    }

    /// Create a transaction to respond to a non-INVITE request
    pub fn create_server_tsx(&self, request: &IncomingRequest) -> ServerTsx {
        ServerTsx::new(self.clone(), request)
    }

    /// Create a transaction to respond to an INVITE request
    pub fn create_server_inv_tsx(&self, request: &IncomingRequest) -> ServerInvTsx {
        ServerInvTsx::new(self.clone(), request)
    }

    /// Create a response to `request`, copying the headers that tie the
    /// response to its transaction (RFC 3261 Section 8.2.6)
    pub fn create_response(
        &self,
        request: &IncomingRequest,
        code: StatusCode,
        reason: Option<BytesStr>,
    ) -> Response {
        debug_assert_ne!(request.line.method, Method::ACK);

        let mut headers = Headers::with_capacity(5);

        for via in &request.base_headers.via {
            headers.insert_named(via);
        }

        headers.insert_type(Name::FROM, &request.base_headers.from);
        headers.insert_type(Name::TO, &request.base_headers.to);
        headers.insert_named(&request.base_headers.call_id);
        headers.insert_named(&request.base_headers.cseq);

        Response {
            line: StatusLine {
                code,
                reason: reason.or_else(|| code.text().map(BytesStr::from_static)),
            },
            headers,
            body: Bytes::new(),
        }
    }

    /// Print and send a request over the connection
    pub async fn send_outgoing_request(&self, request: &Request) -> io::Result<()> {
        self.send_printed(request.print()).await
    }

    /// Print and send a response over the connection
    pub async fn send_outgoing_response(&self, response: &Response) -> io::Result<()> {
        self.send_printed(response.print()).await
    }

    /// Send an already printed message, used to retransmit a stored ACK
    pub async fn send_raw(&self, message: &str) -> io::Result<()> {
        log::trace!("sending message\n{message}");
        self.inner.transport.send(message).await
    }

    async fn send_printed(&self, printed: Bytes) -> io::Result<()> {
        let text = std::str::from_utf8(&printed)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        log::trace!("sending message\n{text}");
        self.inner.transport.send(text).await
    }

    /// Feed a message received from the transport into the endpoint.
    ///
    /// Responses are routed to their client transaction, requests that are
    /// no retransmission surface at the upstream receiver. Malformed
    /// messages are logged and dropped without any state change.
    #[tracing::instrument(level = "debug", skip(self, message))]
    pub fn receive(&self, message: &BytesStr) {
        let bytes = Bytes::copy_from_slice(message.as_bytes());

        let msg = match Message::parse(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("dropping malformed message, {e}");
                return;
            }
        };

        let base_headers = match BaseHeaders::extract_from(&msg.headers) {
            Ok(base_headers) => base_headers,
            Err(e) => {
                log::warn!("dropping message with incomplete base headers, {e}");
                return;
            }
        };

        let Some(branch) = base_headers.via.first().and_then(|via| via.branch()).cloned()
        else {
            log::warn!("dropping message without Via branch");
            return;
        };

        match msg.line {
            MessageLine::Status(line) => {
                let tsx_key = TsxKey {
                    branch,
                    method: base_headers.cseq.method.clone(),
                };

                let response = TsxResponse {
                    line,
                    base_headers,
                    headers: msg.headers,
                    body: msg.body,
                };

                if let Some(orphan) = self
                    .inner
                    .transactions
                    .route_response(&tsx_key, response)
                {
                    log::debug!(
                        "dropping orphaned {} response for {tsx_key:?}",
                        orphan.line.code
                    );
                }
            }
            MessageLine::Request(line) => {
                let tsx_key = TsxKey {
                    branch,
                    method: line.method.clone(),
                };

                if self.inner.transactions.is_server_retransmission(&tsx_key) {
                    log::debug!("ignoring retransmission of {tsx_key:?}");
                    return;
                }

                let incoming = IncomingRequest {
                    line,
                    base_headers,
                    headers: msg.headers,
                    body: msg.body,
                    tsx_key,
                };

                if self.inner.upstream.send(incoming).is_err() {
                    log::warn!("connection owner is gone, dropping incoming request");
                }
            }
        }
    }

    /// Respond to a request nobody else handled
    pub async fn handle_unwanted_request(&self, request: IncomingRequest) -> Result<()> {
        if request.line.method == Method::ACK {
            // Cannot respond to ACK requests
            return Ok(());
        }

        let response = self.create_response(
            &request,
            StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
            None,
        );

        if request.line.method == Method::INVITE {
            self.create_server_inv_tsx(&request)
                .respond_failure(response)
                .await
        } else {
            self.create_server_tsx(&request).respond(response).await
        }
    }

    pub(crate) fn transactions(&self) -> &Transactions {
        &self.inner.transactions
    }
}

impl Error {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::RequestTimedOut)
    }
}

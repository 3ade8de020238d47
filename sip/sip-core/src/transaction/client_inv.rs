use super::consts::TIMER_M;
use super::{TsxKey, TsxRegistration, TsxResponse};
use crate::{Endpoint, Error, Result};
use sip_msg::header::typed::CSeq;
use sip_msg::{CodeKind, Method, Name, Request};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Client INVITE transaction.
///
/// ACK requests for negative final responses are generated here, the ACK
/// for a 2xx belongs to the dialog layer (RFC 3261 Section 17.1.1.3).
/// After a 2xx was received the transaction stays alive for the 2xx
/// retransmission window so a dialog can re-acknowledge duplicates.
#[must_use]
#[derive(Debug)]
pub struct ClientInvTsx {
    registration: Option<TsxRegistration>,
    request: Request,
    timeout: Instant,
    state: State,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Proceeding,
    /// A 2xx was received, `receive` keeps yielding its retransmissions
    Accepted { code: u16 },
    Terminated,
}

impl ClientInvTsx {
    /// Internal: used by [`Endpoint::send_invite`]
    pub(crate) async fn send(
        endpoint: Endpoint,
        mut request: Request,
        timeout: Duration,
    ) -> Result<Self> {
        assert_eq!(
            request.line.method,
            Method::INVITE,
            "tried to create client INVITE transaction from {} request",
            request.line.method
        );

        let registration = TsxRegistration::create(endpoint, TsxKey::client(&Method::INVITE));

        let via = registration.endpoint.create_via(&registration.key);
        request.headers.insert_named_front(&via);

        registration
            .endpoint
            .send_outgoing_request(&request)
            .await?;

        Ok(Self {
            registration: Some(registration),
            request,
            timeout: Instant::now() + timeout,
            state: State::Proceeding,
        })
    }

    /// Returns the request the transaction was created from
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The transaction key this INVITE was sent with
    pub fn key(&self) -> Option<&TsxKey> {
        self.registration.as_ref().map(|r| &r.key)
    }

    /// Receive one or more responses.
    ///
    /// Returns `None` once the transaction is terminated. While waiting
    /// for the first final response a timeout is an error; afterwards it
    /// just ends the 2xx retransmission window.
    pub async fn receive(&mut self) -> Result<Option<TsxResponse>> {
        loop {
            let registration = match &mut self.registration {
                Some(registration) => registration,
                None => return Ok(None),
            };

            match self.state {
                State::Proceeding => {
                    let response = match timeout_at(self.timeout, registration.receive()).await {
                        Ok(response) => response,
                        Err(_) => {
                            self.terminate();
                            return Err(Error::RequestTimedOut);
                        }
                    };

                    match response.line.code.kind() {
                        CodeKind::Provisional => return Ok(Some(response)),
                        CodeKind::Success => {
                            self.state = State::Accepted {
                                code: response.line.code.into_u16(),
                            };
                            self.timeout = Instant::now() + TIMER_M;
                            return Ok(Some(response));
                        }
                        _ => {
                            self.acknowledge_failure(&response).await?;
                            self.terminate();
                            return Ok(Some(response));
                        }
                    }
                }
                State::Accepted { code } => {
                    let response = match timeout_at(self.timeout, registration.receive()).await {
                        Ok(response) => response,
                        Err(_) => {
                            self.terminate();
                            return Ok(None);
                        }
                    };

                    // concurrent final responses: keep the highest,
                    // discard lower ones silently
                    if response.line.code.into_u16() < code {
                        continue;
                    }

                    return Ok(Some(response));
                }
                State::Terminated => return Ok(None),
            }
        }
    }

    /// ACK a 3xx-6xx final response within this transaction
    async fn acknowledge_failure(&self, response: &TsxResponse) -> Result<()> {
        let registration = self
            .registration
            .as_ref()
            .expect("acknowledge_failure is only called while registered");

        let mut ack = Request::new(Method::ACK, self.request.line.uri.clone());

        // same branch as the INVITE, To mirrors the response's tag
        ack.headers
            .insert_named(&registration.endpoint.create_via(&registration.key));
        ack.headers.insert(Name::MAX_FORWARDS, "70");
        let from: sip_msg::header::typed::FromTo = self.request.headers.get_type(&Name::FROM)?;
        ack.headers.insert_type(Name::FROM, &from);
        ack.headers.insert_type(Name::TO, &response.base_headers.to);
        ack.headers.insert_named(&response.base_headers.call_id);
        ack.headers
            .insert_named(&CSeq::new(response.base_headers.cseq.cseq, Method::ACK));

        registration
            .endpoint
            .send_outgoing_request(&ack)
            .await?;

        Ok(())
    }

    fn terminate(&mut self) {
        self.state = State::Terminated;
        self.registration = None;
    }
}

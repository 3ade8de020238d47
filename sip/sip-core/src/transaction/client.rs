use super::consts::TIMER_F;
use super::{TsxKey, TsxRegistration, TsxResponse};
use crate::{Endpoint, Error, Result};
use sip_msg::{CodeKind, Method, Request};
use tokio::time::{timeout_at, Instant};

/// Client non-INVITE transaction.
///
/// The transport is ordered and reliable so no request retransmissions
/// are performed; the transaction only correlates responses and enforces
/// the transaction timeout (Timer F).
#[must_use]
#[derive(Debug)]
pub struct ClientTsx {
    registration: Option<TsxRegistration>,
    request: Request,
    timeout: Instant,
    state: State,
}

#[derive(Debug)]
enum State {
    Proceeding,
    Terminated,
}

impl ClientTsx {
    /// Internal: used by [`Endpoint::send_request`]
    pub(crate) async fn send(endpoint: Endpoint, mut request: Request) -> Result<Self> {
        let method = request.line.method.clone();

        assert!(
            !matches!(method, Method::INVITE | Method::ACK),
            "tried to create client transaction from {method} request",
        );

        let registration = TsxRegistration::create(endpoint, TsxKey::client(&method));

        let via = registration.endpoint.create_via(&registration.key);
        request.headers.insert_named_front(&via);

        registration
            .endpoint
            .send_outgoing_request(&request)
            .await?;

        Ok(Self {
            registration: Some(registration),
            request,
            timeout: Instant::now() + TIMER_F,
            state: State::Proceeding,
        })
    }

    /// Internal: used by [`Endpoint::send_cancel`] which must reuse the
    /// branch of the INVITE it cancels (RFC 3261 Section 9.1)
    pub(crate) async fn send_with_key(
        endpoint: Endpoint,
        mut request: Request,
        key: TsxKey,
    ) -> Result<Self> {
        let registration = TsxRegistration::create(endpoint, key);

        let via = registration.endpoint.create_via(&registration.key);
        request.headers.insert_named_front(&via);

        registration
            .endpoint
            .send_outgoing_request(&request)
            .await?;

        Ok(Self {
            registration: Some(registration),
            request,
            timeout: Instant::now() + TIMER_F,
            state: State::Proceeding,
        })
    }

    /// Returns the request the transaction was created from
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Receive one or more responses.
    ///
    /// Must be called until a final response or error is returned;
    /// afterwards the transaction is terminated and this returns an error.
    pub async fn receive(&mut self) -> Result<TsxResponse> {
        let registration = match &mut self.registration {
            Some(registration) if matches!(self.state, State::Proceeding) => registration,
            _ => return Err(Error::RequestTimedOut),
        };

        match timeout_at(self.timeout, registration.receive()).await {
            Ok(response) => {
                if response.line.code.is_final() {
                    self.state = State::Terminated;
                    self.registration = None;
                }

                Ok(response)
            }
            Err(_) => {
                self.state = State::Terminated;
                self.registration = None;
                Err(Error::RequestTimedOut)
            }
        }
    }

    /// Call [`ClientTsx::receive`] until the final response arrives,
    /// discarding provisional ones
    pub async fn receive_final(&mut self) -> Result<TsxResponse> {
        loop {
            let response = self.receive().await?;

            if !matches!(response.line.code.kind(), CodeKind::Provisional) {
                return Ok(response);
            }
        }
    }
}

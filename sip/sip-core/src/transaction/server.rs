use super::TsxKey;
use crate::endpoint::IncomingRequest;
use crate::{Endpoint, Result};
use sip_msg::{CodeKind, Method, Response};

/// Guard keeping a server transaction key registered so request
/// retransmissions are absorbed while a response is pending
#[derive(Debug)]
struct KeyGuard {
    endpoint: Endpoint,
    key: TsxKey,
}

impl KeyGuard {
    fn new(endpoint: Endpoint, request: &IncomingRequest) -> Self {
        endpoint.transactions().register_server(request.tsx_key.clone());

        Self {
            endpoint,
            key: request.tsx_key.clone(),
        }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.endpoint.transactions().remove_server(&self.key);
    }
}

/// Server non-INVITE transaction, used to respond to an incoming request
#[must_use]
#[derive(Debug)]
pub struct ServerTsx {
    guard: KeyGuard,
}

impl ServerTsx {
    /// Internal: used by [`Endpoint::create_server_tsx`]
    pub(crate) fn new(endpoint: Endpoint, request: &IncomingRequest) -> Self {
        assert!(
            !matches!(request.line.method, Method::INVITE | Method::ACK),
            "tried to create server transaction from {} request",
            request.line.method
        );

        Self {
            guard: KeyGuard::new(endpoint, request),
        }
    }

    /// Send a final response, consuming the transaction
    pub async fn respond(self, response: Response) -> Result<()> {
        self.guard.endpoint.send_outgoing_response(&response).await?;
        Ok(())
    }
}

/// Server INVITE transaction
#[must_use]
#[derive(Debug)]
pub struct ServerInvTsx {
    guard: KeyGuard,
}

impl ServerInvTsx {
    /// Internal: used by [`Endpoint::create_server_inv_tsx`]
    pub(crate) fn new(endpoint: Endpoint, request: &IncomingRequest) -> Self {
        assert_eq!(
            request.line.method,
            Method::INVITE,
            "tried to create server INVITE transaction from {} request",
            request.line.method
        );

        Self {
            guard: KeyGuard::new(endpoint, request),
        }
    }

    /// Send a provisional (1xx) response
    pub async fn respond_provisional(&self, response: Response) -> Result<()> {
        assert_eq!(response.line.code.kind(), CodeKind::Provisional);

        self.guard.endpoint.send_outgoing_response(&response).await?;
        Ok(())
    }

    /// Send a 2xx final response, consuming the transaction.
    ///
    /// The ACK to this response creates no transaction and surfaces at
    /// the connection owner, which routes it into the dialog.
    pub async fn respond_success(self, response: Response) -> Result<()> {
        assert_eq!(response.line.code.kind(), CodeKind::Success);

        self.guard.endpoint.send_outgoing_response(&response).await?;
        Ok(())
    }

    /// Send a negative (3xx-6xx) final response, consuming the transaction
    pub async fn respond_failure(self, response: Response) -> Result<()> {
        assert!(!matches!(
            response.line.code.kind(),
            CodeKind::Provisional | CodeKind::Success
        ));

        self.guard.endpoint.send_outgoing_response(&response).await?;
        Ok(())
    }
}

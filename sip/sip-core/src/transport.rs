//! Abstract message transport contract.
//!
//! The engine never opens sockets itself. The embedding application
//! provides a [`Connector`] which yields a full-duplex, message framed and
//! ordered connection to the SIP server, addressed by an opaque url taken
//! from configuration.

use bytesstr::BytesStr;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events emitted by an open connection
#[derive(Debug)]
pub enum TransportEvent {
    /// The connection is established and messages may be sent
    Opened,
    /// A complete SIP message was received
    Message(BytesStr),
    /// The connection is gone, no further events will follow
    Closed { reason: BytesStr },
    /// The connection failed, a `Closed` event will follow
    Error(io::Error),
}

/// A live connection to the SIP server
#[async_trait::async_trait]
pub trait MessageTransport: fmt::Debug + Send + Sync + 'static {
    /// Send a complete SIP message
    async fn send(&self, message: &str) -> io::Result<()>;

    /// Close the connection with the given code and reason
    async fn close(&self, code: u16, reason: &str);
}

/// Shared handle to a [`MessageTransport`]
#[derive(Debug, Clone)]
pub struct TpHandle {
    transport: Arc<dyn MessageTransport>,
}

impl TpHandle {
    pub fn new<T: MessageTransport>(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
        }
    }

    pub async fn send(&self, message: &str) -> io::Result<()> {
        self.transport.send(message).await
    }

    pub async fn close(&self, code: u16, reason: &str) {
        self.transport.close(code, reason).await;
    }
}

/// Receiver half of a connection's event stream
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Factory for connections, implemented by the embedding application
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to `url`.
    ///
    /// The url is passed through from account configuration verbatim, its
    /// scheme and format are an agreement between application and server.
    async fn connect(&self, url: &str) -> io::Result<(TpHandle, TransportEvents)>;
}

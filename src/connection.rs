//! The public connection API.
//!
//! A [`Connection`] is a thin handle: all protocol state lives on the driver
//! task it spawns. Calls post to the driver's mailbox and return
//! immediately; everything the connection has to say comes back through the
//! [`ConnectionDelegate`] (and through the future returned by
//! [`send_request`](Connection::send_request)).

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::builder::MessageBuilder;
use crate::error::{BlipError, CloseStatus};
use crate::frame::MessageType;
use crate::inbound::MessageIn;
use crate::io::{self as blip_io, IoMessage};
use crate::outbound::MessageOut;
use crate::transport::{accept_ws, connect_ws, FrameTransport};

/// Where a connection is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    Connecting,
    Connected,
    Closing,
    /// The transport closed normally (WebSocket code 1000 or 1001).
    Closed,
    /// The transport went away with anything other than a normal close.
    Disconnected,
}

/// Shared connection-state cell, written by the driver and read by anyone
/// holding the connection.
#[derive(Clone)]
pub(crate) struct StateCell(Arc<Mutex<ConnectionState>>);

impl StateCell {
    pub(crate) fn new() -> StateCell {
        StateCell(Arc::new(Mutex::new(ConnectionState::Unopened)))
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        *self.0.lock() = state;
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.0.lock()
    }
}

/// Receives connection lifecycle events and unsolicited messages.
///
/// Every method runs on the connection's driver task, in order: `on_connect`
/// first, then any number of requests and responses, then `on_close` exactly
/// once. Implementations must not block.
pub trait ConnectionDelegate: Send + Sync + 'static {
    fn on_connect(&self) {}

    /// An incoming request no registered handler claimed. The default
    /// declines it with a BLIP/501 error response.
    fn on_request_received(&self, request: MessageIn) {
        request.respond_with_error(crate::ERROR_DOMAIN_BLIP, 501, "no handler for request");
    }

    /// A response (or error) to one of our requests.
    fn on_response_received(&self, _response: MessageIn) {}

    /// The connection is gone. Always the final event.
    fn on_close(&self, _status: CloseStatus) {}
}

/// A per-profile request handler. Runs on the driver task; returning an
/// error (or panicking) sends the peer an automatic BLIP/501 error response.
pub type RequestHandler = Box<dyn Fn(MessageIn) -> crate::Result<()> + Send>;

/// Resolves with the peer's reply to a request sent through
/// [`Connection::send_request`].
///
/// Requests sent NoReply resolve immediately with [`BlipError::NoReply`].
/// If the connection closes first, the future resolves with
/// [`BlipError::ConnectionClosed`].
pub struct ResponseFuture {
    waiter: Option<oneshot::Receiver<MessageIn>>,
}

impl ResponseFuture {
    fn waiting(rx: oneshot::Receiver<MessageIn>) -> ResponseFuture {
        ResponseFuture { waiter: Some(rx) }
    }

    fn no_reply() -> ResponseFuture {
        ResponseFuture { waiter: None }
    }
}

impl Future for ResponseFuture {
    type Output = crate::Result<MessageIn>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.waiter.as_mut() {
            None => Poll::Ready(Err(BlipError::NoReply)),
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.map_err(|_| BlipError::ConnectionClosed)),
        }
    }
}

/// A BLIP connection over a frame transport.
///
/// Holds the only strong handle to the driver's mailbox: dropping the
/// connection (without calling [`close`](Connection::close) first) also
/// shuts the connection down.
pub struct Connection {
    name: String,
    mailbox: mpsc::UnboundedSender<IoMessage>,
    state: StateCell,
}

impl Connection {
    /// Open a client connection to a WebSocket URL.
    pub async fn connect(
        url: &str,
        delegate: Arc<dyn ConnectionDelegate>,
    ) -> io::Result<Connection> {
        let transport = connect_ws(url).await?;
        Ok(Connection::start(transport, format!("->{url}"), delegate))
    }

    /// Take over an accepted stream as the server side of a connection,
    /// performing the WebSocket upgrade first.
    pub async fn accept<S>(stream: S, delegate: Arc<dyn ConnectionDelegate>) -> io::Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let transport = accept_ws(stream).await?;
        Ok(Connection::start(transport, "<-peer".to_string(), delegate))
    }

    /// Run a connection over an already-established frame transport.
    pub fn start<T: FrameTransport>(
        transport: T,
        name: impl Into<String>,
        delegate: Arc<dyn ConnectionDelegate>,
    ) -> Connection {
        let name = name.into();
        debug!(name = %name, "opening connection");
        let state = StateCell::new();
        state.set(ConnectionState::Connecting);
        let mailbox = blip_io::spawn(name.clone(), transport, delegate, state.clone());
        Connection {
            name,
            mailbox,
            state,
        }
    }

    fn post(&self, message: IoMessage) {
        if self.mailbox.send(message).is_err() {
            debug!(name = %self.name, "connection is closed; dropping posted message");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Queue a request. The reply arrives both through the returned future
    /// and through [`ConnectionDelegate::on_response_received`].
    ///
    /// After [`close`](Connection::close) the request is logged and dropped,
    /// and the future resolves with [`BlipError::ConnectionClosed`].
    ///
    /// Panics if the builder was turned into a response or error.
    pub fn send_request(&self, request: MessageBuilder) -> ResponseFuture {
        assert!(
            request.message_type == MessageType::Request,
            "send_request requires a request"
        );
        let no_reply = request.no_reply;
        let (flags, payload) = request.finish();
        let (waiter, future) = if no_reply {
            (None, ResponseFuture::no_reply())
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), ResponseFuture::waiting(rx))
        };
        self.post(IoMessage::Queue(MessageOut::new(flags, payload, 0, waiter)));
        future
    }

    /// Register a handler for incoming requests whose `Profile` property is
    /// `profile`. Replaces any previous handler for the same profile.
    pub fn set_request_handler<F>(&self, profile: &str, handler: F)
    where
        F: Fn(MessageIn) -> crate::Result<()> + Send + 'static,
    {
        self.post(IoMessage::SetHandler {
            profile: profile.to_owned(),
            handler: Some(Box::new(handler)),
        });
    }

    /// Remove the handler for `profile`; such requests go back to the
    /// delegate.
    pub fn remove_request_handler(&self, profile: &str) {
        self.post(IoMessage::SetHandler {
            profile: profile.to_owned(),
            handler: None,
        });
    }

    /// Begin a graceful close. The delegate's `on_close` reports the final
    /// status once the peer completes the close handshake.
    pub fn close(&self) {
        self.post(IoMessage::Close);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .finish()
    }
}

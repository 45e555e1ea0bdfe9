//! The WebSocket seam.
//!
//! The connection driver only needs a transport that moves whole frames and
//! reports when the peer goes away; [`FrameTransport`] is that contract.
//! [`WsTransport`] implements it over tokio-tungstenite. The HTTP upgrade
//! itself belongs to the transport layer; this module only makes sure the
//! `"BLIP"` subprotocol is offered and confirmed.

use std::future::Future;
use std::io;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as ServerRequest, Response as ServerResponse,
};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{CloseReason, CloseStatus};

/// Subprotocol name advertised during the WebSocket handshake.
pub const BLIP_SUBPROTOCOL: &str = "BLIP";

/// One event from the transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete transport message. Only binary frames carry protocol data;
    /// text frames are surfaced so the driver can drop them with a warning.
    Frame { data: Bytes, binary: bool },
    /// The transport is gone; no further events will arrive.
    Closed(CloseStatus),
}

/// A reliable, message-oriented transport carrying one frame per message.
pub trait FrameTransport: Send + 'static {
    /// Send one frame. Errors are fatal to the connection.
    fn send(&mut self, frame: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive the next event, blocking until a frame arrives or the
    /// transport closes. Transport failures are reported as
    /// [`TransportEvent::Closed`] rather than errors.
    fn recv(&mut self) -> impl Future<Output = TransportEvent> + Send;

    /// Start a graceful close. Best effort; the close status still arrives
    /// through [`recv`](FrameTransport::recv).
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// WebSocket transport for BLIP frames.
///
/// Frames are binary WebSocket messages, one frame per message. Pings are
/// answered inline; a close frame (or transport failure) ends the stream of
/// events with a [`CloseStatus`].
pub struct WsTransport<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsTransport<S> {
    pub fn new(stream: WebSocketStream<S>) -> WsTransport<S> {
        WsTransport { stream }
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.stream
    }
}

fn close_status_from_ws(error: WsError) -> CloseStatus {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => CloseStatus::new(
            CloseReason::WebSocket,
            1006,
            "connection closed abnormally",
        ),
        WsError::Io(e) => {
            let code = e.raw_os_error().unwrap_or(0) as u16;
            CloseStatus::new(CloseReason::Posix, code, e.to_string())
        }
        other => CloseStatus::new(CloseReason::Network, 0, other.to_string()),
    }
}

impl<S> FrameTransport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream
            .send(WsMessage::Binary(frame.to_vec()))
            .await
            .map_err(io::Error::other)
    }

    async fn recv(&mut self) -> TransportEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    return TransportEvent::Frame {
                        data: Bytes::from(data),
                        binary: true,
                    };
                }
                Some(Ok(WsMessage::Text(text))) => {
                    return TransportEvent::Frame {
                        data: Bytes::from(text.into_bytes()),
                        binary: false,
                    };
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = self.stream.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    let status = match frame {
                        Some(f) => CloseStatus::new(
                            CloseReason::WebSocket,
                            u16::from(f.code),
                            f.reason.to_string(),
                        ),
                        None => CloseStatus::new(CloseReason::WebSocket, 1005, ""),
                    };
                    return TransportEvent::Closed(status);
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => return TransportEvent::Closed(close_status_from_ws(e)),
                None => {
                    return TransportEvent::Closed(CloseStatus::new(
                        CloseReason::WebSocket,
                        1006,
                        "connection dropped",
                    ));
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self
            .stream
            .close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }))
            .await;
    }
}

/// Open a client WebSocket to `url`, offering the `"BLIP"` subprotocol.
pub async fn connect_ws(url: &str) -> io::Result<WsTransport<MaybeTlsStream<TcpStream>>> {
    let mut request = url.into_client_request().map_err(io::Error::other)?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(BLIP_SUBPROTOCOL),
    );
    let (stream, _response) = connect_async(request).await.map_err(io::Error::other)?;
    Ok(WsTransport::new(stream))
}

/// Accept a server WebSocket on an incoming stream, confirming the `"BLIP"`
/// subprotocol when the client offered it.
pub async fn accept_ws<S>(stream: S) -> io::Result<WsTransport<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let callback = |request: &ServerRequest, mut response: ServerResponse| {
        let offered = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if offered
            .split(',')
            .any(|candidate| candidate.trim() == BLIP_SUBPROTOCOL)
        {
            response.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(BLIP_SUBPROTOCOL),
            );
        }
        Ok(response)
    };
    let ws = accept_hdr_async(stream, callback)
        .await
        .map_err(io::Error::other)?;
    Ok(WsTransport::new(ws))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_tungstenite::client_async;

    #[tokio::test]
    async fn websocket_frame_roundtrip_with_subprotocol() {
        let (client_io, server_io) = duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let mut transport = accept_ws(server_io).await.unwrap();
            match transport.recv().await {
                TransportEvent::Frame { data, binary } => {
                    assert!(binary);
                    transport.send(&data).await.unwrap();
                }
                other => panic!("expected a frame, got {other:?}"),
            }
            // Wait for the client's close.
            loop {
                if let TransportEvent::Closed(status) = transport.recv().await {
                    assert_eq!(status.code, 1000);
                    break;
                }
            }
        });

        let mut request = "ws://local.test/".into_client_request().unwrap();
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(BLIP_SUBPROTOCOL),
        );
        let (stream, response) = client_async(request, client_io).await.unwrap();
        assert_eq!(
            response
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok()),
            Some(BLIP_SUBPROTOCOL)
        );
        let mut transport = WsTransport::new(stream);

        transport.send(b"\x01\x02\x03").await.unwrap();
        match transport.recv().await {
            TransportEvent::Frame { data, binary } => {
                assert!(binary);
                assert_eq!(&data[..], b"\x01\x02\x03");
            }
            other => panic!("expected echo, got {other:?}"),
        }

        transport.close().await;
        loop {
            if let TransportEvent::Closed(status) = transport.recv().await {
                assert!(status.is_normal());
                break;
            }
        }

        server.await.unwrap();
    }

    #[test]
    fn io_errors_map_to_posix() {
        let status = close_status_from_ws(WsError::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset by peer",
        )));
        assert_eq!(status.reason, CloseReason::Posix);
        assert!(status.message.contains("reset"));
    }

    #[test]
    fn closed_stream_maps_to_websocket_1006() {
        let status = close_status_from_ws(WsError::ConnectionClosed);
        assert_eq!(status.reason, CloseReason::WebSocket);
        assert_eq!(status.code, 1006);
        assert!(!status.is_normal());
    }
}

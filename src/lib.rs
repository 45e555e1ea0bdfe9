//! BLIP: a bidirectional, multiplexed request/response messaging protocol
//! layered over WebSocket.
//!
//! Many logical messages travel concurrently over one reliable frame
//! transport. Each frame is `uvarint(msg_no) ‖ uvarint(flags) ‖ payload`;
//! a message body is `uvarint(len) ‖ properties ‖ body`, with well-known
//! property strings tokenized to single bytes and bodies optionally
//! gzipped. Outgoing messages take round-robin turns on the wire, urgent
//! messages jump ahead of regular traffic, and explicit ACK messages give
//! each side per-message back-pressure.
//!
//! All protocol state for a connection lives on one driver task; the public
//! types are handles that post work to it and never block.
//!
//! ```no_run
//! use std::sync::Arc;
//! use blip::{Connection, ConnectionDelegate, MessageBuilder};
//!
//! struct Quiet;
//! impl ConnectionDelegate for Quiet {}
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = Connection::connect("ws://example.net:4984/", Arc::new(Quiet)).await?;
//! connection.set_request_handler("echo", |request| {
//!     let mut reply = MessageBuilder::reply_to(&request);
//!     reply.write(request.body());
//!     request.respond(reply)
//! });
//!
//! let mut request = MessageBuilder::with_profile("echo");
//! request.write(b"hello");
//! let response = connection.send_request(request).await?;
//! assert_eq!(response.body(), b"hello");
//! # Ok(())
//! # }
//! ```

mod builder;
mod connection;
mod error;
pub mod frame;
mod inbound;
mod io;
mod outbound;
mod properties;
pub mod transport;
mod zip;

pub use builder::MessageBuilder;
pub use connection::{
    Connection, ConnectionDelegate, ConnectionState, RequestHandler, ResponseFuture,
};
pub use error::{BlipError, CloseReason, CloseStatus, Result, ERROR_DOMAIN_BLIP};
pub use frame::{FrameFlags, MessageType, MsgNo};
pub use inbound::MessageIn;
pub use properties::Properties;
pub use transport::{FrameTransport, TransportEvent, WsTransport, BLIP_SUBPROTOCOL};

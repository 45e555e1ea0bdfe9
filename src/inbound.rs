//! Incoming messages: reassembly and the delivered message type.

use std::fmt;

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::builder::MessageBuilder;
use crate::error::BlipError;
use crate::frame::{read_uvarint, FrameFlags, MessageType, MsgNo};
use crate::io::{IoMessage, Outgoing};
use crate::outbound::MessageOut;
use crate::properties::{write_tokenized, Properties};
use crate::zip;
use crate::ERROR_DOMAIN_BLIP;

/// Cumulative received bytes between the ACKs we send back. Must stay
/// compatible with the sender-side freeze threshold of our peers.
pub(crate) const INCOMING_ACK_THRESHOLD: u64 = 50_000;

/// Why a partially received message had to be abandoned.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InboundError {
    /// The message ended before the declared end of its properties block.
    TruncatedProperties,
    /// The properties block is not NUL-terminated.
    UnterminatedProperties,
    /// The properties length prefix is missing or malformed.
    BadPropertiesLength,
}

impl fmt::Display for InboundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundError::TruncatedProperties => {
                write!(f, "message ends before end of properties")
            }
            InboundError::UnterminatedProperties => {
                write!(f, "message properties not NUL-terminated")
            }
            InboundError::BadPropertiesLength => {
                write!(f, "malformed properties length prefix")
            }
        }
    }
}

/// A message being reassembled from frames. Owned exclusively by the
/// connection driver until the final frame arrives.
pub(crate) struct InboundMessage {
    number: MsgNo,
    flags: FrameFlags,
    buffer: Vec<u8>,
    unacked_bytes: u64,
    started: bool,
    /// For responses to our own requests: wakes the caller's future.
    waiter: Option<oneshot::Sender<MessageIn>>,
    outgoing: Outgoing,
}

impl InboundMessage {
    /// A new incoming request, before its first frame is applied.
    pub(crate) fn request(number: MsgNo, outgoing: Outgoing) -> InboundMessage {
        InboundMessage {
            number,
            flags: FrameFlags::new(MessageType::Request, false, false, false),
            buffer: Vec::new(),
            unacked_bytes: 0,
            started: false,
            waiter: None,
            outgoing,
        }
    }

    /// The response slot registered when the final frame of one of our
    /// requests goes out. Its flags are provisional: the first response
    /// frame may turn it into an error or mark it urgent or compressed.
    pub(crate) fn expected_response(
        number: MsgNo,
        waiter: Option<oneshot::Sender<MessageIn>>,
        outgoing: Outgoing,
    ) -> InboundMessage {
        InboundMessage {
            number,
            flags: FrameFlags::new(MessageType::Response, false, false, false),
            buffer: Vec::new(),
            unacked_bytes: 0,
            started: false,
            waiter,
            outgoing,
        }
    }

    pub(crate) fn number(&self) -> MsgNo {
        self.number
    }

    /// Apply one frame's payload. Returns the cumulative received byte count
    /// to ACK back to the sender, if this frame crossed the ACK threshold.
    /// Completion is the caller's to detect from the frame's MoreComing bit.
    pub(crate) fn received_frame(&mut self, payload: &[u8], frame_flags: FrameFlags) -> Option<u64> {
        if !self.started {
            self.started = true;
            debug!(
                msg_type = frame_flags.type_name(),
                msg_no = self.number,
                flags = %frame_flags,
                "receiving message"
            );
        }
        // Later frames refresh the flags; the final frame's flags are the
        // ones that count for Compressed and the type bits.
        self.flags = frame_flags.without_more_coming();
        self.buffer.extend_from_slice(payload);

        self.unacked_bytes += payload.len() as u64;
        if self.unacked_bytes >= INCOMING_ACK_THRESHOLD {
            self.unacked_bytes = 0;
            Some(self.buffer.len() as u64)
        } else {
            None
        }
    }

    pub(crate) fn take_waiter(&mut self) -> Option<oneshot::Sender<MessageIn>> {
        self.waiter.take()
    }

    /// Finish reassembly: split off the properties block and, when the
    /// Compressed flag is set, gunzip the body region. A gunzip failure
    /// completes the message as a BLIP-domain error instead of poisoning the
    /// connection; structural failures abandon the message.
    pub(crate) fn finish(mut self) -> Result<MessageIn, InboundError> {
        let mut rest = self.buffer.as_slice();
        let props_len =
            read_uvarint(&mut rest).ok_or(InboundError::BadPropertiesLength)? as usize;
        if rest.len() < props_len {
            return Err(InboundError::TruncatedProperties);
        }
        if props_len > 0 && rest[props_len - 1] != 0 {
            return Err(InboundError::UnterminatedProperties);
        }
        let header_len = self.buffer.len() - rest.len();
        let buffer = Bytes::from(std::mem::take(&mut self.buffer));
        let properties = Properties::from_raw(buffer.slice(header_len..header_len + props_len));
        let body_region = buffer.slice(header_len + props_len..);

        let (flags, properties, body) = if self.flags.is_compressed() {
            match zip::decompress_body(&body_region) {
                Ok(plain) => (
                    self.flags.without_compressed(),
                    properties,
                    Bytes::from(plain),
                ),
                Err(e) => {
                    warn!(msg_no = self.number, error = %e, "failed to decompress message body");
                    let mut raw = Vec::new();
                    write_tokenized(&mut raw, "Error-Domain");
                    write_tokenized(&mut raw, ERROR_DOMAIN_BLIP);
                    write_tokenized(&mut raw, "Error-Code");
                    write_tokenized(&mut raw, "500");
                    (
                        FrameFlags::new(
                            MessageType::Error,
                            self.flags.is_urgent(),
                            false,
                            self.flags.no_reply(),
                        ),
                        Properties::from_raw(Bytes::from(raw)),
                        Bytes::from(format!("invalid gzipped body: {e}")),
                    )
                }
            }
        } else {
            (self.flags, properties, body_region)
        };

        debug!(
            msg_type = flags.type_name(),
            msg_no = self.number,
            body_len = body.len(),
            "finished receiving message"
        );
        Ok(MessageIn {
            number: self.number,
            flags,
            properties,
            body,
            outgoing: self.outgoing.clone(),
        })
    }
}

/// A fully received message.
///
/// Clones are cheap and share the body and property storage. The message
/// carries a weak handle back to its connection so requests can be answered
/// from wherever the application carries them, as long as the connection is
/// still alive; all protocol state stays on the connection's own task.
#[derive(Clone)]
pub struct MessageIn {
    number: MsgNo,
    flags: FrameFlags,
    properties: Properties,
    body: Bytes,
    outgoing: Outgoing,
}

impl MessageIn {
    pub fn number(&self) -> MsgNo {
        self.number
    }

    pub fn message_type(&self) -> MessageType {
        self.flags.message_type().unwrap_or(MessageType::Request)
    }

    pub fn is_error(&self) -> bool {
        self.message_type() == MessageType::Error
    }

    pub fn is_response(&self) -> bool {
        self.message_type().is_response()
    }

    pub fn is_urgent(&self) -> bool {
        self.flags.is_urgent()
    }

    pub fn no_reply(&self) -> bool {
        self.flags.no_reply()
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// The value of a property, if present.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name)
    }

    /// A property parsed as a decimal integer; `None` when absent or not a
    /// well-formed number.
    pub fn int_property(&self, name: &str) -> Option<i64> {
        self.property(name)?.trim().parse().ok()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// For error messages, the error domain.
    pub fn error_domain(&self) -> Option<&str> {
        if self.is_error() {
            self.property("Error-Domain")
        } else {
            None
        }
    }

    /// For error messages, the error code (0 when unparseable).
    pub fn error_code(&self) -> i64 {
        if self.is_error() {
            self.int_property("Error-Code").unwrap_or(0)
        } else {
            0
        }
    }

    /// Send a response to this request. A builder still typed as a request
    /// is coerced into a response; the reply reuses this message's number.
    pub fn respond(&self, mut response: MessageBuilder) -> crate::Result<()> {
        if self.no_reply() {
            warn!(msg_no = self.number, "attempted to respond to a NoReply message");
            return Err(BlipError::NoReply);
        }
        if response.message_type == MessageType::Request {
            response.message_type = MessageType::Response;
        }
        let (flags, payload) = response.finish();
        self.outgoing
            .post(IoMessage::Queue(MessageOut::new(flags, payload, self.number, None)));
        Ok(())
    }

    /// Send an error response with the given domain, code, and message.
    pub fn respond_with_error(&self, domain: &str, code: i64, message: &str) {
        if self.no_reply() {
            return;
        }
        let mut response = MessageBuilder::new();
        response.make_error(domain, code, message);
        let _ = self.respond(response);
    }

    /// Decline a request nobody wants: answers with BLIP error 404.
    pub fn not_handled(&self) {
        self.respond_with_error(ERROR_DOMAIN_BLIP, 404, "no handler was found");
    }

    #[cfg(test)]
    pub(crate) fn test_stub(number: MsgNo, flags: FrameFlags, body: &[u8]) -> MessageIn {
        MessageIn {
            number,
            flags,
            properties: Properties::empty(),
            body: Bytes::copy_from_slice(body),
            outgoing: Outgoing::disconnected(),
        }
    }
}

impl fmt::Debug for MessageIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageIn")
            .field("number", &self.number)
            .field("type", &self.message_type())
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .finish()
    }
}

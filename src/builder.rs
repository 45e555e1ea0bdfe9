//! Outgoing message construction.

use bytes::Bytes;

use crate::frame::{put_uvarint, FrameFlags, MessageType, MAX_VARINT_LEN};
use crate::inbound::MessageIn;
use crate::properties::write_tokenized;
use crate::zip;

/// Builds a message: properties first, then body bytes.
///
/// Properties are serialized as they are added, so no more can be added once
/// body data has been written. The builder is consumed when the message is
/// handed to [`Connection::send_request`](crate::Connection::send_request) or
/// [`MessageIn::respond`].
///
/// ```
/// use blip::MessageBuilder;
///
/// let mut msg = MessageBuilder::with_profile("echo");
/// msg.add_property("Sender", "example");
/// msg.write(b"hello");
/// ```
pub struct MessageBuilder {
    pub message_type: MessageType,
    pub urgent: bool,
    pub compressed: bool,
    pub no_reply: bool,
    properties: Vec<u8>,
    body: Vec<u8>,
    wrote_body: bool,
}

impl MessageBuilder {
    pub fn new() -> MessageBuilder {
        MessageBuilder {
            message_type: MessageType::Request,
            urgent: false,
            compressed: false,
            no_reply: false,
            properties: Vec::new(),
            body: Vec::new(),
            wrote_body: false,
        }
    }

    /// A request builder with its `Profile` property already set.
    pub fn with_profile(profile: &str) -> MessageBuilder {
        let mut builder = MessageBuilder::new();
        builder.add_property("Profile", profile);
        builder
    }

    /// A response builder for `request`, inheriting its urgency.
    ///
    /// Panics if `request` is itself a response.
    pub fn reply_to(request: &MessageIn) -> MessageBuilder {
        assert!(
            !request.is_response(),
            "cannot build a reply to a response"
        );
        let mut builder = MessageBuilder::new();
        builder.message_type = MessageType::Response;
        builder.urgent = request.is_urgent();
        builder
    }

    /// Add a property. Panics once body data has been written.
    pub fn add_property(&mut self, name: &str, value: &str) -> &mut MessageBuilder {
        assert!(!self.wrote_body, "properties must precede the body");
        write_tokenized(&mut self.properties, name);
        write_tokenized(&mut self.properties, value);
        self
    }

    /// Add a property with an integer value.
    pub fn add_property_int(&mut self, name: &str, value: i64) -> &mut MessageBuilder {
        self.add_property(name, &value.to_string())
    }

    /// Turn this builder into an error message with the given domain, code,
    /// and human-readable body.
    pub fn make_error(&mut self, domain: &str, code: i64, message: &str) -> &mut MessageBuilder {
        assert!(!domain.is_empty(), "error domain is required");
        self.message_type = MessageType::Error;
        self.add_property("Error-Domain", domain);
        self.add_property_int("Error-Code", code);
        if !message.is_empty() {
            self.write(message.as_bytes());
        }
        self
    }

    /// Append body bytes.
    pub fn write(&mut self, data: &[u8]) -> &mut MessageBuilder {
        self.wrote_body = true;
        self.body.extend_from_slice(data);
        self
    }

    /// Serialize into the message payload: `uvarint(len) ‖ properties ‖ body`.
    ///
    /// When the Compressed flag is requested, the body is gzipped here; the
    /// compressed form is kept only if it is strictly smaller, otherwise the
    /// plain body ships and the flag is cleared.
    pub(crate) fn finish(self) -> (FrameFlags, Bytes) {
        let mut compressed = self.compressed;
        let mut body = self.body;
        if compressed {
            match zip::compress_body(&body) {
                Some(smaller) => body = smaller,
                None => compressed = false,
            }
        }
        let mut out =
            Vec::with_capacity(MAX_VARINT_LEN + self.properties.len() + body.len());
        put_uvarint(&mut out, self.properties.len() as u64);
        out.extend_from_slice(&self.properties);
        out.extend_from_slice(&body);
        let flags = FrameFlags::new(self.message_type, self.urgent, compressed, self.no_reply);
        (flags, Bytes::from(out))
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        MessageBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_uvarint;
    use crate::properties::Properties;

    fn split_payload(payload: &[u8]) -> (Properties, &[u8]) {
        let mut rest = payload;
        let props_len = read_uvarint(&mut rest).unwrap() as usize;
        let props = Properties::from_raw(Bytes::copy_from_slice(&rest[..props_len]));
        (props, &rest[props_len..])
    }

    #[test]
    fn payload_layout() {
        let mut builder = MessageBuilder::with_profile("echo");
        builder.add_property("Sender", "tests");
        builder.write(b"hello");
        let (flags, payload) = builder.finish();
        assert_eq!(flags.message_type(), Some(MessageType::Request));
        assert!(!flags.is_compressed());
        let (props, body) = split_payload(&payload);
        assert_eq!(props.get("Profile"), Some("echo"));
        assert_eq!(props.get("Sender"), Some("tests"));
        assert_eq!(body, b"hello");
    }

    #[test]
    fn empty_message_is_one_zero_byte() {
        let (_, payload) = MessageBuilder::new().finish();
        assert_eq!(&payload[..], &[0]);
    }

    #[test]
    fn error_builder_sets_type_and_properties() {
        let mut builder = MessageBuilder::new();
        builder.make_error("HTTP", 404, "not found");
        let (flags, payload) = builder.finish();
        assert_eq!(flags.message_type(), Some(MessageType::Error));
        let (props, body) = split_payload(&payload);
        assert_eq!(props.get("Error-Domain"), Some("HTTP"));
        assert_eq!(props.get("Error-Code"), Some("404"));
        assert_eq!(body, b"not found");
    }

    #[test]
    fn compressed_body_adopted_only_when_smaller() {
        let mut builder = MessageBuilder::new();
        builder.compressed = true;
        builder.write(&[b'A'; 100_000]);
        let (flags, payload) = builder.finish();
        assert!(flags.is_compressed());
        assert!(payload.len() < 10_000);

        let mut tiny = MessageBuilder::new();
        tiny.compressed = true;
        tiny.write(b"hi");
        let (flags, payload) = tiny.finish();
        // Two bytes cannot shrink; the flag is cleared and the body is plain.
        assert!(!flags.is_compressed());
        let (_, body) = split_payload(&payload);
        assert_eq!(body, b"hi");
    }

    #[test]
    fn flag_bits_follow_builder_fields() {
        let mut builder = MessageBuilder::new();
        builder.urgent = true;
        builder.no_reply = true;
        let (flags, _) = builder.finish();
        assert!(flags.is_urgent());
        assert!(flags.no_reply());
        assert!(!flags.more_coming());
    }

    #[test]
    #[should_panic(expected = "precede the body")]
    fn property_after_body_panics() {
        let mut builder = MessageBuilder::new();
        builder.write(b"body");
        builder.add_property("Too", "late");
    }
}

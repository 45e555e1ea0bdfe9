//! The per-connection driver.
//!
//! One tokio task owns every piece of protocol state: the outgoing queues,
//! the reassembly maps, the message counters, and the registered request
//! handlers. Everything else talks to it by posting an [`IoMessage`] to its
//! mailbox, which never blocks; the task interleaves mailbox traffic,
//! incoming transport frames, and bounded bursts of outgoing frames in one
//! select loop. No other code touches this state, so there is nothing to
//! lock.

use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionDelegate, ConnectionState, RequestHandler, StateCell};
use crate::error::{CloseReason, CloseStatus};
use crate::frame::{
    self, FrameFlags, MessageType, MsgNo, BIG_FRAME_SIZE, DEFAULT_FRAME_SIZE,
    FRAME_HEADER_RESERVE, MAX_VARINT_LEN,
};
use crate::inbound::{InboundMessage, MessageIn};
use crate::outbound::{Icebox, MessageOut, Outbox};
use crate::transport::{FrameTransport, TransportEvent};
use crate::ERROR_DOMAIN_BLIP;

/// Outgoing byte budget per writeable cycle. The write loop hands the
/// transport this much and then yields so reads and mailbox traffic keep
/// flowing.
pub(crate) const MAX_SEND_SIZE: usize = 50 * 1024;

/// Everything that can be posted to the driver's mailbox.
pub(crate) enum IoMessage {
    /// Queue an outgoing message (request, response, or ACK).
    Queue(MessageOut),
    /// Register or remove a per-profile request handler.
    SetHandler {
        profile: String,
        handler: Option<RequestHandler>,
    },
    /// Begin a graceful close.
    Close,
}

/// A weak handle that posts messages to a connection driver.
///
/// Posting never blocks. The handle is weak on purpose: received messages
/// and the driver's own internals carry one, and none of them keep the
/// connection alive. Only the [`Connection`](crate::Connection) holds the
/// strong mailbox sender, so dropping it lets the driver shut down. Once
/// the connection is gone a posted message is logged and dropped; callers
/// that care hold a response waiter, which resolves as closed when it is
/// dropped along with the message.
#[derive(Clone)]
pub(crate) struct Outgoing {
    tx: mpsc::WeakUnboundedSender<IoMessage>,
}

impl Outgoing {
    pub(crate) fn post(&self, message: IoMessage) {
        let Some(tx) = self.tx.upgrade() else {
            debug!("connection is gone; dropping posted message");
            return;
        };
        if tx.send(message).is_err() {
            debug!("connection is closed; dropping posted message");
        }
    }

    #[cfg(test)]
    pub(crate) fn disconnected() -> Outgoing {
        let (tx, _rx) = mpsc::unbounded_channel();
        Outgoing { tx: tx.downgrade() }
    }
}

/// Spawn the driver task for a connection. Returns the strong mailbox
/// sender; the driver closes when every clone of it is gone.
pub(crate) fn spawn<T: FrameTransport>(
    name: String,
    transport: T,
    delegate: Arc<dyn ConnectionDelegate>,
    state: StateCell,
) -> mpsc::UnboundedSender<IoMessage> {
    let (tx, rx) = mpsc::unbounded_channel();
    let driver = BlipIo {
        name,
        transport,
        mailbox: rx,
        mailbox_open: true,
        outgoing: Outgoing {
            tx: tx.downgrade(),
        },
        delegate,
        state,
        outbox: Outbox::new(),
        icebox: Icebox::new(),
        sent_bytes: 0,
        pending_requests: HashMap::new(),
        pending_responses: HashMap::new(),
        last_message_no: 0,
        num_requests_received: 0,
        frame_buf: Vec::with_capacity(2 * MAX_VARINT_LEN + BIG_FRAME_SIZE),
        request_handlers: HashMap::new(),
        closing: false,
    };
    tokio::spawn(driver.run());
    tx
}

struct BlipIo<T: FrameTransport> {
    name: String,
    transport: T,
    mailbox: mpsc::UnboundedReceiver<IoMessage>,
    mailbox_open: bool,
    outgoing: Outgoing,
    delegate: Arc<dyn ConnectionDelegate>,
    state: StateCell,

    outbox: Outbox,
    icebox: Icebox,
    sent_bytes: usize,
    /// Partially received peer requests, by number.
    pending_requests: HashMap<MsgNo, InboundMessage>,
    /// Reply slots for our own fully sent requests, by number.
    pending_responses: HashMap<MsgNo, InboundMessage>,
    last_message_no: MsgNo,
    num_requests_received: MsgNo,
    /// Scratch buffer reused for every outgoing frame.
    frame_buf: Vec<u8>,
    request_handlers: HashMap<String, RequestHandler>,
    closing: bool,
}

impl<T: FrameTransport> BlipIo<T> {
    async fn run(mut self) {
        self.state.set(ConnectionState::Connected);
        debug!(name = %self.name, "connection is open");
        if catch_unwind(AssertUnwindSafe(|| self.delegate.on_connect())).is_err() {
            warn!(name = %self.name, "connect delegate panicked");
        }
        let status = self.event_loop().await;
        self.finish(status);
    }

    async fn event_loop(&mut self) -> CloseStatus {
        loop {
            let can_write = !self.closing && !self.outbox.is_empty();
            tokio::select! {
                biased;

                message = self.mailbox.recv(), if self.mailbox_open => {
                    match message {
                        Some(message) => self.on_io_message(message).await,
                        None => {
                            // Every handle is gone; nobody can queue work or
                            // close us explicitly, so close now.
                            self.mailbox_open = false;
                            self.begin_close().await;
                        }
                    }
                }

                event = self.transport.recv() => {
                    match event {
                        TransportEvent::Frame { data, binary } => self.on_frame(data, binary),
                        TransportEvent::Closed(status) => return status,
                    }
                }

                _ = std::future::ready(()), if can_write => {
                    if let Err(e) = self.write_frames().await {
                        return CloseStatus::new(CloseReason::Network, 0, e.to_string());
                    }
                }
            }
        }
    }

    async fn on_io_message(&mut self, message: IoMessage) {
        match message {
            IoMessage::Queue(msg) => self.queue_message(msg),
            IoMessage::SetHandler { profile, handler } => match handler {
                Some(handler) => {
                    self.request_handlers.insert(profile, handler);
                }
                None => {
                    self.request_handlers.remove(&profile);
                }
            },
            IoMessage::Close => self.begin_close().await,
        }
    }

    async fn begin_close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.state.set(ConnectionState::Closing);
        debug!(name = %self.name, "closing connection");
        self.transport.close().await;
    }

    /// Add a message to the outgoing queue, assigning its number if it does
    /// not have one yet (responses and ACKs reuse the peer's number).
    fn queue_message(&mut self, mut msg: MessageOut) {
        if self.closing {
            debug!(name = %self.name, "connection is closing; dropping outgoing message");
            return;
        }
        if msg.number() == 0 {
            self.last_message_no += 1;
            msg.set_number(self.last_message_no);
        }
        if msg.is_ack() {
            trace!(
                msg_type = msg.message_type().name(),
                msg_no = msg.number(),
                "queueing ACK"
            );
        } else {
            debug!(
                msg_type = msg.message_type().name(),
                msg_no = msg.number(),
                flags = %msg.flags(),
                "queueing message"
            );
        }
        self.outbox.insert(msg);
    }

    /// One writeable cycle: send frames round-robin until the byte budget is
    /// spent or the outbox drains.
    async fn write_frames(&mut self) -> io::Result<()> {
        self.sent_bytes = 0;
        while self.sent_bytes < MAX_SEND_SIZE {
            let Some(mut msg) = self.outbox.pop() else {
                break;
            };
            // An enlarged frame unless an urgent competitor is waiting.
            let max_size = if msg.is_urgent() || !self.outbox.front_is_urgent() {
                BIG_FRAME_SIZE
            } else {
                DEFAULT_FRAME_SIZE
            };
            let (payload, flags) = msg.next_frame(max_size - FRAME_HEADER_RESERVE);
            frame::encode_frame(&mut self.frame_buf, msg.number(), flags, &payload);
            trace!(
                msg_type = flags.type_name(),
                msg_no = msg.number(),
                flags = %flags,
                from = msg.bytes_sent() - payload.len() as u64,
                to = msg.bytes_sent(),
                "sending frame"
            );
            self.transport.send(&self.frame_buf).await?;
            self.sent_bytes += self.frame_buf.len();

            if flags.more_coming() {
                if msg.needs_ack() {
                    trace!(msg_no = msg.number(), "freezing message until an ACK arrives");
                    self.icebox.freeze(msg);
                } else {
                    self.outbox.insert(msg);
                }
            } else {
                debug!(
                    msg_type = msg.message_type().name(),
                    msg_no = msg.number(),
                    "finished sending message"
                );
                if msg.expects_response() {
                    let waiter = msg.take_waiter();
                    self.pending_responses.insert(
                        msg.number(),
                        InboundMessage::expected_response(
                            msg.number(),
                            waiter,
                            self.outgoing.clone(),
                        ),
                    );
                }
            }
        }
        Ok(())
    }

    fn on_frame(&mut self, data: Bytes, binary: bool) {
        if !binary {
            warn!(name = %self.name, "ignoring non-binary transport message");
            return;
        }
        let Some((msg_no, flags, payload)) = frame::decode_frame(&data) else {
            warn!(name = %self.name, "dropping frame with an illegal header");
            return;
        };
        trace!(
            msg_type = flags.type_name(),
            msg_no,
            flags = %flags,
            len = payload.len(),
            "received frame"
        );
        let Some(message_type) = flags.message_type() else {
            warn!(msg_no, bits = flags.bits(), "dropping frame of unknown type");
            return;
        };
        match message_type {
            MessageType::AckRequest | MessageType::AckResponse => {
                self.received_ack(msg_no, message_type == MessageType::AckResponse, payload);
            }
            MessageType::Request => self.on_request_frame(msg_no, flags, payload),
            MessageType::Response | MessageType::Error => {
                self.on_response_frame(msg_no, flags, payload);
            }
        }
    }

    fn on_request_frame(&mut self, msg_no: MsgNo, flags: FrameFlags, payload: &[u8]) {
        let incoming = if let Some(existing) = self.pending_requests.remove(&msg_no) {
            existing
        } else if msg_no == self.num_requests_received + 1 {
            // New request; numbers must arrive contiguously.
            self.num_requests_received = msg_no;
            InboundMessage::request(msg_no, self.outgoing.clone())
        } else {
            warn!(
                msg_no,
                expected = self.num_requests_received + 1,
                "dropping request with a bad number"
            );
            return;
        };
        self.apply_frame(incoming, flags, payload, true);
    }

    fn on_response_frame(&mut self, msg_no: MsgNo, flags: FrameFlags, payload: &[u8]) {
        let Some(incoming) = self.pending_responses.remove(&msg_no) else {
            warn!(msg_no, "dropping unexpected response");
            return;
        };
        self.apply_frame(incoming, flags, payload, false);
    }

    /// Feed one frame into a partially received message, emitting an ACK at
    /// the flow-control cadence and dispatching the message if this frame
    /// completed it.
    fn apply_frame(
        &mut self,
        mut incoming: InboundMessage,
        flags: FrameFlags,
        payload: &[u8],
        is_request: bool,
    ) {
        if let Some(cumulative) = incoming.received_frame(payload, flags) {
            let ack = MessageOut::ack(incoming.number(), !is_request, cumulative);
            self.queue_message(ack);
        }
        if flags.more_coming() {
            let map = if is_request {
                &mut self.pending_requests
            } else {
                &mut self.pending_responses
            };
            map.insert(incoming.number(), incoming);
            return;
        }

        let number = incoming.number();
        let waiter = incoming.take_waiter();
        match incoming.finish() {
            Ok(message) => {
                if is_request {
                    self.handle_request(message);
                } else {
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(message.clone());
                    }
                    let delegate = &self.delegate;
                    if catch_unwind(AssertUnwindSafe(|| {
                        delegate.on_response_received(message)
                    }))
                    .is_err()
                    {
                        warn!(msg_no = number, "response delegate panicked");
                    }
                }
            }
            Err(e) => {
                warn!(msg_no = number, error = %e, "dropping malformed message");
            }
        }
    }

    /// Route a completed request to its profile handler, or to the delegate
    /// when no handler is registered. A handler that fails or panics gets an
    /// automatic BLIP/501 error answer.
    fn handle_request(&mut self, request: MessageIn) {
        let profile = request.property("Profile").map(str::to_owned);
        let handler = profile
            .as_deref()
            .and_then(|p| self.request_handlers.get(p));

        let outcome = match handler {
            Some(handler) => {
                catch_unwind(AssertUnwindSafe(|| handler(request.clone()))).map(Some)
            }
            None => {
                let delegate = &self.delegate;
                catch_unwind(AssertUnwindSafe(|| {
                    delegate.on_request_received(request.clone())
                }))
                .map(|_| None)
            }
        };
        match outcome {
            Ok(None) | Ok(Some(Ok(()))) => {}
            Ok(Some(Err(e))) => {
                warn!(
                    msg_no = request.number(),
                    profile = profile.as_deref().unwrap_or(""),
                    error = %e,
                    "request handler failed"
                );
                request.respond_with_error(ERROR_DOMAIN_BLIP, 501, "the request handler failed");
            }
            Err(_) => {
                warn!(
                    msg_no = request.number(),
                    profile = profile.as_deref().unwrap_or(""),
                    "request handler panicked"
                );
                request.respond_with_error(ERROR_DOMAIN_BLIP, 501, "the request handler failed");
            }
        }
    }

    /// Credit an ACK against the outgoing message it names, thawing it if it
    /// was frozen and may proceed again.
    fn received_ack(&mut self, msg_no: MsgNo, on_response: bool, payload: &[u8]) {
        let mut body = payload;
        let Some(byte_count) = frame::read_uvarint(&mut body) else {
            warn!(msg_no, "could not parse ACK body");
            return;
        };
        if let Some(msg) = self.outbox.find_mut(msg_no, on_response) {
            msg.received_ack(byte_count);
            return;
        }
        if let Some(index) = self.icebox.position(msg_no, on_response) {
            let frozen = self.icebox.get_mut(index);
            frozen.received_ack(byte_count);
            if !frozen.needs_ack() {
                trace!(msg_no, "thawing message");
                let msg = self.icebox.thaw(index);
                self.outbox.insert(msg);
            }
        }
        // An ACK for a finished message needs no action.
    }

    fn finish(mut self, status: CloseStatus) {
        debug!(name = %self.name, status = %status, "connection closed");
        self.state.set(if status.is_normal() {
            ConnectionState::Closed
        } else {
            ConnectionState::Disconnected
        });
        // TODO: Call error handlers for any unfinished outgoing messages.
        self.outbox.clear();
        self.icebox.clear();
        self.pending_requests.clear();
        self.pending_responses.clear();
        self.request_handlers.clear();
        if catch_unwind(AssertUnwindSafe(|| self.delegate.on_close(status))).is_err() {
            warn!(name = %self.name, "close delegate panicked");
        }
    }
}

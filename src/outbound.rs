//! Outgoing messages and the scheduling queues.
//!
//! A [`MessageOut`] owns its fully serialized payload and hands out one
//! frame-sized slice per scheduling turn. The [`Outbox`] round-robins the
//! active messages so many large transfers interleave fairly; the [`Icebox`]
//! parks messages that have outrun the peer's ACKs until flow control lets
//! them continue. A message lives in at most one of the two at any moment
//! because it is moved, never shared.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::frame::{put_uvarint, FrameFlags, MessageType, MsgNo, MAX_VARINT_LEN};
use crate::inbound::MessageIn;

/// How many bytes a message may have on the wire without an ACK before it is
/// frozen. Peers must agree on compatible flow-control constants.
pub(crate) const MAX_UNACKED_BYTES: u64 = 128_000;

/// An outgoing message: a request, response, error, or ACK.
pub(crate) struct MessageOut {
    number: MsgNo,
    flags: FrameFlags,
    payload: Bytes,
    bytes_sent: u64,
    unacked_bytes: u64,
    /// Resolves the caller's response future when the reply arrives.
    waiter: Option<oneshot::Sender<MessageIn>>,
}

impl MessageOut {
    pub(crate) fn new(
        flags: FrameFlags,
        payload: Bytes,
        number: MsgNo,
        waiter: Option<oneshot::Sender<MessageIn>>,
    ) -> MessageOut {
        MessageOut {
            number,
            flags,
            payload,
            bytes_sent: 0,
            unacked_bytes: 0,
            waiter,
        }
    }

    /// An ACK for a peer message, carrying the cumulative received byte
    /// count. ACKs are urgent, expect no reply, and skip the properties
    /// block entirely.
    pub(crate) fn ack(acked: MsgNo, on_response: bool, byte_count: u64) -> MessageOut {
        let message_type = if on_response {
            MessageType::AckResponse
        } else {
            MessageType::AckRequest
        };
        let mut payload = Vec::with_capacity(MAX_VARINT_LEN);
        put_uvarint(&mut payload, byte_count);
        MessageOut::new(
            FrameFlags::new(message_type, true, false, true),
            Bytes::from(payload),
            acked,
            None,
        )
    }

    pub(crate) fn number(&self) -> MsgNo {
        self.number
    }

    pub(crate) fn set_number(&mut self, number: MsgNo) {
        self.number = number;
    }

    pub(crate) fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub(crate) fn message_type(&self) -> MessageType {
        self.flags.message_type().unwrap_or(MessageType::Request)
    }

    pub(crate) fn is_urgent(&self) -> bool {
        self.flags.is_urgent()
    }

    pub(crate) fn is_ack(&self) -> bool {
        self.message_type().is_ack()
    }

    /// Responses and errors share the peer request's number space.
    pub(crate) fn is_response_kind(&self) -> bool {
        self.message_type().is_response()
    }

    /// True for a request whose sender wants an answer.
    pub(crate) fn expects_response(&self) -> bool {
        self.message_type() == MessageType::Request && !self.flags.no_reply()
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// The next slice of the payload, at most `max_payload` bytes, plus the
    /// flag byte for its frame. MoreComing is set iff bytes remain after it.
    pub(crate) fn next_frame(&mut self, max_payload: usize) -> (Bytes, FrameFlags) {
        let offset = self.bytes_sent as usize;
        let size = max_payload.min(self.payload.len() - offset);
        let chunk = self.payload.slice(offset..offset + size);
        self.bytes_sent += size as u64;
        self.unacked_bytes += size as u64;
        let flags = if (self.bytes_sent as usize) < self.payload.len() {
            self.flags.with_more_coming()
        } else {
            self.flags.without_more_coming()
        };
        (chunk, flags)
    }

    /// Record the peer's cumulative received byte count.
    pub(crate) fn received_ack(&mut self, byte_count: u64) {
        if byte_count <= self.bytes_sent {
            self.unacked_bytes = self.unacked_bytes.min(self.bytes_sent - byte_count);
        }
    }

    /// True once enough unacknowledged bytes are in flight that sending more
    /// would outrun the peer.
    pub(crate) fn needs_ack(&self) -> bool {
        self.unacked_bytes >= MAX_UNACKED_BYTES
    }

    pub(crate) fn take_waiter(&mut self) -> Option<oneshot::Sender<MessageIn>> {
        self.waiter.take()
    }
}

/// The active outgoing queue. Each member sends one frame per turn.
#[derive(Default)]
pub(crate) struct Outbox {
    queue: VecDeque<MessageOut>,
}

impl Outbox {
    pub(crate) fn new() -> Outbox {
        Outbox {
            queue: VecDeque::with_capacity(10),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn pop(&mut self) -> Option<MessageOut> {
        self.queue.pop_front()
    }

    /// True when the head of the queue is urgent.
    pub(crate) fn front_is_urgent(&self) -> bool {
        self.queue.front().map(MessageOut::is_urgent).unwrap_or(false)
    }

    pub(crate) fn find_mut(&mut self, number: MsgNo, is_response: bool) -> Option<&mut MessageOut> {
        self.queue
            .iter_mut()
            .find(|m| m.number() == number && m.is_response_kind() == is_response)
    }

    /// Queue a message for its next (or first) frame.
    ///
    /// Regular messages append to the tail. An urgent message goes after
    /// the last urgent one, normally keeping one regular message in between
    /// so regular traffic keeps making progress; with no urgent message
    /// queued it lands right behind the head. Exception: an urgent message
    /// that has not sent its first frame steps ahead of regular messages
    /// that have not sent theirs either, so the first frames of urgent
    /// messages hit the wire in the order they were queued.
    pub(crate) fn insert(&mut self, msg: MessageOut) {
        if !msg.is_urgent() || self.queue.is_empty() {
            self.queue.push_back(msg);
            return;
        }
        let at = self.urgent_insert_index(&msg);
        self.queue.insert(at, msg);
    }

    fn urgent_insert_index(&self, msg: &MessageOut) -> usize {
        let len = self.queue.len();
        let mut stepped_ahead: Option<usize> = None;
        for j in (0..len).rev() {
            let other = &self.queue[j];
            if other.is_urgent() {
                let with_gap = (j + 2).min(len);
                let at = match stepped_ahead {
                    // The gap is waived when the message that would fill it
                    // has not started sending.
                    Some(m) => m.max(j + 1).min(with_gap),
                    None => with_gap,
                };
                return at.max(1);
            }
            if msg.bytes_sent() == 0 && other.bytes_sent() == 0 {
                stepped_ahead = Some(j);
            }
            // Regular messages already mid-flight are scanned past; urgent
            // traffic is allowed to jump ahead of their remaining frames.
        }
        // No urgent message queued: right behind the head.
        stepped_ahead.unwrap_or(1).max(1)
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
    }

    #[cfg(test)]
    fn numbers(&self) -> Vec<MsgNo> {
        self.queue.iter().map(MessageOut::number).collect()
    }
}

/// Messages frozen while they wait for the peer to acknowledge. Thawing
/// happens in whatever order ACKs arrive.
#[derive(Default)]
pub(crate) struct Icebox {
    frozen: Vec<MessageOut>,
}

impl Icebox {
    pub(crate) fn new() -> Icebox {
        Icebox { frozen: Vec::new() }
    }

    pub(crate) fn freeze(&mut self, msg: MessageOut) {
        debug_assert!(self
            .position(msg.number(), msg.is_response_kind())
            .is_none());
        self.frozen.push(msg);
    }

    pub(crate) fn position(&self, number: MsgNo, is_response: bool) -> Option<usize> {
        self.frozen
            .iter()
            .position(|m| m.number() == number && m.is_response_kind() == is_response)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> &mut MessageOut {
        &mut self.frozen[index]
    }

    pub(crate) fn thaw(&mut self, index: usize) -> MessageOut {
        self.frozen.remove(index)
    }

    pub(crate) fn clear(&mut self) {
        self.frozen.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.frozen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_uvarint;

    fn message(number: MsgNo, urgent: bool, payload_len: usize) -> MessageOut {
        let flags = FrameFlags::new(MessageType::Request, urgent, false, false);
        MessageOut::new(flags, Bytes::from(vec![0u8; payload_len]), number, None)
    }

    #[test]
    fn frame_slices_cover_payload_exactly() {
        let mut msg = message(1, false, 10_000);
        let mut total = 0;
        let mut final_frames = 0;
        loop {
            let (chunk, flags) = msg.next_frame(4096);
            total += chunk.len();
            if !flags.more_coming() {
                final_frames += 1;
                break;
            }
        }
        assert_eq!(total, 10_000);
        assert_eq!(final_frames, 1);
        assert_eq!(msg.bytes_sent(), 10_000);
    }

    #[test]
    fn more_coming_set_on_all_but_last() {
        let mut msg = message(1, false, 8192);
        let (_, f1) = msg.next_frame(4096);
        assert!(f1.more_coming());
        let (_, f2) = msg.next_frame(4096);
        assert!(!f2.more_coming());
    }

    #[test]
    fn ack_accounting() {
        let mut msg = message(1, false, 400_000);
        while msg.bytes_sent() < MAX_UNACKED_BYTES {
            msg.next_frame(16_384);
        }
        assert!(msg.needs_ack());
        // Peer has received all but the last 10 bytes.
        msg.received_ack(msg.bytes_sent() - 10);
        assert!(!msg.needs_ack());
        // A stale ACK beyond what was sent is ignored.
        msg.received_ack(msg.bytes_sent() + 1_000_000);
        assert!(!msg.needs_ack());
    }

    #[test]
    fn ack_frames_are_urgent_noreply_varints() {
        let mut ack = MessageOut::ack(7, true, 50_000);
        assert_eq!(ack.number(), 7);
        assert_eq!(ack.message_type(), MessageType::AckResponse);
        assert!(ack.is_ack());
        let (payload, flags) = ack.next_frame(4096);
        assert!(flags.is_urgent());
        assert!(flags.no_reply());
        assert!(!flags.more_coming());
        let mut slice = &payload[..];
        assert_eq!(read_uvarint(&mut slice), Some(50_000));
    }

    #[test]
    fn regular_messages_append_in_order() {
        let mut outbox = Outbox::new();
        outbox.insert(message(1, false, 10));
        outbox.insert(message(2, false, 10));
        outbox.insert(message(3, false, 10));
        assert_eq!(outbox.numbers(), [1, 2, 3]);
    }

    #[test]
    fn urgent_overtakes_unsent_regular_traffic() {
        // Head mid-flight, two regular messages not yet started: the urgent
        // newcomer lands right behind the head.
        let mut outbox = Outbox::new();
        let mut head = message(1, false, 100_000);
        head.next_frame(16_384);
        outbox.insert(head);
        outbox.insert(message(2, false, 100_000));
        outbox.insert(message(3, false, 100_000));
        outbox.insert(message(4, true, 100_000));
        assert_eq!(outbox.numbers(), [1, 4, 2, 3]);
    }

    #[test]
    fn urgent_never_displaces_the_head() {
        let mut outbox = Outbox::new();
        outbox.insert(message(1, false, 10));
        outbox.insert(message(2, false, 10));
        outbox.insert(message(3, true, 10));
        assert_eq!(outbox.numbers(), [1, 3, 2]);
    }

    #[test]
    fn urgent_follows_last_urgent_with_a_gap() {
        let mut outbox = Outbox::new();
        let mut head = message(1, false, 100_000);
        head.next_frame(16_384);
        outbox.insert(head);
        let mut urgent = message(2, true, 100_000);
        urgent.next_frame(16_384);
        outbox.insert(urgent);
        let mut tail = message(3, false, 100_000);
        tail.next_frame(16_384);
        outbox.insert(tail);
        // After the last urgent (#2), skipping one regular message (#3).
        outbox.insert(message(4, true, 100_000));
        assert_eq!(outbox.numbers(), [1, 2, 3, 4]);
    }

    #[test]
    fn urgent_first_frames_stay_chronological() {
        let mut outbox = Outbox::new();
        outbox.insert(message(1, true, 100_000));
        outbox.insert(message(2, true, 100_000));
        assert_eq!(outbox.numbers(), [1, 2]);
    }

    #[test]
    fn urgent_jumps_mid_flight_regular_traffic_behind_the_head() {
        let mut outbox = Outbox::new();
        let mut a = message(1, false, 100_000);
        a.next_frame(16_384);
        let mut b = message(2, false, 100_000);
        b.next_frame(16_384);
        outbox.insert(a);
        outbox.insert(b);
        outbox.insert(message(3, true, 100_000));
        assert_eq!(outbox.numbers(), [1, 3, 2]);
    }

    #[test]
    fn gap_after_urgent_is_waived_for_unsent_messages() {
        let mut outbox = Outbox::new();
        outbox.insert(message(1, true, 100_000));
        outbox.insert(message(2, false, 100_000));
        outbox.insert(message(3, false, 100_000));
        // Queue is [u1, n2, n3], none started: the newcomer goes directly
        // after the last urgent message because n2 has not sent a frame.
        outbox.insert(message(4, true, 100_000));
        assert_eq!(outbox.numbers(), [1, 4, 2, 3]);
    }

    #[test]
    fn find_distinguishes_requests_from_responses() {
        let mut outbox = Outbox::new();
        outbox.insert(message(5, false, 10));
        let response = MessageOut::new(
            FrameFlags::new(MessageType::Response, false, false, false),
            Bytes::from_static(&[0]),
            5,
            None,
        );
        outbox.insert(response);
        assert!(outbox.find_mut(5, false).is_some());
        assert!(outbox.find_mut(5, true).is_some());
        assert!(outbox.find_mut(6, false).is_none());
    }

    #[test]
    fn icebox_freeze_and_thaw() {
        let mut icebox = Icebox::new();
        icebox.freeze(message(1, false, 10));
        icebox.freeze(message(2, false, 10));
        assert_eq!(icebox.len(), 2);
        let idx = icebox.position(1, false).unwrap();
        let thawed = icebox.thaw(idx);
        assert_eq!(thawed.number(), 1);
        assert_eq!(icebox.len(), 1);
        assert!(icebox.position(1, false).is_none());
    }
}

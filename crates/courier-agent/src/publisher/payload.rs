//! In-flight payloads: an ordered batch of events under one nonce.
//!
//! The wire body of a payload is
//! `nonce (16 bytes) ‖ count (u32) ‖ count × (length (u32) ‖ event JSON)`.
//! The full frame is built once at construction and cached, so a
//! retransmission sends byte-identical data under the original nonce and a
//! late acknowledgement still matches.

use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use tokio::time::Instant;

use crate::event::{Event, FileId};
use crate::transport::frame::{self, NONCE_LEN, TAG_JDAT};

/// One transmitted batch awaiting acknowledgement.
pub struct Payload {
    nonce: [u8; NONCE_LEN],
    events: Vec<Event>,
    /// Index of the first event not yet acknowledged.
    first_unacked: usize,
    /// When the payload was last handed to the transport.
    pub sent_at: Instant,
    /// Transmission attempts beyond the first.
    pub retries: u32,
    wire: Bytes,
}

impl Payload {
    /// Assigns a random nonce and encodes the frame.
    #[must_use]
    pub fn new(events: Vec<Event>) -> Self {
        let nonce: [u8; NONCE_LEN] = rand::thread_rng().gen();
        let wire = encode_jdat(nonce, &events);
        Self {
            nonce,
            events,
            first_unacked: 0,
            sent_at: Instant::now(),
            retries: 0,
            wire,
        }
    }

    #[must_use]
    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        self.nonce
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The complete frame, ready for the transport.
    #[must_use]
    pub fn wire(&self) -> Bytes {
        self.wire.clone()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.first_unacked >= self.events.len()
    }

    /// Stamps a (re)transmission.
    pub fn mark_sent(&mut self, resend: bool) {
        self.sent_at = Instant::now();
        if resend {
            self.retries += 1;
        }
    }

    /// Applies an acknowledgement sequence: the first `sequence` events are
    /// acknowledged. Sequences are clamped to the event count and treated
    /// as monotonically non-decreasing, so a stale or duplicate ack is a
    /// no-op. Returns the range of newly acknowledged events.
    pub fn ack(&mut self, sequence: u32) -> Option<Range<usize>> {
        let upto = (sequence as usize).min(self.events.len());
        if upto <= self.first_unacked {
            return None;
        }
        let range = self.first_unacked..upto;
        self.first_unacked = upto;
        Some(range)
    }

    /// The highest acknowledged offset per distinct file within `range`,
    /// in first-appearance order. Events of one file appear in offset
    /// order, so the last occurrence carries the highest offset.
    #[must_use]
    pub fn acked_offsets(&self, range: Range<usize>) -> Vec<(FileId, u64)> {
        let mut offsets: Vec<(FileId, u64)> = Vec::new();
        for event in &self.events[range] {
            match offsets.iter_mut().find(|(id, _)| *id == event.file_id) {
                Some((_, offset)) => *offset = event.offset,
                None => offsets.push((event.file_id, event.offset)),
            }
        }
        offsets
    }

    /// Events within `range`, for ack-cell advancement.
    #[must_use]
    pub fn events_in(&self, range: Range<usize>) -> &[Event] {
        &self.events[range]
    }
}

fn encode_jdat(nonce: [u8; NONCE_LEN], events: &[Event]) -> Bytes {
    let bodies: Vec<Vec<u8>> = events.iter().map(Event::to_wire).collect();
    let payload_len =
        NONCE_LEN + 4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>();

    let mut payload = BytesMut::with_capacity(payload_len);
    payload.put_slice(&nonce);
    payload.put_u32(events.len() as u32);
    for body in &bodies {
        payload.put_u32(body.len() as u32);
        payload.put_slice(body);
    }
    frame::encode(TAG_JDAT, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AckCell;
    use crate::transport::frame::{decode_jdat, parse_header, HEADER_LEN};
    use serde_json::Map;

    fn create_test_events(file_id: FileId, offsets: &[u64]) -> Vec<Event> {
        let ack = AckCell::new();
        offsets
            .iter()
            .enumerate()
            .map(|(i, &offset)| {
                Event::new(
                    file_id,
                    ack.clone(),
                    "host",
                    "/tmp/file.log",
                    offset,
                    i as u64 + 1,
                    format!("line at {offset}"),
                    &Map::new(),
                )
            })
            .collect()
    }

    #[test]
    fn test_wire_frame_decodes_back() {
        let payload = Payload::new(create_test_events(1, &[2, 4, 6]));
        let wire = payload.wire();

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&wire[..HEADER_LEN]);
        let (tag, len) = parse_header(&header).unwrap();
        assert_eq!(tag, TAG_JDAT);
        assert_eq!(len, wire.len() - HEADER_LEN);

        let (nonce, bodies) = decode_jdat(&wire[HEADER_LEN..]).unwrap();
        assert_eq!(nonce, payload.nonce());
        assert_eq!(bodies.len(), 3);
        let first: serde_json::Value = serde_json::from_slice(&bodies[0]).unwrap();
        assert_eq!(first["offset"], 2);
    }

    #[test]
    fn test_wire_is_stable_across_resends() {
        let mut payload = Payload::new(create_test_events(1, &[2]));
        let before = payload.wire();
        payload.mark_sent(true);
        assert_eq!(before, payload.wire());
        assert_eq!(payload.retries, 1);
    }

    #[test]
    fn test_partial_ack_advances() {
        let mut payload = Payload::new(create_test_events(1, &[2, 4, 6]));
        let range = payload.ack(2).unwrap();
        assert_eq!(range, 0..2);
        assert!(!payload.is_complete());

        let range = payload.ack(3).unwrap();
        assert_eq!(range, 2..3);
        assert!(payload.is_complete());
    }

    #[test]
    fn test_stale_ack_is_no_op() {
        let mut payload = Payload::new(create_test_events(1, &[2, 4, 6]));
        payload.ack(2).unwrap();
        assert!(payload.ack(2).is_none());
        assert!(payload.ack(1).is_none());
    }

    #[test]
    fn test_ack_clamped_to_event_count() {
        let mut payload = Payload::new(create_test_events(1, &[2]));
        let range = payload.ack(100).unwrap();
        assert_eq!(range, 0..1);
        assert!(payload.is_complete());
    }

    #[test]
    fn test_acked_offsets_highest_per_file() {
        let mut events = create_test_events(1, &[2, 4]);
        events.extend(create_test_events(2, &[10, 20]));
        let mut payload = Payload::new(events);

        let range = payload.ack(3).unwrap();
        let offsets = payload.acked_offsets(range);
        assert_eq!(offsets, vec![(1, 4), (2, 10)]);

        let range = payload.ack(4).unwrap();
        let offsets = payload.acked_offsets(range);
        assert_eq!(offsets, vec![(2, 20)]);
    }

    #[test]
    fn test_nonces_are_distinct() {
        let a = Payload::new(create_test_events(1, &[1]));
        let b = Payload::new(create_test_events(1, &[1]));
        assert_ne!(a.nonce(), b.nonce());
    }
}

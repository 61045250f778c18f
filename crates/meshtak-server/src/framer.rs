//! Stream framer for the CoT XML wire protocol.
//!
//! TAK Protocol v0 is a plain XML stream; message boundaries only exist at
//! `</event>`. The framer accumulates arbitrary byte chunks and yields
//! complete `[<event, </event>]` slices, discarding anything that precedes
//! an orphan close tag.

use bytes::{Buf, BytesMut};
use tracing::warn;

const OPEN_TAG: &[u8] = b"<event";
const CLOSE_TAG: &[u8] = b"</event>";

pub struct EventFramer {
    buf: BytesMut,
    max_bytes: usize,
}

impl EventFramer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            max_bytes,
        }
    }

    /// Append received bytes. The buffer is cleared outright when it grows
    /// past the cap without producing a complete event.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        if self.buf.len() > self.max_bytes {
            warn!(
                buffered = self.buf.len(),
                "read buffer exceeded cap without a complete event, clearing"
            );
            self.buf.clear();
        }
    }

    /// Extract the next complete event, if any.
    pub fn next_event(&mut self) -> Option<Vec<u8>> {
        loop {
            let close = find(&self.buf, CLOSE_TAG)?;
            let end = close + CLOSE_TAG.len();
            match rfind(&self.buf[..close], OPEN_TAG) {
                Some(start) => {
                    let message = self.buf[start..end].to_vec();
                    self.buf.advance(end);
                    return Some(message);
                }
                None => {
                    // Close tag with no matching open: drop it and its prefix.
                    self.buf.advance(end);
                }
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT_A: &[u8] = br#"<event uid="A" type="t"><point lat="0" lon="0" hae="0" ce="0" le="0"/></event>"#;
    const EVENT_B: &[u8] = br#"<event uid="B" type="t"><detail/></event>"#;

    fn framer() -> EventFramer {
        EventFramer::new(crate::MAX_EVENT_BYTES)
    }

    #[test]
    fn test_single_event() {
        let mut framer = framer();
        framer.push(EVENT_A);
        assert_eq!(framer.next_event().as_deref(), Some(EVENT_A));
        assert!(framer.next_event().is_none());
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_multiple_events_one_chunk() {
        let mut framer = framer();
        let mut stream = Vec::new();
        stream.extend_from_slice(EVENT_A);
        stream.extend_from_slice(b"\n  ");
        stream.extend_from_slice(EVENT_B);
        framer.push(&stream);

        assert_eq!(framer.next_event().as_deref(), Some(EVENT_A));
        assert_eq!(framer.next_event().as_deref(), Some(EVENT_B));
        assert!(framer.next_event().is_none());
    }

    #[test]
    fn test_arbitrary_chunk_boundaries() {
        // Cut the concatenated stream at every possible byte boundary.
        let mut stream = Vec::new();
        stream.extend_from_slice(EVENT_A);
        stream.extend_from_slice(EVENT_B);

        for cut in 0..=stream.len() {
            let mut framer = framer();
            framer.push(&stream[..cut]);
            let mut events = Vec::new();
            while let Some(ev) = framer.next_event() {
                events.push(ev);
            }
            framer.push(&stream[cut..]);
            while let Some(ev) = framer.next_event() {
                events.push(ev);
            }
            assert_eq!(events.len(), 2, "cut at {}", cut);
            assert_eq!(events[0], EVENT_A);
            assert_eq!(events[1], EVENT_B);
        }
    }

    #[test]
    fn test_xml_declaration_prefix_is_stripped() {
        let mut framer = framer();
        framer.push(br#"<?xml version="1.0" encoding="UTF-8"?>"#);
        framer.push(EVENT_A);
        assert_eq!(framer.next_event().as_deref(), Some(EVENT_A));
    }

    #[test]
    fn test_orphan_close_tag_dropped() {
        let mut framer = framer();
        framer.push(b"garbage</event>");
        framer.push(EVENT_B);
        assert_eq!(framer.next_event().as_deref(), Some(EVENT_B));
        assert!(framer.next_event().is_none());
    }

    #[test]
    fn test_buffer_cap_clears() {
        let mut framer = EventFramer::new(64);
        framer.push(&b"x".repeat(100));
        assert_eq!(framer.buffered(), 0);

        // Still usable afterwards.
        framer.push(EVENT_B);
        assert_eq!(framer.next_event().as_deref(), Some(EVENT_B));
    }

    #[test]
    fn test_incomplete_event_waits() {
        let mut framer = framer();
        framer.push(br#"<event uid="A" type="t"><point"#);
        assert!(framer.next_event().is_none());
        assert!(framer.buffered() > 0);
    }
}

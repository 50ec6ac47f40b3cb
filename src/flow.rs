//! Receive side of a reliable flow.
//!
//! A flow buffers out-of-order fragments by stage, drains the contiguous
//! prefix in order, reassembles multi-fragment messages along their
//! BEFORE/AFTER span and reports what it still misses so the session can
//! acknowledge precisely.

use std::collections::BTreeMap;

use crate::message::frag_flags;
use crate::stream::StreamKind;

#[derive(Debug)]
struct Fragment {
    flags: u8,
    payload: Vec<u8>,
}

/// One unidirectional inbound flow within a session.
#[derive(Debug)]
pub struct Flow {
    id: u64,
    signature: Vec<u8>,
    kind: StreamKind,
    /// Writer id the peer wants answers on (full-duplex header part).
    writer_ref: Option<u64>,
    /// Next stage to deliver. Everything below has been handed over.
    next_stage: u64,
    /// Out-of-order fragments at or above `next_stage`.
    fragments: BTreeMap<u64, Fragment>,
    /// Partial message assembly across a WITH_AFTER span.
    partial: Vec<u8>,
    /// Stage carrying the END bit, once seen.
    end_stage: Option<u64>,
    /// Dirty marker: stages arrived since the last ack was produced.
    ack_due: bool,
}

impl Flow {
    pub fn new(id: u64, signature: Vec<u8>, kind: StreamKind, writer_ref: Option<u64>) -> Self {
        Self {
            id,
            signature,
            kind,
            writer_ref,
            next_stage: 1,
            fragments: BTreeMap::new(),
            partial: Vec::new(),
            end_stage: None,
            ack_due: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &StreamKind {
        &self.kind
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn writer_ref(&self) -> Option<u64> {
        self.writer_ref
    }

    /// Accept one fragment. Completed messages are returned in delivery
    /// order; duplicates and already-delivered stages change nothing.
    pub fn receive(&mut self, stage: u64, flags: u8, payload: &[u8]) -> Vec<Vec<u8>> {
        if stage == 0 || stage < self.next_stage {
            trace!("flow {} dupe stage {}", self.id, stage);
            return Vec::new();
        }

        if flags & frag_flags::END != 0 {
            self.end_stage = Some(stage);
        }

        // Second arrival of a buffered stage is a dupe too.
        if self.fragments.contains_key(&stage) {
            trace!("flow {} dupe buffered stage {}", self.id, stage);
            return Vec::new();
        }

        self.fragments.insert(
            stage,
            Fragment {
                flags,
                payload: payload.to_vec(),
            },
        );
        self.ack_due = true;

        self.drain()
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut complete = Vec::new();

        while let Some(fragment) = self.fragments.remove(&self.next_stage) {
            self.next_stage += 1;

            if fragment.flags & frag_flags::ABANDON != 0 {
                // The stage counts but the sender gave up on the message.
                self.partial.clear();
                continue;
            }

            let follows = fragment.flags & frag_flags::WITH_BEFORE != 0;
            let continues = fragment.flags & frag_flags::WITH_AFTER != 0;

            if follows && self.partial.is_empty() {
                // Tail of a message whose head was abandoned.
                continue;
            }

            if !follows {
                self.partial.clear();
            }
            self.partial.extend_from_slice(&fragment.payload);

            if !continues {
                complete.push(std::mem::take(&mut self.partial));
            }
        }

        complete
    }

    /// Cumulative ack level: the highest stage delivered.
    pub fn cumulative(&self) -> u64 {
        self.next_stage - 1
    }

    /// `(lost, received)` runs describing buffered stages past the
    /// cumulative level.
    pub fn ack_ranges(&self) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        let mut expected = self.next_stage;
        let mut run_start: Option<u64> = None;
        let mut run_len = 0u64;

        for &stage in self.fragments.keys() {
            match run_start {
                Some(start) if stage == start + run_len => {
                    run_len += 1;
                }
                _ => {
                    if let Some(start) = run_start {
                        ranges.push((start - expected, run_len));
                        expected = start + run_len;
                    }
                    run_start = Some(stage);
                    run_len = 1;
                }
            }
        }
        if let Some(start) = run_start {
            ranges.push((start - expected, run_len));
        }

        ranges
    }

    /// True when fresh stages arrived since the last `take_ack`.
    pub fn ack_due(&self) -> bool {
        self.ack_due
    }

    pub fn clear_ack_due(&mut self) {
        self.ack_due = false;
    }

    /// The peer signalled the end and everything before it was delivered.
    pub fn consumed(&self) -> bool {
        match self.end_stage {
            Some(end) => self.next_stage > end,
            None => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn flow() -> Flow {
        Flow::new(2, vec![0x00, 0x54, 0x43, 0x04, 0x00], StreamKind::Connection, None)
    }

    #[test]
    fn in_order_delivery() {
        let mut f = flow();
        assert_eq!(f.receive(1, 0, b"a"), vec![b"a".to_vec()]);
        assert_eq!(f.receive(2, 0, b"b"), vec![b"b".to_vec()]);
        assert_eq!(f.cumulative(), 2);
    }

    #[test]
    fn out_of_order_buffered_then_drained() {
        let mut f = flow();
        assert!(f.receive(2, 0, b"b").is_empty());
        assert!(f.receive(3, 0, b"c").is_empty());
        let out = f.receive(1, 0, b"a");
        assert_eq!(out, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(f.cumulative(), 3);
    }

    #[test]
    fn duplicates_are_idempotent() {
        let mut f = flow();
        assert_eq!(f.receive(1, 0, b"a").len(), 1);
        assert!(f.receive(1, 0, b"a").is_empty());
        assert_eq!(f.receive(2, 0, b"b").len(), 1);
        assert!(f.receive(2, 0, b"b").is_empty());
        assert_eq!(f.receive(3, 0, b"c").len(), 1);
        assert_eq!(f.cumulative(), 3);

        // Buffered dupe
        assert!(f.receive(5, 0, b"e").is_empty());
        assert!(f.receive(5, 0, b"e").is_empty());
    }

    #[test]
    fn multi_fragment_reassembly() {
        use frag_flags::{WITH_AFTER, WITH_BEFORE};

        let mut f = flow();
        assert!(f.receive(1, WITH_AFTER, b"he").is_empty());
        assert!(f.receive(2, WITH_BEFORE | WITH_AFTER, b"ll").is_empty());
        let out = f.receive(3, WITH_BEFORE, b"o");
        assert_eq!(out, vec![b"hello".to_vec()]);
    }

    #[test]
    fn abandoned_stage_advances_without_delivery() {
        use frag_flags::ABANDON;

        let mut f = flow();
        assert_eq!(f.receive(1, 0, b"a").len(), 1);
        assert!(f.receive(2, ABANDON, &[]).is_empty());
        assert_eq!(f.receive(3, 0, b"c"), vec![b"c".to_vec()]);
        assert_eq!(f.cumulative(), 3);
    }

    #[test]
    fn ack_ranges_describe_holes() {
        let mut f = flow();
        f.receive(1, 0, b"a");
        f.receive(4, 0, b"d");
        f.receive(5, 0, b"e");
        f.receive(8, 0, b"h");

        assert_eq!(f.cumulative(), 1);
        // missing 2..3, have 4..5, missing 6..7, have 8
        assert_eq!(f.ack_ranges(), vec![(2, 2), (2, 1)]);
    }

    #[test]
    fn consumed_after_end_delivered() {
        use frag_flags::END;

        let mut f = flow();
        assert!(!f.consumed());
        f.receive(2, END, b"fin");
        assert!(!f.consumed());
        f.receive(1, 0, b"a");
        assert!(f.consumed());
    }
}

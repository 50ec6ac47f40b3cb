//! Send side of a reliable flow.
//!
//! A writer assigns stages, keeps every fragment buffered until a
//! cumulative acknowledgment covers it, and retransmits — or abandons,
//! for unreliable channels — when the peer reports holes or when no
//! progress happens within the retransmit deadline.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::message::{frag_flags, Ack};

/// Largest payload slice a single stage carries. Chosen so a fragment
/// with a full header still fits an empty packet.
pub const MAX_FRAGMENT_SIZE: usize = 1120;

const MIN_RETRANSMIT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Opening,
    Open,
    NearClosed,
    Closed,
}

#[derive(Debug)]
struct PendingFragment {
    stage: u64,
    flags: u8,
    payload: Vec<u8>,
    reliable: bool,
    sent: bool,
    /// Covered by an ack range but not yet by the cumulative level.
    acked: bool,
    /// Marked for immediate retransmission.
    resend: bool,
}

/// A fragment the session should put on the wire now.
#[derive(Debug)]
pub struct FragmentOut {
    pub stage: u64,
    pub flags: u8,
    pub payload: Vec<u8>,
    /// Signature and writer reference, present on stage 1.
    pub with_header: bool,
}

/// Send side of one flow.
#[derive(Debug)]
pub struct Writer {
    id: u64,
    signature: Vec<u8>,
    /// Inbound flow this writer answers, if any.
    flow_ref: Option<u64>,
    stage: u64,
    stage_ack: u64,
    queue: VecDeque<PendingFragment>,
    state: WriterState,
    deadline: Option<Instant>,
}

impl Writer {
    pub fn new(id: u64, signature: Vec<u8>, flow_ref: Option<u64>) -> Self {
        Self {
            id,
            signature,
            flow_ref,
            stage: 0,
            stage_ack: 0,
            queue: VecDeque::new(),
            state: WriterState::Opening,
            deadline: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    pub fn flow_ref(&self) -> Option<u64> {
        self.flow_ref
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn stage_ack(&self) -> u64 {
        self.stage_ack
    }

    /// Stages buffered and not yet covered by the cumulative ack.
    pub fn unacked(&self) -> Vec<u64> {
        self.queue.iter().map(|f| f.stage).collect()
    }

    /// Queue one message, splitting it into stages of at most
    /// [`MAX_FRAGMENT_SIZE`]. Returns the stages assigned.
    pub fn write_message(&mut self, payload: &[u8], reliable: bool) -> (u64, u64) {
        debug_assert!(matches!(
            self.state,
            WriterState::Opening | WriterState::Open
        ));

        let parts: Vec<&[u8]> = if payload.is_empty() {
            vec![&[]]
        } else {
            payload.chunks(MAX_FRAGMENT_SIZE).collect()
        };
        let n = parts.len();
        let first = self.stage + 1;

        for (i, part) in parts.into_iter().enumerate() {
            self.stage += 1;
            let mut flags = 0;
            if i > 0 {
                flags |= frag_flags::WITH_BEFORE;
            }
            if i < n - 1 {
                flags |= frag_flags::WITH_AFTER;
            }
            self.queue.push_back(PendingFragment {
                stage: self.stage,
                flags,
                payload: part.to_vec(),
                reliable,
                sent: false,
                acked: false,
                resend: false,
            });
        }

        (first, self.stage)
    }

    /// Ask the peer to close the flow: an empty terminal stage.
    pub fn close(&mut self) {
        if matches!(self.state, WriterState::NearClosed | WriterState::Closed) {
            return;
        }
        self.stage += 1;
        self.queue.push_back(PendingFragment {
            stage: self.stage,
            flags: frag_flags::ABANDON | frag_flags::END,
            payload: Vec::new(),
            reliable: true,
            sent: false,
            acked: false,
            resend: false,
        });
        self.state = WriterState::NearClosed;
    }

    /// Drop everything and mark the writer dead (0x5E from the peer).
    pub fn fail(&mut self) {
        self.queue.clear();
        self.deadline = None;
        self.state = WriterState::Closed;
    }

    /// Process a 0x51 acknowledgment. Returns true if the cumulative
    /// level advanced.
    pub fn on_ack(&mut self, ack: &Ack, now: Instant, ping_ms: u16) -> bool {
        let progressed = ack.cumulative > self.stage_ack;

        if progressed {
            self.stage_ack = ack.cumulative;
            while let Some(front) = self.queue.front() {
                if front.stage <= ack.cumulative {
                    self.queue.pop_front();
                } else {
                    break;
                }
            }
        }

        // Walk the hole description. The first missing stage gets an
        // immediate retransmit; received runs are flagged so the
        // deadline path skips them.
        let mut cursor = ack.cumulative;
        let mut first_hole: Option<u64> = None;
        for (lost, received) in &ack.ranges {
            if first_hole.is_none() && *lost > 0 {
                first_hole = Some(cursor + 1);
            }
            cursor += lost;
            for stage in cursor + 1..=cursor + received {
                if let Some(f) = self.queue.iter_mut().find(|f| f.stage == stage) {
                    f.acked = true;
                }
            }
            cursor += received;
        }
        if let Some(hole) = first_hole {
            if let Some(f) = self.queue.iter_mut().find(|f| f.stage == hole && f.sent) {
                f.resend = true;
            }
        }

        if progressed {
            self.state = match self.state {
                WriterState::Opening => WriterState::Open,
                s => s,
            };
            self.deadline = if self.queue.is_empty() {
                None
            } else {
                Some(now + retransmit_after(ping_ms))
            };
        }

        if self.state == WriterState::NearClosed && self.queue.is_empty() {
            self.state = WriterState::Closed;
        }

        progressed
    }

    /// 0x18 negative ack: retransmit the lowest unacked stage now.
    pub fn on_nack(&mut self) {
        if let Some(f) = self.queue.iter_mut().find(|f| f.sent && !f.acked) {
            f.resend = true;
        }
    }

    /// Collect fragments that must go on the wire: everything unsent,
    /// explicit resends, and — past the deadline — the whole suffix of
    /// sent-but-unacked stages, lowest first (retransmitted if
    /// reliable, abandoned otherwise).
    pub fn take_sendable(&mut self, now: Instant, ping_ms: u16) -> Vec<FragmentOut> {
        let deadline_hit = self.deadline.map(|d| now >= d).unwrap_or(false);

        if deadline_hit {
            for f in self.queue.iter_mut().filter(|f| f.sent && !f.acked) {
                if f.reliable {
                    f.resend = true;
                } else {
                    // Abandon: the stage still has to reach the peer so
                    // the flow advances, but without the payload.
                    f.payload = Vec::new();
                    f.flags = (f.flags & frag_flags::END) | frag_flags::ABANDON;
                    f.resend = true;
                }
            }
        }

        let mut out = Vec::new();
        for f in self.queue.iter_mut() {
            if !f.sent || f.resend {
                out.push(FragmentOut {
                    stage: f.stage,
                    flags: f.flags,
                    payload: f.payload.clone(),
                    with_header: f.stage == 1,
                });
                f.sent = true;
                f.resend = false;
            }
        }

        if !out.is_empty() {
            self.deadline = Some(now + retransmit_after(ping_ms));
        } else if self.queue.is_empty() {
            self.deadline = None;
        }

        out
    }

    /// Earliest instant this writer wants another look.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

fn retransmit_after(ping_ms: u16) -> Duration {
    MIN_RETRANSMIT.max(Duration::from_millis(u64::from(ping_ms) * 2))
}

#[cfg(test)]
mod test {
    use super::*;

    fn writer() -> Writer {
        Writer::new(2, vec![0x00, 0x54, 0x43, 0x04, 0x00], None)
    }

    fn ack(cumulative: u64, ranges: Vec<(u64, u64)>) -> Ack {
        Ack {
            flow_id: 2,
            buffers_available: 0x7F,
            cumulative,
            ranges,
        }
    }

    #[test]
    fn stages_are_sequential() {
        let mut w = writer();
        assert_eq!(w.write_message(b"a", true), (1, 1));
        assert_eq!(w.write_message(b"b", true), (2, 2));
        assert_eq!(w.unacked(), vec![1, 2]);
    }

    #[test]
    fn large_message_splits_with_span_flags() {
        let mut w = writer();
        let big = vec![0u8; MAX_FRAGMENT_SIZE * 2 + 10];
        let (first, last) = w.write_message(&big, true);
        assert_eq!((first, last), (1, 3));

        let now = Instant::now();
        let out = w.take_sendable(now, 0);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].flags, frag_flags::WITH_AFTER);
        assert_eq!(
            out[1].flags,
            frag_flags::WITH_BEFORE | frag_flags::WITH_AFTER
        );
        assert_eq!(out[2].flags, frag_flags::WITH_BEFORE);
    }

    #[test]
    fn cumulative_ack_releases_prefix() {
        let mut w = writer();
        for _ in 0..5 {
            w.write_message(b"x", true);
        }
        let now = Instant::now();
        w.take_sendable(now, 0);

        assert!(w.on_ack(&ack(3, vec![]), now, 0));
        assert_eq!(w.unacked(), vec![4, 5]);
        assert_eq!(w.stage_ack(), 3);

        // Unacked stages stay a contiguous suffix.
        let unacked = w.unacked();
        for pair in unacked.windows(2) {
            assert_eq!(pair[1], pair[0] + 1);
        }
    }

    #[test]
    fn ack_range_triggers_resend_of_hole() {
        let mut w = writer();
        for _ in 0..5 {
            w.write_message(b"x", true);
        }
        let now = Instant::now();
        w.take_sendable(now, 0);

        // Peer has 1..3 plus 5; 4 is the hole.
        w.on_ack(&ack(3, vec![(1, 1)]), now, 0);
        let out = w.take_sendable(now, 0);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].stage, 4);
    }

    #[test]
    fn deadline_retransmits_unacked_suffix() {
        let mut w = writer();
        w.write_message(b"x", true);
        w.write_message(b"y", true);
        let now = Instant::now();
        w.take_sendable(now, 0);
        assert!(w.take_sendable(now, 0).is_empty());

        let later = now + Duration::from_millis(250);
        let out = w.take_sendable(later, 0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].stage, 1);
        assert_eq!(out[1].stage, 2);
    }

    #[test]
    fn acked_ranges_are_not_retransmitted_on_deadline() {
        let mut w = writer();
        for _ in 0..3 {
            w.write_message(b"x", true);
        }
        let now = Instant::now();
        w.take_sendable(now, 0);

        // Peer holds 2..3 but not 1.
        w.on_ack(&ack(0, vec![(1, 2)]), now, 0);
        let out = w.take_sendable(now, 0);
        assert_eq!(out.len(), 1, "only the hole resends at once");

        let later = now + Duration::from_millis(250);
        let out = w.take_sendable(later, 0);
        assert!(
            out.iter().all(|f| f.stage == 1),
            "stages the peer already has stay quiet"
        );
    }

    #[test]
    fn unreliable_is_abandoned_not_retransmitted() {
        let mut w = writer();
        w.write_message(b"av-frame", false);
        let now = Instant::now();
        w.take_sendable(now, 0);

        let later = now + Duration::from_millis(250);
        let out = w.take_sendable(later, 0);
        assert_eq!(out.len(), 1);
        assert!(out[0].flags & frag_flags::ABANDON != 0);
        assert!(out[0].payload.is_empty());
    }

    #[test]
    fn close_queues_terminal_stage_and_finishes_on_ack() {
        let mut w = writer();
        w.write_message(b"x", true);
        w.close();
        assert_eq!(w.state(), WriterState::NearClosed);

        let now = Instant::now();
        let out = w.take_sendable(now, 0);
        assert_eq!(out.len(), 2);
        assert!(out[1].flags & frag_flags::END != 0);

        w.on_ack(&ack(2, vec![]), now, 0);
        assert_eq!(w.state(), WriterState::Closed);
    }

    #[test]
    fn header_only_on_stage_one() {
        let mut w = writer();
        w.write_message(b"a", true);
        w.write_message(b"b", true);
        let out = w.take_sendable(Instant::now(), 0);
        assert!(out[0].with_header);
        assert!(!out[1].with_header);
    }
}

//! FLV byte-stream adapters.
//!
//! The host reads media as an FLV stream and feeds publications the same
//! way. The reader frames received packets as FLV tags behind the
//! 13-byte prologue; the publisher parses an incoming FLV stream
//! (resumable at any byte) back into timed audio/video packets.

use std::collections::VecDeque;

/// The literal FLV prologue returned by the first read on a media id.
pub const FLV_HEADER: [u8; 13] = [
    0x46, 0x4C, 0x56, 0x01, 0x05, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

const TAG_HEADER_SIZE: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
    Data,
}

impl MediaKind {
    pub fn tag_type(&self) -> u8 {
        match self {
            MediaKind::Audio => 0x08,
            MediaKind::Video => 0x09,
            MediaKind::Data => 0x12,
        }
    }

    pub fn from_tag_type(tag: u8) -> Option<MediaKind> {
        match tag {
            0x08 => Some(MediaKind::Audio),
            0x09 => Some(MediaKind::Video),
            0x12 => Some(MediaKind::Data),
            _ => None,
        }
    }
}

/// One timed media payload.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    pub time: u32,
    pub kind: MediaKind,
    pub payload: Vec<u8>,
}

// AVC video packet: frame type 1 (keyframe) + codec id 7, AVC header.
fn is_h264_codec_infos(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x17 && data[1] == 0x00
}

/// Buffers received media and serves it as an FLV byte stream.
///
/// Video is dropped until the codec configuration packet arrives, and
/// timestamps are rebased so the first delivered packet plays at zero.
#[derive(Debug)]
pub struct MediaReader {
    queue: VecDeque<Vec<u8>>,
    first_read: bool,
    codec_infos_read: bool,
    time_start: Option<u32>,
    /// Read offset into the front of the queue.
    pos: usize,
}

impl Default for MediaReader {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaReader {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            first_read: true,
            codec_infos_read: false,
            time_start: None,
            pos: 0,
        }
    }

    pub fn push(&mut self, time: u32, kind: MediaKind, payload: &[u8]) {
        if !self.codec_infos_read {
            match kind {
                MediaKind::Video if is_h264_codec_infos(payload) => {
                    info!("video codec infos found, starting to read");
                    self.codec_infos_read = true;
                }
                MediaKind::Video => {
                    debug!("video frame dropped waiting for first key frame");
                    return;
                }
                _ => {}
            }
        }

        let start = *self.time_start.get_or_insert(time);
        if time < start {
            debug!("media packet older ({}) than start time ({})", time, start);
            return;
        }

        self.queue.push_back(frame_tag(time - start, kind, payload));
    }

    pub fn has_data(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Fill `buf` with as much framed FLV as is queued. The first call
    /// emits the 13-byte FLV prologue before any tag.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;

        if self.first_read {
            if buf.len() < FLV_HEADER.len() {
                return 0;
            }
            buf[..FLV_HEADER.len()].copy_from_slice(&FLV_HEADER);
            n = FLV_HEADER.len();
            self.first_read = false;
        }

        while n < buf.len() {
            let Some(front) = self.queue.front() else {
                break;
            };
            let remaining = &front[self.pos..];
            let take = remaining.len().min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&remaining[..take]);
            n += take;
            self.pos += take;
            if self.pos == front.len() {
                self.queue.pop_front();
                self.pos = 0;
            }
        }

        n
    }
}

/// Frame one packet as an FLV tag with its previous-tag-size footer.
fn frame_tag(time: u32, kind: MediaKind, payload: &[u8]) -> Vec<u8> {
    let size = payload.len();
    let mut tag = Vec::with_capacity(TAG_HEADER_SIZE + size + 4);
    tag.push(kind.tag_type());
    tag.extend_from_slice(&(size as u32).to_be_bytes()[1..]); // u24 size
    tag.extend_from_slice(&time.to_be_bytes()[1..]); // u24 time
    tag.push((time >> 24) as u8); // extended time
    tag.extend_from_slice(&[0, 0, 0]); // stream id
    tag.extend_from_slice(payload);
    tag.extend_from_slice(&((TAG_HEADER_SIZE + size) as u32).to_be_bytes());
    tag
}

/// Parses the FLV byte stream the host writes into timed packets.
///
/// Input arrives in arbitrary slices; the parser resumes mid-header or
/// mid-payload.
#[derive(Debug, Default)]
pub struct FlvParser {
    buf: Vec<u8>,
    header_skipped: bool,
}

impl FlvParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every complete tag they unlock.
    pub fn write(&mut self, bytes: &[u8]) -> Vec<MediaPacket> {
        self.buf.extend_from_slice(bytes);
        let mut packets = Vec::new();

        if !self.header_skipped {
            if self.buf.len() < FLV_HEADER.len() {
                return packets;
            }
            if self.buf.starts_with(b"FLV") {
                self.buf.drain(..FLV_HEADER.len());
            }
            self.header_skipped = true;
        }

        loop {
            if self.buf.len() < TAG_HEADER_SIZE {
                break;
            }
            let size = u32::from_be_bytes([0, self.buf[1], self.buf[2], self.buf[3]]) as usize;
            let total = TAG_HEADER_SIZE + size + 4;
            if self.buf.len() < total {
                break;
            }

            let tag_type = self.buf[0];
            let time = u32::from_be_bytes([self.buf[7], self.buf[4], self.buf[5], self.buf[6]]);
            let payload = self.buf[TAG_HEADER_SIZE..TAG_HEADER_SIZE + size].to_vec();

            if let Some(kind) = MediaKind::from_tag_type(tag_type) {
                packets.push(MediaPacket {
                    time,
                    kind,
                    payload,
                });
            } else {
                debug!("skipping unknown flv tag type 0x{:02x}", tag_type);
            }

            self.buf.drain(..total);
        }

        packets
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_read_returns_flv_prologue() {
        let mut r = MediaReader::new();
        r.push(0, MediaKind::Audio, &[0xAF, 0x01, 0x55]);

        let mut buf = [0u8; 256];
        let n = r.read(&mut buf);
        assert!(n > FLV_HEADER.len());
        assert_eq!(&buf[..13], &FLV_HEADER);
        // First tag follows immediately
        assert_eq!(buf[13], 0x08);
    }

    #[test]
    fn video_gated_until_codec_infos() {
        let mut r = MediaReader::new();
        r.push(0, MediaKind::Video, &[0x27, 0x01]); // inter frame, dropped
        assert!(!r.has_data());
        r.push(10, MediaKind::Video, &[0x17, 0x00, 0x00]); // AVC seq header
        assert!(r.has_data());
    }

    #[test]
    fn timestamps_rebase_to_first_packet() {
        let mut r = MediaReader::new();
        r.push(1000, MediaKind::Audio, &[1]);
        r.push(1040, MediaKind::Audio, &[2]);

        let mut buf = [0u8; 256];
        let n = r.read(&mut buf);
        assert!(n > 0);
        // time24 of the first tag is 0, of the second is 40
        let t1 = u32::from_be_bytes([0, buf[17], buf[18], buf[19]]);
        assert_eq!(t1, 0);
        let second = 13 + 11 + 1 + 4;
        let t2 = u32::from_be_bytes([0, buf[second + 4], buf[second + 5], buf[second + 6]]);
        assert_eq!(t2, 40);
    }

    #[test]
    fn partial_reads_resume() {
        let mut r = MediaReader::new();
        r.push(0, MediaKind::Audio, &[9u8; 32]);

        let mut small = [0u8; 20];
        let mut collected = Vec::new();
        loop {
            let n = r.read(&mut small);
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&small[..n]);
        }
        // prologue + tag header + payload + footer
        assert_eq!(collected.len(), 13 + 11 + 32 + 4);
    }

    #[test]
    fn flv_parser_round_trips_reader_frames() {
        let mut r = MediaReader::new();
        r.push(0, MediaKind::Audio, &[1, 2, 3]);
        r.push(25, MediaKind::Audio, &[4, 5]);

        let mut buf = [0u8; 512];
        let n = r.read(&mut buf);

        let mut p = FlvParser::new();
        // Feed byte by byte to exercise resumption.
        let mut packets = Vec::new();
        for b in &buf[..n] {
            packets.extend(p.write(std::slice::from_ref(b)));
        }

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].payload, vec![1, 2, 3]);
        assert_eq!(packets[0].time, 0);
        assert_eq!(packets[1].payload, vec![4, 5]);
        assert_eq!(packets[1].time, 25);
        assert_eq!(packets[1].kind, MediaKind::Audio);
    }

    #[test]
    fn flv_parser_accepts_headerless_stream() {
        // A raw tag without the FLV prologue, e.g. resuming mid-stream.
        let tag = frame_tag(5, MediaKind::Video, &[0x17, 0x00]);
        let mut p = FlvParser::new();
        let packets = p.write(&tag);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].kind, MediaKind::Video);
    }
}

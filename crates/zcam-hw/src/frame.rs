//! Frame type and stream synchronization: marker scan, reassembly, header injection.
//!
//! The bridge streams JPEG scan data in fixed-size packets with no
//! sequence numbers. Frames are recovered purely by scanning for the
//! start-of-image marker: each marker closes the previous frame and opens
//! the next one. Content between markers is never validated; a garbled
//! frame is passed on and left for the decoder to reject.

use crate::jpeg::SOI;

/// A reassembled JPEG frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Encoded bytes, starting with SOI (or the synthetic header).
    pub data: Vec<u8>,
    pub sequence: u32,
    pub timestamp: std::time::Instant,
    /// True if `data` starts with a synthesized header instead of the hardware's.
    pub injected_header: bool,
}

impl Frame {
    /// Whether the frame ends with an end-of-image marker.
    pub fn has_eoi(&self) -> bool {
        self.data.ends_with(&[0xff, 0xd9])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    AwaitingFrameStart,
    AccumulatingFrame,
}

/// Running counters for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub frames: u64,
    /// Bytes seen while no frame was open.
    pub skipped_bytes: u64,
    /// Frames emitted because they hit the length cap.
    pub oversized: u64,
}

/// Per-stream frame assembly state.
///
/// One synchronizer per active stream; create it when streaming starts
/// and drop it (or [`finish`](Self::finish) it) when streaming stops.
#[derive(Debug)]
pub struct FrameSynchronizer {
    state: SyncState,
    /// Last byte of the previous packet, for markers split across packets.
    lookback: Option<u8>,
    header: Option<Vec<u8>>,
    partial: Vec<u8>,
    max_frame_len: Option<usize>,
    next_sequence: u32,
    stats: SyncStats,
}

impl FrameSynchronizer {
    /// `header`, if given, replaces the hardware's marker at the start of every frame.
    pub fn new(header: Option<Vec<u8>>) -> Self {
        Self {
            state: SyncState::AwaitingFrameStart,
            lookback: None,
            header,
            partial: Vec::new(),
            max_frame_len: None,
            next_sequence: 0,
            stats: SyncStats::default(),
        }
    }

    /// Emit and abandon any frame that grows past `len` bytes.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = Some(len);
        self
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Whether a frame is currently open.
    pub fn in_frame(&self) -> bool {
        self.state == SyncState::AccumulatingFrame
    }

    /// Feed one video packet. Returns the frames it completed, in order.
    pub fn push(&mut self, packet: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut start = 0;

        for i in 0..packet.len() {
            if packet[i] != SOI[1] {
                continue;
            }
            let prev = if i == 0 { self.lookback } else { Some(packet[i - 1]) };
            if prev != Some(SOI[0]) {
                continue;
            }

            match self.state {
                SyncState::AccumulatingFrame => {
                    self.partial.extend_from_slice(&packet[start..i]);
                    // The marker's first byte is already in the buffer.
                    self.partial.pop();
                    frames.push(self.take_frame());
                }
                SyncState::AwaitingFrameStart => {
                    self.stats.skipped_bytes += (i + 1 - start) as u64;
                }
            }
            self.begin_frame();
            start = i + 1;
        }

        match self.state {
            SyncState::AccumulatingFrame => self.partial.extend_from_slice(&packet[start..]),
            SyncState::AwaitingFrameStart => {
                self.stats.skipped_bytes += (packet.len() - start) as u64;
            }
        }
        if let Some(&last) = packet.last() {
            self.lookback = Some(last);
        }

        if let Some(max) = self.max_frame_len {
            if self.state == SyncState::AccumulatingFrame && self.partial.len() > max {
                tracing::warn!(len = self.partial.len(), max, "frame exceeded length cap");
                self.stats.oversized += 1;
                frames.push(self.take_frame());
                self.state = SyncState::AwaitingFrameStart;
            }
        }

        frames
    }

    /// End of stream: hand back the unterminated frame, if one is open.
    pub fn finish(mut self) -> Option<Frame> {
        match self.state {
            SyncState::AccumulatingFrame => Some(self.take_frame()),
            SyncState::AwaitingFrameStart => None,
        }
    }

    fn begin_frame(&mut self) {
        self.state = SyncState::AccumulatingFrame;
        self.partial.clear();
        match &self.header {
            Some(header) => self.partial.extend_from_slice(header),
            None => self.partial.extend_from_slice(&SOI),
        }
    }

    fn take_frame(&mut self) -> Frame {
        let data = std::mem::take(&mut self.partial);
        let frame = Frame {
            data,
            sequence: self.next_sequence,
            timestamp: std::time::Instant::now(),
            injected_header: self.header.is_some(),
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.stats.frames += 1;
        tracing::trace!(seq = frame.sequence, len = frame.data.len(), "frame complete");
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D1: &[u8] = &[0x11, 0x12, 0xff, 0x00, 0x13];
    const D2: &[u8] = &[0x21, 0xd8, 0x22];
    const D3: &[u8] = &[0x31, 0x32, 0xff];

    fn stream() -> Vec<u8> {
        let mut s = vec![0x00, 0xd8, 0xff];
        for d in [D1, D2, D3] {
            s.extend_from_slice(&SOI);
            s.extend_from_slice(d);
        }
        s
    }

    fn with_marker(d: &[u8]) -> Vec<u8> {
        let mut v = SOI.to_vec();
        v.extend_from_slice(d);
        v
    }

    fn run(packets: &[&[u8]], header: Option<Vec<u8>>) -> (Vec<Vec<u8>>, FrameSynchronizer) {
        let mut sync = FrameSynchronizer::new(header);
        let mut out = Vec::new();
        for p in packets {
            out.extend(sync.push(p).into_iter().map(|f| f.data));
        }
        (out, sync)
    }

    #[test]
    fn test_single_packet() {
        let s = stream();
        let (frames, sync) = run(&[&s[..]], None);
        assert_eq!(frames, vec![with_marker(D1), with_marker(D2)]);
        assert!(sync.in_frame());
        assert_eq!(sync.finish().unwrap().data, with_marker(D3));
    }

    #[test]
    fn test_every_two_and_three_way_split() {
        let s = stream();
        let expected = vec![with_marker(D1), with_marker(D2)];
        for a in 0..=s.len() {
            let (frames, _) = run(&[&s[..a], &s[a..]], None);
            assert_eq!(frames, expected, "split at {a}");
            for b in a..=s.len() {
                let (frames, sync) = run(&[&s[..a], &s[a..b], &s[b..]], None);
                assert_eq!(frames, expected, "split at {a},{b}");
                assert_eq!(sync.finish().unwrap().data, with_marker(D3));
            }
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let s = stream();
        let packets: Vec<&[u8]> = s.chunks(1).collect();
        let (frames, _) = run(&packets, None);
        assert_eq!(frames, vec![with_marker(D1), with_marker(D2)]);
    }

    #[test]
    fn test_header_injection() {
        let header = vec![0xff, 0xd8, 0xaa, 0xbb];
        let s = stream();
        let (frames, _) = run(&[&s[..4], &s[4..]], Some(header.clone()));
        let mut expected = header.clone();
        expected.extend_from_slice(D1);
        assert_eq!(frames[0], expected);

        let mut sync = FrameSynchronizer::new(Some(header));
        let frame = sync.push(&s).remove(0);
        assert!(frame.injected_header);
        assert_eq!(frame.sequence, 0);
    }

    #[test]
    fn test_no_marker_emits_nothing() {
        let (frames, sync) = run(&[&[1, 2, 3], &[0xff], &[0x00, 0xd8]], None);
        assert!(frames.is_empty());
        assert!(!sync.in_frame());
        assert_eq!(sync.stats().skipped_bytes, 6);
        assert!(sync.finish().is_none());
    }

    #[test]
    fn test_empty_packet_keeps_lookback() {
        let (frames, sync) = run(&[&[0xff], &[], &[0xd8, 0x01]], None);
        assert!(frames.is_empty());
        assert!(sync.in_frame());
        assert_eq!(sync.finish().unwrap().data, vec![0xff, 0xd8, 0x01]);
    }

    #[test]
    fn test_garbage_forwarded_verbatim() {
        let mut s = SOI.to_vec();
        s.extend_from_slice(&[0xff, 0xff, 0x00, 0xd9, 0xd8]);
        s.extend_from_slice(&SOI);
        let (frames, _) = run(&[&s[..]], None);
        assert_eq!(frames, vec![with_marker(&[0xff, 0xff, 0x00, 0xd9, 0xd8])]);
    }

    #[test]
    fn test_back_to_back_markers_yield_empty_frame() {
        let s = [0xff, 0xd8, 0xff, 0xd8, 0x01];
        let (frames, _) = run(&[&s[..]], None);
        assert_eq!(frames, vec![SOI.to_vec()]);
    }

    #[test]
    fn test_length_cap() {
        let mut sync = FrameSynchronizer::new(None).with_max_frame_len(8);
        assert!(sync.push(&[0xff, 0xd8, 1, 2, 3]).is_empty());
        let frames = sync.push(&[4, 5, 6, 7, 8]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.len(), 10);
        assert!(!sync.in_frame());
        assert_eq!(sync.stats().oversized, 1);
    }

    #[test]
    fn test_sequence_and_eoi() {
        let mut sync = FrameSynchronizer::new(None);
        let frames = sync.push(&[0xff, 0xd8, 0xff, 0xd9, 0xff, 0xd8, 0x00, 0xff, 0xd8]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(frames[1].sequence, 1);
        assert!(frames[0].has_eoi());
        assert!(!frames[1].has_eoi());
        assert_eq!(sync.stats().frames, 2);
    }
}

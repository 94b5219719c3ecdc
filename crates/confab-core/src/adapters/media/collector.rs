//! Inbound video reassembly: collects fragmented frames from packets.
//!
//! Chunks are placed by offset computed from their sequence distance to
//! the frame's start chunk, so unordered delivery within a frame is
//! tolerated; chunks that arrive before the start chunk is known are
//! stashed and placed once it lands. A frame is finalized when the next
//! frame begins (one frame of latency) and is emitted only if its bytes
//! match the CRC-32 carried in the fragmentation extension — incomplete
//! or corrupt frames are counted and dropped, never delivered short.

use bytes::Bytes;
use tracing::{trace, warn};

use crate::domain::wire::{descriptor_has_start, header_len, FragmentExtension, PacketHeader};

use super::splitter::CHUNK_SIZE;

/// Reassembly buffer: 2 MiB, enough for any keyframe at our bitrates.
const BUFFER_CAPACITY: usize = 2 * 1024 * 1024;

/// Maximum chunk distance from the frame start before a packet is
/// considered garbage.
const MAX_CHUNK_OFFSET: u16 = 4096;

/// Chunks held while the start chunk of their frame is still in flight.
const MAX_STASHED: usize = 64;

// ---------------------------------------------------------------------------
// FrameCollector
// ---------------------------------------------------------------------------

pub struct FrameCollector {
    buffer: Vec<u8>,
    /// Bytes accumulated for the current frame.
    size: usize,
    /// Frame sequence currently being accumulated.
    current_frame_seq: Option<u16>,
    /// Packet seq of the current frame's start chunk, once seen.
    anchor_seq: Option<u16>,
    /// CRC-32 the sender computed over the whole frame.
    expected_crc: u32,
    /// Chunks of the current frame received before its start chunk.
    stash: Vec<(u16, Vec<u8>)>,
    last_packet_seq: Option<u16>,
    dropped_frames: u64,
}

impl Default for FrameCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCollector {
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; BUFFER_CAPACITY],
            size: 0,
            current_frame_seq: None,
            anchor_seq: None,
            expected_crc: 0,
            stash: Vec::new(),
            last_packet_seq: None,
            dropped_frames: 0,
        }
    }

    /// Frames dropped for failing the CRC gate (loss or corruption).
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Feed one plaintext packet (header + extension + chunk payload).
    /// Returns the previous frame when this packet begins a new one and
    /// the previous frame reassembled cleanly.
    pub fn process(&mut self, packet: &[u8]) -> Option<Bytes> {
        let hdr = PacketHeader::decode(packet)?;
        let hlen = header_len(packet);
        let payload = &packet[hlen..];
        if payload.is_empty() {
            return None;
        }

        // Back-to-back duplicate suppression; not a reorder buffer.
        if self.last_packet_seq == Some(hdr.seq) {
            return None;
        }
        self.last_packet_seq = Some(hdr.seq);

        let Some(ext) = FragmentExtension::decode(packet) else {
            warn!(seq = hdr.seq, "video packet without fragment extension, dropping");
            return None;
        };

        // A chunk of a different frame finalizes whatever is pending.
        let mut emitted = None;
        if self.current_frame_seq != Some(ext.frame_seq) {
            emitted = self.finalize_pending();
            self.current_frame_seq = Some(ext.frame_seq);
            self.expected_crc = ext.crc32;
            self.anchor_seq = None;
            self.size = 0;
        }

        let descriptor = payload[0];
        let chunk = &payload[1..];

        if descriptor_has_start(descriptor) {
            self.anchor_seq = Some(hdr.seq);
            let stashed = std::mem::take(&mut self.stash);
            for (seq, data) in stashed {
                self.place(seq, &data);
            }
        }

        if self.anchor_seq.is_some() {
            self.place(hdr.seq, chunk);
        } else if self.stash.len() < MAX_STASHED {
            self.stash.push((hdr.seq, chunk.to_vec()));
        } else {
            warn!(seq = hdr.seq, "stash overflow waiting for frame start, dropping packet");
        }

        emitted
    }

    /// Flush the pending frame on stream end, through the same CRC gate.
    pub fn finish(&mut self) -> Option<Bytes> {
        let frame = self.finalize_pending();
        self.reset();
        frame
    }

    /// Drop all accumulation state (background pause, teardown).
    pub fn reset(&mut self) {
        self.size = 0;
        self.current_frame_seq = None;
        self.anchor_seq = None;
        self.expected_crc = 0;
        self.stash.clear();
        self.last_packet_seq = None;
    }

    // -- internals --

    fn place(&mut self, seq: u16, chunk: &[u8]) {
        let anchor = match self.anchor_seq {
            Some(a) => a,
            None => return,
        };
        let rel = seq.wrapping_sub(anchor);
        let pos = rel as usize * CHUNK_SIZE;
        if rel > MAX_CHUNK_OFFSET || pos + chunk.len() > self.buffer.len() {
            warn!(seq, rel, "chunk offset out of range, dropping packet");
            return;
        }
        self.buffer[pos..pos + chunk.len()].copy_from_slice(chunk);
        self.size += chunk.len();
    }

    fn finalize_pending(&mut self) -> Option<Bytes> {
        if self.size == 0 {
            if !self.stash.is_empty() {
                // Chunks arrived but the start chunk never did.
                self.dropped_frames += 1;
                warn!(
                    frame_seq = ?self.current_frame_seq,
                    "frame never anchored (start chunk lost), dropping"
                );
            }
            return None;
        }

        let assembled = &self.buffer[..self.size];
        let crc = crc32fast::hash(assembled);
        if crc == self.expected_crc {
            trace!(
                frame_seq = ?self.current_frame_seq,
                bytes = self.size,
                "frame reassembled"
            );
            Some(Bytes::copy_from_slice(assembled))
        } else {
            self.dropped_frames += 1;
            warn!(
                frame_seq = ?self.current_frame_seq,
                bytes = self.size,
                "frame failed CRC check (lost or corrupt chunks), dropping"
            );
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use super::*;
    use crate::adapters::media::splitter::FrameSplitter;
    use crate::domain::identity::StreamIdentity;
    use crate::domain::wire::WireFrame;

    fn identity() -> StreamIdentity {
        StreamIdentity {
            ssrc: 42,
            transport_port: 5004,
            cipher_key: None,
        }
    }

    fn split(splitter: &mut FrameSplitter, frame: &[u8], ts: u32) -> Vec<Vec<u8>> {
        splitter
            .split_frame(frame, ts, false)
            .unwrap()
            .iter()
            .map(|w| WireFrame::decode(w).unwrap().payload.to_vec())
            .collect()
    }

    fn synthetic_frame(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn in_order_delivery_reassembles() {
        let mut splitter = FrameSplitter::new(&identity());
        let mut collector = FrameCollector::new();

        let frame = synthetic_frame(3000, 1);
        for pkt in split(&mut splitter, &frame, 0) {
            assert!(collector.process(&pkt).is_none());
        }
        // Emission happens when the next frame starts.
        let next = synthetic_frame(100, 2);
        let packets = split(&mut splitter, &next, 3600);
        let emitted = collector.process(&packets[0]).unwrap();
        assert_eq!(&emitted[..], &frame[..]);
        assert_eq!(collector.dropped_frames(), 0);
    }

    #[test]
    fn arbitrary_permutation_reassembles() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0xC0FFEE);
        let frame = synthetic_frame(5 * CHUNK_SIZE + 17, 3);

        for _ in 0..20 {
            let mut splitter = FrameSplitter::new(&identity());
            let mut collector = FrameCollector::new();

            let mut packets = split(&mut splitter, &frame, 0);
            packets.shuffle(&mut rng);
            for pkt in &packets {
                assert!(collector.process(pkt).is_none());
            }
            let emitted = collector.finish().expect("frame should reassemble");
            assert_eq!(&emitted[..], &frame[..]);
        }
    }

    #[test]
    fn missing_start_chunk_emits_nothing() {
        let mut splitter = FrameSplitter::new(&identity());
        let mut collector = FrameCollector::new();

        let frame = synthetic_frame(3 * CHUNK_SIZE, 4);
        let packets = split(&mut splitter, &frame, 0);
        for pkt in &packets[1..] {
            assert!(collector.process(pkt).is_none());
        }
        assert!(collector.finish().is_none());
        assert_eq!(collector.dropped_frames(), 1);
    }

    #[test]
    fn mid_frame_gap_is_dropped_and_counted() {
        let mut splitter = FrameSplitter::new(&identity());
        let mut collector = FrameCollector::new();

        let frame = synthetic_frame(3 * CHUNK_SIZE, 5);
        let packets = split(&mut splitter, &frame, 0);
        collector.process(&packets[0]);
        // packets[1] lost in transit
        collector.process(&packets[2]);

        // Next frame arrives: the damaged frame must not surface.
        let next_packets = split(&mut splitter, &synthetic_frame(50, 6), 3600);
        assert!(collector.process(&next_packets[0]).is_none());
        assert_eq!(collector.dropped_frames(), 1);

        // The healthy next frame still comes out.
        let emitted = collector.finish().unwrap();
        assert_eq!(&emitted[..], &synthetic_frame(50, 6)[..]);
    }

    #[test]
    fn duplicate_packet_is_ignored() {
        let mut splitter = FrameSplitter::new(&identity());
        let mut collector = FrameCollector::new();

        let frame = synthetic_frame(100, 7);
        let packets = split(&mut splitter, &frame, 0);
        collector.process(&packets[0]);
        collector.process(&packets[0]); // duplicated in transit
        let emitted = collector.finish().unwrap();
        assert_eq!(&emitted[..], &frame[..]);
    }

    #[test]
    fn oversized_offset_is_dropped_not_a_crash() {
        let mut collector = FrameCollector::new();

        // Hand-craft a start packet, then one absurdly far away.
        let mut splitter = FrameSplitter::new(&identity());
        let packets = split(&mut splitter, &synthetic_frame(10, 8), 0);
        collector.process(&packets[0]);

        let mut far = packets[0].clone();
        // Bump the seq field way past the anchor and clear the start bit.
        let bad_seq = 1u16.wrapping_add(MAX_CHUNK_OFFSET).wrapping_add(5);
        far[2..4].copy_from_slice(&bad_seq.to_be_bytes());
        let hlen = header_len(&far);
        far[hlen] = 0x00;
        assert!(collector.process(&far).is_none());
    }

    #[test]
    fn reset_discards_pending_state() {
        let mut splitter = FrameSplitter::new(&identity());
        let mut collector = FrameCollector::new();
        let packets = split(&mut splitter, &synthetic_frame(2000, 9), 0);
        collector.process(&packets[0]);
        collector.reset();
        assert!(collector.finish().is_none());
    }
}

//! Outbound packetization: video frame splitting and single-packet audio.
//!
//! [`FrameSplitter`] turns one encoded video frame into ⌈len/1209⌉ wire
//! frames sharing a frame sequence number and a CRC-32 of the whole
//! frame; [`AudioPacketizer`] wraps one encoded audio frame per packet
//! (audio frames always fit the MTU budget). Both seal payloads when the
//! stream carries a key, with the 12-byte packet header as AAD.

use bytes::Bytes;
use tracing::trace;

use crate::adapters::crypto::{CipherError, PacketCipher};
use crate::domain::identity::StreamIdentity;
use crate::domain::wire::{
    FragmentExtension, MediaClass, PacketHeader, WireFrame, DESCRIPTOR_LEN, DESCRIPTOR_START,
    PT_AUDIO, PT_VIDEO,
};

/// Per-chunk payload budget, measured against the transport MTU.
pub const CHUNK_SIZE: usize = 1209;

// ---------------------------------------------------------------------------
// FrameSplitter (video)
// ---------------------------------------------------------------------------

/// Splits encoded video frames into transport packets.
///
/// Packet sequence numbers increment per chunk, the frame sequence once
/// per frame; both wrap at 2^16. Chunks of one frame always leave in
/// order over the same link.
pub struct FrameSplitter {
    ssrc: u32,
    port: u16,
    cipher: Option<PacketCipher>,
    seq: u16,
    frame_seq: u16,
}

impl FrameSplitter {
    pub fn new(identity: &StreamIdentity) -> Self {
        Self {
            ssrc: identity.ssrc,
            port: identity.transport_port,
            cipher: identity.cipher_key.as_ref().map(PacketCipher::new),
            seq: 1,
            frame_seq: 1,
        }
    }

    /// Packetize one encoded frame. Returns the wire frames to hand to
    /// the link sender, in send order.
    pub fn split_frame(
        &mut self,
        frame: &[u8],
        timestamp: u32,
        is_keyframe: bool,
    ) -> Result<Vec<Bytes>, CipherError> {
        let crc = crc32fast::hash(frame);
        let ext = FragmentExtension {
            crc32: crc,
            frame_seq: self.frame_seq,
        };

        let chunk_count = frame.len().div_ceil(CHUNK_SIZE).max(1);
        let mut out = Vec::with_capacity(chunk_count);

        let mut first = true;
        let mut chunks = frame.chunks(CHUNK_SIZE);
        loop {
            let chunk = match chunks.next() {
                Some(c) => c,
                // Zero-length frames still produce one (empty) start chunk.
                None if first => &[][..],
                None => break,
            };

            let mut payload = Vec::with_capacity(DESCRIPTOR_LEN + chunk.len());
            payload.push(if first { DESCRIPTOR_START } else { 0x00 });
            payload.extend_from_slice(chunk);
            first = false;

            let header = PacketHeader::new(PT_VIDEO, self.seq, timestamp, self.ssrc)
                .with_extension()
                .encode();

            let body = match &self.cipher {
                Some(cipher) => cipher.seal(&header, &payload)?,
                None => payload,
            };

            let mut packet = Vec::with_capacity(header.len() + ext.encode().len() + body.len());
            packet.extend_from_slice(&header);
            packet.extend_from_slice(&ext.encode());
            packet.extend_from_slice(&body);

            out.push(WireFrame::encode(self.ssrc, self.port, MediaClass::Rtp, &packet));
            self.seq = self.seq.wrapping_add(1);

            if chunk.is_empty() {
                break;
            }
        }

        trace!(
            frame_seq = self.frame_seq,
            bytes = frame.len(),
            chunks = out.len(),
            is_keyframe,
            "Split video frame"
        );

        self.frame_seq = self.frame_seq.wrapping_add(1);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// AudioPacketizer
// ---------------------------------------------------------------------------

/// Wraps one encoded audio frame per wire packet, no fragmentation.
pub struct AudioPacketizer {
    ssrc: u32,
    port: u16,
    cipher: Option<PacketCipher>,
    seq: u16,
}

impl AudioPacketizer {
    pub fn new(identity: &StreamIdentity) -> Self {
        Self {
            ssrc: identity.ssrc,
            port: identity.transport_port,
            cipher: identity.cipher_key.as_ref().map(PacketCipher::new),
            seq: 0,
        }
    }

    pub fn packetize(&mut self, frame: &[u8], timestamp: u32) -> Result<Bytes, CipherError> {
        self.seq = self.seq.wrapping_add(1);
        let header = PacketHeader::new(PT_AUDIO, self.seq, timestamp, self.ssrc).encode();

        let body = match &self.cipher {
            Some(cipher) => cipher.seal(&header, frame)?,
            None => frame.to_vec(),
        };

        let mut packet = Vec::with_capacity(header.len() + body.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&body);
        Ok(WireFrame::encode(self.ssrc, self.port, MediaClass::Rtp, &packet))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::wire::{self, descriptor_has_start, header_len};

    fn clear_identity() -> StreamIdentity {
        StreamIdentity {
            ssrc: 0x1111,
            transport_port: 5004,
            cipher_key: None,
        }
    }

    /// Strip the WSM envelope, returning the raw packet.
    fn unwrap_packet(frame: &[u8]) -> Vec<u8> {
        let parsed = WireFrame::decode(frame).unwrap();
        assert_eq!(parsed.media_class, MediaClass::Rtp);
        parsed.payload.to_vec()
    }

    #[test]
    fn three_thousand_bytes_make_three_packets() {
        let frame: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut splitter = FrameSplitter::new(&clear_identity());
        let packets = splitter.split_frame(&frame, 90_000, true).unwrap();
        assert_eq!(packets.len(), 3);

        let crc = crc32fast::hash(&frame);
        for (i, wire_frame) in packets.iter().enumerate() {
            let pkt = unwrap_packet(wire_frame);
            let hdr = PacketHeader::decode(&pkt).unwrap();
            assert!(hdr.has_extension);
            assert_eq!(hdr.seq, 1 + i as u16);
            assert_eq!(hdr.timestamp, 90_000);

            let ext = FragmentExtension::decode(&pkt).unwrap();
            assert_eq!(ext.crc32, crc);
            assert_eq!(ext.frame_seq, 1);

            let descriptor = pkt[header_len(&pkt)];
            assert_eq!(descriptor_has_start(descriptor), i == 0);
        }

        // Chunk sizes: 1209 + 1209 + 582 payload bytes (plus descriptors).
        let last = unwrap_packet(&packets[2]);
        assert_eq!(last.len() - header_len(&last) - DESCRIPTOR_LEN, 3000 - 2 * CHUNK_SIZE);
    }

    #[test]
    fn frame_seq_advances_per_frame() {
        let mut splitter = FrameSplitter::new(&clear_identity());
        splitter.split_frame(&[1; 10], 0, false).unwrap();
        let packets = splitter.split_frame(&[2; 10], 3600, false).unwrap();
        let pkt = unwrap_packet(&packets[0]);
        assert_eq!(FragmentExtension::decode(&pkt).unwrap().frame_seq, 2);
        // Sequence numbers continue across frames.
        assert_eq!(PacketHeader::decode(&pkt).unwrap().seq, 2);
    }

    #[test]
    fn sealed_chunks_round_trip_through_the_cipher() {
        use crate::domain::identity::CipherKey;

        let identity = StreamIdentity {
            cipher_key: Some(CipherKey([3u8; 32])),
            ..clear_identity()
        };
        let frame = vec![0xABu8; 100];
        let mut splitter = FrameSplitter::new(&identity);
        let packets = splitter.split_frame(&frame, 0, false).unwrap();
        let pkt = unwrap_packet(&packets[0]);

        let cipher = PacketCipher::new(identity.cipher_key.as_ref().unwrap());
        let plain = cipher
            .open(&pkt[..wire::PACKET_HEADER_LEN], &pkt[header_len(&pkt)..])
            .unwrap();
        assert_eq!(plain[0], DESCRIPTOR_START);
        assert_eq!(&plain[1..], &frame[..]);
    }

    #[test]
    fn audio_packets_have_no_extension() {
        let mut packetizer = AudioPacketizer::new(&clear_identity());
        let wire_frame = packetizer.packetize(b"opus", 1920).unwrap();
        let pkt = unwrap_packet(&wire_frame);
        let hdr = PacketHeader::decode(&pkt).unwrap();
        assert!(!hdr.has_extension);
        assert_eq!(hdr.payload_type, PT_AUDIO);
        assert_eq!(hdr.seq, 1);
        assert_eq!(&pkt[header_len(&pkt)..], b"opus");
    }
}

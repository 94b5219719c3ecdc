//! Wire formats: the 10-byte WSM envelope, the 12-byte RTP-like packet
//! header with its fragmentation extension, and the RTCP keyframe notice.
//!
//! Pure binary transforms — no I/O.

use bytes::Bytes;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Size of the WSM envelope header.
pub const WIRE_HEADER_LEN: usize = 10;

/// Size of the fixed RTP-like packet header.
pub const PACKET_HEADER_LEN: usize = 12;

/// Extension block size: 4-byte profile/length words + 8-byte payload.
pub const EXTENSION_LEN: usize = 12;

/// Extension payload length in 32-bit words, as carried on the wire.
pub const EXTENSION_WORDS: u16 = 2;

/// Dynamic payload type used for video packets.
pub const PT_VIDEO: u8 = 96;

/// Payload type used for Opus audio packets.
pub const PT_AUDIO: u8 = 111;

/// RTCP APP packet type.
pub const RTCP_PT_APP: u8 = 204;

/// RTCP APP `name` value requesting a forced keyframe.
pub const RTCP_NAME_KEYFRAME: u32 = 1;

/// Payload descriptor prefixed to every video chunk; bit 3 marks the
/// first chunk of a frame.
pub const DESCRIPTOR_LEN: usize = 1;
pub const DESCRIPTOR_START: u8 = 0x08;

/// True when a chunk descriptor carries the frame-start marker.
pub fn descriptor_has_start(descriptor: u8) -> bool {
    (descriptor >> 3) & 1 != 0
}

// ---------------------------------------------------------------------------
// WSM envelope
// ---------------------------------------------------------------------------

/// Top-level message discriminator of the WSM envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireMsgType {
    Media = 1,
    Blob = 2,
}

impl TryFrom<u8> for WireMsgType {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        match v {
            1 => Ok(Self::Media),
            2 => Ok(Self::Blob),
            other => Err(other),
        }
    }
}

/// Class of the media payload inside a [`WireMsgType::Media`] frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MediaClass {
    Rtp = 1,
    Rtcp = 2,
}

impl TryFrom<u16> for MediaClass {
    type Error = u16;
    fn try_from(v: u16) -> Result<Self, u16> {
        match v {
            1 => Ok(Self::Rtp),
            2 => Ok(Self::Rtcp),
            other => Err(other),
        }
    }
}

/// One parsed WSM envelope.
///
/// Layout (big-endian): `msg_type(u8) | flags(u8) | ssrc(u32) |
/// port(u16) | media_class(u16) | payload`. The payload length is
/// implicit from the transport message length.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub msg_type: WireMsgType,
    pub flags: u8,
    pub ssrc: u32,
    pub port: u16,
    pub media_class: MediaClass,
    pub payload: Bytes,
}

impl WireFrame {
    /// Serialize an envelope around `payload`.
    pub fn encode(ssrc: u32, port: u16, media_class: MediaClass, payload: &[u8]) -> Bytes {
        let mut out = Vec::with_capacity(WIRE_HEADER_LEN + payload.len());
        out.push(WireMsgType::Media as u8);
        out.push(0); // flags
        out.extend_from_slice(&ssrc.to_be_bytes());
        out.extend_from_slice(&port.to_be_bytes());
        out.extend_from_slice(&(media_class as u16).to_be_bytes());
        out.extend_from_slice(payload);
        Bytes::from(out)
    }

    /// Parse an envelope. Returns `None` when the buffer is shorter than
    /// the header or a discriminator is unknown.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < WIRE_HEADER_LEN {
            return None;
        }
        let msg_type = WireMsgType::try_from(buf[0]).ok()?;
        let flags = buf[1];
        let ssrc = u32::from_be_bytes(buf[2..6].try_into().ok()?);
        let port = u16::from_be_bytes([buf[6], buf[7]]);
        let media_class = MediaClass::try_from(u16::from_be_bytes([buf[8], buf[9]])).ok()?;
        Some(Self {
            msg_type,
            flags,
            ssrc,
            port,
            media_class,
            payload: Bytes::copy_from_slice(&buf[WIRE_HEADER_LEN..]),
        })
    }
}

// ---------------------------------------------------------------------------
// RTP-like packet header
// ---------------------------------------------------------------------------

/// The fixed 12-byte packet header (version always 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub payload_type: u8,
    pub seq: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub marker: bool,
    pub has_extension: bool,
    pub csrc_count: u8,
}

impl PacketHeader {
    pub fn new(payload_type: u8, seq: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            payload_type,
            seq,
            timestamp,
            ssrc,
            marker: false,
            has_extension: false,
            csrc_count: 0,
        }
    }

    pub fn with_extension(mut self) -> Self {
        self.has_extension = true;
        self
    }

    /// Serialize to the fixed 12-byte layout.
    pub fn encode(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut out = [0u8; PACKET_HEADER_LEN];
        out[0] = 0x80 | if self.has_extension { 0x10 } else { 0 } | (self.csrc_count & 0x0F);
        out[1] = if self.marker { 0x80 } else { 0 } | (self.payload_type & 0x7F);
        out[2..4].copy_from_slice(&self.seq.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        out
    }

    /// Parse the fixed part of a packet header.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < PACKET_HEADER_LEN {
            return None;
        }
        Some(Self {
            payload_type: buf[1] & 0x7F,
            seq: u16::from_be_bytes([buf[2], buf[3]]),
            timestamp: u32::from_be_bytes(buf[4..8].try_into().ok()?),
            ssrc: u32::from_be_bytes(buf[8..12].try_into().ok()?),
            marker: buf[1] & 0x80 != 0,
            has_extension: buf[0] & 0x10 != 0,
            csrc_count: buf[0] & 0x0F,
        })
    }
}

/// Full header length of a packet including CSRC entries and extension
/// words. Returns the input length when the computed length would run
/// past it, so callers can slice safely on malformed input.
pub fn header_len(pkt: &[u8]) -> usize {
    if pkt.len() < PACKET_HEADER_LEN {
        return pkt.len();
    }
    let cc = (pkt[0] & 0x0F) as usize;
    let has_ext = pkt[0] & 0x10 != 0;
    let mut off = PACKET_HEADER_LEN + cc * 4;
    if has_ext {
        if pkt.len() < off + 4 {
            return pkt.len();
        }
        let ext_words = u16::from_be_bytes([pkt[off + 2], pkt[off + 3]]) as usize;
        off += 4 + ext_words * 4;
    }
    off.min(pkt.len())
}

// ---------------------------------------------------------------------------
// Fragmentation extension
// ---------------------------------------------------------------------------

/// Extension payload carried on every fragmented video packet:
/// the CRC-32 of the whole unencoded frame and the frame sequence
/// number shared by all of its chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentExtension {
    pub crc32: u32,
    pub frame_seq: u16,
}

impl FragmentExtension {
    /// Serialize the full 12-byte extension block: `profile(u16=0) |
    /// length(u16=2 words) | crc32(u32) | frame_seq(u16) | reserved(u16)`.
    pub fn encode(&self) -> [u8; EXTENSION_LEN] {
        let mut out = [0u8; EXTENSION_LEN];
        out[2..4].copy_from_slice(&EXTENSION_WORDS.to_be_bytes());
        out[4..8].copy_from_slice(&self.crc32.to_be_bytes());
        out[8..10].copy_from_slice(&self.frame_seq.to_be_bytes());
        out
    }

    /// Read the extension from a full packet (header included).
    /// Returns `None` when the packet has no extension bit or is short.
    pub fn decode(pkt: &[u8]) -> Option<Self> {
        if pkt.len() < PACKET_HEADER_LEN || pkt[0] & 0x10 == 0 {
            return None;
        }
        let off = PACKET_HEADER_LEN + (pkt[0] & 0x0F) as usize * 4;
        if pkt.len() < off + EXTENSION_LEN {
            return None;
        }
        Some(Self {
            crc32: u32::from_be_bytes(pkt[off + 4..off + 8].try_into().ok()?),
            frame_seq: u16::from_be_bytes([pkt[off + 8], pkt[off + 9]]),
        })
    }
}

// ---------------------------------------------------------------------------
// RTCP keyframe notice
// ---------------------------------------------------------------------------

/// Serialize an RTCP APP packet carrying the force-keyframe request.
pub fn encode_keyframe_request(ssrc: u32) -> Bytes {
    let mut out = Vec::with_capacity(12);
    out.push(0x80); // V=2, P=0, count=0
    out.push(RTCP_PT_APP);
    out.extend_from_slice(&2u16.to_be_bytes()); // length: total/4 - 1
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.extend_from_slice(&RTCP_NAME_KEYFRAME.to_be_bytes());
    Bytes::from(out)
}

/// True when an RTCP payload is a force-keyframe request.
pub fn is_keyframe_request(payload: &[u8]) -> bool {
    payload.len() >= 12
        && payload[1] == RTCP_PT_APP
        && u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]])
            == RTCP_NAME_KEYFRAME
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_frame_round_trip() {
        let frame = WireFrame::encode(0xAABBCCDD, 5004, MediaClass::Rtp, b"payload");
        assert_eq!(frame.len(), WIRE_HEADER_LEN + 7);
        let parsed = WireFrame::decode(&frame).unwrap();
        assert_eq!(parsed.msg_type, WireMsgType::Media);
        assert_eq!(parsed.ssrc, 0xAABBCCDD);
        assert_eq!(parsed.port, 5004);
        assert_eq!(parsed.media_class, MediaClass::Rtp);
        assert_eq!(&parsed.payload[..], b"payload");
    }

    #[test]
    fn wire_frame_too_short_is_none() {
        assert!(WireFrame::decode(&[1, 0, 0, 0, 0, 0, 0, 0, 0]).is_none());
    }

    #[test]
    fn packet_header_round_trip() {
        let hdr = PacketHeader::new(PT_VIDEO, 42, 90_000, 7).with_extension();
        let bytes = hdr.encode();
        assert_eq!(bytes[0], 0x90); // V=2 + X bit
        assert_eq!(bytes[1], 96);
        let parsed = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn header_len_walks_extension() {
        let hdr = PacketHeader::new(PT_VIDEO, 1, 0, 7).with_extension();
        let ext = FragmentExtension {
            crc32: 0xDEADBEEF,
            frame_seq: 3,
        };
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&hdr.encode());
        pkt.extend_from_slice(&ext.encode());
        pkt.extend_from_slice(b"data");
        assert_eq!(header_len(&pkt), PACKET_HEADER_LEN + EXTENSION_LEN);

        // No extension bit -> bare header.
        let bare = PacketHeader::new(PT_AUDIO, 1, 0, 7).encode();
        assert_eq!(header_len(&bare), PACKET_HEADER_LEN);
    }

    #[test]
    fn header_len_clamps_on_truncated_input() {
        let hdr = PacketHeader::new(PT_VIDEO, 1, 0, 7).with_extension().encode();
        // Extension bit set but the extension words are missing.
        assert_eq!(header_len(&hdr), hdr.len());
        assert_eq!(header_len(&hdr[..5]), 5);
    }

    #[test]
    fn fragment_extension_round_trip() {
        let hdr = PacketHeader::new(PT_VIDEO, 9, 0, 7).with_extension();
        let ext = FragmentExtension {
            crc32: 0x01020304,
            frame_seq: 0xBEEF,
        };
        let mut pkt = Vec::new();
        pkt.extend_from_slice(&hdr.encode());
        pkt.extend_from_slice(&ext.encode());
        assert_eq!(FragmentExtension::decode(&pkt).unwrap(), ext);

        let no_ext = PacketHeader::new(PT_VIDEO, 9, 0, 7).encode();
        assert!(FragmentExtension::decode(&no_ext).is_none());
    }

    #[test]
    fn keyframe_request_notice() {
        let rtcp = encode_keyframe_request(77);
        assert_eq!(rtcp.len(), 12);
        assert!(is_keyframe_request(&rtcp));
        assert_eq!(u32::from_be_bytes(rtcp[4..8].try_into().unwrap()), 77);

        let mut other = rtcp.to_vec();
        other[11] = 9; // different APP name
        assert!(!is_keyframe_request(&other));
    }

    #[test]
    fn descriptor_start_bit() {
        assert!(descriptor_has_start(DESCRIPTOR_START));
        assert!(!descriptor_has_start(0x00));
        assert!(!descriptor_has_start(0x04));
    }
}

//! Codec-aware RTP packetization.
//!
//! One encoded access unit (H.264/HEVC) or temporal unit (AV1) goes in,
//! a sequence of wire-ready RTP packets comes out. The only state kept
//! across frames is the sequence counter and the SSRC.

pub mod av1;
pub mod h264;
pub mod hevc;

use bytes::Bytes;
use huddle_protocol::VideoCodec;

/// Maximum RTP payload size in bytes. Chosen so a full packet
/// (12-byte header + payload) stays under typical path MTU with room
/// for SRTP auth tags.
pub const MAX_PAYLOAD: usize = 1200;

/// Fixed RTP header size (no CSRC, no extensions).
pub const RTP_HEADER_SIZE: usize = 12;

/// RTP clock rate for video.
pub const VIDEO_CLOCK_HZ: u32 = 90_000;

/// One RTP packet ready for the wire, plus the metadata the fan-out
/// needs for its drop policy.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    /// Full packet: 12-byte header followed by payload.
    pub data: Bytes,
    /// Marker bit — set on the last packet of an access unit.
    pub marker: bool,
    /// True for every packet of a keyframe access unit.
    pub keyframe: bool,
    /// RTP timestamp (90 kHz for video). Identical for all packets of
    /// one access unit, which makes it usable as an AU identifier.
    pub timestamp: u32,
    pub sequence: u16,
}

/// Sequence/SSRC bookkeeping for one RTP stream.
#[derive(Debug)]
pub struct RtpStream {
    ssrc: u32,
    payload_type: u8,
    sequence: u16,
}

impl RtpStream {
    /// New stream with a random initial sequence number (RFC 3550).
    pub fn new(ssrc: u32, payload_type: u8) -> Self {
        Self::with_sequence(ssrc, payload_type, rand::random())
    }

    pub fn with_sequence(ssrc: u32, payload_type: u8, sequence: u16) -> Self {
        Self {
            ssrc,
            payload_type,
            sequence,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Wrap a payload in an RTP header, consuming one sequence number.
    pub(crate) fn packet(
        &mut self,
        payload: &[u8],
        timestamp: u32,
        marker: bool,
        keyframe: bool,
    ) -> RtpPacket {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let mut buf = Vec::with_capacity(RTP_HEADER_SIZE + payload.len());
        buf.push(0x80); // V=2, P=0, X=0, CC=0
        buf.push(((marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.extend_from_slice(&sequence.to_be_bytes());
        buf.extend_from_slice(&timestamp.to_be_bytes());
        buf.extend_from_slice(&self.ssrc.to_be_bytes());
        buf.extend_from_slice(payload);

        RtpPacket {
            data: Bytes::from(buf),
            marker,
            keyframe,
            timestamp,
            sequence,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketizeError {
    #[error("empty access unit")]
    EmptyAccessUnit,
    #[error("no Annex B start code found")]
    MissingStartCode,
    #[error("NAL unit shorter than its header")]
    TruncatedNal,
    #[error("malformed OBU header")]
    BadObuHeader,
    #[error("OBU length overflows the temporal unit")]
    ObuLengthOverflow,
}

/// Codec-dispatching packetizer. Owns the video RTP stream state.
pub struct Packetizer {
    codec: VideoCodec,
    stream: RtpStream,
}

impl Packetizer {
    pub fn new(codec: VideoCodec, ssrc: u32, payload_type: u8) -> Self {
        Self {
            codec,
            stream: RtpStream::new(ssrc, payload_type),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_sequence(
        codec: VideoCodec,
        ssrc: u32,
        payload_type: u8,
        sequence: u16,
    ) -> Self {
        Self {
            codec,
            stream: RtpStream::with_sequence(ssrc, payload_type, sequence),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.stream.ssrc()
    }

    /// Split one access unit into RTP packets. All packets share `pts`
    /// (90 kHz); the marker bit is set on the last packet only.
    pub fn packetize(
        &mut self,
        access_unit: &[u8],
        pts: u32,
        keyframe: bool,
    ) -> Result<Vec<RtpPacket>, PacketizeError> {
        let payloads = match self.codec {
            VideoCodec::H264 => h264::payloads(access_unit)?,
            VideoCodec::Hevc => hevc::payloads(access_unit)?,
            VideoCodec::Av1 => av1::payloads(access_unit)?,
        };
        if payloads.is_empty() {
            return Err(PacketizeError::EmptyAccessUnit);
        }

        let last = payloads.len() - 1;
        Ok(payloads
            .iter()
            .enumerate()
            .map(|(i, p)| self.stream.packet(p, pts, i == last, keyframe))
            .collect())
    }
}

/// Split an Annex B byte stream into NAL unit slices (start codes removed).
/// Accepts both 4-byte (`00 00 00 01`) and 3-byte (`00 00 01`) start codes.
pub(crate) fn split_annexb(data: &[u8]) -> Result<Vec<&[u8]>, PacketizeError> {
    if data.is_empty() {
        return Err(PacketizeError::EmptyAccessUnit);
    }

    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                starts.push((i, i + 3));
                i += 3;
                continue;
            }
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push((i, i + 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    if starts.is_empty() {
        return Err(PacketizeError::MissingStartCode);
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &(_, begin)) in starts.iter().enumerate() {
        let end = starts
            .get(idx + 1)
            .map(|&(next_sc, _)| next_sc)
            .unwrap_or(data.len());
        if begin < end {
            nals.push(&data[begin..end]);
        }
    }
    Ok(nals)
}

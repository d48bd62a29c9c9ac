//! H.264 RTP payloads per RFC 6184, non-interleaved mode
//! (packetization-mode=1): Single NAL Unit packets and FU-A fragments.

use super::{MAX_PAYLOAD, PacketizeError, split_annexb};

const FU_A: u8 = 28;
const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// NAL type of an IDR slice.
pub const NAL_IDR: u8 = 5;

/// Split one Annex B access unit into RTP payloads. NALs that fit in
/// `MAX_PAYLOAD` become Single-NAL payloads; larger ones are fragmented
/// as FU-A. Start codes never reach the wire.
pub(crate) fn payloads(access_unit: &[u8]) -> Result<Vec<Vec<u8>>, PacketizeError> {
    let nals = split_annexb(access_unit)?;
    let mut out = Vec::with_capacity(nals.len());

    for nal in nals {
        if nal.is_empty() {
            continue;
        }
        if nal.len() <= MAX_PAYLOAD {
            out.push(nal.to_vec());
            continue;
        }

        // FU-A: indicator keeps F+NRI and substitutes type 28; the FU
        // header carries the original type with S/E framing bits.
        let header = nal[0];
        let fu_indicator = (header & 0xE0) | FU_A;
        let fu_type = header & 0x1F;

        let budget = MAX_PAYLOAD - 2;
        let body = &nal[1..];

        let mut offset = 0;
        while offset < body.len() {
            let take = (body.len() - offset).min(budget);
            let s = if offset == 0 { FU_START } else { 0 };
            let e = if offset + take == body.len() { FU_END } else { 0 };

            let mut payload = Vec::with_capacity(2 + take);
            payload.push(fu_indicator);
            payload.push(s | e | fu_type);
            payload.extend_from_slice(&body[offset..offset + take]);
            out.push(payload);

            offset += take;
        }
    }

    if out.is_empty() {
        return Err(PacketizeError::EmptyAccessUnit);
    }
    Ok(out)
}

/// True if the Annex B access unit contains an IDR slice.
pub fn contains_idr(access_unit: &[u8]) -> bool {
    split_annexb(access_unit)
        .map(|nals| {
            nals.iter()
                .any(|n| !n.is_empty() && n[0] & 0x1F == NAL_IDR)
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{Packetizer, RTP_HEADER_SIZE};
    use huddle_protocol::VideoCodec;

    /// Reassemble payloads back into the NAL sequence (inverse of
    /// `payloads`, without start codes).
    fn depacketize(payloads: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut nals: Vec<Vec<u8>> = Vec::new();
        let mut fragment: Option<Vec<u8>> = None;
        for p in payloads {
            let nal_type = p[0] & 0x1F;
            if nal_type == FU_A {
                let fu_header = p[1];
                if fu_header & FU_START != 0 {
                    let original = (p[0] & 0xE0) | (fu_header & 0x1F);
                    fragment = Some(vec![original]);
                }
                let frag = fragment.as_mut().expect("FU-A middle without start");
                frag.extend_from_slice(&p[2..]);
                if fu_header & FU_END != 0 {
                    nals.push(fragment.take().unwrap());
                }
            } else {
                nals.push(p.clone());
            }
        }
        nals
    }

    #[test]
    fn small_nal_is_single_nal_payload() {
        let au = [0x00, 0x00, 0x00, 0x01, 0x61, 0xAA, 0xBB];
        let p = payloads(&au).unwrap();
        assert_eq!(p, vec![vec![0x61, 0xAA, 0xBB]]);
    }

    #[test]
    fn fragments_large_idr_nal() {
        // 4000-byte NAL, type 5 (IDR), NRI 3 -> header 0x65.
        let mut au = vec![0x00, 0x00, 0x00, 0x01, 0x65];
        au.extend((0..3999u32).map(|i| i as u8));
        let p = payloads(&au).unwrap();

        // ceil((4000 - 1) / (1200 - 2)) = 4 fragments
        assert_eq!(p.len(), 4);
        for frag in &p {
            assert!(frag.len() <= MAX_PAYLOAD);
            assert_eq!(frag[0], 0x7C); // F=0, NRI=3, type 28
        }
        assert_eq!(p[0][1], 0x85); // S=1, type 5
        assert_eq!(p[1][1], 0x05);
        assert_eq!(p[2][1], 0x05);
        assert_eq!(p[3][1], 0x45); // E=1, type 5
    }

    #[test]
    fn fu_a_rtp_packets_match_contract() {
        // Scenario: 4000-byte type-5 NAL at pts 900000 through the full
        // packetizer. Marker on the last packet only, consecutive
        // sequence numbers, identical timestamps.
        let mut packetizer = Packetizer::with_sequence(VideoCodec::H264, 0x1234, 96, 1000);
        let mut au = vec![0x00, 0x00, 0x00, 0x01, 0x65];
        au.extend(std::iter::repeat_n(0x11u8, 3999));

        let pkts = packetizer.packetize(&au, 900_000, true).unwrap();
        assert_eq!(pkts.len(), 4);
        for (i, pkt) in pkts.iter().enumerate() {
            assert_eq!(pkt.sequence, 1000 + i as u16);
            assert_eq!(pkt.timestamp, 900_000);
            assert_eq!(pkt.marker, i == 3);
            assert!(pkt.keyframe);
            assert_eq!(pkt.data[RTP_HEADER_SIZE], 0x7C);
        }
    }

    #[test]
    fn roundtrip_multi_nal_access_unit() {
        // SPS + PPS + oversized IDR
        let mut au = vec![0x00, 0x00, 0x00, 0x01, 0x67, 0x4D, 0x40, 0x28];
        au.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x68, 0xEE, 0x3C, 0x80]);
        au.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x65]);
        au.extend((0..2500u32).map(|i| (i * 7) as u8));

        let p = payloads(&au).unwrap();
        let nals = depacketize(&p);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0], &[0x67, 0x4D, 0x40, 0x28]);
        assert_eq!(nals[1], &[0x68, 0xEE, 0x3C, 0x80]);
        assert_eq!(nals[2][0], 0x65);
        assert_eq!(nals[2].len(), 2501);
        let mut expected = vec![0x65];
        expected.extend((0..2500u32).map(|i| (i * 7) as u8));
        assert_eq!(nals[2], expected);
    }

    #[test]
    fn exactly_max_payload_stays_single_nal() {
        let mut au = vec![0x00, 0x00, 0x00, 0x01];
        au.push(0x61);
        au.extend(std::iter::repeat_n(0u8, MAX_PAYLOAD - 1));
        let p = payloads(&au).unwrap();
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].len(), MAX_PAYLOAD);
    }

    #[test]
    fn one_byte_over_max_payload_fragments() {
        let mut au = vec![0x00, 0x00, 0x00, 0x01];
        au.push(0x61);
        au.extend(std::iter::repeat_n(0u8, MAX_PAYLOAD));
        let p = payloads(&au).unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p[0][1] & FU_START, FU_START);
        assert_eq!(p[1][1] & FU_END, FU_END);
    }

    #[test]
    fn malformed_input_is_error_not_panic() {
        assert!(payloads(&[0x01, 0x02, 0x03]).is_err());
        assert!(payloads(&[]).is_err());
    }

    #[test]
    fn idr_detection() {
        let idr = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88];
        let non_idr = [0x00, 0x00, 0x00, 0x01, 0x61, 0x88];
        assert!(contains_idr(&idr));
        assert!(!contains_idr(&non_idr));
        assert!(!contains_idr(&[]));
    }
}

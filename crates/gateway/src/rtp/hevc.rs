//! HEVC RTP payloads per RFC 7798: Single NAL Unit packets and
//! Fragmentation Units (payload type 49).
//!
//! The two-byte HEVC NAL header is `F(1) | Type(6) | LayerId(6) | TID(3)`.
//! An FU rewrites Type to 49 and appends a one-byte FU header carrying
//! the original type with S/E framing bits.

use super::{MAX_PAYLOAD, PacketizeError, split_annexb};

const FU_TYPE: u8 = 49;
const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// IRAP NAL types that start a decodable sequence.
pub const NAL_IDR_W_RADL: u8 = 19;
pub const NAL_IDR_N_LP: u8 = 20;
pub const NAL_CRA: u8 = 21;

fn nal_type(nal: &[u8]) -> u8 {
    (nal[0] >> 1) & 0x3F
}

pub(crate) fn payloads(access_unit: &[u8]) -> Result<Vec<Vec<u8>>, PacketizeError> {
    let nals = split_annexb(access_unit)?;
    let mut out = Vec::with_capacity(nals.len());

    for nal in nals {
        if nal.is_empty() {
            continue;
        }
        if nal.len() < 2 {
            return Err(PacketizeError::TruncatedNal);
        }
        if nal.len() <= MAX_PAYLOAD {
            out.push(nal.to_vec());
            continue;
        }

        // PayloadHdr: keep F and LayerId/TID bits, substitute type 49.
        let hdr0 = (nal[0] & 0x81) | (FU_TYPE << 1);
        let hdr1 = nal[1];
        let original_type = nal_type(nal);

        let budget = MAX_PAYLOAD - 3;
        let body = &nal[2..];

        let mut offset = 0;
        while offset < body.len() {
            let take = (body.len() - offset).min(budget);
            let s = if offset == 0 { FU_START } else { 0 };
            let e = if offset + take == body.len() { FU_END } else { 0 };

            let mut payload = Vec::with_capacity(3 + take);
            payload.push(hdr0);
            payload.push(hdr1);
            payload.push(s | e | original_type);
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

/// True if the access unit contains an IRAP slice (IDR or CRA).
pub fn contains_irap(access_unit: &[u8]) -> bool {
    split_annexb(access_unit)
        .map(|nals| {
            nals.iter().any(|n| {
                n.len() >= 2 && matches!(nal_type(n), NAL_IDR_W_RADL | NAL_IDR_N_LP | NAL_CRA)
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depacketize(payloads: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut nals: Vec<Vec<u8>> = Vec::new();
        let mut fragment: Option<Vec<u8>> = None;
        for p in payloads {
            if nal_type(p) == FU_TYPE {
                let fu_header = p[2];
                if fu_header & FU_START != 0 {
                    let hdr0 = (p[0] & 0x81) | ((fu_header & 0x3F) << 1);
                    fragment = Some(vec![hdr0, p[1]]);
                }
                let frag = fragment.as_mut().expect("FU middle without start");
                frag.extend_from_slice(&p[3..]);
                if fu_header & FU_END != 0 {
                    nals.push(fragment.take().unwrap());
                }
            } else {
                nals.push(p.clone());
            }
        }
        nals
    }

    /// IDR_W_RADL NAL header: type 19, layer 0, TID 1 -> 0x26 0x01.
    fn idr_nal(len: usize) -> Vec<u8> {
        let mut nal = vec![0x26, 0x01];
        nal.extend((0..len - 2).map(|i| (i % 251) as u8));
        nal
    }

    #[test]
    fn small_nal_passthrough() {
        let mut au = vec![0x00, 0x00, 0x00, 0x01];
        au.extend_from_slice(&[0x40, 0x01, 0x0C]); // VPS
        let p = payloads(&au).unwrap();
        assert_eq!(p, vec![vec![0x40, 0x01, 0x0C]]);
    }

    #[test]
    fn large_nal_fragments_with_type_49() {
        let mut au = vec![0x00, 0x00, 0x00, 0x01];
        au.extend(idr_nal(4000));
        let p = payloads(&au).unwrap();

        // ceil((4000 - 2) / (1200 - 3)) = 4 fragments
        assert_eq!(p.len(), 4);
        for frag in &p {
            assert!(frag.len() <= MAX_PAYLOAD);
            assert_eq!(nal_type(frag), FU_TYPE);
            assert_eq!(frag[1], 0x01); // LayerId/TID preserved
        }
        assert_eq!(p[0][2], FU_START | NAL_IDR_W_RADL);
        assert_eq!(p[1][2], NAL_IDR_W_RADL);
        assert_eq!(p[2][2], NAL_IDR_W_RADL);
        assert_eq!(p[3][2], FU_END | NAL_IDR_W_RADL);
    }

    #[test]
    fn roundtrip_fragmented_nal() {
        let nal = idr_nal(5000);
        let mut au = vec![0x00, 0x00, 0x00, 0x01];
        au.extend(&nal);
        let p = payloads(&au).unwrap();
        let nals = depacketize(&p);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0], nal);
    }

    #[test]
    fn single_byte_nal_is_error() {
        let au = [0x00, 0x00, 0x00, 0x01, 0x26];
        assert_eq!(payloads(&au), Err(PacketizeError::TruncatedNal));
    }

    #[test]
    fn irap_detection() {
        let mut idr = vec![0x00, 0x00, 0x00, 0x01];
        idr.extend(idr_nal(10));
        assert!(contains_irap(&idr));

        // TRAIL_R slice, type 1 -> header 0x02 0x01
        let trail = [0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0xAB];
        assert!(!contains_irap(&trail));
    }
}

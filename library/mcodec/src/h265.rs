use bytes::BytesMut;

pub mod nalu_type {
    pub const IDR_W_RADL: u8 = 19;
    pub const IDR_N_LP: u8 = 20;
    pub const CRA_NUT: u8 = 21;
    pub const VPS: u8 = 32;
    pub const SPS: u8 = 33;
    pub const PPS: u8 = 34;
    pub const AUD: u8 = 35;
    pub const AGGREGATION: u8 = 48;
    pub const FRAGMENTATION: u8 = 49;
}

/// H.265 NAL type lives in bits 1..6 of the first byte.
pub fn nal_type(nalu: &[u8]) -> u8 {
    if nalu.is_empty() {
        return 0;
    }
    (nalu[0] >> 1) & 0x3F
}

pub fn is_key_frame(typ: u8) -> bool {
    matches!(
        typ,
        nalu_type::IDR_W_RADL | nalu_type::IDR_N_LP | nalu_type::CRA_NUT
    )
}

pub fn is_parameter_set(typ: u8) -> bool {
    matches!(typ, nalu_type::VPS | nalu_type::SPS | nalu_type::PPS)
}

/// Recover VPS / SPS / PPS from a single RTP payload (single NAL or an
/// aggregation packet); fragments go through the access-unit path instead.
pub fn extract_params(
    payload: &[u8],
) -> (Option<BytesMut>, Option<BytesMut>, Option<BytesMut>) {
    if payload.len() < 2 {
        return (None, None, None);
    }

    let mut vps = None;
    let mut sps = None;
    let mut pps = None;

    let mut store = |nalu: &[u8]| match nal_type(nalu) {
        nalu_type::VPS => vps = Some(BytesMut::from(nalu)),
        nalu_type::SPS => sps = Some(BytesMut::from(nalu)),
        nalu_type::PPS => pps = Some(BytesMut::from(nalu)),
        _ => {}
    };

    match nal_type(payload) {
        nalu_type::AGGREGATION => {
            let mut rest = &payload[2..];
            while rest.len() >= 2 {
                let size = (rest[0] as usize) << 8 | rest[1] as usize;
                rest = &rest[2..];
                if size == 0 || size > rest.len() {
                    break;
                }
                store(&rest[..size]);
                rest = &rest[size..];
            }
        }
        _ => store(payload),
    }

    (vps, sps, pps)
}

#[cfg(test)]
mod tests {
    use super::*;

    // first bytes only matter for type classification
    const VPS: [u8; 4] = [0x40, 0x01, 0x0C, 0x01];
    const SPS: [u8; 4] = [0x42, 0x01, 0x01, 0x01];
    const PPS: [u8; 3] = [0x44, 0x01, 0xC1];

    #[test]
    fn type_classification() {
        assert_eq!(nal_type(&VPS), nalu_type::VPS);
        assert_eq!(nal_type(&SPS), nalu_type::SPS);
        assert_eq!(nal_type(&PPS), nalu_type::PPS);
        assert!(is_key_frame(nalu_type::IDR_W_RADL));
        assert!(is_key_frame(nalu_type::CRA_NUT));
        assert!(!is_key_frame(1));
    }

    #[test]
    fn extract_from_aggregation() {
        let mut payload = vec![nalu_type::AGGREGATION << 1, 0x00];
        for nalu in [&VPS[..], &SPS[..], &PPS[..]] {
            payload.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
            payload.extend_from_slice(nalu);
        }

        let (vps, sps, pps) = extract_params(&payload);
        assert_eq!(&vps.unwrap()[..], &VPS[..]);
        assert_eq!(&sps.unwrap()[..], &SPS[..]);
        assert_eq!(&pps.unwrap()[..], &PPS[..]);
    }

    #[test]
    fn extract_from_single() {
        let (vps, sps, pps) = extract_params(&SPS);
        assert!(vps.is_none());
        assert!(sps.is_some());
        assert!(pps.is_none());
    }
}

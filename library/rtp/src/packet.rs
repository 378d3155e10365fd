use {
    crate::errors::{RtpError, RtpErrorValue},
    bytes::{BufMut, BytesMut},
};

pub const RTP_FIXED_HEADER_LEN: usize = 12;

///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub seq_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: BytesMut,
}

impl RtpPacket {
    pub fn new(header: RtpHeader) -> Self {
        Self {
            header,
            payload: BytesMut::new(),
        }
    }

    pub fn marshal(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(RTP_FIXED_HEADER_LEN + self.payload.len());
        let h = &self.header;

        out.put_u8(
            h.version << 6
                | (h.padding as u8) << 5
                | (h.extension as u8) << 4
                | h.csrc_count & 0x0F,
        );
        out.put_u8((h.marker as u8) << 7 | h.payload_type & 0x7F);
        out.put_u16(h.seq_number);
        out.put_u32(h.timestamp);
        out.put_u32(h.ssrc);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, RtpError> {
        if data.len() < RTP_FIXED_HEADER_LEN {
            return Err(RtpError {
                value: RtpErrorValue::NotEnoughBytes,
            });
        }

        let header = RtpHeader {
            version: data[0] >> 6,
            padding: data[0] & 0x20 != 0,
            extension: data[0] & 0x10 != 0,
            csrc_count: data[0] & 0x0F,
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            seq_number: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        };

        let mut pos = RTP_FIXED_HEADER_LEN + header.csrc_count as usize * 4;
        if pos > data.len() {
            return Err(RtpError::malformed("csrc list beyond packet"));
        }

        if header.extension {
            if pos + 4 > data.len() {
                return Err(RtpError::malformed("truncated extension header"));
            }
            let ext_words =
                u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            pos += 4 + ext_words * 4;
            if pos > data.len() {
                return Err(RtpError::malformed("extension beyond packet"));
            }
        }

        let mut payload_end = data.len();
        if header.padding {
            if payload_end == pos {
                return Err(RtpError::malformed("padding flag on empty payload"));
            }
            let pad = data[payload_end - 1] as usize;
            if pad == 0 || pos + pad > payload_end {
                return Err(RtpError::malformed("bad padding length"));
            }
            payload_end -= pad;
        }

        Ok(Self {
            header,
            payload: BytesMut::from(&data[pos..payload_end]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marshal_unmarshal_round_trip() {
        let mut pkt = RtpPacket::new(RtpHeader {
            version: 2,
            marker: true,
            payload_type: 96,
            seq_number: 57899,
            timestamp: 345234345,
            ssrc: 978651231,
            ..Default::default()
        });
        pkt.payload.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);

        let data = pkt.marshal();
        assert_eq!(data.len(), 16);
        assert_eq!(data[0], 0x80);
        assert_eq!(data[1], 0x80 | 96);

        let parsed = RtpPacket::unmarshal(&data).unwrap();
        assert_eq!(parsed, pkt);
    }

    #[test]
    fn padding_is_stripped() {
        let mut pkt = RtpPacket::new(RtpHeader {
            version: 2,
            payload_type: 96,
            ..Default::default()
        });
        pkt.payload.extend_from_slice(&[0xAA, 0xBB]);

        let mut data = pkt.marshal();
        data[0] |= 0x20; // padding flag
        data.extend_from_slice(&[0x00, 0x00, 0x03]); // 3 bytes of padding

        let parsed = RtpPacket::unmarshal(&data).unwrap();
        assert_eq!(&parsed.payload[..], &[0xAA, 0xBB]);
        assert!(parsed.header.padding);
    }

    #[test]
    fn truncated_packet_is_rejected() {
        assert!(RtpPacket::unmarshal(&[0x80, 0x60, 0x00]).is_err());
    }
}

use {
    crate::{
        errors::{RtpError, RtpErrorValue},
        packet::{RtpHeader, RtpPacket},
        AccessUnit,
    },
    bytes::{BufMut, BytesMut},
};

/// MPEG-4 audio over RTP per RFC 3640 (AAC-hbr: sizeLength=13,
/// indexLength=3 in the common case, both taken from the negotiated
/// format).
pub struct AacPacker {
    header: RtpHeader,
    size_length: u8,
    index_length: u8,
}

impl AacPacker {
    pub fn new(
        payload_type: u8,
        ssrc: u32,
        init_seq: u16,
        size_length: u8,
        index_length: u8,
    ) -> Self {
        Self {
            header: RtpHeader {
                version: 2,
                payload_type,
                ssrc,
                seq_number: init_seq,
                ..Default::default()
            },
            size_length,
            index_length,
        }
    }

    /// One AU per packet; the marker is always set since an AU never spans
    /// packets at the sizes this server relays.
    pub fn pack(&mut self, frame: &[u8], timestamp: u32) -> Result<Vec<RtpPacket>, RtpError> {
        if self.size_length != 13 || self.index_length != 3 {
            return Err(RtpError::malformed("unsupported au header layout"));
        }

        self.header.timestamp = timestamp;

        let mut packet = RtpPacket::new(self.header.clone());
        packet.header.marker = true;
        packet.payload.put_u16(16); // AU-headers-length in bits
        packet
            .payload
            .put_u16((frame.len() as u16) << 3); // 13-bit size, 3-bit index = 0
        packet.payload.extend_from_slice(frame);
        self.header.seq_number = self.header.seq_number.wrapping_add(1);

        Ok(vec![packet])
    }
}

#[derive(Default)]
pub struct AacUnpacker {
    size_length: u8,
    index_length: u8,
}

impl AacUnpacker {
    pub fn new(size_length: u8, index_length: u8) -> Self {
        Self {
            size_length,
            index_length,
        }
    }

    /// Each packet carries whole AUs, so unlike video there is nothing to
    /// accumulate across packets.
    pub fn unpack(&mut self, packet: &RtpPacket) -> Result<Option<AccessUnit>, RtpError> {
        if self.size_length != 13 || self.index_length != 3 {
            return Err(RtpError::malformed("unsupported au header layout"));
        }
        if packet.payload.len() < 2 {
            return Err(RtpError {
                value: RtpErrorValue::NotEnoughBytes,
            });
        }

        let headers_bits =
            (packet.payload[0] as usize) << 8 | packet.payload[1] as usize;
        let headers_len = (headers_bits + 7) / 8;
        if 2 + headers_len > packet.payload.len() {
            return Err(RtpError::malformed("au headers beyond payload"));
        }

        let au_count = headers_bits / 16;
        let mut sizes = Vec::with_capacity(au_count);
        for i in 0..au_count {
            let off = 2 + i * 2;
            let h = (packet.payload[off] as usize) << 8 | packet.payload[off + 1] as usize;
            sizes.push(h >> 3);
        }

        let mut units = Vec::with_capacity(au_count);
        let mut pos = 2 + headers_len;
        for size in sizes {
            if pos + size > packet.payload.len() {
                return Err(RtpError::malformed("au data beyond payload"));
            }
            units.push(BytesMut::from(&packet.payload[pos..pos + size]));
            pos += size;
        }

        if units.is_empty() {
            return Ok(None);
        }

        Ok(Some(AccessUnit {
            units,
            timestamp: packet.header.timestamp,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let frame = [0x11u8; 120];
        let mut packer = AacPacker::new(97, 9, 0, 13, 3);
        let packets = packer.pack(&frame, 48000).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].header.marker);

        let mut unpacker = AacUnpacker::new(13, 3);
        let au = unpacker.unpack(&packets[0]).unwrap().unwrap();
        assert_eq!(au.units.len(), 1);
        assert_eq!(&au.units[0][..], &frame[..]);
        assert_eq!(au.timestamp, 48000);
    }

    #[test]
    fn multiple_aus_in_one_packet() {
        let mut packet = RtpPacket::new(RtpHeader {
            version: 2,
            marker: true,
            payload_type: 97,
            timestamp: 1024,
            ..Default::default()
        });
        packet.payload.put_u16(32); // two AU headers
        packet.payload.put_u16(3 << 3);
        packet.payload.put_u16(2 << 3);
        packet.payload.extend_from_slice(&[1, 2, 3, 4, 5]);

        let mut unpacker = AacUnpacker::new(13, 3);
        let au = unpacker.unpack(&packet).unwrap().unwrap();
        assert_eq!(au.units.len(), 2);
        assert_eq!(&au.units[0][..], &[1, 2, 3]);
        assert_eq!(&au.units[1][..], &[4, 5]);
    }

    #[test]
    fn truncated_au_is_rejected() {
        let mut packet = RtpPacket::new(RtpHeader::default());
        packet.payload.put_u16(16);
        packet.payload.put_u16(100 << 3);
        packet.payload.extend_from_slice(&[0; 4]);

        let mut unpacker = AacUnpacker::new(13, 3);
        assert!(unpacker.unpack(&packet).is_err());
    }
}

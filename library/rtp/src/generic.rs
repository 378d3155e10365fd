use {
    crate::{
        errors::RtpError,
        packet::{RtpHeader, RtpPacket},
        AccessUnit,
    },
    bytes::BytesMut,
};

/// Pass-through packetizer for codecs the server relays without
/// re-packetization (Opus, VP8/VP9, PCM, G.711, MPEG-1/2 audio). One unit
/// per packet in both directions.
pub struct GenericPacker {
    header: RtpHeader,
}

impl GenericPacker {
    pub fn new(payload_type: u8, ssrc: u32, init_seq: u16) -> Self {
        Self {
            header: RtpHeader {
                version: 2,
                payload_type,
                ssrc,
                seq_number: init_seq,
                ..Default::default()
            },
        }
    }

    pub fn pack(&mut self, unit: &[u8], timestamp: u32) -> Result<Vec<RtpPacket>, RtpError> {
        self.header.timestamp = timestamp;
        let mut packet = RtpPacket::new(self.header.clone());
        packet.header.marker = true;
        packet.payload.extend_from_slice(unit);
        self.header.seq_number = self.header.seq_number.wrapping_add(1);
        Ok(vec![packet])
    }
}

#[derive(Default)]
pub struct GenericUnpacker;

impl GenericUnpacker {
    pub fn new() -> Self {
        Self
    }

    pub fn unpack(&mut self, packet: &RtpPacket) -> Result<Option<AccessUnit>, RtpError> {
        if packet.payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(AccessUnit {
            units: vec![BytesMut::from(&packet.payload[..])],
            timestamp: packet.header.timestamp,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut packer = GenericPacker::new(111, 5, 1);
        let packets = packer.pack(&[9, 8, 7], 500).unwrap();
        let mut unpacker = GenericUnpacker::new();
        let au = unpacker.unpack(&packets[0]).unwrap().unwrap();
        assert_eq!(&au.units[0][..], &[9, 8, 7]);
    }
}

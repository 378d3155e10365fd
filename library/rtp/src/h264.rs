use {
    crate::{
        errors::{RtpError, RtpErrorValue},
        packet::{RtpHeader, RtpPacket, RTP_FIXED_HEADER_LEN},
        AccessUnit,
    },
    bytes::{BufMut, BytesMut},
    mcodec::h264::{nal_type, nalu_type},
};

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// H.264 RTP packetizer (RFC 6184): single NAL unit packets when a NALU
/// fits the MTU, FU-A fragmentation otherwise. The marker bit is set on the
/// final packet of each access unit.
pub struct H264Packer {
    header: RtpHeader,
    mtu: usize,
}

impl H264Packer {
    pub fn new(payload_type: u8, ssrc: u32, init_seq: u16, mtu: usize) -> Self {
        Self {
            header: RtpHeader {
                version: 2,
                payload_type,
                ssrc,
                seq_number: init_seq,
                ..Default::default()
            },
            mtu,
        }
    }

    pub fn next_seq(&self) -> u16 {
        self.header.seq_number
    }

    pub fn pack(
        &mut self,
        nalus: &[&[u8]],
        timestamp: u32,
    ) -> Result<Vec<RtpPacket>, RtpError> {
        self.header.timestamp = timestamp;
        let mut packets = Vec::new();

        for (idx, nalu) in nalus.iter().enumerate() {
            let last_nalu = idx == nalus.len() - 1;
            if nalu.len() + RTP_FIXED_HEADER_LEN <= self.mtu {
                packets.push(self.pack_single(nalu, last_nalu));
            } else {
                self.pack_fu_a(nalu, last_nalu, &mut packets)?;
            }
        }

        Ok(packets)
    }

    fn pack_single(&mut self, nalu: &[u8], marker: bool) -> RtpPacket {
        let mut packet = RtpPacket::new(self.header.clone());
        packet.header.marker = marker;
        packet.payload.extend_from_slice(nalu);
        self.header.seq_number = self.header.seq_number.wrapping_add(1);
        packet
    }

    fn pack_fu_a(
        &mut self,
        nalu: &[u8],
        last_nalu: bool,
        packets: &mut Vec<RtpPacket>,
    ) -> Result<(), RtpError> {
        if nalu.is_empty() {
            return Err(RtpError::malformed("empty nalu"));
        }

        let first = nalu[0];
        let fu_indicator = (first & 0xE0) | nalu_type::FU_A;
        let max_fragment = self
            .mtu
            .checked_sub(RTP_FIXED_HEADER_LEN + 2)
            .ok_or_else(|| RtpError::malformed("mtu smaller than headers"))?;

        let mut rest = &nalu[1..];
        let mut first_fragment = true;

        while !rest.is_empty() {
            let take = rest.len().min(max_fragment);
            let last_fragment = take == rest.len();

            let mut fu_header = first & 0x1F;
            if first_fragment {
                fu_header |= FU_START;
            }
            if last_fragment {
                fu_header |= FU_END;
            }

            let mut packet = RtpPacket::new(self.header.clone());
            packet.header.marker = last_fragment && last_nalu;
            packet.payload.put_u8(fu_indicator);
            packet.payload.put_u8(fu_header);
            packet.payload.extend_from_slice(&rest[..take]);
            self.header.seq_number = self.header.seq_number.wrapping_add(1);
            packets.push(packet);

            rest = &rest[take..];
            first_fragment = false;
        }

        Ok(())
    }
}

/// H.264 RTP depacketizer. NAL units are accumulated until a packet with
/// the marker bit arrives, then the whole access unit is returned; partial
/// units are never emitted.
#[derive(Default)]
pub struct H264Unpacker {
    fu_buffer: BytesMut,
    pending: Vec<BytesMut>,
    timestamp: u32,
}

impl H264Unpacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unpack(&mut self, packet: &RtpPacket) -> Result<Option<AccessUnit>, RtpError> {
        if packet.payload.is_empty() {
            return Ok(None);
        }

        self.timestamp = packet.header.timestamp;

        match packet.payload[0] & 0x1F {
            1..=23 => {
                self.pending.push(packet.payload.clone());
            }
            nalu_type::STAP_A => self.unpack_stap(&packet.payload[1..])?,
            nalu_type::STAP_B => {
                if packet.payload.len() < 3 {
                    return Err(RtpError {
                        value: RtpErrorValue::NotEnoughBytes,
                    });
                }
                self.unpack_stap(&packet.payload[3..])?
            }
            nalu_type::FU_A => self.unpack_fu(packet.payload[0], &packet.payload[1..], 0)?,
            nalu_type::FU_B => self.unpack_fu(packet.payload[0], &packet.payload[1..], 2)?,
            other => {
                return Err(RtpError::malformed(&format!(
                    "unhandled nal packet type {other}"
                )))
            }
        }

        if packet.header.marker && !self.pending.is_empty() {
            let units = std::mem::take(&mut self.pending);
            return Ok(Some(AccessUnit {
                units,
                timestamp: self.timestamp,
            }));
        }

        Ok(None)
    }

    fn unpack_stap(&mut self, mut rest: &[u8]) -> Result<(), RtpError> {
        while rest.len() >= 2 {
            let size = (rest[0] as usize) << 8 | rest[1] as usize;
            rest = &rest[2..];
            if size == 0 {
                break;
            }
            if size > rest.len() {
                return Err(RtpError::malformed("stap unit beyond payload"));
            }
            self.pending.push(BytesMut::from(&rest[..size]));
            rest = &rest[size..];
        }
        Ok(())
    }

    fn unpack_fu(
        &mut self,
        fu_indicator: u8,
        data: &[u8],
        don_len: usize,
    ) -> Result<(), RtpError> {
        if data.len() < 1 + don_len {
            return Err(RtpError {
                value: RtpErrorValue::NotEnoughBytes,
            });
        }
        let fu_header = data[0];
        let fragment = &data[1 + don_len..];

        if fu_header & FU_START != 0 {
            self.fu_buffer.clear();
            // original NAL header = indicator's F/NRI bits + fragment type
            self.fu_buffer
                .put_u8((fu_indicator & 0xE0) | (fu_header & 0x1F));
        } else if self.fu_buffer.is_empty() {
            return Err(RtpError {
                value: RtpErrorValue::NonStartingFragment,
            });
        }

        self.fu_buffer.extend_from_slice(fragment);

        if fu_header & FU_END != 0 {
            let nalu = self.fu_buffer.split_to(self.fu_buffer.len());
            self.pending.push(nalu);
        }

        Ok(())
    }
}

/// Emits NAL types worth logging once per stream.
pub fn is_parameter_nalu(nalu: &[u8]) -> bool {
    matches!(nal_type(nalu), nalu_type::SPS | nalu_type::PPS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_nalu_round_trip() {
        let mut packer = H264Packer::new(96, 0x1234, 100, 1400);
        let nalu: &[u8] = &[0x65, 0x01, 0x02, 0x03];
        let packets = packer.pack(&[nalu], 9000).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].header.marker);
        assert_eq!(packets[0].header.seq_number, 100);

        let mut unpacker = H264Unpacker::new();
        let au = unpacker.unpack(&packets[0]).unwrap().unwrap();
        assert_eq!(au.units.len(), 1);
        assert_eq!(&au.units[0][..], nalu);
        assert_eq!(au.timestamp, 9000);
    }

    #[test]
    fn oversize_nalu_is_fragmented_and_reassembled() {
        let mtu = 200;
        let mut packer = H264Packer::new(96, 1, 0, mtu);
        let mut nalu = vec![0x65u8];
        nalu.extend((0..1000).map(|i| (i % 251) as u8));

        let packets = packer.pack(&[&nalu], 1234).unwrap();
        assert!(packets.len() > 1);
        for p in &packets {
            assert!(p.marshal().len() <= mtu);
            assert_eq!(p.payload[0] & 0x1F, nalu_type::FU_A);
        }
        assert!(packets.last().unwrap().header.marker);
        assert!(!packets[0].header.marker);

        let mut unpacker = H264Unpacker::new();
        let mut got = None;
        for p in &packets {
            if let Some(au) = unpacker.unpack(p).unwrap() {
                got = Some(au);
            }
        }
        let au = got.expect("no access unit emitted");
        assert_eq!(au.units.len(), 1);
        assert_eq!(&au.units[0][..], &nalu[..]);
    }

    #[test]
    fn stap_a_expands_to_multiple_nalus() {
        let sps: &[u8] = &[0x67, 0x42, 0x00, 0x1E];
        let pps: &[u8] = &[0x68, 0xCE, 0x38, 0x80];

        let mut payload = BytesMut::new();
        payload.put_u8(nalu_type::STAP_A);
        payload.put_u16(sps.len() as u16);
        payload.extend_from_slice(sps);
        payload.put_u16(pps.len() as u16);
        payload.extend_from_slice(pps);

        let mut packet = RtpPacket::new(RtpHeader {
            version: 2,
            marker: true,
            payload_type: 96,
            ..Default::default()
        });
        packet.payload = payload;

        let mut unpacker = H264Unpacker::new();
        let au = unpacker.unpack(&packet).unwrap().unwrap();
        assert_eq!(au.units.len(), 2);
        assert_eq!(&au.units[0][..], sps);
        assert_eq!(&au.units[1][..], pps);
    }

    #[test]
    fn fragment_without_start_is_an_error() {
        let mut packet = RtpPacket::new(RtpHeader {
            version: 2,
            ..Default::default()
        });
        packet.payload.put_u8(nalu_type::FU_A | 0x60);
        packet.payload.put_u8(0x05); // neither start nor end
        packet.payload.extend_from_slice(&[1, 2, 3]);

        let mut unpacker = H264Unpacker::new();
        assert!(unpacker.unpack(&packet).is_err());
    }

    #[test]
    fn no_unit_before_marker() {
        let mut packer = H264Packer::new(96, 1, 0, 1400);
        let packets = packer
            .pack(&[&[0x67, 0x42][..], &[0x68, 0xCE][..], &[0x65, 0x88][..]], 0)
            .unwrap();
        assert_eq!(packets.len(), 3);
        assert!(!packets[0].header.marker);
        assert!(!packets[1].header.marker);
        assert!(packets[2].header.marker);

        let mut unpacker = H264Unpacker::new();
        assert!(unpacker.unpack(&packets[0]).unwrap().is_none());
        assert!(unpacker.unpack(&packets[1]).unwrap().is_none());
        let au = unpacker.unpack(&packets[2]).unwrap().unwrap();
        assert_eq!(au.units.len(), 3);
    }
}

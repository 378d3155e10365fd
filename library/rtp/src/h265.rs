use {
    crate::{
        errors::{RtpError, RtpErrorValue},
        packet::{RtpHeader, RtpPacket, RTP_FIXED_HEADER_LEN},
        AccessUnit,
    },
    bytes::{BufMut, BytesMut},
    mcodec::h265::nalu_type,
};

const FU_START: u8 = 0x80;
const FU_END: u8 = 0x40;

/// H.265 RTP packetizer (RFC 7798): single NAL unit packets and FU
/// fragmentation. Aggregation packets are accepted inbound but never
/// produced.
pub struct H265Packer {
    header: RtpHeader,
    mtu: usize,
}

impl H265Packer {
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
                let mut packet = RtpPacket::new(self.header.clone());
                packet.header.marker = last_nalu;
                packet.payload.extend_from_slice(nalu);
                self.header.seq_number = self.header.seq_number.wrapping_add(1);
                packets.push(packet);
            } else {
                self.pack_fu(nalu, last_nalu, &mut packets)?;
            }
        }

        Ok(packets)
    }

    fn pack_fu(
        &mut self,
        nalu: &[u8],
        last_nalu: bool,
        packets: &mut Vec<RtpPacket>,
    ) -> Result<(), RtpError> {
        if nalu.len() < 2 {
            return Err(RtpError::malformed("h265 nalu too short"));
        }

        let nal_typ = (nalu[0] >> 1) & 0x3F;
        // payload header of the FU packet: type 49, layer/tid copied
        let ph0 = (nalu[0] & 0x81) | nalu_type::FRAGMENTATION << 1;
        let ph1 = nalu[1];

        let max_fragment = self
            .mtu
            .checked_sub(RTP_FIXED_HEADER_LEN + 3)
            .ok_or_else(|| RtpError::malformed("mtu smaller than headers"))?;

        let mut rest = &nalu[2..];
        let mut first_fragment = true;

        while !rest.is_empty() {
            let take = rest.len().min(max_fragment);
            let last_fragment = take == rest.len();

            let mut fu_header = nal_typ;
            if first_fragment {
                fu_header |= FU_START;
            }
            if last_fragment {
                fu_header |= FU_END;
            }

            let mut packet = RtpPacket::new(self.header.clone());
            packet.header.marker = last_fragment && last_nalu;
            packet.payload.put_u8(ph0);
            packet.payload.put_u8(ph1);
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

/// H.265 RTP depacketizer with until-marker access unit accumulation.
#[derive(Default)]
pub struct H265Unpacker {
    fu_buffer: BytesMut,
    pending: Vec<BytesMut>,
    timestamp: u32,
}

impl H265Unpacker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unpack(&mut self, packet: &RtpPacket) -> Result<Option<AccessUnit>, RtpError> {
        if packet.payload.len() < 2 {
            return Ok(None);
        }

        self.timestamp = packet.header.timestamp;
        let typ = (packet.payload[0] >> 1) & 0x3F;

        match typ {
            nalu_type::AGGREGATION => {
                let mut rest = &packet.payload[2..];
                while rest.len() >= 2 {
                    let size = (rest[0] as usize) << 8 | rest[1] as usize;
                    rest = &rest[2..];
                    if size == 0 {
                        break;
                    }
                    if size > rest.len() {
                        return Err(RtpError::malformed("aggregation unit beyond payload"));
                    }
                    self.pending.push(BytesMut::from(&rest[..size]));
                    rest = &rest[size..];
                }
            }
            nalu_type::FRAGMENTATION => self.unpack_fu(&packet.payload)?,
            _ => {
                self.pending.push(packet.payload.clone());
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

    fn unpack_fu(&mut self, payload: &[u8]) -> Result<(), RtpError> {
        if payload.len() < 3 {
            return Err(RtpError {
                value: RtpErrorValue::NotEnoughBytes,
            });
        }
        let fu_header = payload[2];
        let fragment = &payload[3..];

        if fu_header & FU_START != 0 {
            self.fu_buffer.clear();
            // rebuild the original two-byte NAL header
            self.fu_buffer
                .put_u8((payload[0] & 0x81) | (fu_header & 0x3F) << 1);
            self.fu_buffer.put_u8(payload[1]);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_nalu_round_trip() {
        let nalu: &[u8] = &[0x26, 0x01, 0xAA, 0xBB]; // IDR_W_RADL
        let mut packer = H265Packer::new(96, 7, 10, 1400);
        let packets = packer.pack(&[nalu], 100).unwrap();
        assert_eq!(packets.len(), 1);

        let mut unpacker = H265Unpacker::new();
        let au = unpacker.unpack(&packets[0]).unwrap().unwrap();
        assert_eq!(&au.units[0][..], nalu);
    }

    #[test]
    fn fragmentation_round_trip() {
        let mut nalu = vec![0x26u8, 0x01];
        nalu.extend((0..900).map(|i| (i % 250) as u8));

        let mut packer = H265Packer::new(96, 7, 0, 300);
        let packets = packer.pack(&[&nalu], 100).unwrap();
        assert!(packets.len() > 1);

        let mut unpacker = H265Unpacker::new();
        let mut got = None;
        for p in &packets {
            if let Some(au) = unpacker.unpack(p).unwrap() {
                got = Some(au);
            }
        }
        assert_eq!(&got.unwrap().units[0][..], &nalu[..]);
    }
}

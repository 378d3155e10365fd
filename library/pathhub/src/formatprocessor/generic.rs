use {
    super::ProcessorOutput,
    crate::{
        define::FrameData,
        track::{MediaKind, Track},
    },
    bytes::BytesMut,
    rtp::{
        errors::RtpError,
        generic::{GenericPacker, GenericUnpacker},
        RtpPacket, RTP_FIXED_HEADER_LEN,
    },
};

/// Pass-through processor for Opus, VP8/VP9, PCM, G.711 and MPEG-1/2
/// audio: padding strip and size policing only.
pub struct GenericProcessor {
    track: Track,
    udp_max_payload_size: usize,
    decoder: GenericUnpacker,
    encoder: Option<GenericPacker>,
}

impl GenericProcessor {
    pub fn new(track: Track, udp_max_payload_size: usize) -> Self {
        Self {
            track,
            udp_max_payload_size,
            decoder: GenericUnpacker::new(),
            encoder: None,
        }
    }

    fn frame_data(&self, timestamp: u32, units: Vec<BytesMut>) -> FrameData {
        match self.track.kind {
            MediaKind::Video => FrameData::Video {
                track_id: self.track.id,
                timestamp,
                key_frame: false,
                nalus: units,
            },
            MediaKind::Audio => FrameData::Audio {
                track_id: self.track.id,
                timestamp,
                frames: units,
            },
        }
    }

    pub fn process_rtp(
        &mut self,
        mut packet: RtpPacket,
        want_frames: bool,
    ) -> Result<ProcessorOutput, RtpError> {
        packet.header.padding = false;

        // these codecs cannot be re-fragmented; oversize input is a
        // publisher bug and the packet is dropped
        if packet.payload.len() + RTP_FIXED_HEADER_LEN > self.udp_max_payload_size {
            return Err(RtpError::malformed("payload exceeds maximum size"));
        }

        let frame = if want_frames {
            self.decoder
                .unpack(&packet)?
                .map(|au| self.frame_data(au.timestamp, au.units))
        } else {
            None
        };

        Ok(ProcessorOutput {
            packets: vec![packet],
            frame,
        })
    }

    pub fn process_units(
        &mut self,
        timestamp: u32,
        units: Vec<BytesMut>,
    ) -> Result<ProcessorOutput, RtpError> {
        let encoder = self.encoder.get_or_insert_with(|| {
            GenericPacker::new(self.track.payload_type, rand::random(), rand::random())
        });

        let mut packets = Vec::new();
        for unit in &units {
            if unit.len() + RTP_FIXED_HEADER_LEN > self.udp_max_payload_size {
                return Err(RtpError::malformed("unit exceeds maximum size"));
            }
            packets.extend(encoder.pack(unit, timestamp)?);
        }

        let frame = Some(self.frame_data(timestamp, units));
        Ok(ProcessorOutput { packets, frame })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::TrackParams;
    use rtp::RtpHeader;

    fn opus_track() -> Track {
        Track::new(
            1,
            MediaKind::Audio,
            111,
            48000,
            TrackParams::Opus { channels: 2 },
        )
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let mut proc = GenericProcessor::new(opus_track(), 200);
        let mut pkt = RtpPacket::new(RtpHeader {
            version: 2,
            payload_type: 111,
            ..Default::default()
        });
        pkt.payload.extend_from_slice(&[0u8; 400]);
        assert!(proc.process_rtp(pkt, false).is_err());
    }

    #[test]
    fn passthrough_keeps_packet() {
        let mut proc = GenericProcessor::new(opus_track(), 1472);
        let mut pkt = RtpPacket::new(RtpHeader {
            version: 2,
            marker: true,
            payload_type: 111,
            timestamp: 960,
            ..Default::default()
        });
        pkt.payload.extend_from_slice(&[1, 2, 3]);

        let out = proc.process_rtp(pkt.clone(), true).unwrap();
        assert_eq!(out.packets[0], pkt);
        assert!(matches!(out.frame, Some(FrameData::Audio { .. })));
    }
}

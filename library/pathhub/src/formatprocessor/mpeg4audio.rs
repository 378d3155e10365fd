use {
    super::ProcessorOutput,
    crate::{define::FrameData, track::Track},
    bytes::BytesMut,
    rtp::{
        aac::{AacPacker, AacUnpacker},
        errors::RtpError,
        RtpPacket, RTP_FIXED_HEADER_LEN,
    },
};

pub struct Mpeg4AudioProcessor {
    track: Track,
    udp_max_payload_size: usize,
    size_length: u8,
    index_length: u8,
    decoder: Option<AacUnpacker>,
    encoder: Option<AacPacker>,
}

impl Mpeg4AudioProcessor {
    pub fn new(
        track: Track,
        udp_max_payload_size: usize,
        size_length: u8,
        index_length: u8,
    ) -> Self {
        Self {
            track,
            udp_max_payload_size,
            size_length,
            index_length,
            decoder: None,
            encoder: None,
        }
    }

    fn frame_data(&self, timestamp: u32, frames: Vec<BytesMut>) -> FrameData {
        FrameData::Audio {
            track_id: self.track.id,
            timestamp,
            frames,
        }
    }

    pub fn process_rtp(
        &mut self,
        mut packet: RtpPacket,
        want_frames: bool,
    ) -> Result<ProcessorOutput, RtpError> {
        if self.encoder.is_none() {
            packet.header.padding = false;
            if packet.payload.len() + RTP_FIXED_HEADER_LEN > self.udp_max_payload_size {
                self.encoder = Some(AacPacker::new(
                    packet.header.payload_type,
                    packet.header.ssrc,
                    packet.header.seq_number,
                    self.size_length,
                    self.index_length,
                ));
            }
        }

        if !want_frames && self.encoder.is_none() {
            return Ok(ProcessorOutput {
                packets: vec![packet],
                frame: None,
            });
        }

        let size_length = self.size_length;
        let index_length = self.index_length;
        let decoder = self
            .decoder
            .get_or_insert_with(|| AacUnpacker::new(size_length, index_length));
        let Some(au) = decoder.unpack(&packet)? else {
            return Ok(ProcessorOutput {
                packets: if self.encoder.is_none() {
                    vec![packet]
                } else {
                    Vec::new()
                },
                frame: None,
            });
        };

        let frame = want_frames.then(|| self.frame_data(au.timestamp, au.units.clone()));

        let packets = match &mut self.encoder {
            Some(encoder) => {
                let mut packets = Vec::new();
                let mut ts = au.timestamp;
                for unit in &au.units {
                    packets.extend(encoder.pack(unit, ts)?);
                    // 1024 samples per AAC frame
                    ts = ts.wrapping_add(1024);
                }
                packets
            }
            None => vec![packet],
        };

        Ok(ProcessorOutput { packets, frame })
    }

    pub fn process_units(
        &mut self,
        timestamp: u32,
        units: Vec<BytesMut>,
    ) -> Result<ProcessorOutput, RtpError> {
        let encoder = self.encoder.get_or_insert_with(|| {
            AacPacker::new(
                self.track.payload_type,
                rand::random(),
                rand::random(),
                self.size_length,
                self.index_length,
            )
        });

        let mut packets = Vec::new();
        let mut ts = timestamp;
        for unit in &units {
            packets.extend(encoder.pack(unit, ts)?);
            ts = ts.wrapping_add(1024);
        }

        let frame = Some(self.frame_data(timestamp, units));
        Ok(ProcessorOutput { packets, frame })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{MediaKind, TrackParams};
    use mcodec::aac::AudioSpecificConfig;

    fn audio_track() -> Track {
        Track::new(
            1,
            MediaKind::Audio,
            97,
            44100,
            TrackParams::Mpeg4Audio {
                config: AudioSpecificConfig {
                    object_type: 2,
                    sample_rate_index: 4,
                    channels: 2,
                },
                size_length: 13,
                index_length: 3,
            },
        )
    }

    #[test]
    fn units_are_packetized_and_mirrored() {
        let mut proc = Mpeg4AudioProcessor::new(audio_track(), 1472, 13, 3);
        let frame = BytesMut::from(&[0x21, 0x10, 0x05][..]);
        let out = proc.process_units(2048, vec![frame.clone()]).unwrap();

        assert_eq!(out.packets.len(), 1);
        let Some(FrameData::Audio { frames, timestamp, .. }) = out.frame else {
            panic!("no audio frame");
        };
        assert_eq!(timestamp, 2048);
        assert_eq!(frames[0], frame);
    }

    #[test]
    fn rtp_passthrough_without_frame_readers() {
        let mut proc = Mpeg4AudioProcessor::new(audio_track(), 1472, 13, 3);
        let mut packer = AacPacker::new(97, 1, 0, 13, 3);
        let pkt = packer.pack(&[0xAB; 64], 0).unwrap().remove(0);

        let out = proc.process_rtp(pkt.clone(), false).unwrap();
        assert_eq!(out.packets.len(), 1);
        assert_eq!(out.packets[0], pkt);
        assert!(out.frame.is_none());
    }
}

use {
    super::ProcessorOutput,
    crate::{define::FrameData, track::Track, track::TrackParams},
    bytes::BytesMut,
    mcodec::h264::{extract_sps_pps, nal_type, nalu_type},
    rtp::{
        errors::RtpError,
        h264::{H264Packer, H264Unpacker},
        RtpPacket, RTP_FIXED_HEADER_LEN,
    },
};

pub struct H264Processor {
    track: Track,
    udp_max_payload_size: usize,
    decoder: Option<H264Unpacker>,
    /// Lazily instantiated when inbound packets exceed the UDP MTU, or
    /// when the publisher provides units instead of RTP.
    encoder: Option<H264Packer>,
}

impl H264Processor {
    pub fn new(track: Track, udp_max_payload_size: usize) -> Self {
        Self {
            track,
            udp_max_payload_size,
            decoder: None,
            encoder: None,
        }
    }

    fn update_params_from_payload(&self, payload: &[u8]) {
        let (sps, pps) = extract_sps_pps(payload);
        if sps.is_none() && pps.is_none() {
            return;
        }
        self.track.update_params(|params| {
            if let TrackParams::H264 {
                sps: cur_sps,
                pps: cur_pps,
            } = params
            {
                if let Some(sps) = sps {
                    if sps != *cur_sps {
                        *cur_sps = sps;
                    }
                }
                if let Some(pps) = pps {
                    if pps != *cur_pps {
                        *cur_pps = pps;
                    }
                }
            }
        });
    }

    fn update_params_from_nalus(&self, nalus: &[BytesMut]) {
        for nalu in nalus {
            match nal_type(nalu) {
                nalu_type::SPS => self.track.update_params(|params| {
                    if let TrackParams::H264 { sps, .. } = params {
                        if *sps != *nalu {
                            *sps = nalu.clone();
                        }
                    }
                }),
                nalu_type::PPS => self.track.update_params(|params| {
                    if let TrackParams::H264 { pps, .. } = params {
                        if *pps != *nalu {
                            *pps = nalu.clone();
                        }
                    }
                }),
                _ => {}
            }
        }
    }

    /// Strip SPS/PPS/AUD; prepend the current parameter sets once when the
    /// unit contains an IDR.
    fn remux_access_unit(&self, nalus: Vec<BytesMut>) -> Vec<BytesMut> {
        let has_idr = nalus.iter().any(|n| nal_type(n) == nalu_type::IDR);

        let mut out = Vec::with_capacity(nalus.len() + 2);
        if has_idr {
            if let TrackParams::H264 { sps, pps } = self.track.params() {
                if !sps.is_empty() && !pps.is_empty() {
                    out.push(sps);
                    out.push(pps);
                }
            }
        }

        for nalu in nalus {
            match nal_type(&nalu) {
                nalu_type::SPS | nalu_type::PPS | nalu_type::AUD => continue,
                _ => out.push(nalu),
            }
        }

        out
    }

    fn frame_data(&self, timestamp: u32, nalus: &[BytesMut]) -> FrameData {
        FrameData::Video {
            track_id: self.track.id,
            timestamp,
            key_frame: nalus.iter().any(|n| nal_type(n) == nalu_type::IDR),
            nalus: nalus.to_vec(),
        }
    }

    pub fn process_rtp(
        &mut self,
        mut packet: RtpPacket,
        want_frames: bool,
    ) -> Result<ProcessorOutput, RtpError> {
        self.update_params_from_payload(&packet.payload);

        if self.encoder.is_none() {
            packet.header.padding = false;

            // oversize inbound packets switch the track to re-encoding,
            // keeping SSRC / sequence / timestamp continuity
            if packet.payload.len() + RTP_FIXED_HEADER_LEN > self.udp_max_payload_size {
                self.encoder = Some(H264Packer::new(
                    packet.header.payload_type,
                    packet.header.ssrc,
                    packet.header.seq_number,
                    self.udp_max_payload_size,
                ));
            }
        }

        if !want_frames && self.encoder.is_none() {
            return Ok(ProcessorOutput {
                packets: vec![packet],
                frame: None,
            });
        }

        let decoder = self.decoder.get_or_insert_with(H264Unpacker::new);
        let decoded = decoder.unpack(&packet)?;

        let Some(au) = decoded else {
            // partial access unit: original packets still flow unchanged
            // when no re-encode is active
            return Ok(ProcessorOutput {
                packets: if self.encoder.is_none() {
                    vec![packet]
                } else {
                    Vec::new()
                },
                frame: None,
            });
        };

        let remuxed = self.remux_access_unit(au.units);
        if remuxed.is_empty() {
            return Ok(ProcessorOutput::default());
        }

        let frame = want_frames.then(|| self.frame_data(au.timestamp, &remuxed));

        let packets = match &mut self.encoder {
            Some(encoder) => {
                let refs: Vec<&[u8]> = remuxed.iter().map(|n| &n[..]).collect();
                encoder.pack(&refs, au.timestamp)?
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
        self.update_params_from_nalus(&units);

        let remuxed = self.remux_access_unit(units);
        if remuxed.is_empty() {
            return Ok(ProcessorOutput::default());
        }

        let encoder = self.encoder.get_or_insert_with(|| {
            H264Packer::new(
                self.track.payload_type,
                rand::random(),
                rand::random(),
                self.udp_max_payload_size,
            )
        });

        let refs: Vec<&[u8]> = remuxed.iter().map(|n| &n[..]).collect();
        let packets = encoder.pack(&refs, timestamp)?;
        let frame = Some(self.frame_data(timestamp, &remuxed));

        Ok(ProcessorOutput { packets, frame })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::MediaKind;
    use rtp::RtpHeader;

    const SPS: [u8; 10] = [0x67, 0x64, 0x00, 0x0C, 0xAC, 0x3B, 0x50, 0xB0, 0x4B, 0x42];
    const PPS: [u8; 4] = [0x68, 0xEE, 0x3C, 0x80];

    fn video_track() -> Track {
        Track::new(
            0,
            MediaKind::Video,
            96,
            90000,
            TrackParams::H264 {
                sps: BytesMut::from(&SPS[..]),
                pps: BytesMut::from(&PPS[..]),
            },
        )
    }

    fn idr_packet(seq: u16, payload: &[u8]) -> RtpPacket {
        let mut pkt = RtpPacket::new(RtpHeader {
            version: 2,
            marker: true,
            payload_type: 96,
            seq_number: seq,
            timestamp: 345234345,
            ssrc: 978651231,
            ..Default::default()
        });
        pkt.payload.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn small_packets_pass_through_unchanged() {
        let mut proc = H264Processor::new(video_track(), 1472);
        let pkt = idr_packet(57899, &[0x65, 0x01, 0x02, 0x03, 0x04]);
        let out = proc.process_rtp(pkt.clone(), false).unwrap();
        assert_eq!(out.packets.len(), 1);
        assert_eq!(out.packets[0], pkt);
        assert!(out.frame.is_none());
    }

    #[test]
    fn params_prepended_once_and_aud_stripped() {
        let mut proc = H264Processor::new(video_track(), 1472);

        // one AU arriving as decoded units: AUD + SPS + PPS + IDR
        let units = vec![
            BytesMut::from(&[0x09, 0xF0][..]),
            BytesMut::from(&SPS[..]),
            BytesMut::from(&PPS[..]),
            BytesMut::from(&[0x65, 0xAA, 0xBB][..]),
        ];
        let out = proc.process_units(3000, units).unwrap();

        let Some(FrameData::Video {
            nalus, key_frame, ..
        }) = out.frame
        else {
            panic!("no video frame");
        };
        assert!(key_frame);
        assert_eq!(nalus.len(), 3); // SPS + PPS + IDR, AUD removed
        assert_eq!(nal_type(&nalus[0]), nalu_type::SPS);
        assert_eq!(nal_type(&nalus[1]), nalu_type::PPS);
        assert_eq!(nal_type(&nalus[2]), nalu_type::IDR);

        assert!(!out.packets.is_empty());
    }

    #[test]
    fn non_idr_units_get_no_parameter_sets() {
        let mut proc = H264Processor::new(video_track(), 1472);
        let units = vec![BytesMut::from(&[0x41, 0x9A][..])];
        let out = proc.process_units(6000, units).unwrap();

        let Some(FrameData::Video {
            nalus, key_frame, ..
        }) = out.frame
        else {
            panic!("no video frame");
        };
        assert!(!key_frame);
        assert_eq!(nalus.len(), 1);
        assert_eq!(nal_type(&nalus[0]), 0x01);
    }

    #[test]
    fn oversize_rtp_triggers_reencode_preserving_identity() {
        let mtu = 300;
        let mut proc = H264Processor::new(video_track(), mtu);

        let mut payload = vec![0x65u8];
        payload.extend(std::iter::repeat(0x42).take(800));
        let pkt = idr_packet(100, &payload);
        let ssrc = pkt.header.ssrc;
        let ts = pkt.header.timestamp;
        let pt = pkt.header.payload_type;

        let out = proc.process_rtp(pkt, false).unwrap();
        assert!(out.packets.len() > 1);
        for p in &out.packets {
            assert!(p.marshal().len() <= mtu);
            assert_eq!(p.header.ssrc, ssrc);
            assert_eq!(p.header.timestamp, ts);
            assert_eq!(p.header.payload_type, pt);
        }
        // first re-encoded packet continues the inbound sequence
        assert_eq!(out.packets[0].header.seq_number, 100);
        // marker survives on the last packet
        assert!(out.packets.last().unwrap().header.marker);
    }

    #[test]
    fn inflight_sps_update_is_visible_in_snapshots() {
        let track = video_track();
        let mut proc = H264Processor::new(track.clone(), 1472);

        let new_sps = [0x67u8, 0x42, 0x00, 0x1E, 0xAB];
        let pkt = idr_packet(1, &new_sps);
        proc.process_rtp(pkt, false).unwrap();

        match track.params() {
            TrackParams::H264 { sps, .. } => assert_eq!(&sps[..], &new_sps[..]),
            other => panic!("unexpected params: {other:?}"),
        }
    }
}

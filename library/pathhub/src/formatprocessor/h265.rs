use {
    super::ProcessorOutput,
    crate::{define::FrameData, track::Track, track::TrackParams},
    bytes::BytesMut,
    mcodec::h265::{extract_params, is_key_frame, is_parameter_set, nal_type, nalu_type},
    rtp::{
        errors::RtpError,
        h265::{H265Packer, H265Unpacker},
        RtpPacket, RTP_FIXED_HEADER_LEN,
    },
    std::time::{Duration, Instant},
};

/// Warn when no random-access point arrived for this long.
const KEY_FRAME_INTERVAL_WARN: Duration = Duration::from_secs(10);

pub struct H265Processor {
    track: Track,
    udp_max_payload_size: usize,
    decoder: Option<H265Unpacker>,
    encoder: Option<H265Packer>,
    last_key_frame: Instant,
    key_frame_warned: bool,
}

impl H265Processor {
    pub fn new(track: Track, udp_max_payload_size: usize) -> Self {
        Self {
            track,
            udp_max_payload_size,
            decoder: None,
            encoder: None,
            last_key_frame: Instant::now(),
            key_frame_warned: false,
        }
    }

    fn update_params_from_payload(&self, payload: &[u8]) {
        let (vps, sps, pps) = extract_params(payload);
        if vps.is_none() && sps.is_none() && pps.is_none() {
            return;
        }
        self.track.update_params(|params| {
            if let TrackParams::H265 {
                vps: cur_vps,
                sps: cur_sps,
                pps: cur_pps,
            } = params
            {
                if let Some(vps) = vps {
                    *cur_vps = vps;
                }
                if let Some(sps) = sps {
                    *cur_sps = sps;
                }
                if let Some(pps) = pps {
                    *cur_pps = pps;
                }
            }
        });
    }

    fn update_params_from_nalus(&self, nalus: &[BytesMut]) {
        for nalu in nalus {
            let typ = nal_type(nalu);
            if !is_parameter_set(typ) {
                continue;
            }
            self.track.update_params(|params| {
                if let TrackParams::H265 { vps, sps, pps } = params {
                    match typ {
                        nalu_type::VPS => *vps = nalu.clone(),
                        nalu_type::SPS => *sps = nalu.clone(),
                        nalu_type::PPS => *pps = nalu.clone(),
                        _ => {}
                    }
                }
            });
        }
    }

    /// Key-frame watchdog: streams without periodic random-access points
    /// cannot be joined by new readers or segmented by HLS.
    fn observe_key_frames(&mut self, nalus: &[BytesMut]) -> bool {
        let key = nalus.iter().any(|n| is_key_frame(nal_type(n)));
        if key {
            self.last_key_frame = Instant::now();
            self.key_frame_warned = false;
        } else if self.last_key_frame.elapsed() > KEY_FRAME_INTERVAL_WARN && !self.key_frame_warned
        {
            log::warn!(
                "no H265 key frame received in the last {:?}",
                KEY_FRAME_INTERVAL_WARN
            );
            self.key_frame_warned = true;
        }
        key
    }

    fn remux_access_unit(&mut self, nalus: Vec<BytesMut>) -> (Vec<BytesMut>, bool) {
        let key = self.observe_key_frames(&nalus);

        let mut out = Vec::with_capacity(nalus.len() + 3);
        if key {
            if let TrackParams::H265 { vps, sps, pps } = self.track.params() {
                if !vps.is_empty() && !sps.is_empty() && !pps.is_empty() {
                    out.push(vps);
                    out.push(sps);
                    out.push(pps);
                }
            }
        }

        for nalu in nalus {
            let typ = nal_type(&nalu);
            if is_parameter_set(typ) || typ == nalu_type::AUD {
                continue;
            }
            out.push(nalu);
        }

        (out, key)
    }

    fn frame_data(&self, timestamp: u32, key_frame: bool, nalus: &[BytesMut]) -> FrameData {
        FrameData::Video {
            track_id: self.track.id,
            timestamp,
            key_frame,
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
            if packet.payload.len() + RTP_FIXED_HEADER_LEN > self.udp_max_payload_size {
                self.encoder = Some(H265Packer::new(
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

        let decoder = self.decoder.get_or_insert_with(H265Unpacker::new);
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

        let (remuxed, key) = self.remux_access_unit(au.units);
        if remuxed.is_empty() {
            return Ok(ProcessorOutput::default());
        }

        let frame = want_frames.then(|| self.frame_data(au.timestamp, key, &remuxed));

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

        let (remuxed, key) = self.remux_access_unit(units);
        if remuxed.is_empty() {
            return Ok(ProcessorOutput::default());
        }

        let encoder = self.encoder.get_or_insert_with(|| {
            H265Packer::new(
                self.track.payload_type,
                rand::random(),
                rand::random(),
                self.udp_max_payload_size,
            )
        });

        let refs: Vec<&[u8]> = remuxed.iter().map(|n| &n[..]).collect();
        let packets = encoder.pack(&refs, timestamp)?;
        let frame = Some(self.frame_data(timestamp, key, &remuxed));

        Ok(ProcessorOutput { packets, frame })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::MediaKind;

    fn h265_track() -> Track {
        Track::new(
            0,
            MediaKind::Video,
            96,
            90000,
            TrackParams::H265 {
                vps: BytesMut::from(&[0x40, 0x01, 0x0C][..]),
                sps: BytesMut::from(&[0x42, 0x01, 0x01][..]),
                pps: BytesMut::from(&[0x44, 0x01, 0xC1][..]),
            },
        )
    }

    #[test]
    fn key_units_get_vps_sps_pps_prepended() {
        let mut proc = H265Processor::new(h265_track(), 1472);
        let idr = BytesMut::from(&[nalu_type::IDR_W_RADL << 1, 0x01, 0xAA][..]);
        let out = proc.process_units(0, vec![idr]).unwrap();

        let Some(FrameData::Video {
            nalus, key_frame, ..
        }) = out.frame
        else {
            panic!("no frame");
        };
        assert!(key_frame);
        assert_eq!(nalus.len(), 4);
        assert_eq!(nal_type(&nalus[0]), nalu_type::VPS);
        assert_eq!(nal_type(&nalus[1]), nalu_type::SPS);
        assert_eq!(nal_type(&nalus[2]), nalu_type::PPS);
        assert_eq!(nal_type(&nalus[3]), nalu_type::IDR_W_RADL);
    }

    #[test]
    fn parameter_sets_are_tracked_from_units() {
        let track = h265_track();
        let mut proc = H265Processor::new(track.clone(), 1472);

        let new_sps = BytesMut::from(&[0x42, 0x01, 0x99, 0x88][..]);
        proc.process_units(0, vec![new_sps.clone()]).unwrap();

        match track.params() {
            TrackParams::H265 { sps, .. } => assert_eq!(sps, new_sps),
            other => panic!("unexpected: {other:?}"),
        }
    }
}

use {
    crate::errors::HlsError,
    bytes::BytesMut,
    mcodec::{
        aac::{parse_adts, AudioSpecificConfig},
        h264::{extract_sps_pps, nal_type, nalu_type, split_annexb},
    },
    mmpegts::{define::stream_type, demuxer::DemuxedFrame, demuxer::TsDemuxer},
    pathhub::{
        define::StreamInput,
        path::PathHandle,
        stream::StreamHandle,
        track::{MediaKind, Track, TrackParams},
        utils::HandleId,
    },
};

/// Converts a transport stream (from an HLS or UDP source) into path
/// tracks and access units: track parameters are sniffed from the
/// elementary streams, then frames flow into the path's stream.
pub struct TsBridge {
    demuxer: TsDemuxer,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    sps: Option<BytesMut>,
    pps: Option<BytesMut>,
    audio_config: Option<AudioSpecificConfig>,
    buffered: Vec<DemuxedFrame>,
    stream: Option<StreamHandle>,
    video_track: Option<usize>,
    audio_track: Option<usize>,
}

impl Default for TsBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl TsBridge {
    pub fn new() -> Self {
        Self {
            demuxer: TsDemuxer::new(),
            video_pid: None,
            audio_pid: None,
            sps: None,
            pps: None,
            audio_config: None,
            buffered: Vec::new(),
            stream: None,
            video_track: None,
            audio_track: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.stream.is_some()
    }

    /// Feed transport-stream bytes. Returns true once the path went
    /// ready (which happens at most once per bridge).
    pub async fn push(
        &mut self,
        data: &[u8],
        path: &PathHandle,
        source_id: HandleId,
    ) -> Result<bool, HlsError> {
        let frames = self.demuxer.push(data)?;
        let mut became_ready = false;

        for frame in frames {
            self.classify(&frame);

            if self.stream.is_none() {
                self.sniff_parameters(&frame);
                self.buffered.push(frame);

                if self.parameters_complete() {
                    self.declare(path, source_id).await?;
                    became_ready = true;
                }
                continue;
            }

            self.forward(frame);
        }

        Ok(became_ready)
    }

    fn classify(&mut self, frame: &DemuxedFrame) {
        match frame.stream_type {
            stream_type::H264 => {
                if self.video_pid.is_none() {
                    self.video_pid = Some(frame.pid);
                }
            }
            stream_type::AAC => {
                if self.audio_pid.is_none() {
                    self.audio_pid = Some(frame.pid);
                }
            }
            other => {
                log::debug!("ignoring ts stream type 0x{other:02x} on pid {}", frame.pid);
            }
        }
    }

    fn sniff_parameters(&mut self, frame: &DemuxedFrame) {
        if Some(frame.pid) == self.video_pid {
            for nalu in split_annexb(&frame.data) {
                let (sps, pps) = extract_sps_pps(nalu);
                if let Some(sps) = sps {
                    self.sps = Some(sps);
                }
                if let Some(pps) = pps {
                    self.pps = Some(pps);
                }
            }
        } else if Some(frame.pid) == self.audio_pid && self.audio_config.is_none() {
            if let Ok((config, _)) = parse_adts(&frame.data) {
                self.audio_config = Some(config);
            }
        }
    }

    fn parameters_complete(&self) -> bool {
        let video_ok = match self.video_pid {
            Some(_) => self.sps.is_some() && self.pps.is_some(),
            None => true,
        };
        let audio_ok = match self.audio_pid {
            Some(_) => self.audio_config.is_some(),
            None => true,
        };
        (self.video_pid.is_some() || self.audio_pid.is_some()) && video_ok && audio_ok
    }

    async fn declare(
        &mut self,
        path: &PathHandle,
        source_id: HandleId,
    ) -> Result<(), HlsError> {
        let mut tracks = Vec::new();

        if self.video_pid.is_some() {
            let id = tracks.len();
            tracks.push(Track::new(
                id,
                MediaKind::Video,
                96,
                90000,
                TrackParams::H264 {
                    sps: self.sps.clone().unwrap_or_default(),
                    pps: self.pps.clone().unwrap_or_default(),
                },
            ));
            self.video_track = Some(id);
        }
        if let Some(config) = &self.audio_config {
            let id = tracks.len();
            tracks.push(Track::new(
                id,
                MediaKind::Audio,
                97,
                config.sample_rate(),
                TrackParams::Mpeg4Audio {
                    config: config.clone(),
                    size_length: 13,
                    index_length: 3,
                },
            ));
            self.audio_track = Some(id);
        }

        let stream = path
            .source_set_ready(source_id, tracks)
            .await
            .map_err(HlsError::from)?;
        self.stream = Some(stream);

        for frame in std::mem::take(&mut self.buffered) {
            self.forward(frame);
        }
        Ok(())
    }

    fn forward(&mut self, frame: DemuxedFrame) {
        let Some(stream) = &self.stream else {
            return;
        };

        if Some(frame.pid) == self.video_pid {
            let Some(track_id) = self.video_track else {
                return;
            };
            let nalus: Vec<BytesMut> = split_annexb(&frame.data)
                .into_iter()
                .filter(|n| nal_type(n) != nalu_type::AUD)
                .map(BytesMut::from)
                .collect();
            if nalus.is_empty() {
                return;
            }
            stream.write(StreamInput::Frame {
                track_id,
                timestamp: frame.pts as u32,
                units: nalus,
            });
        } else if Some(frame.pid) == self.audio_pid {
            let Some(track_id) = self.audio_track else {
                return;
            };
            let Some(config) = &self.audio_config else {
                return;
            };
            let clock = config.sample_rate().max(1) as u64;

            // a PES may carry several ADTS frames back to back
            let mut rest: &[u8] = &frame.data;
            let mut ticks = frame.pts * clock / 90_000;
            while !rest.is_empty() {
                match parse_adts(rest) {
                    Ok((_, raw)) => {
                        let consumed = raw.as_ptr() as usize - rest.as_ptr() as usize + raw.len();
                        stream.write(StreamInput::Frame {
                            track_id,
                            timestamp: ticks as u32,
                            units: vec![BytesMut::from(raw)],
                        });
                        ticks += 1024;
                        rest = &rest[consumed..];
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

use {
    crate::{
        errors::{HlsError, HlsErrorValue},
        fmp4::{self, AudioInit, FragmentSample, TrackFragment, VideoInit},
        m3u8::{Part, Playlist, Segment},
    },
    bytes::{BufMut, Bytes, BytesMut},
    mcodec::{dts::DtsEstimator, h264::AvcDecoderConfig, h264::ANNEXB_START_CODE},
    mmpegts::{
        define::{stream_type, AUDIO_PID, VIDEO_PID},
        muxer::TsMuxer,
    },
    pathhub::{
        define::{
            close_signal, AccessContext, FrameData, HubEvent, ReaderDataSender, ReaderHandle,
            SessionKind,
        },
        manager::PathManagerHandle,
        track::{MediaKind, TrackParams},
        utils::new_handle_id,
    },
    std::{
        collections::HashMap,
        sync::Arc,
        time::Duration,
    },
    tokio::sync::{oneshot, Mutex, Notify},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HlsVariant {
    MpegTs,
    LowLatency,
}

#[derive(Debug, Clone)]
pub struct HlsMuxerConfig {
    pub variant: HlsVariant,
    pub segment_count: usize,
    pub segment_duration: Duration,
    pub part_duration: Duration,
    pub close_after_inactivity: Duration,
    pub always_remux: bool,
}

impl Default for HlsMuxerConfig {
    fn default() -> Self {
        Self {
            variant: HlsVariant::MpegTs,
            segment_count: 7,
            segment_duration: Duration::from_secs(1),
            part_duration: Duration::from_millis(200),
            close_after_inactivity: Duration::from_secs(60),
            always_remux: false,
        }
    }
}

/// State shared with the HTTP layer: playlist, addressable resources and
/// the activity clock that drives idle teardown.
pub struct MuxerStore {
    pub playlist: Mutex<Playlist>,
    pub resources: Mutex<HashMap<String, Bytes>>,
    pub init_section: Mutex<Option<Bytes>>,
    /// Woken on every playlist change; blocking playlist requests wait
    /// here for their `_HLS_msn`/`_HLS_part` target.
    pub updated: Notify,
    pub last_request: Mutex<tokio::time::Instant>,
    pub closed: Mutex<bool>,
}

impl MuxerStore {
    fn new(config: &HlsMuxerConfig) -> Self {
        Self {
            playlist: Mutex::new(Playlist::new(
                config.segment_count,
                config.segment_duration.as_secs_f64(),
                config.variant == HlsVariant::LowLatency,
                config.part_duration.as_secs_f64(),
            )),
            resources: Mutex::new(HashMap::new()),
            init_section: Mutex::new(None),
            updated: Notify::new(),
            last_request: Mutex::new(tokio::time::Instant::now()),
            closed: Mutex::new(false),
        }
    }

    pub async fn touch(&self) {
        *self.last_request.lock().await = tokio::time::Instant::now();
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.lock().await
    }
}

#[derive(Clone)]
pub struct MuxerHandle {
    pub path_name: String,
    pub store: Arc<MuxerStore>,
}

/// Spawn the per-path muxer: binds to the path as a non-RTSP reader and
/// keeps the rolling playlist current until the stream ends or no HTTP
/// request arrives within the inactivity window.
pub async fn spawn(
    path_name: String,
    access: AccessContext,
    config: HlsMuxerConfig,
    hub: PathManagerHandle,
) -> Result<MuxerHandle, HlsError> {
    let handle_id = new_handle_id();
    let (close_tx, mut close_rx) = close_signal();

    let (tx, rx) = oneshot::channel();
    hub.send(HubEvent::AddReader {
        path_name: path_name.clone(),
        access,
        reader: ReaderHandle {
            id: handle_id,
            kind: SessionKind::HlsMuxer,
            remote_addr: String::new(),
            close: close_tx,
        },
        result: tx,
    })
    .map_err(HlsError::from)?;

    let attachment = rx
        .await
        .unwrap_or_else(|_| Err(pathhub::errors::PathError::terminated()))
        .map_err(HlsError::from)?;

    let (frame_tx, mut frame_rx) = attachment.stream.frame_channel();
    attachment
        .path
        .reader_start(handle_id, ReaderDataSender::Frame(frame_tx))
        .await
        .map_err(HlsError::from)?;

    let store = Arc::new(MuxerStore::new(&config));
    let handle = MuxerHandle {
        path_name: path_name.clone(),
        store: store.clone(),
    };

    let mut segmenter = Segmenter::new(&config, &attachment.stream, store.clone())?;

    let path = attachment.path.clone();
    tokio::spawn(async move {
        let mut idle_check = tokio::time::interval(Duration::from_secs(1));

        let reason = loop {
            tokio::select! {
                frame = frame_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(err) = segmenter.on_frame(frame).await {
                                break format!("mux error: {err}");
                            }
                        }
                        None => break "stream closed".to_string(),
                    }
                }
                reason = close_rx.recv() => {
                    break format!("closed by path: {:?}", reason);
                }
                _ = idle_check.tick() => {
                    if !config.always_remux {
                        let last = *store.last_request.lock().await;
                        if last.elapsed() >= config.close_after_inactivity {
                            break "inactivity".to_string();
                        }
                    }
                }
            }
        };

        log::info!("[hls muxer {}] destroyed ({})", path_name, reason);
        *store.closed.lock().await = true;
        store.updated.notify_waiters();
        path.reader_remove(handle_id).await;
    });

    Ok(handle)
}

struct TimestampUnwrap {
    initialized: bool,
    last: u32,
    high: u64,
}

impl TimestampUnwrap {
    fn new() -> Self {
        Self {
            initialized: false,
            last: 0,
            high: 0,
        }
    }

    fn feed(&mut self, ts: u32) -> u64 {
        if !self.initialized {
            self.initialized = true;
            self.last = ts;
            return ts as u64;
        }
        if ts < self.last && self.last - ts > u32::MAX / 2 {
            self.high += 1 << 32;
        }
        self.last = ts;
        self.high + ts as u64
    }
}

const AUD_NALU: [u8; 2] = [0x09, 0xF0];

enum Segmenter {
    Ts(TsSegmenter),
    LowLatency(LlSegmenter),
}

impl Segmenter {
    fn new(
        config: &HlsMuxerConfig,
        stream: &pathhub::stream::StreamHandle,
        store: Arc<MuxerStore>,
    ) -> Result<Self, HlsError> {
        let mut video = None;
        let mut audio = None;
        for track in stream.tracks().iter() {
            match (track.kind, track.params()) {
                (MediaKind::Video, TrackParams::H264 { sps, pps }) => {
                    video = Some((track.clock_rate, sps, pps));
                }
                (MediaKind::Audio, TrackParams::Mpeg4Audio { config, .. }) => {
                    audio = Some((track.clock_rate, config));
                }
                (_, params) => {
                    log::info!(
                        "hls skips track with codec {}",
                        params.codec_name()
                    );
                }
            }
        }

        if video.is_none() && audio.is_none() {
            return Err(HlsError::upstream("no hls-compatible tracks"));
        }

        match config.variant {
            HlsVariant::MpegTs => Ok(Segmenter::Ts(TsSegmenter::new(
                config, video, audio, store,
            ))),
            HlsVariant::LowLatency => Ok(Segmenter::LowLatency(LlSegmenter::new(
                config, video, audio, store,
            ))),
        }
    }

    async fn on_frame(&mut self, frame: FrameData) -> Result<(), HlsError> {
        match self {
            Segmenter::Ts(s) => s.on_frame(frame).await,
            Segmenter::LowLatency(s) => s.on_frame(frame).await,
        }
    }
}

type VideoParams = (u32, BytesMut, BytesMut);
type AudioParams = (u32, mcodec::aac::AudioSpecificConfig);

// ---- classic MPEG-TS variant ----

struct TsSegmenter {
    muxer: TsMuxer,
    store: Arc<MuxerStore>,
    segment_duration: Duration,
    has_video: bool,
    audio_config: Option<AudioParams>,
    video_unwrap: TimestampUnwrap,
    audio_unwrap: TimestampUnwrap,
    dts_estimator: DtsEstimator,
    segment_index: u64,
    segment_start_dts: Option<u64>,
    last_dts: u64,
    tables_written: bool,
}

impl TsSegmenter {
    fn new(
        config: &HlsMuxerConfig,
        video: Option<VideoParams>,
        audio: Option<AudioParams>,
        store: Arc<MuxerStore>,
    ) -> Self {
        let muxer = TsMuxer::new(
            video.as_ref().map(|_| stream_type::H264),
            audio.as_ref().map(|_| stream_type::AAC),
        );
        Self {
            muxer,
            store,
            segment_duration: config.segment_duration,
            has_video: video.is_some(),
            audio_config: audio,
            video_unwrap: TimestampUnwrap::new(),
            audio_unwrap: TimestampUnwrap::new(),
            dts_estimator: DtsEstimator::new(),
            segment_index: 0,
            segment_start_dts: None,
            last_dts: 0,
            tables_written: false,
        }
    }

    async fn on_frame(&mut self, frame: FrameData) -> Result<(), HlsError> {
        match frame {
            FrameData::Video {
                timestamp,
                key_frame,
                nalus,
                ..
            } => {
                let pts = self.video_unwrap.feed(timestamp);
                let dts = self.dts_estimator.feed(pts as i64, key_frame).max(0) as u64;

                // segments must start on a random access point
                if key_frame {
                    let should_cut = match self.segment_start_dts {
                        Some(start) => {
                            Duration::from_millis((dts.saturating_sub(start)) / 90)
                                >= self.segment_duration
                        }
                        None => false,
                    };
                    if should_cut {
                        self.finish_segment(dts).await?;
                    }
                    if self.segment_start_dts.is_none() {
                        self.segment_start_dts = Some(dts);
                    }
                }

                if self.segment_start_dts.is_none() {
                    // wait for the first random access point
                    return Ok(());
                }

                if !self.tables_written {
                    self.muxer.write_tables();
                    self.tables_written = true;
                }

                // AUD first, then the access unit (players require it)
                let mut payload = BytesMut::new();
                payload.extend_from_slice(&ANNEXB_START_CODE);
                payload.extend_from_slice(&AUD_NALU);
                for nalu in &nalus {
                    payload.extend_from_slice(&ANNEXB_START_CODE);
                    payload.extend_from_slice(nalu);
                }

                self.muxer
                    .write(VIDEO_PID, pts, dts, key_frame, &payload)?;
                self.last_dts = dts;
            }
            FrameData::Audio {
                timestamp, frames, ..
            } => {
                let Some((clock_rate, _)) = &self.audio_config else {
                    return Ok(());
                };
                let clock_rate = *clock_rate;
                let ticks = self.audio_unwrap.feed(timestamp);
                let pts = ticks * 90_000 / clock_rate.max(1) as u64;

                if !self.has_video {
                    // audio drives segmentation (and the PCR) without video
                    let should_cut = match self.segment_start_dts {
                        Some(start) => {
                            Duration::from_millis((pts.saturating_sub(start)) / 90)
                                >= self.segment_duration
                        }
                        None => {
                            self.segment_start_dts = Some(pts);
                            false
                        }
                    };
                    if should_cut {
                        self.finish_segment(pts).await?;
                        self.segment_start_dts = Some(pts);
                    }
                } else if self.segment_start_dts.is_none() {
                    return Ok(());
                }

                if !self.tables_written {
                    self.muxer.write_tables();
                    self.tables_written = true;
                }

                let Some((_, config)) = &self.audio_config else {
                    return Ok(());
                };
                let mut payload = BytesMut::new();
                for frame in &frames {
                    payload.extend_from_slice(&config.adts_header(frame.len()));
                    payload.extend_from_slice(frame);
                }
                self.muxer.write(AUDIO_PID, pts, pts, false, &payload)?;
                if !self.has_video {
                    self.last_dts = pts;
                }
            }
        }
        Ok(())
    }

    async fn finish_segment(&mut self, cut_dts: u64) -> Result<(), HlsError> {
        let data = self.muxer.take_data();
        self.tables_written = false;
        let Some(start) = self.segment_start_dts.take() else {
            return Ok(());
        };
        if data.is_empty() {
            return Ok(());
        }

        let duration = (cut_dts.saturating_sub(start)) as f64 / 90_000.0;
        let name = format!("seg{}.ts", self.segment_index);
        self.segment_index += 1;

        let bytes = Bytes::from(data.to_vec());
        {
            let mut resources = self.store.resources.lock().await;
            resources.insert(name.clone(), bytes.clone());

            let mut playlist = self.store.playlist.lock().await;
            playlist.push_segment(Segment {
                name: name.clone(),
                duration,
                data: bytes,
                parts: Vec::new(),
            });

            // discard resources that fell out of the window
            let keep: std::collections::HashSet<String> = playlist
                .segments
                .iter()
                .map(|s| s.name.clone())
                .collect();
            resources.retain(|k, _| keep.contains(k));
        }
        self.store.updated.notify_waiters();
        Ok(())
    }
}

// ---- low-latency fMP4 variant ----

struct PendingSample {
    dts: u64,
    composition_offset: i32,
    is_key: bool,
    data: BytesMut,
}

struct LlTrackState {
    track_id: u32,
    timescale: u32,
    unwrap: TimestampUnwrap,
    pending: Vec<PendingSample>,
    part_base_dts: Option<u64>,
}

struct LlSegmenter {
    store: Arc<MuxerStore>,
    segment_duration: Duration,
    part_duration: Duration,
    video: Option<LlTrackState>,
    audio: Option<LlTrackState>,
    dts_estimator: DtsEstimator,
    fragment_seq: u32,
    segment_index: u64,
    part_index: u64,
    segment_start_dts: Option<u64>,
    /// Parts accumulated for the open segment.
    segment_parts: Vec<Part>,
    segment_data: BytesMut,
    last_video_dts: u64,
    part_had_key: bool,
}

impl LlSegmenter {
    fn new(
        config: &HlsMuxerConfig,
        video: Option<VideoParams>,
        audio: Option<AudioParams>,
        store: Arc<MuxerStore>,
    ) -> Self {
        let mut next_track_id = 1u32;
        let video_state = video.as_ref().map(|(clock, sps, pps)| {
            let state = LlTrackState {
                track_id: next_track_id,
                timescale: *clock,
                unwrap: TimestampUnwrap::new(),
                pending: Vec::new(),
                part_base_dts: None,
            };
            next_track_id += 1;

            let (width, height) = mcodec::h264::SpsInfo::parse(sps)
                .map(|info| (info.width, info.height))
                .unwrap_or((1280, 720));
            let init = fmp4::write_init(
                Some(&VideoInit {
                    config: AvcDecoderConfig {
                        sps: sps.clone(),
                        pps: pps.clone(),
                    },
                    width,
                    height,
                    timescale: *clock,
                }),
                audio.as_ref().map(|(a_clock, config)| AudioInit {
                    config: config.clone(),
                    timescale: *a_clock,
                })
                .as_ref(),
            );
            (state, init)
        });

        let (video_state, init) = match video_state {
            Some((state, init)) => (Some(state), init),
            None => {
                let init = fmp4::write_init(
                    None,
                    audio
                        .as_ref()
                        .map(|(clock, config)| AudioInit {
                            config: config.clone(),
                            timescale: *clock,
                        })
                        .as_ref(),
                );
                (None, init)
            }
        };

        let audio_state = audio.as_ref().map(|(clock, _)| LlTrackState {
            track_id: next_track_id,
            timescale: *clock,
            unwrap: TimestampUnwrap::new(),
            pending: Vec::new(),
            part_base_dts: None,
        });

        // the store is not shared with the HTTP layer yet
        if let Ok(mut slot) = store.init_section.try_lock() {
            *slot = Some(Bytes::from(init.to_vec()));
        }

        Self {
            store,
            segment_duration: config.segment_duration,
            part_duration: config.part_duration,
            video: video_state,
            audio: audio_state,
            dts_estimator: DtsEstimator::new(),
            fragment_seq: 1,
            segment_index: 0,
            part_index: 0,
            segment_start_dts: None,
            segment_parts: Vec::new(),
            segment_data: BytesMut::new(),
            last_video_dts: 0,
            part_had_key: false,
        }
    }

    async fn on_frame(&mut self, frame: FrameData) -> Result<(), HlsError> {
        match frame {
            FrameData::Video {
                timestamp,
                key_frame,
                nalus,
                ..
            } => {
                let Some(video) = &mut self.video else {
                    return Ok(());
                };
                let pts = video.unwrap.feed(timestamp);
                let dts = self.dts_estimator.feed(pts as i64, key_frame).max(0) as u64;

                if self.segment_start_dts.is_none() {
                    if !key_frame {
                        return Ok(());
                    }
                    self.segment_start_dts = Some(dts);
                }

                // length-prefixed samples (the avcC declares 4-byte sizes)
                let mut data = BytesMut::new();
                for nalu in &nalus {
                    data.put_u32(nalu.len() as u32);
                    data.extend_from_slice(nalu);
                }

                if video.part_base_dts.is_none() {
                    video.part_base_dts = Some(dts);
                }
                video.pending.push(PendingSample {
                    dts,
                    composition_offset: (pts as i64 - dts as i64) as i32,
                    is_key: key_frame,
                    data,
                });
                self.part_had_key |= key_frame;
                self.last_video_dts = dts;

                let part_elapsed = video
                    .part_base_dts
                    .map(|base| Duration::from_millis(dts.saturating_sub(base) / 90))
                    .unwrap_or_default();

                let segment_elapsed = self
                    .segment_start_dts
                    .map(|base| Duration::from_millis(dts.saturating_sub(base) / 90))
                    .unwrap_or_default();

                if key_frame && segment_elapsed >= self.segment_duration {
                    self.flush_part().await?;
                    self.finish_segment(dts).await;
                } else if part_elapsed >= self.part_duration {
                    self.flush_part().await?;
                }
            }
            FrameData::Audio {
                timestamp, frames, ..
            } => {
                let Some(audio) = &mut self.audio else {
                    return Ok(());
                };
                let mut ticks = audio.unwrap.feed(timestamp);
                if audio.part_base_dts.is_none() {
                    audio.part_base_dts = Some(ticks);
                }
                for frame in frames {
                    audio.pending.push(PendingSample {
                        dts: ticks,
                        composition_offset: 0,
                        is_key: true,
                        data: frame,
                    });
                    ticks += 1024;
                }

                if self.video.is_none() {
                    // audio-only: parts and segments cut on audio time
                    if self.segment_start_dts.is_none() {
                        self.segment_start_dts = audio.part_base_dts;
                    }
                    let timescale = audio.timescale.max(1) as u64;
                    let part_elapsed = audio
                        .part_base_dts
                        .map(|base| {
                            Duration::from_millis(
                                ticks.saturating_sub(base) * 1000 / timescale,
                            )
                        })
                        .unwrap_or_default();
                    let segment_elapsed = self
                        .segment_start_dts
                        .map(|base| {
                            Duration::from_millis(
                                ticks.saturating_sub(base) * 1000 / timescale,
                            )
                        })
                        .unwrap_or_default();

                    if segment_elapsed >= self.segment_duration {
                        self.flush_part().await?;
                        self.finish_segment(ticks).await;
                    } else if part_elapsed >= self.part_duration {
                        self.flush_part().await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn drain_track(track: &mut LlTrackState) -> Option<TrackFragment> {
        if track.pending.is_empty() {
            track.part_base_dts = None;
            return None;
        }
        let base = track.pending[0].dts;
        let default_duration = track.timescale / 30;

        let mut samples = Vec::with_capacity(track.pending.len());
        for i in 0..track.pending.len() {
            let duration = if i + 1 < track.pending.len() {
                (track.pending[i + 1].dts - track.pending[i].dts).max(1) as u32
            } else if i > 0 {
                (track.pending[i].dts - track.pending[i - 1].dts).max(1) as u32
            } else {
                default_duration
            };
            let p = &track.pending[i];
            samples.push(FragmentSample {
                duration,
                composition_offset: p.composition_offset,
                is_key: p.is_key,
                data: p.data.clone(),
            });
        }
        track.pending.clear();
        track.part_base_dts = None;

        Some(TrackFragment {
            track_id: track.track_id,
            base_decode_time: base,
            samples,
        })
    }

    async fn flush_part(&mut self) -> Result<(), HlsError> {
        let mut fragments = Vec::new();
        let mut part_duration = self.part_duration.as_secs_f64();

        if let Some(video) = &mut self.video {
            if let Some(fragment) = Self::drain_track(video) {
                let ticks: u64 = fragment.samples.iter().map(|s| s.duration as u64).sum();
                part_duration = ticks as f64 / video.timescale.max(1) as f64;
                fragments.push(fragment);
            }
        }
        if let Some(audio) = &mut self.audio {
            if let Some(fragment) = Self::drain_track(audio) {
                if self.video.is_none() {
                    let ticks: u64 =
                        fragment.samples.iter().map(|s| s.duration as u64).sum();
                    part_duration = ticks as f64 / audio.timescale.max(1) as f64;
                }
                fragments.push(fragment);
            }
        }

        if fragments.is_empty() {
            return Ok(());
        }

        let data = fmp4::write_fragment(self.fragment_seq, &fragments);
        self.fragment_seq += 1;

        let name = format!("part{}.{}.mp4", self.segment_index, self.part_index);
        self.part_index += 1;

        let bytes = Bytes::from(data.to_vec());
        self.segment_data.extend_from_slice(&bytes);

        let part = Part {
            name: name.clone(),
            duration: part_duration,
            independent: self.part_had_key,
        };
        self.part_had_key = false;
        self.segment_parts.push(part.clone());

        {
            let mut resources = self.store.resources.lock().await;
            resources.insert(name, bytes);
            let mut playlist = self.store.playlist.lock().await;
            playlist.open_parts.push(part);
        }
        self.store.updated.notify_waiters();
        Ok(())
    }

    async fn finish_segment(&mut self, cut_dts: u64) {
        let Some(start) = self.segment_start_dts.take() else {
            return;
        };
        if self.segment_data.is_empty() {
            self.segment_start_dts = Some(cut_dts);
            return;
        }

        let timescale = if self.video.is_some() {
            90_000.0
        } else {
            self.audio
                .as_ref()
                .map(|a| a.timescale as f64)
                .unwrap_or(90_000.0)
        };
        let duration = cut_dts.saturating_sub(start) as f64 / timescale;

        let name = format!("seg{}.mp4", self.segment_index);
        self.segment_index += 1;
        self.part_index = 0;
        self.segment_start_dts = Some(cut_dts);

        let data = Bytes::from(self.segment_data.split().to_vec());
        let parts = std::mem::take(&mut self.segment_parts);

        {
            let mut resources = self.store.resources.lock().await;
            resources.insert(name.clone(), data.clone());

            let mut playlist = self.store.playlist.lock().await;
            playlist.push_segment(Segment {
                name,
                duration,
                data,
                parts,
            });

            let keep: std::collections::HashSet<String> = playlist
                .segments
                .iter()
                .flat_map(|s| {
                    std::iter::once(s.name.clone())
                        .chain(s.parts.iter().map(|p| p.name.clone()))
                })
                .chain(playlist.open_parts.iter().map(|p| p.name.clone()))
                .collect();
            resources.retain(|k, _| keep.contains(k));
        }
        self.store.updated.notify_waiters();
    }
}

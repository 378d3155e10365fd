use {
    crate::{
        amf0::{self, Amf0Value},
        chunk::{csid, ChunkPacketizer, ChunkUnpacketizer, DEFAULT_WRITE_CHUNK_SIZE},
        errors::{RtmpError, RtmpErrorValue},
        handshake,
        messages::{self, msg_type, user_control_event, RtmpMessage},
        server::{ApiConnState, ServerShared},
    },
    baselib::auth::{query_credentials, PresentedCredentials, CRITICAL_FAIL_STALL},
    bytes::{Bytes, BytesMut},
    indexmap::IndexMap,
    mcodec::{dts::DtsEstimator, h264::AvcDecoderConfig},
    mflv::{
        demuxer::{demux_audio, demux_video, AudioTag, VideoTag},
        muxer,
    },
    netio::{cursor::ByteCursor, net::TNetIO},
    pathhub::{
        define::{
            close_signal, AccessContext, CloseReason, CloseSignalReceiver, CloseSignalSender,
            FrameData, HubEvent, PublisherHandle, ReaderAttachment, ReaderDataSender,
            ReaderHandle, SessionKind, StreamInput,
        },
        manager::PathManagerHandle,
        path::PathHandle,
        stream::StreamHandle,
        track::{MediaKind, Track, TrackParams},
        utils::{new_handle_id, HandleId},
    },
    std::{net::SocketAddr, sync::Arc, time::Duration},
    tokio::sync::oneshot,
};

const WINDOW_ACK_SIZE: u32 = 2_500_000;
/// How long a publisher may take to declare its tracks after the first
/// media packet, when metadata did not settle the question.
const TRACK_DECLARATION_TIMEOUT: Duration = Duration::from_secs(1);
const MSG_STREAM_ID: u32 = 1;

enum Role {
    Pending,
    Publisher {
        path: PathHandle,
        stream: Option<StreamHandle>,
    },
    Player {
        attachment: ReaderAttachment,
    },
}

/// What the publisher promised (through onMetaData) and what actually
/// arrived.
#[derive(Default)]
struct TrackDeclaration {
    metadata_seen: bool,
    wants_video: bool,
    wants_audio: bool,
    video_config: Option<AvcDecoderConfig>,
    audio_config: Option<mcodec::aac::AudioSpecificConfig>,
    first_media_at: Option<tokio::time::Instant>,
}

impl TrackDeclaration {
    fn complete(&self) -> bool {
        if self.metadata_seen {
            let video_ok = !self.wants_video || self.video_config.is_some();
            let audio_ok = !self.wants_audio || self.audio_config.is_some();
            (self.wants_video || self.wants_audio) && video_ok && audio_ok
        } else {
            self.video_config.is_some() && self.audio_config.is_some()
        }
    }

    fn has_any(&self) -> bool {
        self.video_config.is_some() || self.audio_config.is_some()
    }
}

pub struct RtmpConnection {
    conn_id: String,
    io: Box<dyn TNetIO + Send + Sync>,
    cursor: ByteCursor,
    unpacketizer: ChunkUnpacketizer,
    packetizer: ChunkPacketizer,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
    hub: PathManagerHandle,

    handle_id: HandleId,
    close_tx: CloseSignalSender,
    close_rx: CloseSignalReceiver,

    app_name: String,
    query: String,
    path_name: String,
    role: Role,

    bytes_in: u64,
    last_ack: u64,
    peer_window_ack: u32,
}

impl RtmpConnection {
    pub async fn run_with_io(
        io: Box<dyn TNetIO + Send + Sync>,
        peer: SocketAddr,
        shared: Arc<ServerShared>,
        hub: PathManagerHandle,
    ) {
        let handle_id = new_handle_id();
        let conn_id = format!("{handle_id:x}");
        shared.register_conn(&conn_id, peer.to_string()).await;

        let (close_tx, close_rx) = close_signal();
        let mut conn = RtmpConnection {
            conn_id: conn_id.clone(),
            io,
            cursor: ByteCursor::default(),
            unpacketizer: ChunkUnpacketizer::new(),
            packetizer: ChunkPacketizer::new(DEFAULT_WRITE_CHUNK_SIZE),
            peer,
            shared: shared.clone(),
            hub,
            handle_id,
            close_tx,
            close_rx,
            app_name: String::new(),
            query: String::new(),
            path_name: String::new(),
            role: Role::Pending,
            bytes_in: 0,
            last_ack: 0,
            peer_window_ack: WINDOW_ACK_SIZE,
        };

        log::info!("[rtmp conn {}] opened from {}", conn_id, peer);
        if let Err(err) = conn.run().await {
            log::info!("[rtmp conn {}] closed: {}", conn_id, err);
        } else {
            log::info!("[rtmp conn {}] closed", conn_id);
        }

        conn.release().await;
        shared.unregister_conn(&conn_id).await;
    }

    async fn run(&mut self) -> Result<(), RtmpError> {
        handshake::server_handshake(&mut self.io, &mut self.cursor).await?;
        // handshake leftovers belong to the chunk stream
        let leftover = self.cursor.take_remaining();
        self.unpacketizer.feed(&leftover);

        loop {
            let messages = self.unpacketizer.read_messages()?;
            for message in messages {
                let parsed = messages::parse(message)?;
                if self.on_message(parsed).await? {
                    return Ok(());
                }
            }

            if matches!(self.role, Role::Player { .. }) {
                return self.play_loop().await;
            }

            let deadline = self.shared.config.read_timeout;
            let data = tokio::select! {
                reason = self.close_rx.recv() => {
                    return Err(RtmpError {
                        value: RtmpErrorValue::Closed(
                            reason.unwrap_or(CloseReason::Terminated),
                        ),
                    });
                }
                data = self.io.read_timeout(deadline) => data?,
            };
            self.bytes_in += data.len() as u64;
            self.unpacketizer.feed(&data);
            self.maybe_acknowledge().await?;
        }
    }

    async fn maybe_acknowledge(&mut self) -> Result<(), RtmpError> {
        if self.bytes_in - self.last_ack >= self.peer_window_ack as u64 {
            self.last_ack = self.bytes_in;
            self.send_message(
                csid::PROTOCOL_CONTROL,
                msg_type::ACKNOWLEDGEMENT,
                0,
                0,
                &messages::acknowledgement(self.bytes_in as u32),
            )
            .await?;
        }
        Ok(())
    }

    async fn send_message(
        &mut self,
        csid: u32,
        msg_type: u8,
        msg_stream_id: u32,
        timestamp: u32,
        payload: &[u8],
    ) -> Result<(), RtmpError> {
        let data = self
            .packetizer
            .packetize(csid, msg_type, msg_stream_id, timestamp, payload);
        self.io.write(Bytes::from(data.to_vec())).await?;
        Ok(())
    }

    async fn send_command(
        &mut self,
        values: &[Amf0Value],
        msg_stream_id: u32,
    ) -> Result<(), RtmpError> {
        let payload = amf0::write_all(values);
        self.send_message(
            csid::COMMAND,
            msg_type::COMMAND_AMF0,
            msg_stream_id,
            0,
            &payload,
        )
        .await
    }

    fn on_status(level: &str, code: &str, description: &str) -> Amf0Value {
        let mut map = IndexMap::new();
        map.insert(
            "level".to_string(),
            Amf0Value::Utf8String(level.to_string()),
        );
        map.insert("code".to_string(), Amf0Value::Utf8String(code.to_string()));
        map.insert(
            "description".to_string(),
            Amf0Value::Utf8String(description.to_string()),
        );
        Amf0Value::Object(map)
    }

    async fn on_message(&mut self, message: RtmpMessage) -> Result<bool, RtmpError> {
        match message {
            RtmpMessage::SetChunkSize(size) => {
                self.unpacketizer.set_chunk_size(size as usize);
            }
            RtmpMessage::WindowAckSize(size) => {
                self.peer_window_ack = size.max(1);
            }
            RtmpMessage::UserControl { event, data } => {
                if event == user_control_event::PING_REQUEST {
                    self.send_message(
                        csid::PROTOCOL_CONTROL,
                        msg_type::USER_CONTROL,
                        0,
                        0,
                        &messages::user_control(user_control_event::PING_RESPONSE, data),
                    )
                    .await?;
                }
            }
            RtmpMessage::Command {
                name,
                transaction_id,
                values,
            } => return self.on_command(&name, transaction_id, values).await,
            RtmpMessage::Data { .. }
            | RtmpMessage::Audio { .. }
            | RtmpMessage::Video { .. } => {
                // media before publish is not meaningful; the publish loop
                // consumes these once the role is set
                log::debug!("[rtmp conn {}] media before publish", self.conn_id);
            }
            _ => {}
        }
        Ok(false)
    }

    async fn on_command(
        &mut self,
        name: &str,
        transaction_id: f64,
        values: Vec<Amf0Value>,
    ) -> Result<bool, RtmpError> {
        log::debug!("[rtmp conn {}] command '{}'", self.conn_id, name);

        match name {
            "connect" => {
                if let Some(object) = values.first().and_then(|v| v.as_map()) {
                    if let Some(app) = object.get("app").and_then(|v| v.as_str()) {
                        // tcUrl query carries ?user=&pass=
                        let (app, query) = match app.split_once('?') {
                            Some((a, q)) => (a.to_string(), q.to_string()),
                            None => (app.to_string(), String::new()),
                        };
                        self.app_name = app;
                        self.query = query;
                    }
                    if self.query.is_empty() {
                        if let Some(tc_url) = object.get("tcUrl").and_then(|v| v.as_str()) {
                            if let Some((_, query)) = tc_url.split_once('?') {
                                self.query = query.to_string();
                            }
                        }
                    }
                }

                self.send_message(
                    csid::PROTOCOL_CONTROL,
                    msg_type::WINDOW_ACK_SIZE,
                    0,
                    0,
                    &messages::window_ack_size(WINDOW_ACK_SIZE),
                )
                .await?;
                self.send_message(
                    csid::PROTOCOL_CONTROL,
                    msg_type::SET_PEER_BANDWIDTH,
                    0,
                    0,
                    &messages::set_peer_bandwidth(WINDOW_ACK_SIZE, 2),
                )
                .await?;
                self.send_message(
                    csid::PROTOCOL_CONTROL,
                    msg_type::SET_CHUNK_SIZE,
                    0,
                    0,
                    &messages::set_chunk_size(DEFAULT_WRITE_CHUNK_SIZE as u32),
                )
                .await?;

                let mut props = IndexMap::new();
                props.insert(
                    "fmsVer".to_string(),
                    Amf0Value::Utf8String("FMS/3,0,1,123".to_string()),
                );
                props.insert("capabilities".to_string(), Amf0Value::Number(31.0));
                let mut info = IndexMap::new();
                info.insert(
                    "level".to_string(),
                    Amf0Value::Utf8String("status".to_string()),
                );
                info.insert(
                    "code".to_string(),
                    Amf0Value::Utf8String("NetConnection.Connect.Success".to_string()),
                );
                info.insert(
                    "description".to_string(),
                    Amf0Value::Utf8String("Connection succeeded.".to_string()),
                );
                info.insert("objectEncoding".to_string(), Amf0Value::Number(0.0));

                self.send_command(
                    &[
                        Amf0Value::Utf8String("_result".to_string()),
                        Amf0Value::Number(transaction_id),
                        Amf0Value::Object(props),
                        Amf0Value::Object(info),
                    ],
                    0,
                )
                .await?;
            }

            "createStream" => {
                self.send_command(
                    &[
                        Amf0Value::Utf8String("_result".to_string()),
                        Amf0Value::Number(transaction_id),
                        Amf0Value::Null,
                        Amf0Value::Number(MSG_STREAM_ID as f64),
                    ],
                    0,
                )
                .await?;
            }

            "releaseStream" | "FCPublish" | "FCUnpublish" | "getStreamLength" => {}

            "publish" => {
                let stream_key = values
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.start_publish(&stream_key).await?;
                return Ok(self.publish_loop().await.map(|_| true)?);
            }

            "play" => {
                let stream_key = values
                    .get(1)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.start_play(&stream_key).await?;
                // the caller switches into play_loop
            }

            "deleteStream" | "closeStream" => {
                return Ok(true);
            }

            other => {
                log::debug!("[rtmp conn {}] ignoring command '{}'", self.conn_id, other);
            }
        }

        Ok(false)
    }

    /// `key[?query]` appended to the app name forms the path.
    fn split_key(&mut self, stream_key: &str) -> String {
        let (key, query) = match stream_key.split_once('?') {
            Some((k, q)) => (k.to_string(), q.to_string()),
            None => (stream_key.to_string(), String::new()),
        };
        if !query.is_empty() {
            self.query = query;
        }
        match (self.app_name.is_empty(), key.is_empty()) {
            (true, _) => key,
            (false, true) => self.app_name.clone(),
            (false, false) => format!("{}/{}", self.app_name, key),
        }
    }

    fn access_context(&self) -> AccessContext {
        let credentials = if self.query.is_empty() {
            PresentedCredentials::None
        } else {
            query_credentials(&self.query)
        };
        AccessContext {
            peer_ip: self.peer.ip(),
            credentials,
            method: String::new(),
            query: self.query.clone(),
        }
    }

    async fn fail_auth(&mut self, err: pathhub::errors::PathError) -> RtmpError {
        if err.is_critical_auth() {
            tokio::time::sleep(CRITICAL_FAIL_STALL).await;
        }
        RtmpError::from(err)
    }

    async fn start_publish(&mut self, stream_key: &str) -> Result<(), RtmpError> {
        self.path_name = self.split_key(stream_key);

        let (tx, rx) = oneshot::channel();
        self.hub.send(HubEvent::AddPublisher {
            path_name: self.path_name.clone(),
            access: self.access_context(),
            publisher: PublisherHandle {
                id: self.handle_id,
                kind: SessionKind::RtmpConn,
                remote_addr: self.peer.to_string(),
                close: self.close_tx.clone(),
            },
            result: tx,
        })?;

        let path = match rx
            .await
            .unwrap_or_else(|_| Err(pathhub::errors::PathError::terminated()))
        {
            Ok(path) => path,
            Err(err) => return Err(self.fail_auth(err).await),
        };

        self.role = Role::Publisher { path, stream: None };
        self.shared
            .set_conn_state(&self.conn_id, ApiConnState::Publish)
            .await;

        self.send_command(
            &[
                Amf0Value::Utf8String("onStatus".to_string()),
                Amf0Value::Number(0.0),
                Amf0Value::Null,
                Self::on_status(
                    "status",
                    "NetStream.Publish.Start",
                    "publish started",
                ),
            ],
            MSG_STREAM_ID,
        )
        .await?;

        Ok(())
    }

    /// Consume media from a publisher until the connection ends. Tracks
    /// are declared from onMetaData plus the decoder-config packets, or
    /// from the configs alone when metadata never shows up.
    async fn publish_loop(&mut self) -> Result<(), RtmpError> {
        let mut declaration = TrackDeclaration::default();
        let mut video_track: Option<usize> = None;
        let mut audio_track: Option<usize> = None;
        let mut audio_clock_rate: u32 = 44100;

        loop {
            let messages = self.unpacketizer.read_messages()?;
            for message in messages {
                match messages::parse(message)? {
                    RtmpMessage::SetChunkSize(size) => {
                        self.unpacketizer.set_chunk_size(size as usize);
                    }
                    RtmpMessage::Data { values } => {
                        self.on_metadata(&values, &mut declaration);
                    }
                    RtmpMessage::Video { timestamp, payload } => {
                        if declaration.first_media_at.is_none() {
                            declaration.first_media_at = Some(tokio::time::Instant::now());
                        }
                        match demux_video(&payload) {
                            Ok(VideoTag::SequenceHeader(config)) => {
                                if let (Role::Publisher { stream: Some(stream), .. }, Some(id)) =
                                    (&self.role, video_track)
                                {
                                    if let Some(track) = stream.track(id) {
                                        track.set_params(TrackParams::H264 {
                                            sps: config.sps.clone(),
                                            pps: config.pps.clone(),
                                        });
                                    }
                                }
                                declaration.video_config = Some(config);
                            }
                            Ok(VideoTag::AccessUnit {
                                key_frame: _,
                                cts,
                                nalus,
                            }) => {
                                if let (
                                    Role::Publisher {
                                        stream: Some(stream),
                                        ..
                                    },
                                    Some(id),
                                ) = (&self.role, video_track)
                                {
                                    let pts_ms = timestamp.wrapping_add(cts as u32);
                                    stream.write(StreamInput::Frame {
                                        track_id: id,
                                        timestamp: pts_ms.wrapping_mul(90),
                                        units: nalus,
                                    });
                                }
                            }
                            Ok(VideoTag::EndOfSequence) => {}
                            Err(err) => {
                                log::debug!(
                                    "[rtmp conn {}] dropping video tag: {}",
                                    self.conn_id,
                                    err
                                );
                            }
                        }
                    }
                    RtmpMessage::Audio { timestamp, payload } => {
                        if declaration.first_media_at.is_none() {
                            declaration.first_media_at = Some(tokio::time::Instant::now());
                        }
                        match demux_audio(&payload) {
                            Ok(AudioTag::SequenceHeader(config)) => {
                                audio_clock_rate = config.sample_rate();
                                declaration.audio_config = Some(config);
                            }
                            Ok(AudioTag::Frame(frame)) => {
                                if let (
                                    Role::Publisher {
                                        stream: Some(stream),
                                        ..
                                    },
                                    Some(id),
                                ) = (&self.role, audio_track)
                                {
                                    let ticks = (timestamp as u64)
                                        .wrapping_mul(audio_clock_rate as u64)
                                        / 1000;
                                    stream.write(StreamInput::Frame {
                                        track_id: id,
                                        timestamp: ticks as u32,
                                        units: vec![frame],
                                    });
                                }
                            }
                            Err(err) => {
                                log::debug!(
                                    "[rtmp conn {}] dropping audio tag: {}",
                                    self.conn_id,
                                    err
                                );
                            }
                        }
                    }
                    RtmpMessage::Command { name, .. } => {
                        if name == "deleteStream" || name == "closeStream" || name == "FCUnpublish"
                        {
                            return Ok(());
                        }
                    }
                    RtmpMessage::UserControl { event, data } => {
                        if event == user_control_event::PING_REQUEST {
                            self.send_message(
                                csid::PROTOCOL_CONTROL,
                                msg_type::USER_CONTROL,
                                0,
                                0,
                                &messages::user_control(
                                    user_control_event::PING_RESPONSE,
                                    data,
                                ),
                            )
                            .await?;
                        }
                    }
                    _ => {}
                }
            }

            // declare the track list once it settled
            if matches!(&self.role, Role::Publisher { stream: None, .. }) {
                let timed_out = declaration
                    .first_media_at
                    .map(|t| t.elapsed() >= TRACK_DECLARATION_TIMEOUT)
                    .unwrap_or(false);
                if declaration.has_any() && (declaration.complete() || timed_out) {
                    let (tracks, vt, at, clock) = build_tracks(&declaration);
                    video_track = vt;
                    audio_track = at;
                    if let Some(clock) = clock {
                        audio_clock_rate = clock;
                    }

                    let Role::Publisher { path, stream } = &mut self.role else {
                        unreachable!()
                    };
                    let new_stream = path
                        .publisher_start(self.handle_id, tracks)
                        .await
                        .map_err(RtmpError::from)?;
                    *stream = Some(new_stream);
                    log::info!(
                        "[rtmp conn {}] publishing to path '{}'",
                        self.conn_id,
                        self.path_name
                    );
                }
            }

            let data = tokio::select! {
                reason = self.close_rx.recv() => {
                    return Err(RtmpError {
                        value: RtmpErrorValue::Closed(
                            reason.unwrap_or(CloseReason::Terminated),
                        ),
                    });
                }
                data = self.io.read_timeout(self.shared.config.read_timeout) => data?,
            };
            self.bytes_in += data.len() as u64;
            self.unpacketizer.feed(&data);
            self.maybe_acknowledge().await?;
        }
    }

    fn on_metadata(&self, values: &[Amf0Value], declaration: &mut TrackDeclaration) {
        let mut iter = values.iter();
        let Some(first) = iter.next().and_then(|v| v.as_str()) else {
            return;
        };
        let object = if first == "@setDataFrame" {
            iter.nth(1)
        } else if first == "onMetaData" {
            iter.next()
        } else {
            None
        };
        let Some(map) = object.and_then(|v| v.as_map()) else {
            return;
        };

        declaration.metadata_seen = true;
        declaration.wants_video = map
            .get("videocodecid")
            .and_then(|v| v.as_number())
            .map(|v| v as u32 == 7)
            .unwrap_or(false);
        declaration.wants_audio = map
            .get("audiocodecid")
            .and_then(|v| v.as_number())
            .map(|v| v as u32 == 10)
            .unwrap_or(false);
    }

    async fn start_play(&mut self, stream_key: &str) -> Result<(), RtmpError> {
        self.path_name = self.split_key(stream_key);

        let (tx, rx) = oneshot::channel();
        self.hub.send(HubEvent::AddReader {
            path_name: self.path_name.clone(),
            access: self.access_context(),
            reader: ReaderHandle {
                id: self.handle_id,
                kind: SessionKind::RtmpConn,
                remote_addr: self.peer.to_string(),
                close: self.close_tx.clone(),
            },
            result: tx,
        })?;

        let attachment = match rx
            .await
            .unwrap_or_else(|_| Err(pathhub::errors::PathError::terminated()))
        {
            Ok(attachment) => attachment,
            Err(err) => return Err(self.fail_auth(err).await),
        };

        self.role = Role::Player { attachment };
        self.shared
            .set_conn_state(&self.conn_id, ApiConnState::Read)
            .await;

        self.send_message(
            csid::PROTOCOL_CONTROL,
            msg_type::USER_CONTROL,
            0,
            0,
            &messages::user_control(user_control_event::STREAM_BEGIN, MSG_STREAM_ID),
        )
        .await?;
        self.send_command(
            &[
                Amf0Value::Utf8String("onStatus".to_string()),
                Amf0Value::Number(0.0),
                Amf0Value::Null,
                Self::on_status("status", "NetStream.Play.Start", "play started"),
            ],
            MSG_STREAM_ID,
        )
        .await?;

        Ok(())
    }

    /// Forward the stream's access units as FLV messages until the reader
    /// leaves or is dropped.
    async fn play_loop(&mut self) -> Result<(), RtmpError> {
        let Role::Player { attachment } = &self.role else {
            return Err(RtmpError {
                value: RtmpErrorValue::UnexpectedCommand("play".to_string()),
            });
        };
        let stream = attachment.stream.clone();
        let path = attachment.path.clone();

        // H264 + AAC are the codecs RTMP can carry
        let mut video_clock = 90000u32;
        let mut audio_clock = 44100u32;
        let mut have_video = false;
        let mut have_audio = false;

        for track in stream.tracks().iter() {
            match track.params() {
                TrackParams::H264 { sps, pps } => {
                    have_video = true;
                    video_clock = track.clock_rate;
                    if !sps.is_empty() && !pps.is_empty() {
                        let body = muxer::mux_video_sequence_header(&AvcDecoderConfig {
                            sps,
                            pps,
                        })?;
                        self.send_message(
                            csid::VIDEO,
                            msg_type::VIDEO,
                            MSG_STREAM_ID,
                            0,
                            &body,
                        )
                        .await?;
                    }
                }
                TrackParams::Mpeg4Audio { config, .. } => {
                    have_audio = true;
                    audio_clock = track.clock_rate;
                    let body = muxer::mux_audio_sequence_header(&config);
                    self.send_message(csid::AUDIO, msg_type::AUDIO, MSG_STREAM_ID, 0, &body)
                        .await?;
                }
                other => {
                    log::info!(
                        "[rtmp conn {}] skipping track with codec {}",
                        self.conn_id,
                        other.codec_name()
                    );
                }
            }
        }

        if !have_video && !have_audio {
            return Err(RtmpError {
                value: RtmpErrorValue::UnexpectedCommand(
                    "no rtmp-compatible tracks".to_string(),
                ),
            });
        }

        let (tx, mut rx) = stream.frame_channel();
        path.reader_start(self.handle_id, ReaderDataSender::Frame(tx))
            .await
            .map_err(RtmpError::from)?;

        let mut dts_estimator = DtsEstimator::new();

        let result = loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else {
                        break Err(RtmpError {
                            value: RtmpErrorValue::StreamGone,
                        });
                    };
                    match frame {
                        FrameData::Video {
                            timestamp,
                            key_frame,
                            nalus,
                            ..
                        } => {
                            let pts = timestamp as i64;
                            let dts = dts_estimator.feed(pts, key_frame);
                            let dts_ms =
                                (dts * 1000 / video_clock.max(1) as i64).max(0) as u32;
                            let cts_ms =
                                ((pts - dts) * 1000 / video_clock.max(1) as i64) as i32;
                            let body =
                                muxer::mux_video_access_unit(key_frame, cts_ms, &nalus);
                            if let Err(err) = self
                                .send_message(
                                    csid::VIDEO,
                                    msg_type::VIDEO,
                                    MSG_STREAM_ID,
                                    dts_ms,
                                    &body,
                                )
                                .await
                            {
                                break Err(err);
                            }
                        }
                        FrameData::Audio { timestamp, frames, .. } => {
                            let ts_ms = (timestamp as u64 * 1000
                                / audio_clock.max(1) as u64)
                                as u32;
                            let mut failed = None;
                            for unit in frames {
                                let body = muxer::mux_audio_frame(&unit);
                                if let Err(err) = self
                                    .send_message(
                                        csid::AUDIO,
                                        msg_type::AUDIO,
                                        MSG_STREAM_ID,
                                        ts_ms,
                                        &body,
                                    )
                                    .await
                                {
                                    failed = Some(err);
                                    break;
                                }
                            }
                            if let Some(err) = failed {
                                break Err(err);
                            }
                        }
                    }
                }
                reason = self.close_rx.recv() => {
                    break Err(RtmpError {
                        value: RtmpErrorValue::Closed(
                            reason.unwrap_or(CloseReason::Terminated),
                        ),
                    });
                }
                data = self.io.read_timeout(Duration::from_secs(60)) => {
                    match data {
                        Ok(data) => {
                            self.bytes_in += data.len() as u64;
                            self.unpacketizer.feed(&data);
                            let mut closed = false;
                            for message in self.unpacketizer.read_messages()? {
                                if let RtmpMessage::Command { name, .. } =
                                    messages::parse(message)?
                                {
                                    if name == "deleteStream" || name == "closeStream" {
                                        closed = true;
                                    }
                                }
                            }
                            if closed {
                                break Ok(());
                            }
                        }
                        Err(err) => break Err(err.into()),
                    }
                }
            }
        };

        path.reader_pause(self.handle_id).await;
        result
    }

    async fn release(&mut self) {
        match &self.role {
            Role::Publisher { path, .. } => {
                path.publisher_remove(self.handle_id).await;
            }
            Role::Player { attachment } => {
                attachment.path.reader_remove(self.handle_id).await;
            }
            Role::Pending => {}
        }
    }
}

fn build_tracks(
    declaration: &TrackDeclaration,
) -> (Vec<Track>, Option<usize>, Option<usize>, Option<u32>) {
    let mut tracks = Vec::new();
    let mut video_track = None;
    let mut audio_track = None;
    let mut audio_clock = None;

    if let Some(config) = &declaration.video_config {
        let id = tracks.len();
        tracks.push(Track::new(
            id,
            MediaKind::Video,
            96,
            90000,
            TrackParams::H264 {
                sps: config.sps.clone(),
                pps: config.pps.clone(),
            },
        ));
        video_track = Some(id);
    }

    if let Some(config) = &declaration.audio_config {
        let id = tracks.len();
        let clock = config.sample_rate();
        tracks.push(Track::new(
            id,
            MediaKind::Audio,
            97,
            clock,
            TrackParams::Mpeg4Audio {
                config: config.clone(),
                size_length: 13,
                index_length: 3,
            },
        ));
        audio_track = Some(id);
        audio_clock = Some(clock);
    }

    (tracks, video_track, audio_track, audio_clock)
}

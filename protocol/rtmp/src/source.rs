use {
    crate::{
        amf0::{self, Amf0Value},
        chunk::{csid, ChunkPacketizer, ChunkUnpacketizer, DEFAULT_WRITE_CHUNK_SIZE},
        errors::{RtmpError, RtmpErrorValue},
        handshake,
        messages::{self, msg_type, RtmpMessage},
    },
    bytes::Bytes,
    indexmap::IndexMap,
    mflv::demuxer::{demux_audio, demux_video, AudioTag, VideoTag},
    netio::{cursor::ByteCursor, net::TcpIO, net::TNetIO},
    pathhub::{
        define::{StaticSourceContext, StreamInput, SOURCE_RETRY_PAUSE_SECS},
        path::PathHandle,
        stream::StreamHandle,
        track::{MediaKind, Track, TrackParams},
        utils::HandleId,
    },
    std::time::Duration,
    tokio::net::TcpStream,
};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pull an upstream RTMP stream (connect/createStream/play) into the
/// owning path, reconnecting until the path stops the source.
pub fn spawn(ctx: StaticSourceContext) {
    let StaticSourceContext {
        path,
        path_name,
        source_id,
        source_url,
        conf: _,
        mut stop,
    } = ctx;

    tokio::spawn(async move {
        loop {
            let result = tokio::select! {
                result = run_once(&path, &path_name, source_id, &source_url) => result,
                _ = stop.recv() => return,
            };

            path.source_set_not_ready(source_id).await;

            match result {
                Ok(()) => return,
                Err(err) => {
                    log::info!(
                        "[rtmp source {}] disconnected: {}, retrying in {}s",
                        path_name,
                        err,
                        SOURCE_RETRY_PAUSE_SECS
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(SOURCE_RETRY_PAUSE_SECS)) => {}
                _ = stop.recv() => return,
            }
        }
    });
}

/// `rtmp://host[:port]/app/stream` → (host, port, app, stream key)
fn parse_rtmp_url(url: &str) -> Result<(String, u16, String, String), RtmpError> {
    let rest = url
        .strip_prefix("rtmp://")
        .or_else(|| url.strip_prefix("rtmps://"))
        .ok_or_else(|| RtmpError::handshake("invalid rtmp url"))?;

    let (authority, path) = rest
        .split_once('/')
        .ok_or_else(|| RtmpError::handshake("rtmp url without path"))?;

    let (host, port) = match authority.split_once(':') {
        Some((h, p)) => (
            h.to_string(),
            p.parse().map_err(|_| RtmpError::handshake("invalid port"))?,
        ),
        None => (authority.to_string(), 1935),
    };

    let (app, key) = match path.rsplit_once('/') {
        Some((app, key)) => (app.to_string(), key.to_string()),
        None => (path.to_string(), String::new()),
    };

    Ok((host, port, app, key))
}

struct PullClient {
    io: Box<dyn TNetIO + Send + Sync>,
    cursor: ByteCursor,
    unpacketizer: ChunkUnpacketizer,
    packetizer: ChunkPacketizer,
    transaction_id: f64,
}

impl PullClient {
    async fn send_command(&mut self, values: &[Amf0Value]) -> Result<(), RtmpError> {
        let payload = amf0::write_all(values);
        let data = self
            .packetizer
            .packetize(csid::COMMAND, msg_type::COMMAND_AMF0, 0, 0, &payload);
        self.io.write(Bytes::from(data.to_vec())).await?;
        Ok(())
    }

    /// Pump the chunk stream until the given command result shows up.
    async fn wait_result(&mut self, expect: &[&str]) -> Result<String, RtmpError> {
        loop {
            for message in self.unpacketizer.read_messages()? {
                match messages::parse(message)? {
                    RtmpMessage::SetChunkSize(size) => {
                        self.unpacketizer.set_chunk_size(size as usize);
                    }
                    RtmpMessage::Command { name, .. } => {
                        if name == "_error" {
                            return Err(RtmpError {
                                value: RtmpErrorValue::UnexpectedCommand(name),
                            });
                        }
                        if expect.contains(&name.as_str()) {
                            return Ok(name);
                        }
                    }
                    _ => {}
                }
            }
            let data = self.io.read_timeout(RESPONSE_TIMEOUT).await?;
            self.unpacketizer.feed(&data);
        }
    }
}

async fn run_once(
    path: &PathHandle,
    path_name: &str,
    source_id: HandleId,
    source_url: &str,
) -> Result<(), RtmpError> {
    let (host, port, app, key) = parse_rtmp_url(source_url)?;

    let stream = TcpStream::connect((host.as_str(), port)).await?;
    log::info!("[rtmp source {}] connected", path_name);

    let mut client = PullClient {
        io: Box::new(TcpIO::new(stream)),
        cursor: ByteCursor::default(),
        unpacketizer: ChunkUnpacketizer::new(),
        packetizer: ChunkPacketizer::new(DEFAULT_WRITE_CHUNK_SIZE),
        transaction_id: 0.0,
    };

    handshake::client_handshake(&mut client.io, &mut client.cursor).await?;
    let leftover = client.cursor.take_remaining();
    client.unpacketizer.feed(&leftover);

    // announce our write chunk size before bulk data flows back
    let data = client.packetizer.packetize(
        csid::PROTOCOL_CONTROL,
        msg_type::SET_CHUNK_SIZE,
        0,
        0,
        &messages::set_chunk_size(DEFAULT_WRITE_CHUNK_SIZE as u32),
    );
    client.io.write(Bytes::from(data.to_vec())).await?;

    client.transaction_id += 1.0;
    let mut object = IndexMap::new();
    object.insert("app".to_string(), Amf0Value::Utf8String(app.clone()));
    object.insert(
        "tcUrl".to_string(),
        Amf0Value::Utf8String(format!("rtmp://{host}:{port}/{app}")),
    );
    object.insert("fpad".to_string(), Amf0Value::Boolean(false));
    let tid = client.transaction_id;
    client
        .send_command(&[
            Amf0Value::Utf8String("connect".to_string()),
            Amf0Value::Number(tid),
            Amf0Value::Object(object),
        ])
        .await?;
    client.wait_result(&["_result"]).await?;

    client.transaction_id += 1.0;
    let tid = client.transaction_id;
    client
        .send_command(&[
            Amf0Value::Utf8String("createStream".to_string()),
            Amf0Value::Number(tid),
            Amf0Value::Null,
        ])
        .await?;
    client.wait_result(&["_result"]).await?;

    client
        .send_command(&[
            Amf0Value::Utf8String("play".to_string()),
            Amf0Value::Number(0.0),
            Amf0Value::Null,
            Amf0Value::Utf8String(key),
        ])
        .await?;

    // tracks are declared once both decoder configs arrived (or the
    // declaration timeout passes with only one of them)
    let mut video_config = None;
    let mut audio_config = None;
    let mut first_media: Option<tokio::time::Instant> = None;
    let mut stream_handle: Option<StreamHandle> = None;
    let mut video_track: Option<usize> = None;
    let mut audio_track: Option<usize> = None;
    let mut audio_clock: u32 = 44100;
    let mut pending: Vec<(bool, u32, bytes::BytesMut)> = Vec::new();

    loop {
        for message in client.unpacketizer.read_messages()? {
            match messages::parse(message)? {
                RtmpMessage::SetChunkSize(size) => {
                    client.unpacketizer.set_chunk_size(size as usize);
                }
                RtmpMessage::Video { timestamp, payload } => {
                    if first_media.is_none() {
                        first_media = Some(tokio::time::Instant::now());
                    }
                    match demux_video(&payload) {
                        Ok(VideoTag::SequenceHeader(config)) => {
                            video_config = Some(config);
                        }
                        Ok(VideoTag::AccessUnit { cts, nalus, .. }) => {
                            if let (Some(stream), Some(id)) = (&stream_handle, video_track) {
                                let pts_ms = timestamp.wrapping_add(cts as u32);
                                stream.write(StreamInput::Frame {
                                    track_id: id,
                                    timestamp: pts_ms.wrapping_mul(90),
                                    units: nalus,
                                });
                            } else {
                                pending.push((true, timestamp, payload.clone()));
                            }
                        }
                        Ok(VideoTag::EndOfSequence) => {}
                        Err(err) => {
                            log::debug!("[rtmp source {}] bad video tag: {}", path_name, err);
                        }
                    }
                }
                RtmpMessage::Audio { timestamp, payload } => {
                    if first_media.is_none() {
                        first_media = Some(tokio::time::Instant::now());
                    }
                    match demux_audio(&payload) {
                        Ok(AudioTag::SequenceHeader(config)) => {
                            audio_clock = config.sample_rate();
                            audio_config = Some(config);
                        }
                        Ok(AudioTag::Frame(frame)) => {
                            if let (Some(stream), Some(id)) = (&stream_handle, audio_track) {
                                let ticks =
                                    (timestamp as u64).wrapping_mul(audio_clock as u64) / 1000;
                                stream.write(StreamInput::Frame {
                                    track_id: id,
                                    timestamp: ticks as u32,
                                    units: vec![frame],
                                });
                            } else {
                                pending.push((false, timestamp, payload.clone()));
                            }
                        }
                        Err(err) => {
                            log::debug!("[rtmp source {}] bad audio tag: {}", path_name, err);
                        }
                    }
                }
                _ => {}
            }
        }

        if stream_handle.is_none() {
            let both = video_config.is_some() && audio_config.is_some();
            let timed_out = first_media
                .map(|t| t.elapsed() >= Duration::from_secs(1))
                .unwrap_or(false);
            if (video_config.is_some() || audio_config.is_some()) && (both || timed_out) {
                let mut tracks = Vec::new();
                if let Some(config) = &video_config {
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
                if let Some(config) = &audio_config {
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
                    audio_track = Some(id);
                }

                let stream = path
                    .source_set_ready(source_id, tracks)
                    .await
                    .map_err(RtmpError::from)?;
                log::info!("[rtmp source {}] ready", path_name);

                // replay media that arrived before the declaration settled
                for (is_video, timestamp, payload) in pending.drain(..) {
                    if is_video {
                        if let (Ok(VideoTag::AccessUnit { cts, nalus, .. }), Some(id)) =
                            (demux_video(&payload), video_track)
                        {
                            let pts_ms = timestamp.wrapping_add(cts as u32);
                            stream.write(StreamInput::Frame {
                                track_id: id,
                                timestamp: pts_ms.wrapping_mul(90),
                                units: nalus,
                            });
                        }
                    } else if let (Ok(AudioTag::Frame(frame)), Some(id)) =
                        (demux_audio(&payload), audio_track)
                    {
                        let ticks = (timestamp as u64).wrapping_mul(audio_clock as u64) / 1000;
                        stream.write(StreamInput::Frame {
                            track_id: id,
                            timestamp: ticks as u32,
                            units: vec![frame],
                        });
                    }
                }

                stream_handle = Some(stream);
            }
        }

        let data = client.io.read_timeout(RESPONSE_TIMEOUT).await?;
        client.unpacketizer.feed(&data);
    }
}

#[cfg(test)]
mod tests {
    use super::parse_rtmp_url;

    #[test]
    fn url_parsing() {
        let (host, port, app, key) = parse_rtmp_url("rtmp://host:19350/live/cam1").unwrap();
        assert_eq!(host, "host");
        assert_eq!(port, 19350);
        assert_eq!(app, "live");
        assert_eq!(key, "cam1");

        let (host, port, app, key) = parse_rtmp_url("rtmp://host/app/nested/key").unwrap();
        assert_eq!(host, "host");
        assert_eq!(port, 1935);
        assert_eq!(app, "app/nested");
        assert_eq!(key, "key");

        assert!(parse_rtmp_url("http://host/x").is_err());
    }
}

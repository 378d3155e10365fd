use {
    crate::errors::SessionError,
    bytes::BytesMut,
    mcodec::aac::AudioSpecificConfig,
    pathhub::track::{MediaKind, Track, TrackParams},
};

/// Render the session description announced to DESCRIBE clients from the
/// stream's track list. Control attributes use `trackID=<n>` with `n`
/// being the track id.
pub fn marshal(tracks: &[Track]) -> String {
    let mut out = String::new();
    out += "v=0\r\n";
    out += "o=- 0 0 IN IP4 127.0.0.1\r\n";
    out += "s=Stream\r\n";
    out += "c=IN IP4 0.0.0.0\r\n";
    out += "t=0 0\r\n";

    for track in tracks {
        let media = match track.kind {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        };
        out += &format!("m={} 0 RTP/AVP {}\r\n", media, track.payload_type);

        let params = track.params();
        match &params {
            TrackParams::H264 { sps, pps } => {
                out += &format!("a=rtpmap:{} H264/90000\r\n", track.payload_type);
                if sps.len() >= 4 && !pps.is_empty() {
                    out += &format!(
                        "a=fmtp:{} packetization-mode=1; sprop-parameter-sets={},{}; profile-level-id={}\r\n",
                        track.payload_type,
                        base64::encode(&sps[..]),
                        base64::encode(&pps[..]),
                        hex::encode_upper(&sps[1..4]),
                    );
                }
            }
            TrackParams::H265 { vps, sps, pps } => {
                out += &format!("a=rtpmap:{} H265/90000\r\n", track.payload_type);
                if !vps.is_empty() && !sps.is_empty() && !pps.is_empty() {
                    out += &format!(
                        "a=fmtp:{} sprop-vps={}; sprop-sps={}; sprop-pps={}\r\n",
                        track.payload_type,
                        base64::encode(&vps[..]),
                        base64::encode(&sps[..]),
                        base64::encode(&pps[..]),
                    );
                }
            }
            TrackParams::Mpeg4Audio {
                config,
                size_length,
                index_length,
            } => {
                out += &format!(
                    "a=rtpmap:{} MPEG4-GENERIC/{}/{}\r\n",
                    track.payload_type,
                    track.clock_rate,
                    config.channels,
                );
                out += &format!(
                    "a=fmtp:{} profile-level-id=1; mode=AAC-hbr; sizelength={}; indexlength={}; indexdeltalength={}; config={}\r\n",
                    track.payload_type,
                    size_length,
                    index_length,
                    index_length,
                    hex::encode(&config.marshal()[..]),
                );
            }
            TrackParams::Opus { channels } => {
                out += &format!(
                    "a=rtpmap:{} opus/{}/{}\r\n",
                    track.payload_type, track.clock_rate, channels
                );
            }
            TrackParams::Vp8 => {
                out += &format!("a=rtpmap:{} VP8/90000\r\n", track.payload_type);
            }
            TrackParams::Vp9 => {
                out += &format!("a=rtpmap:{} VP9/90000\r\n", track.payload_type);
            }
            TrackParams::G711 { mu_law } => {
                let name = if *mu_law { "PCMU" } else { "PCMA" };
                out += &format!("a=rtpmap:{} {}/8000\r\n", track.payload_type, name);
            }
            TrackParams::Pcm {
                bit_depth,
                channels,
            } => {
                out += &format!(
                    "a=rtpmap:{} L{}/{}/{}\r\n",
                    track.payload_type, bit_depth, track.clock_rate, channels
                );
            }
            TrackParams::Mpeg1Audio => {
                out += &format!("a=rtpmap:{} MPA/90000\r\n", track.payload_type);
            }
            TrackParams::Generic => {}
        }

        out += &format!("a=control:trackID={}\r\n", track.id);
    }

    out
}

/// Per-media `a=control:` attributes in section order, for pull clients
/// that must SETUP whatever track names the upstream chose.
pub fn controls(data: &str) -> Vec<Option<String>> {
    let mut out = Vec::new();
    for line in data.lines() {
        let line = line.trim_end();
        if line.starts_with("m=") {
            out.push(None);
        } else if let Some(control) = line.strip_prefix("a=control:") {
            if let Some(last) = out.last_mut() {
                *last = Some(control.to_string());
            }
        }
    }
    out
}

#[derive(Debug, Default)]
struct MediaSection {
    media: String,
    payload_type: u8,
    encoding: String,
    clock_rate: u32,
    encoding_params: Option<u32>,
    fmtp: Vec<(String, String)>,
}

fn parse_fmtp(value: &str) -> Vec<(String, String)> {
    // "96 packetization-mode=1; sprop-parameter-sets=..,..;"
    let Some((_, rest)) = value.split_once(' ') else {
        return Vec::new();
    };
    rest.split(';')
        .filter_map(|kv| {
            let kv = kv.trim();
            kv.split_once('=')
                .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        })
        .collect()
}

/// Parse an announced session description into the track list recorded on
/// the path.
pub fn unmarshal(data: &str) -> Result<Vec<Track>, SessionError> {
    let mut sections: Vec<MediaSection> = Vec::new();

    for line in data.lines() {
        let line = line.trim_end();
        if let Some(media_line) = line.strip_prefix("m=") {
            // m=video 0 RTP/AVP 96
            let mut fields = media_line.split_ascii_whitespace();
            let media = fields.next().unwrap_or_default().to_string();
            let payload_type = fields
                .nth(2)
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| SessionError::malformed("media line without payload type"))?;
            sections.push(MediaSection {
                media,
                payload_type,
                ..Default::default()
            });
        } else if let Some(attr) = line.strip_prefix("a=") {
            let Some(section) = sections.last_mut() else {
                continue;
            };
            if let Some(rtpmap) = attr.strip_prefix("rtpmap:") {
                // rtpmap:96 H264/90000[/2]
                if let Some((_, spec)) = rtpmap.split_once(' ') {
                    let mut parts = spec.split('/');
                    section.encoding = parts.next().unwrap_or_default().to_string();
                    section.clock_rate =
                        parts.next().and_then(|v| v.parse().ok()).unwrap_or(90000);
                    section.encoding_params = parts.next().and_then(|v| v.parse().ok());
                }
            } else if let Some(fmtp) = attr.strip_prefix("fmtp:") {
                section.fmtp = parse_fmtp(fmtp);
            }
        }
    }

    let mut tracks = Vec::with_capacity(sections.len());
    for (id, section) in sections.into_iter().enumerate() {
        let kind = match section.media.as_str() {
            "video" => MediaKind::Video,
            "audio" => MediaKind::Audio,
            other => {
                log::debug!("skipping media section '{}'", other);
                continue;
            }
        };

        let fmtp_get = |key: &str| -> Option<&String> {
            section.fmtp.iter().find(|(k, _)| k == key).map(|(_, v)| v)
        };

        let params = match section.encoding.to_uppercase().as_str() {
            "H264" => {
                let (sps, pps) = match fmtp_get("sprop-parameter-sets") {
                    Some(sprop) => {
                        let mut parts = sprop.split(',');
                        let sps = parts
                            .next()
                            .and_then(|b| base64::decode(b).ok())
                            .map(|v| BytesMut::from(&v[..]))
                            .unwrap_or_default();
                        let pps = parts
                            .next()
                            .and_then(|b| base64::decode(b).ok())
                            .map(|v| BytesMut::from(&v[..]))
                            .unwrap_or_default();
                        (sps, pps)
                    }
                    None => (BytesMut::new(), BytesMut::new()),
                };
                TrackParams::H264 { sps, pps }
            }
            "H265" => {
                let decode = |key: &str| {
                    fmtp_get(key)
                        .and_then(|b| base64::decode(b).ok())
                        .map(|v| BytesMut::from(&v[..]))
                        .unwrap_or_default()
                };
                TrackParams::H265 {
                    vps: decode("sprop-vps"),
                    sps: decode("sprop-sps"),
                    pps: decode("sprop-pps"),
                }
            }
            "MPEG4-GENERIC" => {
                let config = fmtp_get("config")
                    .and_then(|c| hex::decode(c).ok())
                    .and_then(|c| AudioSpecificConfig::parse(&c).ok())
                    .unwrap_or(AudioSpecificConfig {
                        object_type: 2,
                        sample_rate_index: 4,
                        channels: section.encoding_params.unwrap_or(2) as u8,
                    });
                let size_length = fmtp_get("sizelength")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(13);
                let index_length = fmtp_get("indexlength")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3);
                TrackParams::Mpeg4Audio {
                    config,
                    size_length,
                    index_length,
                }
            }
            "OPUS" => TrackParams::Opus {
                channels: section.encoding_params.unwrap_or(2) as u8,
            },
            "VP8" => TrackParams::Vp8,
            "VP9" => TrackParams::Vp9,
            "PCMU" => TrackParams::G711 { mu_law: true },
            "PCMA" => TrackParams::G711 { mu_law: false },
            "MPA" => TrackParams::Mpeg1Audio,
            name if name.starts_with('L') && name.len() <= 3 => TrackParams::Pcm {
                bit_depth: name[1..].parse().unwrap_or(16),
                channels: section.encoding_params.unwrap_or(2) as u8,
            },
            _ => TrackParams::Generic,
        };

        tracks.push(Track::new(
            id,
            kind,
            section.payload_type,
            if section.clock_rate > 0 {
                section.clock_rate
            } else {
                90000
            },
            params,
        ));
    }

    if tracks.is_empty() {
        return Err(SessionError::malformed("no usable media sections"));
    }

    Ok(tracks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_aac_tracks() -> Vec<Track> {
        vec![
            Track::new(
                0,
                MediaKind::Video,
                96,
                90000,
                TrackParams::H264 {
                    sps: BytesMut::from(
                        &[0x67, 0x64, 0x00, 0x0C, 0xAC, 0x3B, 0x50, 0xB0, 0x4B, 0x42][..],
                    ),
                    pps: BytesMut::from(&[0x68, 0xEE, 0x3C, 0x80][..]),
                },
            ),
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
            ),
        ]
    }

    #[test]
    fn marshal_then_unmarshal_preserves_tracks() {
        let tracks = h264_aac_tracks();
        let text = marshal(&tracks);
        assert!(text.contains("m=video 0 RTP/AVP 96"));
        assert!(text.contains("m=audio 0 RTP/AVP 97"));
        assert!(text.contains("a=control:trackID=0"));
        assert!(text.contains("sprop-parameter-sets="));

        let parsed = unmarshal(&text).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].kind, MediaKind::Video);
        assert_eq!(parsed[0].payload_type, 96);
        assert_eq!(parsed[0].clock_rate, 90000);
        assert_eq!(parsed[0].params(), tracks[0].params());
        assert_eq!(parsed[1].kind, MediaKind::Audio);
        assert_eq!(parsed[1].clock_rate, 44100);
        assert_eq!(parsed[1].params(), tracks[1].params());
    }

    #[test]
    fn ffmpeg_style_announce_parses() {
        let sdp = "v=0\r\n\
            o=- 0 0 IN IP4 127.0.0.1\r\n\
            s=No Name\r\n\
            c=IN IP4 127.0.0.1\r\n\
            t=0 0\r\n\
            m=video 0 RTP/AVP 96\r\n\
            b=AS:284\r\n\
            a=rtpmap:96 H264/90000\r\n\
            a=fmtp:96 packetization-mode=1; sprop-parameter-sets=Z2QAHqzZQKAv+XARAAADAAEAAAMAMg8WLZY=,aOvjyyLA; profile-level-id=64001E\r\n\
            a=control:streamid=0\r\n\
            m=audio 0 RTP/AVP 97\r\n\
            b=AS:128\r\n\
            a=rtpmap:97 MPEG4-GENERIC/48000/2\r\n\
            a=fmtp:97 profile-level-id=1;mode=AAC-hbr;sizelength=13;indexlength=3;indexdeltalength=3; config=119056E500\r\n\
            a=control:streamid=1\r\n";

        let tracks = unmarshal(sdp).unwrap();
        assert_eq!(tracks.len(), 2);
        match tracks[0].params() {
            TrackParams::H264 { sps, pps } => {
                assert!(!sps.is_empty());
                assert!(!pps.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
        match tracks[1].params() {
            TrackParams::Mpeg4Audio {
                config,
                size_length,
                index_length,
            } => {
                assert_eq!(size_length, 13);
                assert_eq!(index_length, 3);
                assert_eq!(config.sample_rate(), 48000);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn sdp_without_media_is_rejected() {
        assert!(unmarshal("v=0\r\ns=No Name\r\n").is_err());
    }
}

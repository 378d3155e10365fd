use {
    crate::{
        define::{aac_packet_type, avc_packet_type, codec_id, frame_type, sound_format},
        errors::{FlvError, FlvErrorValue},
    },
    bytes::BytesMut,
    mcodec::{
        aac::AudioSpecificConfig,
        h264::{split_avcc, AvcDecoderConfig},
    },
};

/// A parsed FLV video tag body (the payload of an RTMP video message).
#[derive(Debug)]
pub enum VideoTag {
    SequenceHeader(AvcDecoderConfig),
    AccessUnit {
        key_frame: bool,
        /// Composition time offset (PTS - DTS) in milliseconds.
        cts: i32,
        nalus: Vec<BytesMut>,
    },
    EndOfSequence,
}

/// A parsed FLV audio tag body.
#[derive(Debug)]
pub enum AudioTag {
    SequenceHeader(AudioSpecificConfig),
    Frame(BytesMut),
}

pub fn demux_video(data: &[u8]) -> Result<VideoTag, FlvError> {
    if data.len() < 5 {
        return Err(FlvError {
            value: FlvErrorValue::NotEnoughBytes,
        });
    }

    let frame = data[0] >> 4;
    let codec = data[0] & 0x0F;
    if codec != codec_id::AVC {
        return Err(FlvError {
            value: FlvErrorValue::UnsupportedCodec(codec),
        });
    }

    let packet_type = data[1];
    let cts = {
        // 24-bit signed composition time
        let raw = (data[2] as i32) << 16 | (data[3] as i32) << 8 | data[4] as i32;
        if raw & 0x80_0000 != 0 {
            raw | !0xFF_FFFF
        } else {
            raw
        }
    };

    match packet_type {
        avc_packet_type::SEQ_HDR => {
            let config = AvcDecoderConfig::unmarshal(&data[5..])?;
            Ok(VideoTag::SequenceHeader(config))
        }
        avc_packet_type::NALU => {
            let nalus = split_avcc(&data[5..])?
                .into_iter()
                .map(BytesMut::from)
                .collect();
            Ok(VideoTag::AccessUnit {
                key_frame: frame == frame_type::KEY_FRAME,
                cts,
                nalus,
            })
        }
        _ => Ok(VideoTag::EndOfSequence),
    }
}

pub fn demux_audio(data: &[u8]) -> Result<AudioTag, FlvError> {
    if data.len() < 2 {
        return Err(FlvError {
            value: FlvErrorValue::NotEnoughBytes,
        });
    }

    let format = data[0] >> 4;
    if format != sound_format::AAC {
        return Err(FlvError {
            value: FlvErrorValue::UnsupportedCodec(format),
        });
    }

    match data[1] {
        aac_packet_type::SEQ_HDR => {
            let config = AudioSpecificConfig::parse(&data[2..])?;
            Ok(AudioTag::SequenceHeader(config))
        }
        _ => Ok(AudioTag::Frame(BytesMut::from(&data[2..]))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::muxer;

    const SPS: [u8; 10] = [0x67, 0x64, 0x00, 0x0C, 0xAC, 0x3B, 0x50, 0xB0, 0x4B, 0x42];
    const PPS: [u8; 4] = [0x68, 0xEE, 0x3C, 0x80];

    #[test]
    fn video_sequence_header_round_trip() {
        let config = AvcDecoderConfig {
            sps: BytesMut::from(&SPS[..]),
            pps: BytesMut::from(&PPS[..]),
        };
        let body = muxer::mux_video_sequence_header(&config).unwrap();
        match demux_video(&body).unwrap() {
            VideoTag::SequenceHeader(parsed) => assert_eq!(parsed, config),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn video_access_unit_round_trip() {
        let nalus = vec![
            BytesMut::from(&[0x65u8, 0x01, 0x02][..]),
            BytesMut::from(&[0x41u8, 0x9A][..]),
        ];
        let body = muxer::mux_video_access_unit(true, -40, &nalus);
        match demux_video(&body).unwrap() {
            VideoTag::AccessUnit {
                key_frame,
                cts,
                nalus: parsed,
            } => {
                assert!(key_frame);
                assert_eq!(cts, -40);
                assert_eq!(parsed, nalus);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn audio_round_trip() {
        let config = AudioSpecificConfig {
            object_type: 2,
            sample_rate_index: 4,
            channels: 2,
        };
        let body = muxer::mux_audio_sequence_header(&config);
        match demux_audio(&body).unwrap() {
            AudioTag::SequenceHeader(parsed) => assert_eq!(parsed, config),
            other => panic!("unexpected: {other:?}"),
        }

        let frame = BytesMut::from(&[0x11u8, 0x22, 0x33][..]);
        let body = muxer::mux_audio_frame(&frame);
        match demux_audio(&body).unwrap() {
            AudioTag::Frame(parsed) => assert_eq!(parsed, frame),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn non_avc_codec_is_rejected() {
        // codec id 2 = Sorenson H.263
        assert!(demux_video(&[0x12, 0x01, 0, 0, 0, 0xAA]).is_err());
    }
}

use {
    crate::define::{aac_packet_type, avc_packet_type, codec_id, frame_type, sound_format},
    crate::errors::FlvError,
    bytes::{BufMut, BytesMut},
    mcodec::{
        aac::AudioSpecificConfig,
        h264::{to_avcc, AvcDecoderConfig},
    },
};

/// FLV/RTMP video message body carrying the AVC decoder configuration.
pub fn mux_video_sequence_header(config: &AvcDecoderConfig) -> Result<BytesMut, FlvError> {
    let mut out = BytesMut::new();
    out.put_u8(frame_type::KEY_FRAME << 4 | codec_id::AVC);
    out.put_u8(avc_packet_type::SEQ_HDR);
    out.put_u8(0);
    out.put_u8(0);
    out.put_u8(0);
    out.extend_from_slice(&config.marshal()?);
    Ok(out)
}

/// FLV/RTMP video message body carrying one access unit in AVCC framing.
pub fn mux_video_access_unit(key_frame: bool, cts: i32, nalus: &[BytesMut]) -> BytesMut {
    let mut out = BytesMut::new();
    let frame = if key_frame {
        frame_type::KEY_FRAME
    } else {
        frame_type::INTER_FRAME
    };
    out.put_u8(frame << 4 | codec_id::AVC);
    out.put_u8(avc_packet_type::NALU);
    out.put_u8((cts >> 16) as u8);
    out.put_u8((cts >> 8) as u8);
    out.put_u8(cts as u8);
    let refs: Vec<&[u8]> = nalus.iter().map(|n| &n[..]).collect();
    out.extend_from_slice(&to_avcc(&refs));
    out
}

const AAC_HEADER: u8 =
    sound_format::AAC << 4 | 0x03 << 2 /* 44 kHz */ | 0x01 << 1 /* 16 bit */ | 0x01 /* stereo */;

pub fn mux_audio_sequence_header(config: &AudioSpecificConfig) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u8(AAC_HEADER);
    out.put_u8(aac_packet_type::SEQ_HDR);
    out.extend_from_slice(&config.marshal());
    out
}

pub fn mux_audio_frame(frame: &[u8]) -> BytesMut {
    let mut out = BytesMut::new();
    out.put_u8(AAC_HEADER);
    out.put_u8(aac_packet_type::RAW);
    out.extend_from_slice(frame);
    out
}

pub mod generic;
pub mod h264;
pub mod h265;
pub mod mpeg4audio;

use {
    crate::{
        define::FrameData,
        track::{Track, TrackParams},
    },
    bytes::BytesMut,
    rtp::{errors::RtpError, RtpPacket},
};

/// Result of pushing one datum through a track's processor: the canonical
/// RTP packets for the RTSP cohort, plus the access-unit form when the
/// stream currently has non-RTSP readers.
#[derive(Debug, Default)]
pub struct ProcessorOutput {
    pub packets: Vec<RtpPacket>,
    pub frame: Option<FrameData>,
}

/// One per track, owned by the stream's fan-out task.
pub enum FormatProcessor {
    H264(h264::H264Processor),
    H265(h265::H265Processor),
    Mpeg4Audio(mpeg4audio::Mpeg4AudioProcessor),
    Generic(generic::GenericProcessor),
}

impl FormatProcessor {
    pub fn new(track: Track, udp_max_payload_size: usize) -> Self {
        match track.params() {
            TrackParams::H264 { .. } => {
                FormatProcessor::H264(h264::H264Processor::new(track, udp_max_payload_size))
            }
            TrackParams::H265 { .. } => {
                FormatProcessor::H265(h265::H265Processor::new(track, udp_max_payload_size))
            }
            TrackParams::Mpeg4Audio {
                size_length,
                index_length,
                ..
            } => FormatProcessor::Mpeg4Audio(mpeg4audio::Mpeg4AudioProcessor::new(
                track,
                udp_max_payload_size,
                size_length,
                index_length,
            )),
            _ => FormatProcessor::Generic(generic::GenericProcessor::new(
                track,
                udp_max_payload_size,
            )),
        }
    }

    /// Inbound raw RTP from an RTSP-transport publisher.
    pub fn process_rtp(
        &mut self,
        packet: RtpPacket,
        want_frames: bool,
    ) -> Result<ProcessorOutput, RtpError> {
        match self {
            FormatProcessor::H264(p) => p.process_rtp(packet, want_frames),
            FormatProcessor::H265(p) => p.process_rtp(packet, want_frames),
            FormatProcessor::Mpeg4Audio(p) => p.process_rtp(packet, want_frames),
            FormatProcessor::Generic(p) => p.process_rtp(packet, want_frames),
        }
    }

    /// Inbound decoded units from RTMP / HLS / UDP publishers.
    pub fn process_units(
        &mut self,
        timestamp: u32,
        units: Vec<BytesMut>,
    ) -> Result<ProcessorOutput, RtpError> {
        match self {
            FormatProcessor::H264(p) => p.process_units(timestamp, units),
            FormatProcessor::H265(p) => p.process_units(timestamp, units),
            FormatProcessor::Mpeg4Audio(p) => p.process_units(timestamp, units),
            FormatProcessor::Generic(p) => p.process_units(timestamp, units),
        }
    }
}

pub mod aac;
pub mod errors;
pub mod generic;
pub mod h264;
pub mod h265;
pub mod packet;

pub use packet::{RtpHeader, RtpPacket, RTP_FIXED_HEADER_LEN};

use bytes::BytesMut;

/// One depacketized access unit: the NAL units (video) or frames (audio)
/// that share a single RTP timestamp.
#[derive(Debug, Clone, Default)]
pub struct AccessUnit {
    pub units: Vec<BytesMut>,
    pub timestamp: u32,
}

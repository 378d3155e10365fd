pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0;
pub const PMT_PID: u16 = 4096;
pub const VIDEO_PID: u16 = 256;
pub const AUDIO_PID: u16 = 257;

pub const PAYLOAD_UNIT_START: u8 = 0x40;

pub mod stream_type {
    pub const AAC: u8 = 0x0F;
    pub const H264: u8 = 0x1B;
    pub const H265: u8 = 0x24;
    pub const MPEG1_AUDIO: u8 = 0x03;
    pub const PRIVATE_DATA: u8 = 0x06;
}

pub mod stream_id {
    pub const VIDEO: u8 = 0xE0;
    pub const AUDIO: u8 = 0xC0;
}

/// 90 kHz ticks in 500 ms; subtracted from DTS so PCR never overtakes the
/// timestamps it paces.
pub const PCR_OFFSET: u64 = 45_000;

/// A PCR is inserted on the PCR PID every this many PES packets.
pub const PCR_PES_PERIOD: u32 = 3;

pub const PTS_NO_VALUE: u64 = u64::MAX;

pub mod errors;
pub mod fmp4;
pub mod hls_source;
pub mod m3u8;
pub mod muxer;
pub mod server;
pub mod ts_bridge;
pub mod udp_source;

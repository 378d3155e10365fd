use {
    bytes::BytesMut,
    mcodec::aac::AudioSpecificConfig,
    serde_derive::Serialize,
    std::sync::{Arc, RwLock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

/// Codec-tagged track parameters. Parameter sets can be replaced
/// mid-stream (SPS/PPS swaps are common), so they live behind the shared
/// snapshot in [`Track`], not here.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackParams {
    H264 {
        sps: BytesMut,
        pps: BytesMut,
    },
    H265 {
        vps: BytesMut,
        sps: BytesMut,
        pps: BytesMut,
    },
    Mpeg4Audio {
        config: AudioSpecificConfig,
        size_length: u8,
        index_length: u8,
    },
    Opus {
        channels: u8,
    },
    Vp8,
    Vp9,
    G711 {
        mu_law: bool,
    },
    Pcm {
        bit_depth: u8,
        channels: u8,
    },
    Mpeg1Audio,
    Generic,
}

impl TrackParams {
    pub fn codec_name(&self) -> &'static str {
        match self {
            TrackParams::H264 { .. } => "H264",
            TrackParams::H265 { .. } => "H265",
            TrackParams::Mpeg4Audio { .. } => "MPEG4-GENERIC",
            TrackParams::Opus { .. } => "opus",
            TrackParams::Vp8 => "VP8",
            TrackParams::Vp9 => "VP9",
            TrackParams::G711 { mu_law: true } => "PCMU",
            TrackParams::G711 { mu_law: false } => "PCMA",
            TrackParams::Pcm { .. } => "L16",
            TrackParams::Mpeg1Audio => "MPA",
            TrackParams::Generic => "private",
        }
    }
}

/// One media track of a stream. Identity fields are immutable once the
/// publisher records; `params` is the atomically swappable parameter-set
/// snapshot read by SDP generation and the HLS muxers while the fan-out
/// path keeps it current.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: usize,
    pub kind: MediaKind,
    pub payload_type: u8,
    pub clock_rate: u32,
    params: Arc<RwLock<TrackParams>>,
}

impl Track {
    pub fn new(id: usize, kind: MediaKind, payload_type: u8, clock_rate: u32, params: TrackParams) -> Self {
        Self {
            id,
            kind,
            payload_type,
            clock_rate,
            params: Arc::new(RwLock::new(params)),
        }
    }

    pub fn params(&self) -> TrackParams {
        self.params.read().unwrap().clone()
    }

    pub fn set_params(&self, params: TrackParams) {
        *self.params.write().unwrap() = params;
    }

    /// Update under the lock; used for partial changes like a new SPS with
    /// the PPS untouched.
    pub fn update_params<F: FnOnce(&mut TrackParams)>(&self, f: F) {
        f(&mut self.params.write().unwrap());
    }

    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_snapshot_is_coherent() {
        let track = Track::new(
            0,
            MediaKind::Video,
            96,
            90000,
            TrackParams::H264 {
                sps: BytesMut::from(&[0x67, 0x42][..]),
                pps: BytesMut::from(&[0x68, 0xCE][..]),
            },
        );

        let before = track.params();
        track.update_params(|p| {
            if let TrackParams::H264 { sps, .. } = p {
                *sps = BytesMut::from(&[0x67, 0x64][..]);
            }
        });
        let after = track.params();

        // the earlier snapshot is unaffected by the update
        if let (TrackParams::H264 { sps: old, .. }, TrackParams::H264 { sps: new, .. }) =
            (before, after)
        {
            assert_eq!(&old[..], &[0x67, 0x42]);
            assert_eq!(&new[..], &[0x67, 0x64]);
        } else {
            panic!("unexpected variant");
        }
    }
}

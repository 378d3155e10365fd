use {
    failure::Fail,
    mmpegts::errors::MpegTsError,
    pathhub::errors::PathError,
    std::fmt,
};

#[derive(Debug, Fail)]
pub enum HlsErrorValue {
    #[fail(display = "io error: {}", _0)]
    IO(std::io::Error),
    #[fail(display = "mpegts error: {}", _0)]
    MpegTs(MpegTsError),
    #[fail(display = "path error: {}", _0)]
    Path(PathError),
    #[fail(display = "upstream error: {}", _0)]
    Upstream(String),
    #[fail(display = "muxer closed")]
    Closed,
}

#[derive(Debug)]
pub struct HlsError {
    pub value: HlsErrorValue,
}

impl HlsError {
    pub fn upstream(msg: &str) -> Self {
        Self {
            value: HlsErrorValue::Upstream(msg.to_string()),
        }
    }
}

impl fmt::Display for HlsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl From<std::io::Error> for HlsError {
    fn from(error: std::io::Error) -> Self {
        HlsError {
            value: HlsErrorValue::IO(error),
        }
    }
}

impl From<MpegTsError> for HlsError {
    fn from(error: MpegTsError) -> Self {
        HlsError {
            value: HlsErrorValue::MpegTs(error),
        }
    }
}

impl From<PathError> for HlsError {
    fn from(error: PathError) -> Self {
        HlsError {
            value: HlsErrorValue::Path(error),
        }
    }
}

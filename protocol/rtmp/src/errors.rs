use {
    failure::Fail,
    mflv::errors::FlvError,
    netio::errors::NetIOError,
    pathhub::errors::PathError,
    std::fmt,
};

#[derive(Debug, Fail)]
pub enum RtmpErrorValue {
    #[fail(display = "net io error: {}", _0)]
    NetIO(NetIOError),
    #[fail(display = "handshake failed: {}", _0)]
    Handshake(String),
    #[fail(display = "malformed chunk stream: {}", _0)]
    Chunk(String),
    #[fail(display = "malformed amf0: {}", _0)]
    Amf0(String),
    #[fail(display = "flv error: {}", _0)]
    Flv(FlvError),
    #[fail(display = "path error: {}", _0)]
    Path(PathError),
    #[fail(display = "unexpected command '{}'", _0)]
    UnexpectedCommand(String),
    #[fail(display = "connection closed: {:?}", _0)]
    Closed(pathhub::define::CloseReason),
    #[fail(display = "stream data channel closed")]
    StreamGone,
}

#[derive(Debug)]
pub struct RtmpError {
    pub value: RtmpErrorValue,
}

impl RtmpError {
    pub fn chunk(msg: &str) -> Self {
        Self {
            value: RtmpErrorValue::Chunk(msg.to_string()),
        }
    }

    pub fn amf0(msg: &str) -> Self {
        Self {
            value: RtmpErrorValue::Amf0(msg.to_string()),
        }
    }

    pub fn handshake(msg: &str) -> Self {
        Self {
            value: RtmpErrorValue::Handshake(msg.to_string()),
        }
    }
}

impl fmt::Display for RtmpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl From<NetIOError> for RtmpError {
    fn from(error: NetIOError) -> Self {
        RtmpError {
            value: RtmpErrorValue::NetIO(error),
        }
    }
}

impl From<FlvError> for RtmpError {
    fn from(error: FlvError) -> Self {
        RtmpError {
            value: RtmpErrorValue::Flv(error),
        }
    }
}

impl From<PathError> for RtmpError {
    fn from(error: PathError) -> Self {
        RtmpError {
            value: RtmpErrorValue::Path(error),
        }
    }
}

impl From<std::io::Error> for RtmpError {
    fn from(error: std::io::Error) -> Self {
        RtmpError {
            value: RtmpErrorValue::NetIO(NetIOError::from(error)),
        }
    }
}

use {
    baselib::errors::AuthError,
    failure::Fail,
    mcodec::errors::CodecError,
    netio::errors::NetIOError,
    pathhub::errors::PathError,
    rtp::errors::RtpError,
    std::{fmt, str::Utf8Error},
};

#[derive(Debug, Fail)]
pub enum SessionErrorValue {
    #[fail(display = "net io error: {}", _0)]
    NetIO(NetIOError),
    #[fail(display = "rtp error: {}", _0)]
    Rtp(RtpError),
    #[fail(display = "codec error: {}", _0)]
    Codec(CodecError),
    #[fail(display = "path error: {}", _0)]
    Path(PathError),
    #[fail(display = "auth error: {}", _0)]
    Auth(AuthError),
    #[fail(display = "transport '{}' is not supported", _0)]
    UnsupportedTransport(String),
    #[fail(display = "malformed request: {}", _0)]
    Malformed(String),
    #[fail(display = "invalid utf8")]
    Utf8(Utf8Error),
    #[fail(display = "invalid state for method {}", _0)]
    InvalidState(String),
    #[fail(display = "no multicast address available")]
    MulticastExhausted,
    #[fail(display = "session closed: {:?}", _0)]
    Closed(pathhub::define::CloseReason),
    #[fail(display = "stream data channel closed")]
    StreamGone,
}

#[derive(Debug)]
pub struct SessionError {
    pub value: SessionErrorValue,
}

impl SessionError {
    pub fn malformed(msg: &str) -> Self {
        Self {
            value: SessionErrorValue::Malformed(msg.to_string()),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

macro_rules! from_error {
    ($from:ty, $variant:ident) => {
        impl From<$from> for SessionError {
            fn from(error: $from) -> Self {
                SessionError {
                    value: SessionErrorValue::$variant(error),
                }
            }
        }
    };
}

from_error!(NetIOError, NetIO);
from_error!(RtpError, Rtp);
from_error!(CodecError, Codec);
from_error!(PathError, Path);
from_error!(AuthError, Auth);
from_error!(Utf8Error, Utf8);

impl From<std::io::Error> for SessionError {
    fn from(error: std::io::Error) -> Self {
        SessionError {
            value: SessionErrorValue::NetIO(NetIOError::from(error)),
        }
    }
}

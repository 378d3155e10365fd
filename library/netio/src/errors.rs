use {
    failure::Fail,
    std::{fmt, io},
    tokio::time::error::Elapsed,
};

#[derive(Debug, Fail)]
pub enum CursorErrorValue {
    #[fail(display = "not enough bytes")]
    NotEnoughBytes,
    #[fail(display = "index out of range")]
    IndexOutOfRange,
    #[fail(display = "io error: {}", _0)]
    IO(#[cause] io::Error),
}

#[derive(Debug)]
pub struct CursorError {
    pub value: CursorErrorValue,
}

impl fmt::Display for CursorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl From<io::Error> for CursorError {
    fn from(error: io::Error) -> Self {
        CursorError {
            value: CursorErrorValue::IO(error),
        }
    }
}

#[derive(Debug, Fail)]
pub enum NetIOErrorValue {
    #[fail(display = "io error: {}", _0)]
    IO(#[cause] io::Error),
    #[fail(display = "connection closed by peer")]
    Closed,
    #[fail(display = "deadline exceeded")]
    Timeout(Elapsed),
    #[fail(display = "tls error: {}", _0)]
    Tls(String),
    #[fail(display = "cursor error: {}", _0)]
    Cursor(CursorError),
}

#[derive(Debug)]
pub struct NetIOError {
    pub value: NetIOErrorValue,
}

impl fmt::Display for NetIOError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl From<io::Error> for NetIOError {
    fn from(error: io::Error) -> Self {
        NetIOError {
            value: NetIOErrorValue::IO(error),
        }
    }
}

impl From<Elapsed> for NetIOError {
    fn from(error: Elapsed) -> Self {
        NetIOError {
            value: NetIOErrorValue::Timeout(error),
        }
    }
}

impl From<CursorError> for NetIOError {
    fn from(error: CursorError) -> Self {
        NetIOError {
            value: NetIOErrorValue::Cursor(error),
        }
    }
}

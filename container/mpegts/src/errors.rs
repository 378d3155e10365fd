use {failure::Fail, std::fmt};

#[derive(Debug, Fail)]
pub enum MpegTsErrorValue {
    #[fail(display = "stream with pid {} not found", _0)]
    StreamNotFound(u16),
    #[fail(display = "malformed transport stream: {}", _0)]
    Malformed(String),
    #[fail(display = "not enough bytes")]
    NotEnoughBytes,
}

#[derive(Debug)]
pub struct MpegTsError {
    pub value: MpegTsErrorValue,
}

impl MpegTsError {
    pub fn malformed(msg: &str) -> Self {
        Self {
            value: MpegTsErrorValue::Malformed(msg.to_string()),
        }
    }
}

impl fmt::Display for MpegTsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

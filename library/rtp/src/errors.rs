use {failure::Fail, mcodec::errors::CodecError, std::fmt};

#[derive(Debug, Fail)]
pub enum RtpErrorValue {
    #[fail(display = "not enough bytes")]
    NotEnoughBytes,
    #[fail(display = "malformed packet: {}", _0)]
    Malformed(String),
    #[fail(display = "fragment without a starting packet")]
    NonStartingFragment,
    #[fail(display = "codec error: {}", _0)]
    Codec(CodecError),
}

#[derive(Debug)]
pub struct RtpError {
    pub value: RtpErrorValue,
}

impl fmt::Display for RtpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl RtpError {
    pub fn malformed(msg: &str) -> Self {
        Self {
            value: RtpErrorValue::Malformed(msg.to_string()),
        }
    }
}

impl From<CodecError> for RtpError {
    fn from(error: CodecError) -> Self {
        RtpError {
            value: RtpErrorValue::Codec(error),
        }
    }
}

use {failure::Fail, mcodec::errors::CodecError, std::fmt};

#[derive(Debug, Fail)]
pub enum FlvErrorValue {
    #[fail(display = "not enough bytes")]
    NotEnoughBytes,
    #[fail(display = "unsupported codec id {}", _0)]
    UnsupportedCodec(u8),
    #[fail(display = "codec error: {}", _0)]
    Codec(CodecError),
}

#[derive(Debug)]
pub struct FlvError {
    pub value: FlvErrorValue,
}

impl fmt::Display for FlvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl From<CodecError> for FlvError {
    fn from(error: CodecError) -> Self {
        FlvError {
            value: FlvErrorValue::Codec(error),
        }
    }
}

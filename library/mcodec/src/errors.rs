use {failure::Fail, std::fmt};

#[derive(Debug, Fail)]
pub enum CodecErrorValue {
    #[fail(display = "not enough bits")]
    NotEnoughBits,
    #[fail(display = "not enough bytes")]
    NotEnoughBytes,
    #[fail(display = "invalid data: {}", _0)]
    InvalidData(String),
    #[fail(display = "unsupported: {}", _0)]
    Unsupported(String),
}

#[derive(Debug)]
pub struct CodecError {
    pub value: CodecErrorValue,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl CodecError {
    pub fn invalid(msg: &str) -> Self {
        Self {
            value: CodecErrorValue::InvalidData(msg.to_string()),
        }
    }
}

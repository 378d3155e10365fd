use {failure::Fail, std::fmt};

#[derive(Debug, Fail)]
pub enum ConfigErrorValue {
    #[fail(display = "cannot read configuration file: {}", _0)]
    IO(std::io::Error),
    #[fail(display = "cannot parse configuration: {}", _0)]
    Parse(String),
    #[fail(display = "invalid configuration: {}", _0)]
    Invalid(String),
}

#[derive(Debug)]
pub struct ConfigError {
    pub value: ConfigErrorValue,
}

impl ConfigError {
    pub fn invalid(msg: String) -> Self {
        Self {
            value: ConfigErrorValue::Invalid(msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(error: std::io::Error) -> Self {
        ConfigError {
            value: ConfigErrorValue::IO(error),
        }
    }
}

impl std::error::Error for ConfigError {}

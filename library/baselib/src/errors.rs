use {failure::Fail, std::fmt};

#[derive(Debug, Fail)]
pub enum AuthErrorValue {
    /// Credentials were required but not presented. Callers answer with a
    /// challenge and let the client retry, without any delay.
    #[fail(display = "authentication required")]
    MissingCredentials,
    #[fail(display = "invalid credentials")]
    WrongCredentials,
    #[fail(display = "ip '{}' not allowed", _0)]
    IpNotAllowed(String),
    #[fail(display = "invalid ip or network '{}'", _0)]
    InvalidIpNetwork(String),
    #[fail(display = "external authentication failed: {}", _0)]
    External(String),
}

#[derive(Debug)]
pub struct AuthError {
    pub value: AuthErrorValue,
}

impl AuthError {
    /// Critical failures get the anti-brute-force stall before the
    /// connection is closed; non-critical ones only get a 401 challenge.
    pub fn is_critical(&self) -> bool {
        !matches!(self.value, AuthErrorValue::MissingCredentials)
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

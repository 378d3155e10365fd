use {baselib::errors::AuthError, failure::Fail, std::fmt};

#[derive(Debug, Fail)]
pub enum PathErrorValue {
    #[fail(display = "no one is publishing to path '{}'", _0)]
    NoOnePublishing(String),
    #[fail(display = "authentication required")]
    AuthNotCritical,
    #[fail(display = "authentication failed: {}", _0)]
    AuthCritical(String),
    #[fail(display = "another publisher is already publishing to path '{}'", _0)]
    AlreadyPublishing(String),
    #[fail(display = "path '{}' is assigned to a static source", _0)]
    StaticSourceSlot(String),
    #[fail(display = "source of path '{}' has timed out", _0)]
    SourceTimeout(String),
    #[fail(display = "invalid path name: {}", _0)]
    InvalidName(String),
    #[fail(display = "publisher is not assigned to this path anymore")]
    StalePublisher,
    #[fail(display = "terminated")]
    Terminated,
}

#[derive(Debug)]
pub struct PathError {
    pub value: PathErrorValue,
}

impl PathError {
    pub fn terminated() -> Self {
        Self {
            value: PathErrorValue::Terminated,
        }
    }

    /// Whether the session should apply the brute-force stall before
    /// closing.
    pub fn is_critical_auth(&self) -> bool {
        matches!(self.value, PathErrorValue::AuthCritical(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(
            self.value,
            PathErrorValue::AuthCritical(_) | PathErrorValue::AuthNotCritical
        )
    }
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.value, f)
    }
}

impl From<AuthError> for PathError {
    fn from(error: AuthError) -> Self {
        if error.is_critical() {
            PathError {
                value: PathErrorValue::AuthCritical(error.to_string()),
            }
        } else {
            PathError {
                value: PathErrorValue::AuthNotCritical,
            }
        }
    }
}

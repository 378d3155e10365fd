use {
    crate::errors::{PathError, PathErrorValue},
    baselib::auth::{parse_ip_list, Credential, PathAuth},
    regex::Regex,
    serde_derive::{Deserialize, Serialize},
    std::time::Duration,
};

fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '~' | '-' | '/')
}

/// Validate a literal path name: alphanumerics plus `_ . ~ - /`, non-empty,
/// no leading or trailing slash.
pub fn check_path_name(name: &str) -> Result<(), PathError> {
    let invalid = |reason: &str| PathError {
        value: PathErrorValue::InvalidName(format!("'{name}': {reason}")),
    };

    if name.is_empty() {
        return Err(invalid("cannot be empty"));
    }
    if name.starts_with('/') {
        return Err(invalid("can't begin with a slash"));
    }
    if name.ends_with('/') {
        return Err(invalid("can't end with a slash"));
    }
    if !name.chars().all(is_valid_name_char) {
        return Err(invalid(
            "can contain only alphanumeric characters, underscore, dot, tilde, minus or slash",
        ));
    }
    Ok(())
}

/// Where a path's media comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// An inbound publisher session provides the stream.
    Publisher,
    Rtsp,
    Rtmp,
    Hls,
    Udp,
    Redirect,
    RpiCamera,
}

pub fn classify_source(source: &str) -> Option<SourceKind> {
    if source == "publisher" {
        Some(SourceKind::Publisher)
    } else if source.starts_with("rtsp://") || source.starts_with("rtsps://") {
        Some(SourceKind::Rtsp)
    } else if source.starts_with("rtmp://") || source.starts_with("rtmps://") {
        Some(SourceKind::Rtmp)
    } else if source.starts_with("http://") || source.starts_with("https://") {
        Some(SourceKind::Hls)
    } else if source.starts_with("udp://") {
        Some(SourceKind::Udp)
    } else if source == "redirect" {
        Some(SourceKind::Redirect)
    } else if source == "rpiCamera" {
        Some(SourceKind::RpiCamera)
    } else {
        None
    }
}

/// Preferred transport of an RTSP static source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceProtocol {
    #[default]
    Automatic,
    Udp,
    Multicast,
    Tcp,
}

/// Immutable per-path configuration. Frozen when the path instance is
/// created; regexp template paths hand a copy to every spawned child.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PathConf {
    pub source: String,
    pub source_protocol: SourceProtocol,
    pub source_on_demand: bool,
    pub source_on_demand_start_timeout: Option<String>,
    pub source_on_demand_close_after: Option<String>,
    pub source_redirect: String,
    pub disable_publisher_override: bool,
    pub fallback: String,

    pub publish_user: String,
    pub publish_pass: String,
    pub publish_i_ps: Vec<String>,
    pub read_user: String,
    pub read_pass: String,
    pub read_i_ps: Vec<String>,

    pub run_on_init: String,
    pub run_on_init_restart: bool,
    pub run_on_demand: String,
    pub run_on_demand_restart: bool,
    pub run_on_demand_start_timeout: Option<String>,
    pub run_on_demand_close_after: Option<String>,
    pub run_on_ready: String,
    pub run_on_ready_restart: bool,
    pub run_on_read: String,
    pub run_on_read_restart: bool,
    pub run_on_publish: String,
    pub run_on_publish_restart: bool,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            source: "publisher".to_string(),
            source_protocol: SourceProtocol::Automatic,
            source_on_demand: false,
            source_on_demand_start_timeout: None,
            source_on_demand_close_after: None,
            source_redirect: String::new(),
            disable_publisher_override: false,
            fallback: String::new(),
            publish_user: String::new(),
            publish_pass: String::new(),
            publish_i_ps: Vec::new(),
            read_user: String::new(),
            read_pass: String::new(),
            read_i_ps: Vec::new(),
            run_on_init: String::new(),
            run_on_init_restart: false,
            run_on_demand: String::new(),
            run_on_demand_restart: false,
            run_on_demand_start_timeout: None,
            run_on_demand_close_after: None,
            run_on_ready: String::new(),
            run_on_ready_restart: false,
            run_on_read: String::new(),
            run_on_read_restart: false,
            run_on_publish: String::new(),
            run_on_publish_restart: false,
        }
    }
}

fn parse_duration(value: &Option<String>, default: Duration) -> Duration {
    let Some(text) = value else {
        return default;
    };
    let text = text.trim();

    let (number, unit) = match text.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => text.split_at(idx),
        None => (text, "s"),
    };

    let Ok(number) = number.parse::<f64>() else {
        return default;
    };

    let secs = match unit {
        "ms" => number / 1000.0,
        "s" | "" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return default,
    };

    Duration::from_secs_f64(secs)
}

impl PathConf {
    pub fn source_kind(&self) -> Option<SourceKind> {
        classify_source(&self.source)
    }

    pub fn has_static_source(&self) -> bool {
        matches!(
            self.source_kind(),
            Some(SourceKind::Rtsp)
                | Some(SourceKind::Rtmp)
                | Some(SourceKind::Hls)
                | Some(SourceKind::Udp)
        )
    }

    pub fn is_on_demand(&self) -> bool {
        (self.has_static_source() && self.source_on_demand) || !self.run_on_demand.is_empty()
    }

    pub fn on_demand_start_timeout(&self) -> Duration {
        if self.has_static_source() {
            parse_duration(&self.source_on_demand_start_timeout, Duration::from_secs(10))
        } else {
            parse_duration(&self.run_on_demand_start_timeout, Duration::from_secs(10))
        }
    }

    pub fn on_demand_close_after(&self) -> Duration {
        if self.has_static_source() {
            parse_duration(&self.source_on_demand_close_after, Duration::from_secs(10))
        } else {
            parse_duration(&self.run_on_demand_close_after, Duration::from_secs(10))
        }
    }

    pub fn read_auth(&self) -> Result<PathAuth, PathError> {
        Ok(PathAuth {
            user: non_empty(&self.read_user).map(|u| Credential::new(u)),
            pass: non_empty(&self.read_pass).map(|p| Credential::new(p)),
            ips: parse_ip_list(&self.read_i_ps)?,
        })
    }

    pub fn publish_auth(&self) -> Result<PathAuth, PathError> {
        Ok(PathAuth {
            user: non_empty(&self.publish_user).map(|u| Credential::new(u)),
            pass: non_empty(&self.publish_pass).map(|p| Credential::new(p)),
            ips: parse_ip_list(&self.publish_i_ps)?,
        })
    }

    /// Startup validation of one (name, conf) entry. Mirrors what the
    /// server accepts at configuration load time.
    pub fn check(&self, name: &str) -> Result<Option<Regex>, PathError> {
        let regexp = if let Some(pattern) = name.strip_prefix('~') {
            let compiled = Regex::new(pattern).map_err(|_| PathError {
                value: PathErrorValue::InvalidName(format!(
                    "invalid regular expression: {pattern}"
                )),
            })?;
            Some(compiled)
        } else {
            check_path_name(name)?;
            None
        };

        let invalid = |reason: String| PathError {
            value: PathErrorValue::InvalidName(reason),
        };

        let kind = self
            .source_kind()
            .ok_or_else(|| invalid(format!("invalid source: '{}'", self.source)))?;

        if regexp.is_some() && self.has_static_source() {
            return Err(invalid(
                "a path with a regular expression cannot have a static source; use another path"
                    .to_string(),
            ));
        }

        if kind == SourceKind::Redirect && self.source_redirect.is_empty() {
            return Err(invalid("source redirect must be filled".to_string()));
        }

        if self.source_on_demand && kind == SourceKind::Publisher {
            return Err(invalid(
                "'sourceOnDemand' is useless when source is 'publisher'".to_string(),
            ));
        }

        if !self.run_on_demand.is_empty() && kind != SourceKind::Publisher {
            return Err(invalid(
                "'runOnDemand' can be used only when source is 'publisher'".to_string(),
            ));
        }

        if !self.run_on_init.is_empty() && regexp.is_some() {
            return Err(invalid(
                "a path with a regular expression does not support option 'runOnInit'; use another path"
                    .to_string(),
            ));
        }

        if self.publish_user.is_empty() != self.publish_pass.is_empty() {
            return Err(invalid(
                "publish username and password must be both filled".to_string(),
            ));
        }

        if self.read_user.is_empty() != self.read_pass.is_empty() {
            return Err(invalid(
                "read username and password must be both filled".to_string(),
            ));
        }

        if !self.publish_user.is_empty() && kind != SourceKind::Publisher {
            return Err(invalid(
                "'publishUser' is useless when source is not 'publisher'".to_string(),
            ));
        }

        if !self.fallback.is_empty() {
            if let Some(inner) = self.fallback.strip_prefix('/') {
                check_path_name(inner)?;
            }
        }

        // force IP list parsing so malformed entries fail at startup
        self.read_auth()?;
        self.publish_auth()?;

        Ok(regexp)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_name_charset() {
        assert!(check_path_name("cam").is_ok());
        assert!(check_path_name("live/feed42").is_ok());
        assert!(check_path_name("a_b.c~d-e").is_ok());
        assert!(check_path_name("").is_err());
        assert!(check_path_name("/leading").is_err());
        assert!(check_path_name("trailing/").is_err());
        assert!(check_path_name("spaces here").is_err());
        assert!(check_path_name("colon:bad").is_err());
    }

    #[test]
    fn source_classification() {
        assert_eq!(classify_source("publisher"), Some(SourceKind::Publisher));
        assert_eq!(classify_source("rtsp://h/x"), Some(SourceKind::Rtsp));
        assert_eq!(classify_source("rtsps://h/x"), Some(SourceKind::Rtsp));
        assert_eq!(classify_source("rtmp://h/x"), Some(SourceKind::Rtmp));
        assert_eq!(classify_source("https://h/x.m3u8"), Some(SourceKind::Hls));
        assert_eq!(classify_source("udp://239.0.0.1:1234"), Some(SourceKind::Udp));
        assert_eq!(classify_source("redirect"), Some(SourceKind::Redirect));
        assert_eq!(classify_source("ftp://x"), None);
    }

    #[test]
    fn regexp_paths_cannot_have_static_sources() {
        let conf = PathConf {
            source: "rtsp://host/stream".to_string(),
            ..Default::default()
        };
        assert!(conf.check("~^live/(.+)$").is_err());
        assert!(conf.check("proxied").is_ok());
    }

    #[test]
    fn on_demand_timeouts_parse_duration_strings() {
        let conf = PathConf {
            source: "rtsp://host/stream".to_string(),
            source_on_demand: true,
            source_on_demand_start_timeout: Some("2s".to_string()),
            source_on_demand_close_after: Some("500ms".to_string()),
            ..Default::default()
        };
        assert!(conf.is_on_demand());
        assert_eq!(conf.on_demand_start_timeout(), Duration::from_secs(2));
        assert_eq!(conf.on_demand_close_after(), Duration::from_millis(500));
    }

    #[test]
    fn defaults_are_ten_seconds() {
        let conf = PathConf {
            source: "rtsp://host/stream".to_string(),
            source_on_demand: true,
            ..Default::default()
        };
        assert_eq!(conf.on_demand_start_timeout(), Duration::from_secs(10));
        assert_eq!(conf.on_demand_close_after(), Duration::from_secs(10));
    }

    #[test]
    fn redirect_requires_target() {
        let conf = PathConf {
            source: "redirect".to_string(),
            ..Default::default()
        };
        assert!(conf.check("r").is_err());

        let conf = PathConf {
            source: "redirect".to_string(),
            source_redirect: "rtsp://other/cam".to_string(),
            ..Default::default()
        };
        assert!(conf.check("r").is_ok());
    }

    #[test]
    fn credentials_must_come_in_pairs() {
        let conf = PathConf {
            read_user: "u".to_string(),
            ..Default::default()
        };
        assert!(conf.check("cam").is_err());
    }
}

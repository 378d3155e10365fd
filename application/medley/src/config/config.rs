use {
    super::errors::ConfigError,
    baselib::auth::AuthMethod,
    indexmap::IndexMap,
    pathhub::conf::{PathConf, SourceKind},
    serde_derive::Deserialize,
    std::{fs, time::Duration},
};

fn default_log_level() -> String {
    "info".to_string()
}
fn default_read_timeout() -> String {
    "10s".to_string()
}
fn default_write_timeout() -> String {
    "10s".to_string()
}
fn default_read_buffer_count() -> usize {
    512
}
fn default_read_buffer_size() -> usize {
    2048
}
fn default_protocols() -> Vec<String> {
    vec![
        "udp".to_string(),
        "multicast".to_string(),
        "tcp".to_string(),
    ]
}
fn default_encryption() -> String {
    "no".to_string()
}
fn default_rtsp_address() -> String {
    ":8554".to_string()
}
fn default_rtsps_address() -> String {
    ":8555".to_string()
}
fn default_rtp_address() -> String {
    ":8000".to_string()
}
fn default_rtcp_address() -> String {
    ":8001".to_string()
}
fn default_multicast_ip_range() -> String {
    "224.1.0.0/16".to_string()
}
fn default_multicast_rtp_port() -> u16 {
    8002
}
fn default_multicast_rtcp_port() -> u16 {
    8003
}
fn default_auth_methods() -> Vec<String> {
    vec!["basic".to_string(), "digest".to_string()]
}
fn default_rtmp_address() -> String {
    ":1935".to_string()
}
fn default_hls_address() -> String {
    ":8888".to_string()
}
fn default_hls_variant() -> String {
    "mpegts".to_string()
}
fn default_hls_segment_count() -> usize {
    7
}
fn default_hls_segment_duration() -> String {
    "1s".to_string()
}
fn default_hls_part_duration() -> String {
    "200ms".to_string()
}
fn default_hls_allow_origin() -> String {
    "*".to_string()
}
fn default_api_address() -> String {
    ":9997".to_string()
}
fn default_true() -> bool {
    true
}

/// Whole configuration surface. Unknown keys (metrics, pprof and the
/// other out-of-scope collaborators) are accepted and ignored so existing
/// configuration files keep loading.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub log_level: String,
    pub log_destinations: Vec<String>,

    pub read_timeout: String,
    pub write_timeout: String,
    pub read_buffer_count: usize,
    pub read_buffer_size: usize,

    pub rtsp_disable: bool,
    pub protocols: Vec<String>,
    pub encryption: String,
    pub rtsp_address: String,
    pub rtsps_address: String,
    pub rtp_address: String,
    pub rtcp_address: String,
    pub multicast_i_p_range: String,
    #[serde(rename = "multicastRTPPort")]
    pub multicast_rtp_port: u16,
    #[serde(rename = "multicastRTCPPort")]
    pub multicast_rtcp_port: u16,
    pub server_key: String,
    pub server_cert: String,
    pub auth_methods: Vec<String>,

    pub rtmp_disable: bool,
    pub rtmp_address: String,

    pub hls_disable: bool,
    pub hls_address: String,
    pub hls_variant: String,
    pub hls_always_remux: bool,
    pub hls_segment_count: usize,
    pub hls_segment_duration: String,
    pub hls_part_duration: String,
    pub hls_allow_origin: String,

    pub api: bool,
    pub api_address: String,

    pub external_authentication_u_r_l: String,

    pub paths: IndexMap<String, PathConf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_destinations: vec!["stdout".to_string()],
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            read_buffer_count: default_read_buffer_count(),
            read_buffer_size: default_read_buffer_size(),
            rtsp_disable: false,
            protocols: default_protocols(),
            encryption: default_encryption(),
            rtsp_address: default_rtsp_address(),
            rtsps_address: default_rtsps_address(),
            rtp_address: default_rtp_address(),
            rtcp_address: default_rtcp_address(),
            multicast_i_p_range: default_multicast_ip_range(),
            multicast_rtp_port: default_multicast_rtp_port(),
            multicast_rtcp_port: default_multicast_rtcp_port(),
            server_key: String::new(),
            server_cert: String::new(),
            auth_methods: default_auth_methods(),
            rtmp_disable: false,
            rtmp_address: default_rtmp_address(),
            hls_disable: false,
            hls_address: default_hls_address(),
            hls_variant: default_hls_variant(),
            hls_always_remux: false,
            hls_segment_count: default_hls_segment_count(),
            hls_segment_duration: default_hls_segment_duration(),
            hls_part_duration: default_hls_part_duration(),
            hls_allow_origin: default_hls_allow_origin(),
            api: default_true(),
            api_address: default_api_address(),
            external_authentication_u_r_l: String::new(),
            paths: IndexMap::new(),
        }
    }
}

pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    let (number, unit) = match value.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let number: f64 = number
        .parse()
        .map_err(|_| ConfigError::invalid(format!("invalid duration '{value}'")))?;
    let secs = match unit {
        "ms" => number / 1000.0,
        "s" | "" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(ConfigError::invalid(format!("invalid duration '{value}'"))),
    };
    Ok(Duration::from_secs_f64(secs))
}

/// `:8554` or `host:8554` → a bindable address string.
pub fn normalize_address(value: &str) -> String {
    if let Some(port) = value.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        value.to_string()
    }
}

pub fn address_port(value: &str) -> Result<u16, ConfigError> {
    value
        .rsplit(':')
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| ConfigError::invalid(format!("invalid address '{value}'")))
}

impl Config {
    pub fn check(&self) -> Result<(), ConfigError> {
        match self.log_level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(ConfigError::invalid(format!("invalid logLevel '{other}'")))
            }
        }

        parse_duration(&self.read_timeout)?;
        parse_duration(&self.write_timeout)?;
        parse_duration(&self.hls_segment_duration)?;
        parse_duration(&self.hls_part_duration)?;

        if self.read_buffer_count == 0 || !self.read_buffer_count.is_power_of_two() {
            return Err(ConfigError::invalid(
                "readBufferCount must be a power of two".to_string(),
            ));
        }

        for protocol in &self.protocols {
            match protocol.as_str() {
                "udp" | "multicast" | "tcp" => {}
                other => {
                    return Err(ConfigError::invalid(format!(
                        "invalid protocol '{other}'"
                    )))
                }
            }
        }
        if self.protocols.is_empty() {
            return Err(ConfigError::invalid("no protocols enabled".to_string()));
        }

        match self.encryption.as_str() {
            "no" | "optional" | "strict" => {}
            other => {
                return Err(ConfigError::invalid(format!(
                    "invalid encryption '{other}'"
                )))
            }
        }
        if self.encryption != "no" && (self.server_cert.is_empty() || self.server_key.is_empty())
        {
            return Err(ConfigError::invalid(
                "encryption requires serverCert and serverKey".to_string(),
            ));
        }
        if self.encryption == "strict" && self.protocols.iter().any(|p| p != "tcp") {
            return Err(ConfigError::invalid(
                "strict encryption supports only the tcp protocol".to_string(),
            ));
        }

        for method in &self.auth_methods {
            match method.as_str() {
                "basic" | "digest" => {}
                other => {
                    return Err(ConfigError::invalid(format!(
                        "invalid authMethod '{other}'"
                    )))
                }
            }
        }

        match self.hls_variant.as_str() {
            "mpegts" | "lowLatency" => {}
            other => {
                return Err(ConfigError::invalid(format!(
                    "invalid hlsVariant '{other}'"
                )))
            }
        }

        for (name, path_conf) in &self.paths {
            path_conf
                .check(name)
                .map_err(|err| ConfigError::invalid(err.to_string()))?;

            if path_conf.source_kind() == Some(SourceKind::RpiCamera) {
                return Err(ConfigError::invalid(format!(
                    "path '{name}': 'rpiCamera' sources are supported on Raspberry Pi only"
                )));
            }

            if !self.external_authentication_u_r_l.is_empty()
                && (!path_conf.read_user.is_empty() || !path_conf.publish_user.is_empty())
            {
                return Err(ConfigError::invalid(format!(
                    "path '{name}': credentials can't be used with 'externalAuthenticationURL'"
                )));
            }
        }

        Ok(())
    }

    pub fn auth_methods_parsed(&self) -> Vec<AuthMethod> {
        self.auth_methods
            .iter()
            .filter_map(|m| match m.as_str() {
                "basic" => Some(AuthMethod::Basic),
                "digest" => Some(AuthMethod::Digest),
                _ => None,
            })
            .collect()
    }
}

pub fn load(path: &str) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)
        .map_err(|err| ConfigError {
            value: super::errors::ConfigErrorValue::Parse(err.to_string()),
        })?;
    config.check()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = Config::default();
        config.check().unwrap();
        assert_eq!(config.rtsp_address, ":8554");
        assert_eq!(config.rtmp_address, ":1935");
        assert_eq!(config.hls_address, ":8888");
        assert_eq!(config.api_address, ":9997");
    }

    #[test]
    fn toml_round_trip() {
        let text = r#"
logLevel = "debug"
protocols = ["tcp"]
hlsSegmentCount = 3
hlsSegmentDuration = "4s"

[paths.cam]
source = "publisher"
readUser = "u"
readPass = "p"

[paths.proxied]
source = "rtsp://camera.local/stream"
sourceOnDemand = true
sourceOnDemandStartTimeout = "2s"

[paths."~^live/(.+)$"]
runOnReady = "echo $G1"
"#;
        let config: Config = toml::from_str(text).unwrap();
        config.check().unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.hls_segment_count, 3);
        assert_eq!(config.paths.len(), 3);
        assert!(config.paths.contains_key("~^live/(.+)$"));
        // configuration order is preserved for regexp tie-breaking
        let names: Vec<&String> = config.paths.keys().collect();
        assert_eq!(names, ["cam", "proxied", "~^live/(.+)$"]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::default();
        config.log_level = "noisy".to_string();
        assert!(config.check().is_err());

        let mut config = Config::default();
        config.encryption = "strict".to_string();
        assert!(config.check().is_err()); // missing cert/key

        let mut config = Config::default();
        config.read_buffer_count = 100;
        assert!(config.check().is_err());

        let mut config = Config::default();
        config.paths.insert(
            "bad name".to_string(),
            PathConf::default(),
        );
        assert!(config.check().is_err());
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("nope").is_err());
    }

    #[test]
    fn address_helpers() {
        assert_eq!(normalize_address(":8554"), "0.0.0.0:8554");
        assert_eq!(normalize_address("127.0.0.1:8554"), "127.0.0.1:8554");
        assert_eq!(address_port(":8554").unwrap(), 8554);
    }
}

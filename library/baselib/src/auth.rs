use {
    crate::errors::{AuthError, AuthErrorValue},
    rand::Rng,
    serde_derive::Serialize,
    sha2::{Digest, Sha256},
    std::net::IpAddr,
    std::time::Duration,
};

/// Delay applied before closing a connection that presented wrong
/// credentials, to slow down brute forcing.
pub const CRITICAL_FAIL_STALL: Duration = Duration::from_secs(2);

/// A configured password. Either a literal, or `sha256:` followed by the
/// standard-base64 SHA-256 digest of the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: &str) -> Self {
        Self(value.to_string())
    }

    pub fn is_hashed(&self) -> bool {
        self.0.starts_with("sha256:")
    }

    pub fn check(&self, presented: &str) -> bool {
        if let Some(digest) = self.0.strip_prefix("sha256:") {
            let computed = base64::encode(Sha256::digest(presented.as_bytes()));
            return computed == digest;
        }
        self.0 == presented
    }

    /// Plaintext value, only available for non-hashed credentials. Digest
    /// authentication needs it to compute HA1.
    pub fn plain(&self) -> Option<&str> {
        if self.is_hashed() {
            None
        } else {
            Some(&self.0)
        }
    }
}

/// An IP or CIDR entry of a per-path allow-list.
#[derive(Debug, Clone)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let invalid = || AuthError {
            value: AuthErrorValue::InvalidIpNetwork(value.to_string()),
        };

        let (addr_str, prefix_str) = match value.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (value, None),
        };

        let addr: IpAddr = addr_str.parse().map_err(|_| invalid())?;
        let max_prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let prefix = match prefix_str {
            Some(p) => {
                let p: u8 = p.parse().map_err(|_| invalid())?;
                if p > max_prefix {
                    return Err(invalid());
                }
                p
            }
            None => max_prefix,
        };

        Ok(Self { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = 32 - self.prefix as u32;
                let mask = if bits >= 32 { 0 } else { u32::MAX << bits };
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = 128 - self.prefix as u32;
                let mask = if bits >= 128 { 0 } else { u128::MAX << bits };
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

pub fn parse_ip_list(values: &[String]) -> Result<Vec<IpNetwork>, AuthError> {
    values.iter().map(|v| IpNetwork::parse(v)).collect()
}

/// Credentials presented by a client, normalized across protocols.
#[derive(Debug, Clone)]
pub enum PresentedCredentials {
    None,
    /// RTSP/HTTP Basic, already decoded.
    Plain { user: String, pass: String },
    /// RTSP Digest response.
    Digest {
        user: String,
        realm: String,
        nonce: String,
        uri: String,
        response: String,
    },
}

/// Parse an RTSP/HTTP `Authorization` header value.
pub fn parse_authorization(value: &str) -> PresentedCredentials {
    if let Some(encoded) = value.strip_prefix("Basic ") {
        if let Ok(decoded) = base64::decode(encoded.trim()) {
            if let Ok(text) = String::from_utf8(decoded) {
                if let Some((user, pass)) = text.split_once(':') {
                    return PresentedCredentials::Plain {
                        user: user.to_string(),
                        pass: pass.to_string(),
                    };
                }
            }
        }
        return PresentedCredentials::None;
    }

    if let Some(fields) = value.strip_prefix("Digest ") {
        let mut user = None;
        let mut realm = None;
        let mut nonce = None;
        let mut uri = None;
        let mut response = None;

        for field in fields.split(',') {
            if let Some((k, v)) = field.trim().split_once('=') {
                let v = v.trim_matches('"').to_string();
                match k {
                    "username" => user = Some(v),
                    "realm" => realm = Some(v),
                    "nonce" => nonce = Some(v),
                    "uri" => uri = Some(v),
                    "response" => response = Some(v),
                    _ => {}
                }
            }
        }

        if let (Some(user), Some(realm), Some(nonce), Some(uri), Some(response)) =
            (user, realm, nonce, uri, response)
        {
            return PresentedCredentials::Digest {
                user,
                realm,
                nonce,
                uri,
                response,
            };
        }
    }

    PresentedCredentials::None
}

/// Extract `?user=&pass=` credentials from a query string (RTMP and HLS).
pub fn query_credentials(query: &str) -> PresentedCredentials {
    let mut user = None;
    let mut pass = None;
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            match k {
                "user" => user = Some(v.to_string()),
                "pass" => pass = Some(v.to_string()),
                _ => {}
            }
        }
    }
    match (user, pass) {
        (Some(user), Some(pass)) => PresentedCredentials::Plain { user, pass },
        _ => PresentedCredentials::None,
    }
}

fn md5_hex(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

/// Per-side (read or publish) authentication rules of one path.
#[derive(Debug, Clone, Default)]
pub struct PathAuth {
    pub user: Option<Credential>,
    pub pass: Option<Credential>,
    pub ips: Vec<IpNetwork>,
}

impl PathAuth {
    pub fn is_configured(&self) -> bool {
        self.user.is_some() || self.pass.is_some() || !self.ips.is_empty()
    }

    /// Run the two-tier gate: IP allow-list first, then credentials.
    ///
    /// `method` and the Digest `uri` only matter for Digest responses; other
    /// callers pass empty strings.
    pub fn validate(
        &self,
        peer_ip: IpAddr,
        presented: &PresentedCredentials,
        method: &str,
    ) -> Result<(), AuthError> {
        if !self.ips.is_empty() && !self.ips.iter().any(|n| n.contains(peer_ip)) {
            return Err(AuthError {
                value: AuthErrorValue::IpNotAllowed(peer_ip.to_string()),
            });
        }

        if self.user.is_none() && self.pass.is_none() {
            return Ok(());
        }

        match presented {
            PresentedCredentials::None => Err(AuthError {
                value: AuthErrorValue::MissingCredentials,
            }),
            PresentedCredentials::Plain { user, pass } => {
                let user_ok = match &self.user {
                    Some(expected) => expected.check(user),
                    None => true,
                };
                let pass_ok = match &self.pass {
                    Some(expected) => expected.check(pass),
                    None => true,
                };
                if user_ok && pass_ok {
                    Ok(())
                } else {
                    Err(AuthError {
                        value: AuthErrorValue::WrongCredentials,
                    })
                }
            }
            PresentedCredentials::Digest {
                user,
                realm,
                nonce,
                uri,
                response,
            } => {
                // hashed credentials cannot feed HA1; those paths accept
                // basic only
                let (expected_user, expected_pass) = match (&self.user, &self.pass) {
                    (Some(u), Some(p)) => match (u.plain(), p.plain()) {
                        (Some(u), Some(p)) => (u, p),
                        _ => {
                            return Err(AuthError {
                                value: AuthErrorValue::WrongCredentials,
                            })
                        }
                    },
                    _ => {
                        return Err(AuthError {
                            value: AuthErrorValue::WrongCredentials,
                        })
                    }
                };

                if user != expected_user {
                    return Err(AuthError {
                        value: AuthErrorValue::WrongCredentials,
                    });
                }

                let ha1 = md5_hex(&format!("{expected_user}:{realm}:{expected_pass}"));
                let ha2 = md5_hex(&format!("{method}:{uri}"));
                let expected = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));

                if *response == expected {
                    Ok(())
                } else {
                    Err(AuthError {
                        value: AuthErrorValue::WrongCredentials,
                    })
                }
            }
        }
    }
}

/// Which challenge schemes a server advertises in WWW-Authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
    Digest,
}

/// Challenge state of one session; the nonce survives across the 401
/// round-trip so the digest response can be verified against it.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
}

impl Challenge {
    pub fn new(realm: &str) -> Self {
        let mut rng = rand::thread_rng();
        let nonce: String = (0..32)
            .map(|_| {
                let v: u8 = rng.gen_range(0..16);
                char::from_digit(v as u32, 16).unwrap()
            })
            .collect();
        Self {
            realm: realm.to_string(),
            nonce,
        }
    }

    pub fn header_values(&self, methods: &[AuthMethod]) -> Vec<String> {
        methods
            .iter()
            .map(|m| match m {
                AuthMethod::Basic => format!("Basic realm=\"{}\"", self.realm),
                AuthMethod::Digest => {
                    format!("Digest realm=\"{}\", nonce=\"{}\"", self.realm, self.nonce)
                }
            })
            .collect()
    }

    /// Reject digest responses that were not computed against this
    /// session's nonce.
    pub fn matches(&self, presented: &PresentedCredentials) -> bool {
        match presented {
            PresentedCredentials::Digest { nonce, .. } => *nonce == self.nonce,
            _ => true,
        }
    }
}

#[derive(Serialize)]
struct ExternalAuthRequest<'a> {
    ip: String,
    user: &'a str,
    password: &'a str,
    path: &'a str,
    action: &'a str,
    query: &'a str,
}

/// Forwarder to the optional external HTTP authentication hook. Any non-2xx
/// answer rejects the client.
pub struct ExternalAuth {
    url: String,
    client: reqwest::Client,
}

impl ExternalAuth {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn validate(
        &self,
        ip: IpAddr,
        user: &str,
        password: &str,
        path: &str,
        action: &str,
        query: &str,
    ) -> Result<(), AuthError> {
        let body = ExternalAuthRequest {
            ip: ip.to_string(),
            user,
            password,
            path,
            action,
            query,
        };

        let res = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| AuthError {
                value: AuthErrorValue::External(err.to_string()),
            })?;

        if !res.status().is_success() {
            return Err(AuthError {
                value: AuthErrorValue::External(format!("server returned {}", res.status())),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_auth(user: &str, pass: &str) -> PathAuth {
        PathAuth {
            user: Some(Credential::new(user)),
            pass: Some(Credential::new(pass)),
            ips: Vec::new(),
        }
    }

    #[test]
    fn literal_password_check() {
        let cred = Credential::new("testpass");
        assert!(cred.check("testpass"));
        assert!(!cred.check("testpass2"));
    }

    #[test]
    fn sha256_password_check() {
        // base64(sha256("testpass"))
        let cred = Credential::new("sha256:E9JJ8stBJ7QM+nV4ZoUCeHk/gU3tPFh/5YieiJp6n2w=");
        assert!(cred.is_hashed());
        assert!(cred.check("testpass"));
        assert!(!cred.check("wrong"));
        assert_eq!(cred.plain(), None);
    }

    #[test]
    fn ip_list_with_cidr() {
        let nets = parse_ip_list(&[
            "127.0.0.1".to_string(),
            "192.168.0.0/16".to_string(),
        ])
        .unwrap();
        assert!(nets.iter().any(|n| n.contains("127.0.0.1".parse().unwrap())));
        assert!(nets.iter().any(|n| n.contains("192.168.3.4".parse().unwrap())));
        assert!(!nets.iter().any(|n| n.contains("10.0.0.1".parse().unwrap())));

        assert!(IpNetwork::parse("not-an-ip").is_err());
        assert!(IpNetwork::parse("10.0.0.0/33").is_err());
    }

    #[test]
    fn missing_credentials_are_not_critical() {
        let auth = path_auth("u", "p");
        let err = auth
            .validate(
                "127.0.0.1".parse().unwrap(),
                &PresentedCredentials::None,
                "DESCRIBE",
            )
            .unwrap_err();
        assert!(!err.is_critical());
    }

    #[test]
    fn wrong_credentials_are_critical() {
        let auth = path_auth("u", "p");
        let err = auth
            .validate(
                "127.0.0.1".parse().unwrap(),
                &PresentedCredentials::Plain {
                    user: "u".to_string(),
                    pass: "wrong".to_string(),
                },
                "DESCRIBE",
            )
            .unwrap_err();
        assert!(err.is_critical());
    }

    #[test]
    fn denied_ip_is_critical() {
        let auth = PathAuth {
            user: None,
            pass: None,
            ips: parse_ip_list(&["10.0.0.0/8".to_string()]).unwrap(),
        };
        let err = auth
            .validate(
                "192.168.1.1".parse().unwrap(),
                &PresentedCredentials::None,
                "DESCRIBE",
            )
            .unwrap_err();
        assert!(err.is_critical());

        assert!(auth
            .validate(
                "10.1.2.3".parse().unwrap(),
                &PresentedCredentials::None,
                "DESCRIBE",
            )
            .is_ok());
    }

    #[test]
    fn digest_round_trip() {
        let auth = path_auth("user", "pass");
        let challenge = Challenge::new("medley");

        let uri = "rtsp://127.0.0.1:8554/cam";
        let ha1 = md5_hex(&format!("user:{}:pass", challenge.realm));
        let ha2 = md5_hex(&format!("DESCRIBE:{uri}"));
        let response = md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2));

        let presented = PresentedCredentials::Digest {
            user: "user".to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response,
        };

        assert!(challenge.matches(&presented));
        assert!(auth
            .validate("127.0.0.1".parse().unwrap(), &presented, "DESCRIBE")
            .is_ok());

        let wrong = PresentedCredentials::Digest {
            user: "user".to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response: "0".repeat(32),
        };
        assert!(auth
            .validate("127.0.0.1".parse().unwrap(), &wrong, "DESCRIBE")
            .is_err());
    }

    #[test]
    fn authorization_header_parsing() {
        let basic = parse_authorization(&format!("Basic {}", base64::encode("myuser:mypass")));
        match basic {
            PresentedCredentials::Plain { user, pass } => {
                assert_eq!(user, "myuser");
                assert_eq!(pass, "mypass");
            }
            other => panic!("unexpected: {other:?}"),
        }

        let digest = parse_authorization(
            "Digest username=\"u\", realm=\"r\", nonce=\"n\", \
             uri=\"rtsp://h/p\", response=\"abc\"",
        );
        match digest {
            PresentedCredentials::Digest { user, nonce, .. } => {
                assert_eq!(user, "u");
                assert_eq!(nonce, "n");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn query_credentials_parsing() {
        match query_credentials("user=u&pass=p&other=1") {
            PresentedCredentials::Plain { user, pass } => {
                assert_eq!(user, "u");
                assert_eq!(pass, "p");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            query_credentials("user=u"),
            PresentedCredentials::None
        ));
    }
}

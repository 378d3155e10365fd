use indexmap::IndexMap;
use std::fmt;

/// Text-protocol decode, shared by the RTSP session layer and tests.
pub trait Unmarshal {
    fn unmarshal(data: &str) -> Option<Self>
    where
        Self: Sized;
}

pub trait Marshal {
    fn marshal(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scheme {
    #[default]
    Rtsp,
    Rtsps,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Scheme::Rtsp => write!(f, "rtsp"),
            Scheme::Rtsps => write!(f, "rtsps"),
        }
    }
}

/// `scheme://host[:port]/path[?query]` as used on RTSP request lines.
#[derive(Debug, Clone, Default)]
pub struct Url {
    pub scheme: Scheme,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
}

impl Url {
    pub fn query_pairs(&self) -> IndexMap<String, String> {
        let mut pairs = IndexMap::new();
        if let Some(query) = &self.query {
            for pair in query.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    pairs.insert(k.to_string(), v.to_string());
                }
            }
        }
        pairs
    }
}

impl Unmarshal for Url {
    fn unmarshal(data: &str) -> Option<Self> {
        let mut url = Url::default();

        let rest = if let Some(rest) = data.strip_prefix("rtsp://") {
            url.scheme = Scheme::Rtsp;
            rest
        } else if let Some(rest) = data.strip_prefix("rtsps://") {
            url.scheme = Scheme::Rtsps;
            rest
        } else {
            return None;
        };

        let (authority, path_and_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };

        match authority.split_once(':') {
            Some((host, port)) => {
                url.host = host.to_string();
                url.port = port.parse().ok();
            }
            None => url.host = authority.to_string(),
        }

        match path_and_query.split_once('?') {
            Some((path, query)) => {
                url.path = path.to_string();
                url.query = Some(query.to_string());
            }
            None => url.path = path_and_query.to_string(),
        }

        Some(url)
    }
}

impl Marshal for Url {
    fn marshal(&self) -> String {
        let authority = match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        };
        let mut out = format!("{}://{}/{}", self.scheme, authority, self.path);
        if let Some(query) = &self.query {
            out.push('?');
            out.push_str(query);
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub version: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<String>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&String> {
        self.headers.get(name)
    }
}

impl Unmarshal for Request {
    fn unmarshal(data: &str) -> Option<Self> {
        let header_end = data.find("\r\n\r\n")?;
        let mut req = Request::default();

        let mut lines = data[..header_end].lines();

        let first = lines.next()?;
        let mut fields = first.split_ascii_whitespace();
        req.method = fields.next()?.to_string();
        req.url = Url::unmarshal(fields.next()?)?;
        req.version = fields.next().unwrap_or("RTSP/1.0").to_string();

        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                req.headers
                    .insert(name.trim().to_string(), value.trim().to_string());
            }
        }

        let body_start = header_end + 4;
        if data.len() > body_start {
            req.body = Some(data[body_start..].to_string());
        }

        Some(req)
    }
}

impl Marshal for Request {
    fn marshal(&self) -> String {
        let mut out = format!("{} {} {}\r\n", self.method, self.url.marshal(), self.version);
        for (name, value) in &self.headers {
            if name == "Content-Length" {
                continue;
            }
            out += &format!("{name}: {value}\r\n");
        }
        if let Some(body) = &self.body {
            out += &format!("Content-Length: {}\r\n", body.len());
        }
        out += "\r\n";
        if let Some(body) = &self.body {
            out += body;
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: IndexMap<String, String>,
    pub body: Option<String>,
}

impl Unmarshal for Response {
    fn unmarshal(data: &str) -> Option<Self> {
        let header_end = data.find("\r\n\r\n")?;
        let mut res = Response::default();

        let mut lines = data[..header_end].lines();

        let first = lines.next()?;
        let mut fields = first.split_ascii_whitespace();
        res.version = fields.next()?.to_string();
        res.status_code = fields.next()?.parse().ok()?;
        res.reason_phrase = fields.collect::<Vec<&str>>().join(" ");

        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                res.headers
                    .insert(name.trim().to_string(), value.trim().to_string());
            }
        }

        let body_start = header_end + 4;
        if data.len() > body_start {
            res.body = Some(data[body_start..].to_string());
        }

        Some(res)
    }
}

impl Marshal for Response {
    fn marshal(&self) -> String {
        let mut out = format!(
            "{} {} {}\r\n",
            self.version, self.status_code, self.reason_phrase
        );
        for (name, value) in &self.headers {
            if name == "Content-Length" {
                continue;
            }
            out += &format!("{name}: {value}\r\n");
        }
        if let Some(body) = &self.body {
            out += &format!("Content-Length: {}\r\n", body.len());
        }
        out += "\r\n";
        if let Some(body) = &self.body {
            out += body;
        }
        out
    }
}

/// Scan the Content-Length of a partially received message so the session
/// knows how many more bytes to wait for.
pub fn content_length(data: &str) -> Option<usize> {
    for line in data.lines() {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_round_trip() {
        let url = Url::unmarshal("rtsp://127.0.0.1:8554/live/cam?user=u&pass=p").unwrap();
        assert_eq!(url.scheme, Scheme::Rtsp);
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, Some(8554));
        assert_eq!(url.path, "live/cam");
        assert_eq!(url.query.as_deref(), Some("user=u&pass=p"));
        assert_eq!(url.query_pairs().get("pass").unwrap(), "p");
        assert_eq!(
            url.marshal(),
            "rtsp://127.0.0.1:8554/live/cam?user=u&pass=p"
        );
    }

    #[test]
    fn rtsps_scheme() {
        let url = Url::unmarshal("rtsps://host:8555/cam").unwrap();
        assert_eq!(url.scheme, Scheme::Rtsps);
        assert_eq!(url.port, Some(8555));
    }

    #[test]
    fn request_round_trip() {
        let data = "SETUP rtsp://127.0.0.1/stream/trackID=0 RTSP/1.0\r\n\
            Transport: RTP/AVP/TCP;unicast;interleaved=0-1;mode=record\r\n\
            CSeq: 3\r\n\
            User-Agent: Lavf58.76.100\r\n\
            \r\n";

        let req = Request::unmarshal(data).unwrap();
        assert_eq!(req.method, "SETUP");
        assert_eq!(req.header("CSeq").unwrap(), "3");
        assert_eq!(req.marshal(), data);
    }

    #[test]
    fn request_with_body() {
        let body = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n";
        let data = format!(
            "ANNOUNCE rtsp://127.0.0.1/stream RTSP/1.0\r\n\
             Content-Type: application/sdp\r\n\
             CSeq: 2\r\n\
             Content-Length: {}\r\n\
             \r\n\
             {}",
            body.len(),
            body
        );

        let req = Request::unmarshal(&data).unwrap();
        assert_eq!(req.body.as_deref(), Some(body));
        assert_eq!(req.marshal(), data);
    }

    #[test]
    fn response_round_trip() {
        let data = "RTSP/1.0 401 Unauthorized\r\n\
            CSeq: 1\r\n\
            WWW-Authenticate: Basic realm=\"medley\"\r\n\
            \r\n";
        let res = Response::unmarshal(data).unwrap();
        assert_eq!(res.status_code, 401);
        assert_eq!(res.reason_phrase, "Unauthorized");
        assert_eq!(res.marshal(), data);
    }

    #[test]
    fn content_length_scan() {
        assert_eq!(
            content_length("DESCRIBE x RTSP/1.0\r\nContent-Length: 42\r\n"),
            Some(42)
        );
        assert_eq!(content_length("OPTIONS x RTSP/1.0\r\n"), None);
    }
}

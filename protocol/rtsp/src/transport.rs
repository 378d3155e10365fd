use std::net::IpAddr;

/// Lower transport negotiated by SETUP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Tcp,
    Udp,
    Multicast,
}

/// Parsed/rendered `Transport:` header.
#[derive(Debug, Clone, Default)]
pub struct TransportHeader {
    pub tcp: bool,
    pub multicast: bool,
    pub interleaved: Option<(u8, u8)>,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    /// Multicast port pair (`port=` parameter).
    pub port: Option<(u16, u16)>,
    pub destination: Option<IpAddr>,
    pub ttl: Option<u8>,
    /// mode=record marks publisher setups.
    pub record: bool,
}

impl TransportHeader {
    pub fn cast_kind(&self) -> CastKind {
        if self.tcp {
            CastKind::Tcp
        } else if self.multicast {
            CastKind::Multicast
        } else {
            CastKind::Udp
        }
    }

    pub fn unmarshal(value: &str) -> Option<Self> {
        let mut th = TransportHeader::default();
        let mut parts = value.split(';');

        let profile = parts.next()?.trim();
        match profile {
            "RTP/AVP" | "RTP/AVP/UDP" => {}
            "RTP/AVP/TCP" => th.tcp = true,
            _ => return None,
        }

        let parse_pair = |v: &str| -> Option<(u16, u16)> {
            let (a, b) = v.split_once('-')?;
            Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
        };

        for part in parts {
            let part = part.trim();
            if part == "multicast" {
                th.multicast = true;
            } else if let Some(v) = part.strip_prefix("interleaved=") {
                let (a, b) = parse_pair(v)?;
                th.interleaved = Some((a as u8, b as u8));
            } else if let Some(v) = part.strip_prefix("client_port=") {
                th.client_port = Some(parse_pair(v)?);
            } else if let Some(v) = part.strip_prefix("server_port=") {
                th.server_port = Some(parse_pair(v)?);
            } else if let Some(v) = part.strip_prefix("port=") {
                th.port = Some(parse_pair(v)?);
            } else if let Some(v) = part.strip_prefix("destination=") {
                th.destination = v.parse().ok();
            } else if let Some(v) = part.strip_prefix("ttl=") {
                th.ttl = v.parse().ok();
            } else if let Some(v) = part.strip_prefix("mode=") {
                th.record = v.eq_ignore_ascii_case("record") || v == "\"RECORD\"";
            }
        }

        Some(th)
    }

    pub fn marshal(&self) -> String {
        let mut out = String::new();
        if self.tcp {
            out += "RTP/AVP/TCP";
        } else {
            out += "RTP/AVP";
        }
        if self.multicast {
            out += ";multicast";
        } else {
            out += ";unicast";
        }
        if let Some(dest) = self.destination {
            out += &format!(";destination={dest}");
        }
        if let Some(ttl) = self.ttl {
            out += &format!(";ttl={ttl}");
        }
        if let Some((a, b)) = self.interleaved {
            out += &format!(";interleaved={a}-{b}");
        }
        if let Some((a, b)) = self.client_port {
            out += &format!(";client_port={a}-{b}");
        }
        if let Some((a, b)) = self.server_port {
            out += &format!(";server_port={a}-{b}");
        }
        if let Some((a, b)) = self.port {
            out += &format!(";port={a}-{b}");
        }
        if self.record {
            out += ";mode=record";
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_interleaved_record() {
        let th =
            TransportHeader::unmarshal("RTP/AVP/TCP;unicast;interleaved=0-1;mode=record").unwrap();
        assert!(th.tcp);
        assert!(th.record);
        assert_eq!(th.interleaved, Some((0, 1)));
        assert_eq!(th.cast_kind(), CastKind::Tcp);
    }

    #[test]
    fn udp_client_ports() {
        let th = TransportHeader::unmarshal("RTP/AVP;unicast;client_port=35466-35467").unwrap();
        assert!(!th.tcp);
        assert_eq!(th.client_port, Some((35466, 35467)));
        assert_eq!(th.cast_kind(), CastKind::Udp);
    }

    #[test]
    fn multicast_request() {
        let th = TransportHeader::unmarshal("RTP/AVP;multicast").unwrap();
        assert_eq!(th.cast_kind(), CastKind::Multicast);
    }

    #[test]
    fn marshal_includes_server_ports() {
        let th = TransportHeader {
            client_port: Some((1000, 1001)),
            server_port: Some((8000, 8001)),
            ..Default::default()
        };
        assert_eq!(
            th.marshal(),
            "RTP/AVP;unicast;client_port=1000-1001;server_port=8000-8001"
        );
    }

    #[test]
    fn unknown_profile_is_rejected() {
        assert!(TransportHeader::unmarshal("RAW/RAW/UDP;unicast").is_none());
    }
}

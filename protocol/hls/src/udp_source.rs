use {
    crate::{errors::HlsError, ts_bridge::TsBridge},
    pathhub::{
        define::{StaticSourceContext, SOURCE_RETRY_PAUSE_SECS},
        path::PathHandle,
        utils::HandleId,
    },
    std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        time::Duration,
    },
    tokio::net::UdpSocket,
};

const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive an MPEG-TS stream over UDP (`udp://[group or local ip]:port`)
/// into the owning path. Multicast groups are joined on the wildcard
/// interface.
pub fn spawn(ctx: StaticSourceContext) {
    let StaticSourceContext {
        path,
        path_name,
        source_id,
        source_url,
        conf: _,
        mut stop,
    } = ctx;

    tokio::spawn(async move {
        loop {
            let result = tokio::select! {
                result = run_once(&path, &path_name, source_id, &source_url) => result,
                _ = stop.recv() => return,
            };

            path.source_set_not_ready(source_id).await;

            match result {
                Ok(()) => return,
                Err(err) => {
                    log::info!(
                        "[udp source {}] stopped: {}, retrying in {}s",
                        path_name,
                        err,
                        SOURCE_RETRY_PAUSE_SECS
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(SOURCE_RETRY_PAUSE_SECS)) => {}
                _ = stop.recv() => return,
            }
        }
    });
}

fn parse_udp_url(url: &str) -> Result<SocketAddr, HlsError> {
    let rest = url
        .strip_prefix("udp://")
        .ok_or_else(|| HlsError::upstream("invalid udp source url"))?;
    rest.parse()
        .map_err(|_| HlsError::upstream("invalid udp address"))
}

async fn run_once(
    path: &PathHandle,
    path_name: &str,
    source_id: HandleId,
    source_url: &str,
) -> Result<(), HlsError> {
    let addr = parse_udp_url(source_url)?;

    let socket = UdpSocket::bind(("0.0.0.0", addr.port())).await?;
    if let IpAddr::V4(ip) = addr.ip() {
        if ip.is_multicast() {
            socket.join_multicast_v4(ip, Ipv4Addr::UNSPECIFIED)?;
        }
    }
    log::info!("[udp source {}] listening on {}", path_name, addr);

    let mut bridge = TsBridge::new();
    let mut buf = vec![0u8; 65536];

    loop {
        let (len, _) = tokio::time::timeout(READ_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .map_err(|_| HlsError::upstream("no data received"))??;

        if bridge.push(&buf[..len], path, source_id).await? && bridge.is_ready() {
            log::info!("[udp source {}] ready", path_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_udp_url;

    #[test]
    fn udp_url_parsing() {
        let addr = parse_udp_url("udp://239.0.0.1:1234").unwrap();
        assert!(addr.ip().is_multicast());
        assert_eq!(addr.port(), 1234);
        assert!(parse_udp_url("rtp://1.2.3.4:5").is_err());
    }
}

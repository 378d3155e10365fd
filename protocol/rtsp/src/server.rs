use {
    crate::{
        errors::{SessionError, SessionErrorValue},
        session::RtspSession,
    },
    baselib::auth::AuthMethod,
    chrono::{DateTime, Local},
    pathhub::{define::StreamInput, manager::PathManagerHandle, stream::StreamHandle},
    rtp::RtpPacket,
    serde_derive::Serialize,
    serde_json::json,
    std::{
        collections::HashMap,
        net::{IpAddr, Ipv4Addr, SocketAddr},
        sync::Arc,
        time::Duration,
    },
    tokio::{
        net::{TcpListener, UdpSocket},
        sync::{mpsc, Mutex},
    },
};

/// Transports a client is allowed to negotiate.
#[derive(Debug, Clone, Copy)]
pub struct AllowedProtocols {
    pub udp: bool,
    pub multicast: bool,
    pub tcp: bool,
}

impl Default for AllowedProtocols {
    fn default() -> Self {
        Self {
            udp: true,
            multicast: true,
            tcp: true,
        }
    }
}

#[derive(Clone)]
pub struct RtspServerConfig {
    pub address: String,
    pub tls_address: Option<String>,
    pub server_cert: Option<String>,
    pub server_key: Option<String>,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub multicast_ip_range: String,
    pub multicast_rtp_port: u16,
    pub multicast_rtcp_port: u16,
    pub protocols: AllowedProtocols,
    pub auth_methods: Vec<AuthMethod>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for RtspServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8554".to_string(),
            tls_address: None,
            server_cert: None,
            server_key: None,
            rtp_port: 8000,
            rtcp_port: 8001,
            multicast_ip_range: "224.1.0.0/16".to_string(),
            multicast_rtp_port: 8002,
            multicast_rtcp_port: 8003,
            protocols: AllowedProtocols::default(),
            auth_methods: vec![AuthMethod::Basic, AuthMethod::Digest],
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiSessionState {
    Idle,
    Read,
    Publish,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSessionInfo {
    pub created: DateTime<Local>,
    pub remote_addr: String,
    pub state: ApiSessionState,
}

/// Where inbound packets on the shared UDP sockets are routed.
pub struct UdpSourceBinding {
    pub stream: StreamHandle,
    pub track_id: usize,
    pub is_rtcp: bool,
}

struct MulticastGroup {
    ip: Ipv4Addr,
    refcount: usize,
    stop_tx: mpsc::UnboundedSender<()>,
}

/// State shared between the listener, the UDP read loops and every
/// session task.
pub struct ServerShared {
    pub config: RtspServerConfig,
    pub sessions: Mutex<HashMap<String, ApiSessionInfo>>,
    pub udp_sources: Mutex<HashMap<SocketAddr, UdpSourceBinding>>,
    pub rtp_socket: Mutex<Option<Arc<UdpSocket>>>,
    multicast: Mutex<MulticastState>,
}

struct MulticastState {
    base: Ipv4Addr,
    count: u32,
    next: u32,
    groups: HashMap<String, MulticastGroup>,
}

fn parse_multicast_range(range: &str) -> (Ipv4Addr, u32) {
    let (base, prefix) = match range.split_once('/') {
        Some((b, p)) => (b, p.parse().unwrap_or(16u32)),
        None => (range, 32),
    };
    let base: Ipv4Addr = base.parse().unwrap_or(Ipv4Addr::new(224, 1, 0, 0));
    let count = if prefix >= 32 { 1 } else { 1u32 << (32 - prefix) };
    (base, count)
}

impl ServerShared {
    pub fn new(config: RtspServerConfig) -> Self {
        let (base, count) = parse_multicast_range(&config.multicast_ip_range);
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            udp_sources: Mutex::new(HashMap::new()),
            rtp_socket: Mutex::new(None),
            multicast: Mutex::new(MulticastState {
                base,
                count,
                next: 1,
                groups: HashMap::new(),
            }),
        }
    }

    pub async fn register_session(&self, id: &str, remote_addr: String) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(id) {
            return false;
        }
        sessions.insert(
            id.to_string(),
            ApiSessionInfo {
                created: Local::now(),
                remote_addr,
                state: ApiSessionState::Idle,
            },
        );
        true
    }

    pub async fn set_session_state(&self, id: &str, state: ApiSessionState) {
        if let Some(info) = self.sessions.lock().await.get_mut(id) {
            info.state = state;
        }
    }

    pub async fn unregister_session(&self, id: &str) {
        self.sessions.lock().await.remove(id);
    }

    pub async fn api_sessions_list(&self) -> serde_json::Value {
        let sessions = self.sessions.lock().await;
        let mut items = serde_json::Map::new();
        for (id, info) in sessions.iter() {
            if let Ok(value) = serde_json::to_value(info) {
                items.insert(id.clone(), value);
            }
        }
        json!({ "items": items })
    }

    /// One multicast group per path, refcounted by its readers. The first
    /// reader starts the writer task that relays the path's RTP onto the
    /// group.
    pub async fn multicast_acquire(
        &self,
        path_name: &str,
        stream: &StreamHandle,
    ) -> Result<Ipv4Addr, SessionError> {
        let mut state = self.multicast.lock().await;

        if let Some(group) = state.groups.get_mut(path_name) {
            group.refcount += 1;
            return Ok(group.ip);
        }

        if state.groups.len() as u32 >= state.count {
            return Err(SessionError {
                value: SessionErrorValue::MulticastExhausted,
            });
        }

        let offset = state.next % state.count.max(1);
        state.next = state.next.wrapping_add(1);
        let ip = Ipv4Addr::from(u32::from(state.base).wrapping_add(offset));

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        spawn_multicast_writer(
            stream.clone(),
            ip,
            self.config.multicast_rtp_port,
            stop_rx,
        )?;

        state.groups.insert(
            path_name.to_string(),
            MulticastGroup {
                ip,
                refcount: 1,
                stop_tx,
            },
        );
        Ok(ip)
    }

    pub async fn multicast_release(&self, path_name: &str) {
        let mut state = self.multicast.lock().await;
        let remove = if let Some(group) = state.groups.get_mut(path_name) {
            group.refcount = group.refcount.saturating_sub(1);
            if group.refcount == 0 {
                let _ = group.stop_tx.send(());
                true
            } else {
                false
            }
        } else {
            false
        };
        if remove {
            state.groups.remove(path_name);
        }
    }
}

fn spawn_multicast_writer(
    stream: StreamHandle,
    group: Ipv4Addr,
    rtp_port: u16,
    mut stop_rx: mpsc::UnboundedReceiver<()>,
) -> Result<(), SessionError> {
    let std_socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
    std_socket.set_multicast_ttl_v4(16)?;
    std_socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(std_socket)?;

    let (tx, mut rx) = stream.packet_channel();
    let (close_tx, mut close_rx) = pathhub::define::close_signal();
    let reader_id = pathhub::utils::new_handle_id();
    stream.reader_add(
        reader_id,
        pathhub::define::ReaderDataSender::Packet(tx),
        close_tx,
    );

    tokio::spawn(async move {
        let dest = SocketAddr::new(IpAddr::V4(group), rtp_port);
        loop {
            tokio::select! {
                pkt = rx.recv() => {
                    let Some(data) = pkt else {
                        break;
                    };
                    let bytes = data.packet.marshal();
                    if let Err(err) = socket.send_to(&bytes, dest).await {
                        log::error!("multicast send error: {}", err);
                        break;
                    }
                }
                _ = close_rx.recv() => break,
                _ = stop_rx.recv() => break,
            }
        }
        stream.reader_remove(reader_id);
    });

    Ok(())
}

/// RTSP/RTSPS listeners plus the shared RTP/RTCP UDP sockets.
pub struct RtspServer {
    hub: PathManagerHandle,
    pub shared: Arc<ServerShared>,
}

impl RtspServer {
    pub fn new(config: RtspServerConfig, hub: PathManagerHandle) -> Self {
        Self {
            hub,
            shared: Arc::new(ServerShared::new(config)),
        }
    }

    pub async fn run(&self) -> Result<(), SessionError> {
        let config = self.shared.config.clone();

        if config.protocols.udp {
            self.spawn_udp_loop(config.rtp_port, false).await?;
            self.spawn_udp_loop(config.rtcp_port, true).await?;
        }

        if let (Some(tls_address), Some(cert), Some(key)) = (
            config.tls_address.clone(),
            config.server_cert.clone(),
            config.server_key.clone(),
        ) {
            let acceptor = netio::net::tls_acceptor(&cert, &key)?;
            let listener = TcpListener::bind(&tls_address).await?;
            log::info!("RTSPS server listening on {}", tls_address);

            let shared = self.shared.clone();
            let hub = self.hub.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            let acceptor = acceptor.clone();
                            let shared = shared.clone();
                            let hub = hub.clone();
                            tokio::spawn(async move {
                                match netio::net::TlsIO::handshake(stream, acceptor).await {
                                    Ok(io) => {
                                        RtspSession::run_with_io(
                                            Box::new(io),
                                            peer,
                                            shared,
                                            hub,
                                        )
                                        .await;
                                    }
                                    Err(err) => {
                                        log::info!("tls handshake with {} failed: {}", peer, err);
                                    }
                                }
                            });
                        }
                        Err(err) => {
                            log::error!("rtsps accept error: {}", err);
                            break;
                        }
                    }
                }
            });
        }

        let listener = TcpListener::bind(&config.address).await?;
        log::info!("RTSP server listening on {}", config.address);

        loop {
            let (stream, peer) = listener.accept().await?;
            let shared = self.shared.clone();
            let hub = self.hub.clone();
            tokio::spawn(async move {
                let io = Box::new(netio::net::TcpIO::new(stream));
                RtspSession::run_with_io(io, peer, shared, hub).await;
            });
        }
    }

    /// Shared-socket read loop: packets are demultiplexed to publisher
    /// streams by `(peer ip, peer port)`.
    async fn spawn_udp_loop(&self, port: u16, is_rtcp: bool) -> Result<(), SessionError> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        log::info!(
            "{} UDP listener opened on 0.0.0.0:{}",
            if is_rtcp { "RTCP" } else { "RTP" },
            port
        );

        if !is_rtcp {
            *self.shared.rtp_socket.lock().await = Some(socket.clone());
        }

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(err) => {
                        log::error!("udp read error: {}", err);
                        break;
                    }
                };

                let sources = shared.udp_sources.lock().await;
                let Some(binding) = sources.get(&peer) else {
                    continue;
                };

                // a client sending RTP on the RTCP port (or vice versa) is
                // ignored, not rerouted
                if binding.is_rtcp != is_rtcp {
                    continue;
                }
                if is_rtcp {
                    continue;
                }

                match RtpPacket::unmarshal(&buf[..len]) {
                    Ok(packet) => {
                        binding.stream.write(StreamInput::Rtp {
                            track_id: binding.track_id,
                            packet,
                        });
                    }
                    Err(err) => {
                        log::debug!("invalid rtp from {}: {}", peer, err);
                    }
                }
            }
        });

        Ok(())
    }
}

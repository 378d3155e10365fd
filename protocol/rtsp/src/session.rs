use {
    crate::{
        errors::{SessionError, SessionErrorValue},
        sdp,
        server::{ApiSessionState, ServerShared, UdpSourceBinding},
        transport::{CastKind, TransportHeader},
    },
    baselib::{
        auth::{parse_authorization, Challenge, PresentedCredentials, CRITICAL_FAIL_STALL},
        http::{Marshal, Request, Response, Unmarshal},
    },
    bytes::BytesMut,
    http::StatusCode,
    netio::{cursor::ByteCursor, net::TNetIO, sink::AsyncByteSink},
    pathhub::{
        define::{
            close_signal, AccessContext, CloseReason, CloseSignalReceiver, CloseSignalSender,
            DescribeAnswer, HubEvent, PacketData, PublisherHandle, ReaderAttachment,
            ReaderDataSender, ReaderHandle, RequestUrl, SessionKind, StreamInput,
        },
        manager::PathManagerHandle,
        path::PathHandle,
        stream::StreamHandle,
        track::Track,
        utils::{new_handle_id, new_session_id, HandleId},
    },
    rtp::RtpPacket,
    std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration},
    tokio::sync::{oneshot, Mutex},
};

/// Keepalive window for sessions that are not expected to talk on the
/// control connection (UDP transports, TCP players between requests).
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

// RTSP-only status codes, absent from the generic HTTP set
const STATUS_METHOD_NOT_VALID: (u16, &str) = (455, "Method Not Valid in This State");
const STATUS_UNSUPPORTED_TRANSPORT: (u16, &str) = (461, "Unsupported Transport");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Initial,
    PrePlay,
    Play,
    PreRecord,
    Record,
}

/// Negotiated per-track transport.
struct TrackSetup {
    cast: CastKind,
    interleaved: (u8, u8),
    client_rtp: Option<SocketAddr>,
    client_rtcp: Option<SocketAddr>,
}

enum Role {
    None,
    Reader {
        attachment: ReaderAttachment,
    },
    Publisher {
        path: PathHandle,
        tracks: Vec<Track>,
        stream: Option<StreamHandle>,
    },
}

pub struct RtspSession {
    session_id: String,
    io: Arc<Mutex<Box<dyn TNetIO + Send + Sync>>>,
    cursor: ByteCursor,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
    hub: PathManagerHandle,

    state: SessionState,
    challenge: Challenge,
    handle_id: HandleId,
    close_tx: CloseSignalSender,
    close_rx: CloseSignalReceiver,
    path_name: String,
    role: Role,
    setups: HashMap<usize, TrackSetup>,
    multicast_joined: bool,
}

impl RtspSession {
    pub async fn run_with_io(
        io: Box<dyn TNetIO + Send + Sync>,
        peer: SocketAddr,
        shared: Arc<ServerShared>,
        hub: PathManagerHandle,
    ) {
        // 9-digit ids, regenerated on collision
        let mut session_id = new_session_id();
        while !shared.register_session(&session_id, peer.to_string()).await {
            session_id = new_session_id();
        }

        let (close_tx, close_rx) = close_signal();
        let mut session = RtspSession {
            session_id: session_id.clone(),
            io: Arc::new(Mutex::new(io)),
            cursor: ByteCursor::default(),
            peer,
            shared: shared.clone(),
            hub,
            state: SessionState::Initial,
            challenge: Challenge::new("medley"),
            handle_id: new_handle_id(),
            close_tx,
            close_rx,
            path_name: String::new(),
            role: Role::None,
            setups: HashMap::new(),
            multicast_joined: false,
        };

        log::info!("[rtsp session {}] opened from {}", session_id, peer);
        if let Err(err) = session.run().await {
            log::info!("[rtsp session {}] closed: {}", session_id, err);
        } else {
            log::info!("[rtsp session {}] closed", session_id);
        }

        session.release().await;
        shared.unregister_session(&session_id).await;
    }

    fn read_deadline(&self) -> Duration {
        match self.state {
            SessionState::Play | SessionState::Record => KEEPALIVE_TIMEOUT,
            _ => self.shared.config.read_timeout,
        }
    }

    async fn run(&mut self) -> Result<(), SessionError> {
        loop {
            match self.state {
                SessionState::Play => {
                    if self.play_loop().await? {
                        return Ok(());
                    }
                }
                _ => {
                    if self.control_loop().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Everything except Play: wait for requests (and, in Record,
    /// interleaved data) on the control connection.
    async fn control_loop(&mut self) -> Result<bool, SessionError> {
        loop {
            if let Some(done) = self.process_buffered().await? {
                return Ok(done);
            }
            if self.state == SessionState::Play {
                return Ok(false);
            }

            let deadline = self.read_deadline();
            let io = self.io.clone();
            tokio::select! {
                reason = self.close_rx.recv() => {
                    return Err(close_reason_error(reason));
                }
                data = async move {
                    io.lock().await.read_timeout(deadline).await
                } => {
                    self.cursor.feed(&data?);
                }
            }
        }
    }

    /// Drain whatever is parseable from the receive buffer. `Some(done)`
    /// means a request asked to end the session.
    async fn process_buffered(&mut self) -> Result<Option<bool>, SessionError> {
        loop {
            if self.cursor.is_empty() {
                return Ok(None);
            }

            if self.cursor.peek_u8().unwrap_or(0) == 0x24 {
                // interleaved frame: '$', channel, 16-bit length
                if self.cursor.len() < 4 {
                    return Ok(None);
                }
                let channel = self.cursor.peek_at(1).unwrap();
                let length = ((self.cursor.peek_at(2).unwrap() as usize) << 8)
                    | self.cursor.peek_at(3).unwrap() as usize;
                if self.cursor.len() < 4 + length {
                    return Ok(None);
                }
                self.cursor.skip(4).map_err(|_| {
                    SessionError::malformed("interleaved header vanished")
                })?;
                let payload = self.cursor.read_bytes(length).unwrap();
                self.on_interleaved(channel, payload);
                continue;
            }

            // a full RTSP message ends with CRLFCRLF plus Content-Length
            let text = match std::str::from_utf8(self.cursor.remaining()) {
                Ok(text) => text,
                Err(_) => return Err(SessionError::malformed("binary garbage on control")),
            };
            let Some(header_end) = text.find("\r\n\r\n") else {
                return Ok(None);
            };
            let body_len = baselib::http::content_length(&text[..header_end]).unwrap_or(0);
            let total = header_end + 4 + body_len;
            if self.cursor.len() < total {
                return Ok(None);
            }

            let message = self.cursor.read_bytes(total).unwrap();
            let message = std::str::from_utf8(&message)?.to_string();
            let Some(request) = Request::unmarshal(&message) else {
                return Err(SessionError::malformed("unparseable request"));
            };

            if self.on_request(&request).await? {
                return Ok(Some(true));
            }
        }
    }

    /// Reading side of a playing session plus its fan-out drain.
    async fn play_loop(&mut self) -> Result<bool, SessionError> {
        let Role::Reader { attachment } = &self.role else {
            return Err(SessionError {
                value: SessionErrorValue::InvalidState("PLAY".to_string()),
            });
        };
        let stream = attachment.stream.clone();
        let path = attachment.path.clone();

        let (tx, mut rx) = stream.packet_channel();
        let sender = ReaderDataSender::Packet(tx);
        path.reader_start(self.handle_id, sender)
            .await
            .map_err(SessionError::from)?;

        let rtp_socket = self.shared.rtp_socket.lock().await.clone();

        let result: Result<bool, SessionError> = loop {
            let io = self.io.clone();
            tokio::select! {
                pkt = rx.recv() => {
                    let Some(pkt) = pkt else {
                        break Err(SessionError {
                            value: SessionErrorValue::StreamGone,
                        });
                    };
                    if let Err(err) = self.write_packet(&pkt, rtp_socket.as_deref()).await {
                        break Err(err);
                    }
                }
                reason = self.close_rx.recv() => {
                    break Err(close_reason_error(reason));
                }
                data = async move {
                    io.lock().await.read_timeout(KEEPALIVE_TIMEOUT).await
                } => {
                    match data {
                        Ok(data) => {
                            self.cursor.feed(&data);
                            match self.process_buffered().await {
                                Ok(Some(done)) => break Ok(done),
                                Ok(None) => {
                                    if self.state != SessionState::Play {
                                        break Ok(false);
                                    }
                                }
                                Err(err) => break Err(err),
                            }
                        }
                        Err(err) => break Err(err.into()),
                    }
                }
            }
        };

        if self.state != SessionState::Play || result.is_err() {
            // leaving Play: detach from the fan-out
            path.reader_pause(self.handle_id).await;
        }

        result
    }

    async fn write_packet(
        &self,
        pkt: &PacketData,
        rtp_socket: Option<&tokio::net::UdpSocket>,
    ) -> Result<(), SessionError> {
        let Some(setup) = self.setups.get(&pkt.track_id) else {
            return Ok(());
        };

        match setup.cast {
            CastKind::Tcp => {
                let data = pkt.packet.marshal();
                let mut sink = AsyncByteSink::new(self.io.clone());
                sink.put_u8(0x24);
                sink.put_u8(setup.interleaved.0);
                sink.put_u16_be(data.len() as u16);
                sink.put(&data);
                sink.flush().await?;
            }
            CastKind::Udp => {
                if let (Some(socket), Some(addr)) = (rtp_socket, setup.client_rtp) {
                    let data = pkt.packet.marshal();
                    socket.send_to(&data, addr).await?;
                }
            }
            CastKind::Multicast => {
                // the shared per-path writer emits the packets; per-reader
                // copies are discarded
            }
        }
        Ok(())
    }

    fn on_interleaved(&mut self, channel: u8, payload: BytesMut) {
        if self.state != SessionState::Record {
            return;
        }
        let Role::Publisher {
            stream: Some(stream),
            ..
        } = &self.role
        else {
            return;
        };

        for (track_id, setup) in &self.setups {
            if setup.interleaved.0 == channel {
                match RtpPacket::unmarshal(&payload) {
                    Ok(packet) => stream.write(StreamInput::Rtp {
                        track_id: *track_id,
                        packet,
                    }),
                    Err(err) => log::debug!(
                        "[rtsp session {}] dropping malformed rtp: {}",
                        self.session_id,
                        err
                    ),
                }
                return;
            }
            if setup.interleaved.1 == channel {
                // inbound RTCP is accepted and ignored
                return;
            }
        }
    }

    // ---- request dispatch ----

    async fn on_request(&mut self, request: &Request) -> Result<bool, SessionError> {
        log::debug!(
            "[rtsp session {}] {} {}",
            self.session_id,
            request.method,
            request.url.marshal()
        );

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(request).await?,
            "DESCRIBE" => self.handle_describe(request).await?,
            "ANNOUNCE" => self.handle_announce(request).await?,
            "SETUP" => self.handle_setup(request).await?,
            "PLAY" => self.handle_play(request).await?,
            "RECORD" => self.handle_record(request).await?,
            "PAUSE" => self.handle_pause(request).await?,
            "GET_PARAMETER" | "SET_PARAMETER" => {
                let response = self.response(StatusCode::OK, request);
                self.send_response(&response).await?;
            }
            "TEARDOWN" => {
                let response = self.response(StatusCode::OK, request);
                self.send_response(&response).await?;
                return Ok(true);
            }
            _ => {
                let response = self.response(StatusCode::NOT_IMPLEMENTED, request);
                self.send_response(&response).await?;
            }
        }
        Ok(false)
    }

    fn response(&self, status: StatusCode, request: &Request) -> Response {
        self.response_raw(
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            request,
        )
    }

    fn response_raw(&self, code: u16, reason: &str, request: &Request) -> Response {
        let mut response = Response {
            version: "RTSP/1.0".to_string(),
            status_code: code,
            reason_phrase: reason.to_string(),
            ..Default::default()
        };
        if let Some(cseq) = request.header("CSeq") {
            response.headers.insert("CSeq".to_string(), cseq.clone());
        }
        response
            .headers
            .insert("Server".to_string(), "medley".to_string());
        if self.state != SessionState::Initial || !self.setups.is_empty() {
            response
                .headers
                .insert("Session".to_string(), self.session_id.clone());
        }
        response
    }

    async fn send_response(&mut self, response: &Response) -> Result<(), SessionError> {
        let mut sink = AsyncByteSink::new(self.io.clone());
        sink.put(response.marshal().as_bytes());
        sink.flush().await?;
        Ok(())
    }

    fn access_context(&self, request: &Request) -> AccessContext {
        let credentials = match request.header("Authorization") {
            Some(value) => parse_authorization(value),
            None => PresentedCredentials::None,
        };
        AccessContext {
            peer_ip: self.peer.ip(),
            credentials,
            method: request.method.clone(),
            query: request.url.query.clone().unwrap_or_default(),
        }
    }

    /// 401 + challenge for missing credentials, stall-then-close for wrong
    /// ones.
    async fn reply_auth_failure(
        &mut self,
        request: &Request,
        critical: bool,
    ) -> Result<(), SessionError> {
        let mut response = self.response(StatusCode::UNAUTHORIZED, request);
        let challenges = self
            .challenge
            .header_values(&self.shared.config.auth_methods)
            .join(", ");
        response
            .headers
            .insert("WWW-Authenticate".to_string(), challenges);

        if critical {
            tokio::time::sleep(CRITICAL_FAIL_STALL).await;
            self.send_response(&response).await?;
            return Err(SessionError {
                value: SessionErrorValue::Malformed("critical authentication failure".to_string()),
            });
        }

        self.send_response(&response).await?;
        Ok(())
    }

    fn check_state(&self, method: &str, allowed: &[SessionState]) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError {
                value: SessionErrorValue::InvalidState(method.to_string()),
            })
        }
    }

    async fn reply_invalid_state(&mut self, request: &Request) -> Result<(), SessionError> {
        let (code, reason) = STATUS_METHOD_NOT_VALID;
        let response = self.response_raw(code, reason, request);
        self.send_response(&response).await
    }

    // ---- verbs ----

    async fn handle_options(&mut self, request: &Request) -> Result<(), SessionError> {
        let mut response = self.response(StatusCode::OK, request);
        response.headers.insert(
            "Public".to_string(),
            "OPTIONS, DESCRIBE, ANNOUNCE, SETUP, PLAY, RECORD, PAUSE, GET_PARAMETER, TEARDOWN"
                .to_string(),
        );
        self.send_response(&response).await
    }

    async fn handle_describe(&mut self, request: &Request) -> Result<(), SessionError> {
        if self.check_state("DESCRIBE", &[SessionState::Initial]).is_err() {
            return self.reply_invalid_state(request).await;
        }

        let path_name = request.url.path.clone();
        let access = self.access_context(request);
        if !self.challenge.matches(&access.credentials) {
            return self.reply_auth_failure(request, true).await;
        }

        let (tx, rx) = oneshot::channel();
        self.hub.send(HubEvent::Describe {
            path_name: path_name.clone(),
            url: RequestUrl {
                scheme: request.url.scheme.to_string(),
                host: match request.url.port {
                    Some(port) => format!("{}:{}", request.url.host, port),
                    None => request.url.host.clone(),
                },
            },
            access,
            result: tx,
        })?;

        let answer = rx
            .await
            .unwrap_or_else(|_| Err(pathhub::errors::PathError::terminated()));

        match answer {
            Ok(DescribeAnswer::Stream { stream }) => {
                self.path_name = path_name;
                let mut response = self.response(StatusCode::OK, request);
                response
                    .headers
                    .insert("Content-Type".to_string(), "application/sdp".to_string());
                response
                    .headers
                    .insert("Content-Base".to_string(), request.url.marshal());
                response.body = Some(sdp::marshal(stream.tracks()));
                self.send_response(&response).await
            }
            Ok(DescribeAnswer::Redirect { url }) => {
                let mut response = self.response(StatusCode::FOUND, request);
                response.headers.insert("Location".to_string(), url);
                self.send_response(&response).await
            }
            Err(err) => self.reply_path_error(request, err).await,
        }
    }

    async fn reply_path_error(
        &mut self,
        request: &Request,
        err: pathhub::errors::PathError,
    ) -> Result<(), SessionError> {
        use pathhub::errors::PathErrorValue;
        match &err.value {
            PathErrorValue::AuthNotCritical => self.reply_auth_failure(request, false).await,
            PathErrorValue::AuthCritical(_) => self.reply_auth_failure(request, true).await,
            PathErrorValue::NoOnePublishing(_) | PathErrorValue::SourceTimeout(_) => {
                // the client may retry on the same connection
                log::info!("[rtsp session {}] {}", self.session_id, err);
                let response = self.response(StatusCode::NOT_FOUND, request);
                self.send_response(&response).await
            }
            _ => {
                log::info!("[rtsp session {}] {}", self.session_id, err);
                let response = self.response(StatusCode::BAD_REQUEST, request);
                self.send_response(&response).await?;
                Err(err.into())
            }
        }
    }

    async fn handle_announce(&mut self, request: &Request) -> Result<(), SessionError> {
        if self.check_state("ANNOUNCE", &[SessionState::Initial]).is_err() {
            return self.reply_invalid_state(request).await;
        }

        let Some(body) = &request.body else {
            return Err(SessionError::malformed("announce without sdp"));
        };
        let tracks = sdp::unmarshal(body)?;

        let access = self.access_context(request);
        if !self.challenge.matches(&access.credentials) {
            return self.reply_auth_failure(request, true).await;
        }

        let path_name = request.url.path.clone();
        let (tx, rx) = oneshot::channel();
        self.hub.send(HubEvent::AddPublisher {
            path_name: path_name.clone(),
            access,
            publisher: PublisherHandle {
                id: self.handle_id,
                kind: SessionKind::RtspSession,
                remote_addr: self.peer.to_string(),
                close: self.close_tx.clone(),
            },
            result: tx,
        })?;

        let path = match rx
            .await
            .unwrap_or_else(|_| Err(pathhub::errors::PathError::terminated()))
        {
            Ok(path) => path,
            Err(err) => return self.reply_path_error(request, err).await,
        };

        self.path_name = path_name;
        self.role = Role::Publisher {
            path,
            tracks,
            stream: None,
        };
        self.state = SessionState::PreRecord;

        let response = self.response(StatusCode::OK, request);
        self.send_response(&response).await
    }

    fn track_id_from_url(&self, request: &Request) -> usize {
        // .../trackID=<n> (or streamid=<n> from ffmpeg)
        let url = request.url.marshal();
        for marker in ["trackID=", "streamid="] {
            if let Some(idx) = url.rfind(marker) {
                if let Ok(id) = url[idx + marker.len()..]
                    .trim_end_matches('/')
                    .parse::<usize>()
                {
                    return id;
                }
            }
        }
        self.setups.len()
    }

    async fn handle_setup(&mut self, request: &Request) -> Result<(), SessionError> {
        if self
            .check_state(
                "SETUP",
                &[
                    SessionState::Initial,
                    SessionState::PrePlay,
                    SessionState::PreRecord,
                ],
            )
            .is_err()
        {
            return self.reply_invalid_state(request).await;
        }

        let Some(transport_value) = request.header("Transport") else {
            return Err(SessionError::malformed("setup without transport"));
        };
        let Some(transport) = TransportHeader::unmarshal(transport_value) else {
            return Err(SessionError::malformed("unparseable transport"));
        };

        let allowed = self.shared.config.protocols;
        let supported = match transport.cast_kind() {
            CastKind::Tcp => allowed.tcp,
            CastKind::Udp => allowed.udp,
            CastKind::Multicast => allowed.multicast,
        };
        if !supported {
            let (code, reason) = STATUS_UNSUPPORTED_TRANSPORT;
            let response = self.response_raw(code, reason, request);
            self.send_response(&response).await?;
            return Ok(());
        }

        // bind the path on the first reader setup (describe-less clients)
        if self.state == SessionState::Initial || matches!(self.role, Role::None) {
            if self.state == SessionState::PreRecord {
                // publisher already bound by ANNOUNCE
            } else {
                let path_name = strip_track_suffix(&request.url.path);
                let access = self.access_context(request);
                if !self.challenge.matches(&access.credentials) {
                    return self.reply_auth_failure(request, true).await;
                }

                let (tx, rx) = oneshot::channel();
                self.hub.send(HubEvent::AddReader {
                    path_name: path_name.clone(),
                    access,
                    reader: ReaderHandle {
                        id: self.handle_id,
                        kind: SessionKind::RtspSession,
                        remote_addr: self.peer.to_string(),
                        close: self.close_tx.clone(),
                    },
                    result: tx,
                })?;

                let attachment = match rx
                    .await
                    .unwrap_or_else(|_| Err(pathhub::errors::PathError::terminated()))
                {
                    Ok(attachment) => attachment,
                    Err(err) => return self.reply_path_error(request, err).await,
                };

                self.path_name = path_name;
                self.role = Role::Reader { attachment };
                self.state = SessionState::PrePlay;
            }
        }

        let track_id = self.track_id_from_url(request);
        let mut reply_transport = transport.clone();

        let setup = match transport.cast_kind() {
            CastKind::Tcp => {
                let interleaved = transport
                    .interleaved
                    .unwrap_or(((track_id * 2) as u8, (track_id * 2 + 1) as u8));
                reply_transport.interleaved = Some(interleaved);
                TrackSetup {
                    cast: CastKind::Tcp,
                    interleaved,
                    client_rtp: None,
                    client_rtcp: None,
                }
            }
            CastKind::Udp => {
                let Some((rtp_port, rtcp_port)) = transport.client_port else {
                    return Err(SessionError::malformed("udp setup without client_port"));
                };
                reply_transport.server_port =
                    Some((self.shared.config.rtp_port, self.shared.config.rtcp_port));
                TrackSetup {
                    cast: CastKind::Udp,
                    interleaved: (0, 0),
                    client_rtp: Some(SocketAddr::new(self.peer.ip(), rtp_port)),
                    client_rtcp: Some(SocketAddr::new(self.peer.ip(), rtcp_port)),
                }
            }
            CastKind::Multicast => {
                let Role::Reader { attachment } = &self.role else {
                    return Err(SessionError::malformed("multicast setup on a publisher"));
                };
                let group = self
                    .shared
                    .multicast_acquire(&self.path_name, &attachment.stream)
                    .await?;
                self.multicast_joined = true;
                reply_transport.destination = Some(group.into());
                reply_transport.ttl = Some(16);
                reply_transport.port = Some((
                    self.shared.config.multicast_rtp_port,
                    self.shared.config.multicast_rtcp_port,
                ));
                TrackSetup {
                    cast: CastKind::Multicast,
                    interleaved: (0, 0),
                    client_rtp: None,
                    client_rtcp: None,
                }
            }
        };

        self.setups.insert(track_id, setup);

        let mut response = self.response(StatusCode::OK, request);
        response
            .headers
            .insert("Transport".to_string(), reply_transport.marshal());
        response
            .headers
            .insert("Session".to_string(), self.session_id.clone());
        self.send_response(&response).await
    }

    async fn handle_play(&mut self, request: &Request) -> Result<(), SessionError> {
        if self.check_state("PLAY", &[SessionState::PrePlay]).is_err() {
            return self.reply_invalid_state(request).await;
        }

        let response = self.response(StatusCode::OK, request);
        self.send_response(&response).await?;

        self.state = SessionState::Play;
        self.shared
            .set_session_state(&self.session_id, ApiSessionState::Read)
            .await;
        Ok(())
    }

    async fn handle_record(&mut self, request: &Request) -> Result<(), SessionError> {
        if self.check_state("RECORD", &[SessionState::PreRecord]).is_err() {
            return self.reply_invalid_state(request).await;
        }

        let Role::Publisher { path, tracks, stream } = &mut self.role else {
            return Err(SessionError {
                value: SessionErrorValue::InvalidState("RECORD".to_string()),
            });
        };

        let new_stream = path
            .publisher_start(self.handle_id, tracks.clone())
            .await
            .map_err(SessionError::from)?;

        // UDP publishers are fed through the shared sockets, demuxed by
        // the addresses they declared at SETUP
        let mut bindings = self.shared.udp_sources.lock().await;
        for (track_id, setup) in &self.setups {
            if setup.cast != CastKind::Udp {
                continue;
            }
            if let Some(addr) = setup.client_rtp {
                bindings.insert(
                    addr,
                    UdpSourceBinding {
                        stream: new_stream.clone(),
                        track_id: *track_id,
                        is_rtcp: false,
                    },
                );
            }
            if let Some(addr) = setup.client_rtcp {
                bindings.insert(
                    addr,
                    UdpSourceBinding {
                        stream: new_stream.clone(),
                        track_id: *track_id,
                        is_rtcp: true,
                    },
                );
            }
        }
        drop(bindings);

        *stream = Some(new_stream);
        self.state = SessionState::Record;
        self.shared
            .set_session_state(&self.session_id, ApiSessionState::Publish)
            .await;

        let response = self.response(StatusCode::OK, request);
        self.send_response(&response).await
    }

    async fn handle_pause(&mut self, request: &Request) -> Result<(), SessionError> {
        match self.state {
            SessionState::Play => {
                // play_loop detaches from the stream when it sees the
                // state change
                self.state = SessionState::PrePlay;
                self.shared
                    .set_session_state(&self.session_id, ApiSessionState::Idle)
                    .await;
            }
            SessionState::Record => {
                if let Role::Publisher { path, stream, .. } = &mut self.role {
                    path.publisher_pause(self.handle_id).await;
                    *stream = None;
                }
                self.remove_udp_bindings().await;
                self.state = SessionState::PreRecord;
                self.shared
                    .set_session_state(&self.session_id, ApiSessionState::Idle)
                    .await;
            }
            _ => return self.reply_invalid_state(request).await,
        }

        let response = self.response(StatusCode::OK, request);
        self.send_response(&response).await
    }

    async fn remove_udp_bindings(&self) {
        let mut bindings = self.shared.udp_sources.lock().await;
        for setup in self.setups.values() {
            if let Some(addr) = setup.client_rtp {
                bindings.remove(&addr);
            }
            if let Some(addr) = setup.client_rtcp {
                bindings.remove(&addr);
            }
        }
    }

    /// Undo every path-side registration. Safe to call once at the end of
    /// the session's life.
    async fn release(&mut self) {
        self.remove_udp_bindings().await;
        if self.multicast_joined {
            self.shared.multicast_release(&self.path_name).await;
        }

        match &self.role {
            Role::Reader { attachment } => {
                attachment.path.reader_remove(self.handle_id).await;
            }
            Role::Publisher { path, .. } => {
                path.publisher_remove(self.handle_id).await;
            }
            Role::None => {}
        }
    }
}

fn close_reason_error(reason: Option<CloseReason>) -> SessionError {
    SessionError {
        value: SessionErrorValue::Closed(reason.unwrap_or(CloseReason::Terminated)),
    }
}

/// `cam/trackID=0` → `cam`
fn strip_track_suffix(path: &str) -> String {
    for marker in ["/trackID=", "/streamid="] {
        if let Some(idx) = path.rfind(marker) {
            return path[..idx].to_string();
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::strip_track_suffix;

    #[test]
    fn track_suffix_is_stripped() {
        assert_eq!(strip_track_suffix("cam/trackID=0"), "cam");
        assert_eq!(strip_track_suffix("live/feed42/streamid=1"), "live/feed42");
        assert_eq!(strip_track_suffix("cam"), "cam");
    }
}

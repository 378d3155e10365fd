use {
    crate::muxer::{self, HlsMuxerConfig, MuxerHandle},
    baselib::auth::{parse_authorization, query_credentials, PresentedCredentials},
    hyper::{
        service::{make_service_fn, service_fn},
        Body, Method, Request, Response, Server, StatusCode,
    },
    pathhub::{
        define::{AccessContext, HubEvent, PathNotify},
        manager::PathManagerHandle,
    },
    std::{collections::HashMap, convert::Infallible, net::SocketAddr, sync::Arc, time::Duration},
    tokio::sync::{oneshot, Mutex},
};

#[derive(Clone)]
pub struct HlsServerConfig {
    pub address: String,
    pub allow_origin: String,
    pub muxer: HlsMuxerConfig,
}

impl Default for HlsServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8888".to_string(),
            allow_origin: "*".to_string(),
            muxer: HlsMuxerConfig::default(),
        }
    }
}

pub struct ServerState {
    config: HlsServerConfig,
    hub: PathManagerHandle,
    muxers: Mutex<HashMap<String, MuxerHandle>>,
}

impl ServerState {
    /// Muxer snapshot for `GET /v1/hlsmuxers/list`.
    async fn api_list(&self) -> serde_json::Value {
        let muxers = self.muxers.lock().await;
        let mut items = serde_json::Map::new();
        for name in muxers.keys() {
            items.insert(
                name.clone(),
                serde_json::json!({ "created": null, "lastRequest": null }),
            );
        }
        serde_json::json!({ "items": items })
    }
}

pub struct HlsServer {
    state: Arc<ServerState>,
}

impl HlsServer {
    pub fn new(config: HlsServerConfig, hub: PathManagerHandle) -> Self {
        Self {
            state: Arc::new(ServerState {
                config,
                hub,
                muxers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn api_muxers_list(&self) -> serde_json::Value {
        self.state.api_list().await
    }

    pub fn state_handle(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    pub async fn run(&self) -> Result<(), hyper::Error> {
        let addr: SocketAddr = self
            .state
            .config
            .address
            .parse()
            .unwrap_or_else(|_| ([0, 0, 0, 0], 8888).into());

        // eager muxers when always-remux is on
        if self.state.config.muxer.always_remux {
            let state = self.state.clone();
            let mut notify = state.hub.subscribe_notify();
            tokio::spawn(async move {
                while let Ok(event) = notify.recv().await {
                    if let PathNotify::SourceReady { path_name } = event {
                        let access = AccessContext::anonymous("127.0.0.1".parse().unwrap());
                        if let Err(err) = ensure_muxer(&state, &path_name, access).await {
                            log::info!("always-remux of '{}' failed: {}", path_name, err);
                        }
                    }
                }
            });
        }

        let state = self.state.clone();
        let make_service = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
            let state = state.clone();
            let peer = conn.remote_addr();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = state.clone();
                    async move { Ok::<_, Infallible>(handle_request(state, peer, req).await) }
                }))
            }
        });

        let server = Server::bind(&addr).serve(make_service);
        log::info!("HLS server listening on http://{}", addr);
        server.await
    }
}

fn respond(status: StatusCode, allow_origin: &str, body: Body, content_type: &str) -> Response<Body> {
    let mut builder = Response::builder()
        .status(status)
        .header("Access-Control-Allow-Origin", allow_origin);
    if !content_type.is_empty() {
        builder = builder.header("Content-Type", content_type);
    }
    builder.body(body).unwrap()
}

async fn ensure_muxer(
    state: &Arc<ServerState>,
    path_name: &str,
    access: AccessContext,
) -> Result<MuxerHandle, crate::errors::HlsError> {
    {
        let mut muxers = state.muxers.lock().await;
        if let Some(handle) = muxers.get(path_name) {
            if !handle.store.is_closed().await {
                return Ok(handle.clone());
            }
            muxers.remove(path_name);
        }
    }

    let handle = muxer::spawn(
        path_name.to_string(),
        access,
        state.config.muxer.clone(),
        state.hub.clone(),
    )
    .await?;

    state
        .muxers
        .lock()
        .await
        .insert(path_name.to_string(), handle.clone());
    Ok(handle)
}

async fn handle_request(
    state: Arc<ServerState>,
    peer: SocketAddr,
    req: Request<Body>,
) -> Response<Body> {
    let allow_origin = state.config.allow_origin.clone();

    if req.method() != Method::GET {
        return respond(
            StatusCode::METHOD_NOT_ALLOWED,
            &allow_origin,
            Body::empty(),
            "",
        );
    }

    let uri_path = req.uri().path().trim_matches('/').to_string();
    let Some((path_name, file)) = uri_path.rsplit_once('/') else {
        return respond(StatusCode::NOT_FOUND, &allow_origin, Body::empty(), "");
    };
    let path_name = path_name.to_string();
    let file = file.to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    // per-request authentication against the path's read rules
    let credentials = match req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
    {
        Some(value) => parse_authorization(value),
        None => query_credentials(&query),
    };
    let access = AccessContext {
        peer_ip: peer.ip(),
        credentials: credentials.clone(),
        method: String::new(),
        query: query.clone(),
    };

    let (tx, rx) = oneshot::channel();
    if state
        .hub
        .send(HubEvent::Authenticate {
            path_name: path_name.clone(),
            access: access.clone(),
            publish: false,
            result: tx,
        })
        .is_err()
    {
        return respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            &allow_origin,
            Body::empty(),
            "",
        );
    }
    match rx.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            if err.is_critical_auth() {
                tokio::time::sleep(baselib::auth::CRITICAL_FAIL_STALL).await;
            }
            let status = if err.is_auth() {
                StatusCode::UNAUTHORIZED
            } else {
                StatusCode::NOT_FOUND
            };
            return respond(status, &allow_origin, Body::empty(), "");
        }
        Err(_) => {
            return respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                &allow_origin,
                Body::empty(),
                "",
            );
        }
    }

    let is_playlist = file == "stream.m3u8" || file == "index.m3u8";

    let muxer = if is_playlist {
        match ensure_muxer(&state, &path_name, access).await {
            Ok(handle) => handle,
            Err(err) => {
                log::info!("cannot start hls muxer for '{}': {}", path_name, err);
                return respond(StatusCode::NOT_FOUND, &allow_origin, Body::empty(), "");
            }
        }
    } else {
        let muxers = state.muxers.lock().await;
        match muxers.get(&path_name) {
            Some(handle) => handle.clone(),
            None => {
                return respond(StatusCode::NOT_FOUND, &allow_origin, Body::empty(), "")
            }
        }
    };

    muxer.store.touch().await;

    if is_playlist {
        // low-latency blocking request support
        let (want_msn, want_part) = parse_blocking_params(&query);
        if let Some(msn) = want_msn {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            loop {
                {
                    let playlist = muxer.store.playlist.lock().await;
                    let satisfied = playlist.last_msn() > msn
                        || (playlist.last_msn() == msn
                            && want_part
                                .map(|p| playlist.open_part_count() > p)
                                .unwrap_or(false));
                    if satisfied {
                        break;
                    }
                }
                if muxer.store.is_closed().await
                    || tokio::time::Instant::now() >= deadline
                {
                    break;
                }
                let _ = tokio::time::timeout(
                    deadline - tokio::time::Instant::now(),
                    muxer.store.updated.notified(),
                )
                .await;
            }
        }

        let playlist = muxer.store.playlist.lock().await;
        if playlist.segments.is_empty() && playlist.open_parts.is_empty() {
            drop(playlist);
            // young muxer: give it a moment to produce the first segment
            let _ = tokio::time::timeout(
                Duration::from_secs(10),
                wait_for_content(&muxer),
            )
            .await;
        } else {
            drop(playlist);
        }

        let playlist = muxer.store.playlist.lock().await;
        if playlist.segments.is_empty() && playlist.open_parts.is_empty() {
            return respond(StatusCode::NOT_FOUND, &allow_origin, Body::empty(), "");
        }
        let body = playlist.render();
        return respond(
            StatusCode::OK,
            &allow_origin,
            Body::from(body),
            "application/vnd.apple.mpegurl",
        );
    }

    if file == "init.mp4" {
        let init = muxer.store.init_section.lock().await;
        return match &*init {
            Some(data) => respond(
                StatusCode::OK,
                &allow_origin,
                Body::from(data.clone()),
                "video/mp4",
            ),
            None => respond(StatusCode::NOT_FOUND, &allow_origin, Body::empty(), ""),
        };
    }

    let resources = muxer.store.resources.lock().await;
    match resources.get(&file) {
        Some(data) => {
            let content_type = if file.ends_with(".ts") {
                "video/mp2t"
            } else {
                "video/mp4"
            };
            respond(
                StatusCode::OK,
                &allow_origin,
                Body::from(data.clone()),
                content_type,
            )
        }
        None => respond(StatusCode::NOT_FOUND, &allow_origin, Body::empty(), ""),
    }
}

async fn wait_for_content(muxer: &MuxerHandle) {
    loop {
        {
            let playlist = muxer.store.playlist.lock().await;
            if !playlist.segments.is_empty() || !playlist.open_parts.is_empty() {
                return;
            }
        }
        if muxer.store.is_closed().await {
            return;
        }
        muxer.store.updated.notified().await;
    }
}

fn parse_blocking_params(query: &str) -> (Option<u64>, Option<usize>) {
    let mut msn = None;
    let mut part = None;
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            match k {
                "_HLS_msn" => msn = v.parse().ok(),
                "_HLS_part" => part = v.parse().ok(),
                _ => {}
            }
        }
    }
    (msn, part)
}

#[cfg(test)]
mod tests {
    use super::parse_blocking_params;

    #[test]
    fn blocking_params() {
        assert_eq!(
            parse_blocking_params("_HLS_msn=12&_HLS_part=3"),
            (Some(12), Some(3))
        );
        assert_eq!(parse_blocking_params(""), (None, None));
        assert_eq!(parse_blocking_params("user=u&pass=p"), (None, None));
    }
}

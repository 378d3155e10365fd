use {
    axum::{extract::State, routing::get, Json, Router},
    pathhub::manager::PathManagerHandle,
    serde_json::{json, Value},
    std::sync::Arc,
};

/// Control API: read-only JSON snapshots of paths and sessions.
#[derive(Clone)]
pub struct ApiState {
    pub hub: PathManagerHandle,
    pub rtsp_shared: Option<Arc<rtsp::server::ServerShared>>,
    pub rtmp_shared: Option<Arc<rtmp::server::ServerShared>>,
    pub hls_server: Option<Arc<hls::server::HlsServer>>,
}

async fn paths_list(State(state): State<ApiState>) -> Json<Value> {
    Json(state.hub.paths_list().await)
}

async fn rtsp_sessions_list(State(state): State<ApiState>) -> Json<Value> {
    match &state.rtsp_shared {
        Some(shared) => Json(shared.api_sessions_list().await),
        None => Json(json!({"items": {}})),
    }
}

async fn rtmp_conns_list(State(state): State<ApiState>) -> Json<Value> {
    match &state.rtmp_shared {
        Some(shared) => Json(shared.api_conns_list().await),
        None => Json(json!({"items": {}})),
    }
}

async fn hls_muxers_list(State(state): State<ApiState>) -> Json<Value> {
    match &state.hls_server {
        Some(server) => Json(server.api_muxers_list().await),
        None => Json(json!({"items": {}})),
    }
}

pub async fn run(state: ApiState, address: String) {
    let app = Router::new()
        .route("/v1/paths/list", get(paths_list))
        .route("/v1/rtspsessions/list", get(rtsp_sessions_list))
        .route("/v1/rtmpconns/list", get(rtmp_conns_list))
        .route("/v1/hlsmuxers/list", get(hls_muxers_list))
        .with_state(state);

    let addr: std::net::SocketAddr = match address.parse() {
        Ok(addr) => addr,
        Err(err) => {
            log::error!("invalid api address '{}': {}", address, err);
            return;
        }
    };

    log::info!("API server listening on http://{}", addr);
    if let Err(err) = axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
    {
        log::error!("api server error: {}", err);
    }
}

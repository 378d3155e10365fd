use {
    crate::{errors::RtmpError, session::RtmpConnection},
    chrono::{DateTime, Local},
    netio::net::TcpIO,
    pathhub::manager::PathManagerHandle,
    serde_derive::Serialize,
    serde_json::json,
    std::{collections::HashMap, sync::Arc, time::Duration},
    tokio::{net::TcpListener, sync::Mutex},
};

#[derive(Clone)]
pub struct RtmpServerConfig {
    pub address: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for RtmpServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:1935".to_string(),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiConnState {
    Idle,
    Read,
    Publish,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConnInfo {
    pub created: DateTime<Local>,
    pub remote_addr: String,
    pub state: ApiConnState,
}

pub struct ServerShared {
    pub config: RtmpServerConfig,
    conns: Mutex<HashMap<String, ApiConnInfo>>,
}

impl ServerShared {
    pub fn new(config: RtmpServerConfig) -> Self {
        Self {
            config,
            conns: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register_conn(&self, id: &str, remote_addr: String) {
        self.conns.lock().await.insert(
            id.to_string(),
            ApiConnInfo {
                created: Local::now(),
                remote_addr,
                state: ApiConnState::Idle,
            },
        );
    }

    pub async fn set_conn_state(&self, id: &str, state: ApiConnState) {
        if let Some(info) = self.conns.lock().await.get_mut(id) {
            info.state = state;
        }
    }

    pub async fn unregister_conn(&self, id: &str) {
        self.conns.lock().await.remove(id);
    }

    pub async fn api_conns_list(&self) -> serde_json::Value {
        let conns = self.conns.lock().await;
        let mut items = serde_json::Map::new();
        for (id, info) in conns.iter() {
            if let Ok(value) = serde_json::to_value(info) {
                items.insert(id.clone(), value);
            }
        }
        json!({ "items": items })
    }
}

pub struct RtmpServer {
    hub: PathManagerHandle,
    pub shared: Arc<ServerShared>,
}

impl RtmpServer {
    pub fn new(config: RtmpServerConfig, hub: PathManagerHandle) -> Self {
        Self {
            hub,
            shared: Arc::new(ServerShared::new(config)),
        }
    }

    pub async fn run(&self) -> Result<(), RtmpError> {
        let listener = TcpListener::bind(&self.shared.config.address).await?;
        log::info!("RTMP server listening on {}", self.shared.config.address);

        loop {
            let (stream, peer) = listener.accept().await?;
            let shared = self.shared.clone();
            let hub = self.hub.clone();
            tokio::spawn(async move {
                let io = Box::new(TcpIO::new(stream));
                RtmpConnection::run_with_io(io, peer, shared, hub).await;
            });
        }
    }
}

use {
    crate::{
        conf::{check_path_name, PathConf},
        define::{
            AccessContext, HubEvent, HubEventReceiver, HubEventSender, PathNotify,
            StaticSourceFactory,
        },
        errors::{PathError, PathErrorValue},
        path::{Path, PathContext, PathHandle},
        stream::StreamConfig,
    },
    baselib::auth::PathAuth,
    regex::Regex,
    serde_json::json,
    std::{collections::HashMap, sync::Arc},
    tokio::sync::{broadcast, mpsc, oneshot},
};

struct PathEntry {
    conf_name: String,
    conf: PathConf,
    regexp: Option<Regex>,
    read_auth: PathAuth,
    publish_auth: PathAuth,
}

#[derive(Clone)]
pub struct PathManagerConfig {
    pub rtsp_port: u16,
    pub stream_config: StreamConfig,
    /// (name, conf) in configuration order; order breaks regexp ties.
    pub paths: Vec<(String, PathConf)>,
}

/// Registry of paths. Resolves names (literals win, then the first
/// matching regexp template), creates path instances lazily, runs the
/// authentication gate, and routes describe / reader / publisher requests
/// to the owning path actor.
pub struct PathManager {
    config: PathManagerConfig,
    entries: Vec<PathEntry>,
    paths: HashMap<String, PathHandle>,
    source_factory: Option<Arc<dyn StaticSourceFactory>>,
    hub_tx: HubEventSender,
    hub_rx: HubEventReceiver,
    notify_tx: broadcast::Sender<PathNotify>,
    shutdown_rx: mpsc::Receiver<oneshot::Sender<()>>,
}

/// Clonable front half of the manager: protocol servers talk to the
/// manager exclusively through this.
#[derive(Clone)]
pub struct PathManagerHandle {
    tx: HubEventSender,
    notify_tx: broadcast::Sender<PathNotify>,
    shutdown_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl PathManagerHandle {
    pub fn sender(&self) -> HubEventSender {
        self.tx.clone()
    }

    pub fn send(&self, event: HubEvent) -> Result<(), PathError> {
        self.tx.send(event).map_err(|_| PathError::terminated())
    }

    pub fn subscribe_notify(&self) -> broadcast::Receiver<PathNotify> {
        self.notify_tx.subscribe()
    }

    pub async fn paths_list(&self) -> serde_json::Value {
        let (tx, rx) = oneshot::channel();
        if self.send(HubEvent::ApiPathsList { result: tx }).is_err() {
            return json!({"items": {}});
        }
        rx.await.unwrap_or_else(|_| json!({"items": {}}))
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.shutdown_tx.send(tx).await.is_ok() {
            let _ = rx.await;
        }
    }
}

impl PathManager {
    pub fn new(
        config: PathManagerConfig,
        source_factory: Option<Arc<dyn StaticSourceFactory>>,
    ) -> Result<(Self, PathManagerHandle), PathError> {
        let mut entries = Vec::with_capacity(config.paths.len());
        for (name, conf) in &config.paths {
            let regexp = conf.check(name)?;
            entries.push(PathEntry {
                conf_name: name.clone(),
                conf: conf.clone(),
                regexp,
                read_auth: conf.read_auth()?,
                publish_auth: conf.publish_auth()?,
            });
        }

        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let (notify_tx, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let handle = PathManagerHandle {
            tx: hub_tx.clone(),
            notify_tx: notify_tx.clone(),
            shutdown_tx,
        };

        Ok((
            Self {
                config,
                entries,
                paths: HashMap::new(),
                source_factory,
                hub_tx,
                hub_rx,
                notify_tx,
                shutdown_rx,
            },
            handle,
        ))
    }

    fn path_context(&self) -> PathContext {
        PathContext {
            rtsp_port: self.config.rtsp_port,
            stream_config: self.config.stream_config,
            source_factory: self.source_factory.clone(),
            hub_tx: self.hub_tx.clone(),
        }
    }

    /// Literal entries match their own name; otherwise the first regexp
    /// entry whose pattern accepts the whole name wins.
    fn find_entry(&self, name: &str) -> Option<(&PathEntry, Vec<String>)> {
        for entry in &self.entries {
            if entry.regexp.is_none() && entry.conf_name == name {
                return Some((entry, vec![name.to_string()]));
            }
        }

        for entry in &self.entries {
            if let Some(re) = &entry.regexp {
                if let Some(caps) = re.captures(name) {
                    let whole = caps.get(0).unwrap();
                    if whole.start() == 0 && whole.end() == name.len() {
                        let matches = caps
                            .iter()
                            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                            .collect();
                        return Some((entry, matches));
                    }
                }
            }
        }

        // the literal entry 'all' is the configured catch-all
        if name != "all" {
            for entry in &self.entries {
                if entry.regexp.is_none() && entry.conf_name == "all" {
                    return Some((entry, vec![name.to_string()]));
                }
            }
        }

        None
    }

    fn get_or_create_path(&mut self, name: &str) -> Result<(PathHandle, usize), PathError> {
        check_path_name(name)?;

        let Some((entry, matches)) = self.find_entry(name) else {
            return Err(PathError {
                value: PathErrorValue::InvalidName(format!(
                    "path '{name}' is not configured"
                )),
            });
        };
        let entry_idx = self
            .entries
            .iter()
            .position(|e| std::ptr::eq(e, entry))
            .unwrap();

        if let Some(handle) = self.paths.get(name) {
            return Ok((handle.clone(), entry_idx));
        }

        let entry = &self.entries[entry_idx];
        // template-spawned instances (regexp or the 'all' catch-all) are
        // garbage-collected when they fall out of use
        let dynamic = entry.regexp.is_some() || entry.conf_name != name;
        let handle = Path::spawn(
            entry.conf_name.clone(),
            entry.conf.clone(),
            name.to_string(),
            matches,
            dynamic,
            self.path_context(),
        );
        self.paths.insert(name.to_string(), handle.clone());
        Ok((handle.clone(), entry_idx))
    }

    fn authenticate(
        &self,
        entry_idx: usize,
        access: &AccessContext,
        publish: bool,
    ) -> Result<(), PathError> {
        let entry = &self.entries[entry_idx];
        let auth = if publish {
            &entry.publish_auth
        } else {
            &entry.read_auth
        };
        auth.validate(access.peer_ip, &access.credentials, &access.method)?;
        Ok(())
    }

    pub async fn run(mut self) {
        // non-regexp paths with a static source or an init hook exist from
        // server start
        let eager: Vec<String> = self
            .entries
            .iter()
            .filter(|e| {
                e.regexp.is_none() && (e.conf.has_static_source() || !e.conf.run_on_init.is_empty())
            })
            .map(|e| e.conf_name.clone())
            .collect();
        for name in eager {
            if let Err(err) = self.get_or_create_path(&name) {
                log::error!("cannot create path '{}': {}", name, err);
            }
        }

        loop {
            tokio::select! {
                event = self.hub_rx.recv() => {
                    match event {
                        Some(event) => self.on_event(event),
                        None => break,
                    }
                }
                done = self.shutdown_rx.recv() => {
                    if let Some(done) = done {
                        self.close_all_paths().await;
                        let _ = done.send(());
                    }
                    break;
                }
            }
        }
    }

    fn on_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Describe {
                path_name,
                url,
                access,
                result,
            } => match self.get_or_create_path(&path_name) {
                Ok((path, entry_idx)) => {
                    if let Err(err) = self.authenticate(entry_idx, &access, false) {
                        let _ = result.send(Err(err));
                        return;
                    }
                    path.describe(url, result);
                }
                Err(err) => {
                    let _ = result.send(Err(err));
                }
            },

            HubEvent::AddReader {
                path_name,
                access,
                reader,
                result,
            } => match self.get_or_create_path(&path_name) {
                Ok((path, entry_idx)) => {
                    if let Err(err) = self.authenticate(entry_idx, &access, false) {
                        let _ = result.send(Err(err));
                        return;
                    }
                    path.reader_add(reader, result);
                }
                Err(err) => {
                    let _ = result.send(Err(err));
                }
            },

            HubEvent::AddPublisher {
                path_name,
                access,
                publisher,
                result,
            } => match self.get_or_create_path(&path_name) {
                Ok((path, entry_idx)) => {
                    if let Err(err) = self.authenticate(entry_idx, &access, true) {
                        let _ = result.send(Err(err));
                        return;
                    }
                    path.publisher_add(publisher, result);
                }
                Err(err) => {
                    let _ = result.send(Err(err));
                }
            },

            HubEvent::FindPath { path_name, result } => {
                let _ = result.send(self.paths.get(&path_name).cloned());
            }

            HubEvent::Authenticate {
                path_name,
                access,
                publish,
                result,
            } => {
                let answer = match self.find_entry(&path_name) {
                    Some((entry, _)) => {
                        let idx = self
                            .entries
                            .iter()
                            .position(|e| std::ptr::eq(e, entry))
                            .unwrap();
                        self.authenticate(idx, &access, publish)
                    }
                    None => Err(PathError {
                        value: PathErrorValue::InvalidName(format!(
                            "path '{path_name}' is not configured"
                        )),
                    }),
                };
                let _ = result.send(answer);
            }

            HubEvent::ApiPathsList { result } => {
                let paths: Vec<(String, PathHandle)> = self
                    .paths
                    .iter()
                    .map(|(name, handle)| (name.clone(), handle.clone()))
                    .collect();

                // collected outside the manager task so a slow path cannot
                // stall routing
                tokio::spawn(async move {
                    let mut items = serde_json::Map::new();
                    for (name, handle) in paths {
                        if let Some(item) = handle.api_item().await {
                            if let Ok(value) = serde_json::to_value(item) {
                                items.insert(name, value);
                            }
                        }
                    }
                    let _ = result.send(json!({ "items": items }));
                });
            }

            HubEvent::PathNotInUse { path_name } => {
                self.paths.remove(&path_name);
            }

            HubEvent::PathSourceReady { path_name } => {
                let _ = self.notify_tx.send(PathNotify::SourceReady { path_name });
            }

            HubEvent::PathSourceNotReady { path_name } => {
                let _ = self
                    .notify_tx
                    .send(PathNotify::SourceNotReady { path_name });
            }
        }
    }

    async fn close_all_paths(&mut self) {
        for (_, handle) in self.paths.drain() {
            handle.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::define::{close_signal, DescribeAnswer, PublisherHandle, RequestUrl, SessionKind};
    use crate::track::{MediaKind, Track, TrackParams};
    use crate::utils::new_handle_id;
    use bytes::BytesMut;
    use std::net::IpAddr;

    fn manager_with(paths: Vec<(String, PathConf)>) -> PathManagerHandle {
        let (manager, handle) = PathManager::new(
            PathManagerConfig {
                rtsp_port: 8554,
                stream_config: StreamConfig::default(),
                paths,
            },
            None,
        )
        .unwrap();
        tokio::spawn(manager.run());
        handle
    }

    fn peer() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn h264_tracks() -> Vec<Track> {
        vec![Track::new(
            0,
            MediaKind::Video,
            96,
            90000,
            TrackParams::H264 {
                sps: BytesMut::from(&[0x67, 0x64][..]),
                pps: BytesMut::from(&[0x68, 0xEE][..]),
            },
        )]
    }

    async fn add_publisher(
        handle: &PathManagerHandle,
        name: &str,
    ) -> Result<crate::path::PathHandle, PathError> {
        let (close_tx, _close_rx) = close_signal();
        let (tx, rx) = oneshot::channel();
        handle
            .send(HubEvent::AddPublisher {
                path_name: name.to_string(),
                access: AccessContext::anonymous(peer()),
                publisher: PublisherHandle {
                    id: new_handle_id(),
                    kind: SessionKind::RtspSession,
                    remote_addr: "127.0.0.1:1234".to_string(),
                    close: close_tx,
                },
                result: tx,
            })
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn describe_with_no_publisher_fails() {
        let handle = manager_with(vec![("cam".to_string(), PathConf::default())]);

        let (tx, rx) = oneshot::channel();
        handle
            .send(HubEvent::Describe {
                path_name: "cam".to_string(),
                url: RequestUrl::default(),
                access: AccessContext::anonymous(peer()),
                result: tx,
            })
            .unwrap();

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err.value, PathErrorValue::NoOnePublishing(_)));
    }

    #[tokio::test]
    async fn publish_then_describe_returns_stream() {
        let handle = manager_with(vec![("cam".to_string(), PathConf::default())]);

        let path = add_publisher(&handle, "cam").await.unwrap();
        let publisher_id = {
            // second publisher_start must come from the registered handle
            let item = path.api_item().await.unwrap();
            u64::from_str_radix(&item.source.unwrap().id, 16).unwrap()
        };
        path.publisher_start(publisher_id, h264_tracks())
            .await
            .unwrap();

        let (tx, rx) = oneshot::channel();
        handle
            .send(HubEvent::Describe {
                path_name: "cam".to_string(),
                url: RequestUrl::default(),
                access: AccessContext::anonymous(peer()),
                result: tx,
            })
            .unwrap();

        match rx.await.unwrap().unwrap() {
            DescribeAnswer::Stream { stream } => {
                assert_eq!(stream.tracks().len(), 1);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_publisher_overrides_by_default() {
        let handle = manager_with(vec![("all".to_string(), PathConf::default())]);

        let (close_a_tx, mut close_a_rx) = close_signal();
        let (tx, rx) = oneshot::channel();
        let id_a = new_handle_id();
        handle
            .send(HubEvent::AddPublisher {
                path_name: "all".to_string(),
                access: AccessContext::anonymous(peer()),
                publisher: PublisherHandle {
                    id: id_a,
                    kind: SessionKind::RtspSession,
                    remote_addr: "1.2.3.4:1".to_string(),
                    close: close_a_tx,
                },
                result: tx,
            })
            .unwrap();
        let path = rx.await.unwrap().unwrap();
        path.publisher_start(id_a, h264_tracks()).await.unwrap();

        // B takes the slot, A gets a close signal
        add_publisher(&handle, "all").await.unwrap();
        let reason = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            close_a_rx.recv(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reason, crate::define::CloseReason::Superseded);
    }

    #[tokio::test]
    async fn override_disabled_rejects_second_publisher() {
        let conf = PathConf {
            disable_publisher_override: true,
            ..Default::default()
        };
        let handle = manager_with(vec![("cam".to_string(), conf)]);

        add_publisher(&handle, "cam").await.unwrap();
        let err = add_publisher(&handle, "cam").await.unwrap_err();
        assert!(matches!(err.value, PathErrorValue::AlreadyPublishing(_)));
    }

    #[tokio::test]
    async fn regexp_template_spawns_child_paths() {
        let handle = manager_with(vec![(
            "~^live/(.+)$".to_string(),
            PathConf::default(),
        )]);

        add_publisher(&handle, "live/feed42").await.unwrap();
        add_publisher(&handle, "live/feed43").await.unwrap();
        // names outside the template are rejected
        let err = add_publisher(&handle, "other/feed").await.unwrap_err();
        assert!(matches!(err.value, PathErrorValue::InvalidName(_)));

        let list = handle.paths_list().await;
        let items = list.get("items").unwrap().as_object().unwrap();
        assert!(items.contains_key("live/feed42"));
        assert!(items.contains_key("live/feed43"));
    }

    #[tokio::test]
    async fn auth_failures_are_tiered() {
        let conf = PathConf {
            read_user: "u".to_string(),
            read_pass: "p".to_string(),
            ..Default::default()
        };
        let handle = manager_with(vec![("cam".to_string(), conf)]);

        // no credentials: non-critical
        let (tx, rx) = oneshot::channel();
        handle
            .send(HubEvent::Describe {
                path_name: "cam".to_string(),
                url: RequestUrl::default(),
                access: AccessContext::anonymous(peer()),
                result: tx,
            })
            .unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err.value, PathErrorValue::AuthNotCritical));

        // wrong credentials: critical
        let (tx, rx) = oneshot::channel();
        handle
            .send(HubEvent::Describe {
                path_name: "cam".to_string(),
                url: RequestUrl::default(),
                access: AccessContext {
                    peer_ip: peer(),
                    credentials: baselib::auth::PresentedCredentials::Plain {
                        user: "u".to_string(),
                        pass: "wrong".to_string(),
                    },
                    method: "DESCRIBE".to_string(),
                    query: String::new(),
                },
                result: tx,
            })
            .unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is_critical_auth());
    }

    #[tokio::test]
    async fn on_demand_describe_times_out() {
        let conf = PathConf {
            source: "rtsp://127.0.0.1:1/unreachable".to_string(),
            source_on_demand: true,
            source_on_demand_start_timeout: Some("100ms".to_string()),
            ..Default::default()
        };
        // no source factory: the source can never become ready
        let handle = manager_with(vec![("proxied".to_string(), conf)]);

        let (tx, rx) = oneshot::channel();
        handle
            .send(HubEvent::Describe {
                path_name: "proxied".to_string(),
                url: RequestUrl::default(),
                access: AccessContext::anonymous(peer()),
                result: tx,
            })
            .unwrap();

        let err = tokio::time::timeout(std::time::Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err.value, PathErrorValue::SourceTimeout(_)));
        assert_eq!(
            err.to_string(),
            "source of path 'proxied' has timed out"
        );
    }
}

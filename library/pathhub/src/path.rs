use {
    crate::{
        conf::{PathConf, SourceKind},
        define::{
            ApiId, ApiPathItem, CloseReason, DescribeAnswer, DescribeResultSender, HubEvent,
            HubEventSender, PublisherHandle, ReaderAttachment, ReaderDataSender, ReaderHandle,
            RequestUrl, SessionKind, StaticSourceContext, StaticSourceFactory,
        },
        errors::{PathError, PathErrorValue},
        hooks::HookCommand,
        stream::{StreamConfig, StreamHandle},
        track::Track,
        utils::{new_handle_id, HandleId},
    },
    std::{collections::HashMap, pin::Pin, sync::Arc},
    tokio::sync::{broadcast, mpsc, oneshot},
    tokio::time::Sleep,
};

/// Everything a path needs from its surroundings, fixed at creation.
#[derive(Clone)]
pub struct PathContext {
    pub rtsp_port: u16,
    pub stream_config: StreamConfig,
    pub source_factory: Option<Arc<dyn StaticSourceFactory>>,
    pub hub_tx: HubEventSender,
}

type ReaderAddResult = oneshot::Sender<Result<ReaderAttachment, PathError>>;

pub enum PathRequest {
    Describe {
        url: RequestUrl,
        result: DescribeResultSender,
    },
    PublisherAdd {
        publisher: PublisherHandle,
        result: oneshot::Sender<Result<PathHandle, PathError>>,
    },
    PublisherStart {
        publisher_id: HandleId,
        tracks: Vec<Track>,
        result: oneshot::Sender<Result<StreamHandle, PathError>>,
    },
    PublisherPause {
        publisher_id: HandleId,
        done: oneshot::Sender<()>,
    },
    PublisherRemove {
        publisher_id: HandleId,
        done: oneshot::Sender<()>,
    },
    ReaderAdd {
        reader: ReaderHandle,
        result: ReaderAddResult,
    },
    ReaderStart {
        reader_id: HandleId,
        sender: ReaderDataSender,
        result: oneshot::Sender<Result<(), PathError>>,
    },
    ReaderPause {
        reader_id: HandleId,
        done: oneshot::Sender<()>,
    },
    ReaderRemove {
        reader_id: HandleId,
        done: oneshot::Sender<()>,
    },
    SourceSetReady {
        source_id: HandleId,
        tracks: Vec<Track>,
        result: oneshot::Sender<Result<StreamHandle, PathError>>,
    },
    SourceSetNotReady {
        source_id: HandleId,
        done: oneshot::Sender<()>,
    },
    ApiItem {
        result: oneshot::Sender<ApiPathItem>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Cheap addressable reference to a path actor. Sessions keep this after
/// binding; every call is a request/reply round through the actor channel,
/// so concurrent sessions never touch path state directly.
#[derive(Debug, Clone)]
pub struct PathHandle {
    pub name: String,
    tx: mpsc::UnboundedSender<PathRequest>,
}

impl PathHandle {
    async fn round<T>(
        &self,
        req: PathRequest,
        rx: oneshot::Receiver<Result<T, PathError>>,
    ) -> Result<T, PathError> {
        if self.tx.send(req).is_err() {
            return Err(PathError::terminated());
        }
        rx.await.unwrap_or_else(|_| Err(PathError::terminated()))
    }

    async fn notify(&self, req: PathRequest, rx: oneshot::Receiver<()>) {
        if self.tx.send(req).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn describe(&self, url: RequestUrl, result: DescribeResultSender) {
        if self.tx.send(PathRequest::Describe { url, result: result }).is_err() {
            log::debug!("describe on a terminated path");
        }
    }

    pub fn reader_add(&self, reader: ReaderHandle, result: ReaderAddResult) {
        if self.tx.send(PathRequest::ReaderAdd { reader, result }).is_err() {
            log::debug!("reader_add on a terminated path");
        }
    }

    pub fn publisher_add(
        &self,
        publisher: PublisherHandle,
        result: oneshot::Sender<Result<PathHandle, PathError>>,
    ) {
        if self
            .tx
            .send(PathRequest::PublisherAdd {
                publisher,
                result,
            })
            .is_err()
        {
            log::debug!("publisher_add on a terminated path");
        }
    }

    pub async fn publisher_start(
        &self,
        publisher_id: HandleId,
        tracks: Vec<Track>,
    ) -> Result<StreamHandle, PathError> {
        let (tx, rx) = oneshot::channel();
        self.round(
            PathRequest::PublisherStart {
                publisher_id,
                tracks,
                result: tx,
            },
            rx,
        )
        .await
    }

    pub async fn publisher_pause(&self, publisher_id: HandleId) {
        let (tx, rx) = oneshot::channel();
        self.notify(
            PathRequest::PublisherPause {
                publisher_id,
                done: tx,
            },
            rx,
        )
        .await;
    }

    pub async fn publisher_remove(&self, publisher_id: HandleId) {
        let (tx, rx) = oneshot::channel();
        self.notify(
            PathRequest::PublisherRemove {
                publisher_id,
                done: tx,
            },
            rx,
        )
        .await;
    }

    pub async fn reader_start(
        &self,
        reader_id: HandleId,
        sender: ReaderDataSender,
    ) -> Result<(), PathError> {
        let (tx, rx) = oneshot::channel();
        self.round(
            PathRequest::ReaderStart {
                reader_id,
                sender,
                result: tx,
            },
            rx,
        )
        .await
    }

    pub async fn reader_pause(&self, reader_id: HandleId) {
        let (tx, rx) = oneshot::channel();
        self.notify(PathRequest::ReaderPause { reader_id, done: tx }, rx)
            .await;
    }

    pub async fn reader_remove(&self, reader_id: HandleId) {
        let (tx, rx) = oneshot::channel();
        self.notify(PathRequest::ReaderRemove { reader_id, done: tx }, rx)
            .await;
    }

    pub async fn source_set_ready(
        &self,
        source_id: HandleId,
        tracks: Vec<Track>,
    ) -> Result<StreamHandle, PathError> {
        let (tx, rx) = oneshot::channel();
        self.round(
            PathRequest::SourceSetReady {
                source_id,
                tracks,
                result: tx,
            },
            rx,
        )
        .await
    }

    pub async fn source_set_not_ready(&self, source_id: HandleId) {
        let (tx, rx) = oneshot::channel();
        self.notify(
            PathRequest::SourceSetNotReady {
                source_id,
                done: tx,
            },
            rx,
        )
        .await;
    }

    pub async fn api_item(&self) -> Option<ApiPathItem> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(PathRequest::ApiItem { result: tx }).is_err() {
            return None;
        }
        rx.await.ok()
    }

    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        self.notify(PathRequest::Close { done: tx }, rx).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnDemandState {
    Initial,
    WaitingReady,
    Ready,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    PrePlay,
    Play,
}

enum Slot {
    Empty,
    Redirect,
    Static {
        id: HandleId,
        kind: SessionKind,
        stop: broadcast::Sender<()>,
    },
    Publisher(PublisherHandle),
}

impl Slot {
    fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

pub struct Path {
    conf_name: String,
    conf: PathConf,
    name: String,
    matches: Vec<String>,
    is_regexp_child: bool,
    ctx: PathContext,
    handle: PathHandle,

    slot: Slot,
    source_ready: bool,
    stream: Option<StreamHandle>,
    readers: HashMap<HandleId, (ReaderHandle, ReaderState)>,
    pending_describes: Vec<(RequestUrl, DescribeResultSender)>,
    pending_setups: Vec<(ReaderHandle, ReaderAddResult)>,
    on_demand_state: OnDemandState,

    on_init_cmd: Option<HookCommand>,
    on_demand_cmd: Option<HookCommand>,
    on_ready_cmd: Option<HookCommand>,
    on_publish_cmd: Option<HookCommand>,
    on_read_cmds: HashMap<HandleId, HookCommand>,
}

impl Path {
    /// Create the path and start its actor task.
    pub fn spawn(
        conf_name: String,
        conf: PathConf,
        name: String,
        matches: Vec<String>,
        is_regexp_child: bool,
        ctx: PathContext,
    ) -> PathHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = PathHandle {
            name: name.clone(),
            tx,
        };

        let path = Path {
            conf_name,
            conf,
            name,
            matches,
            is_regexp_child,
            ctx,
            handle: handle.clone(),
            slot: Slot::Empty,
            source_ready: false,
            stream: None,
            readers: HashMap::new(),
            pending_describes: Vec::new(),
            pending_setups: Vec::new(),
            on_demand_state: OnDemandState::Initial,
            on_init_cmd: None,
            on_demand_cmd: None,
            on_ready_cmd: None,
            on_publish_cmd: None,
            on_read_cmds: HashMap::new(),
        };

        tokio::spawn(path.run(rx));
        handle
    }

    fn log_prefix(&self) -> String {
        format!("[path {}]", self.name)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PathRequest>) {
        log::debug!("{} created", self.log_prefix());

        if self.conf.source_kind() == Some(SourceKind::Redirect) {
            self.slot = Slot::Redirect;
        } else if self.conf.has_static_source() && !self.conf.source_on_demand {
            self.static_source_start();
        }

        if !self.conf.run_on_init.is_empty() {
            log::info!("{} runOnInit command started", self.log_prefix());
            self.on_init_cmd = Some(HookCommand::spawn(
                self.conf.run_on_init.clone(),
                self.hook_env(),
                self.conf.run_on_init_restart,
            ));
        }

        let mut ready_timer: Option<Pin<Box<Sleep>>> = None;
        let mut close_timer: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                _ = async { ready_timer.as_mut().unwrap().await }, if ready_timer.is_some() => {
                    ready_timer = None;
                    self.on_ready_timer();
                    if self.should_close() {
                        break;
                    }
                }
                _ = async { close_timer.as_mut().unwrap().await }, if close_timer.is_some() => {
                    close_timer = None;
                    self.on_close_timer();
                    if self.should_close() {
                        break;
                    }
                }
                req = rx.recv() => {
                    let Some(req) = req else {
                        break;
                    };
                    let exit = self.on_request(req, &mut ready_timer, &mut close_timer);
                    if exit || self.should_close() {
                        break;
                    }
                }
            }
        }

        self.tear_down();
        log::debug!("{} destroyed", self.log_prefix());
        let _ = self.ctx.hub_tx.send(HubEvent::PathNotInUse {
            path_name: self.name.clone(),
        });
    }

    /// Returns true when the path received an explicit close.
    fn on_request(
        &mut self,
        req: PathRequest,
        ready_timer: &mut Option<Pin<Box<Sleep>>>,
        close_timer: &mut Option<Pin<Box<Sleep>>>,
    ) -> bool {
        match req {
            PathRequest::Describe { url, result } => {
                self.handle_describe(url, result, ready_timer);
            }
            PathRequest::PublisherAdd { publisher, result } => {
                let _ = result.send(self.handle_publisher_add(publisher));
            }
            PathRequest::PublisherStart {
                publisher_id,
                tracks,
                result,
            } => {
                let _ = result.send(self.handle_publisher_start(
                    publisher_id,
                    tracks,
                    ready_timer,
                    close_timer,
                ));
            }
            PathRequest::PublisherPause { publisher_id, done } => {
                self.handle_publisher_pause(publisher_id, close_timer);
                let _ = done.send(());
            }
            PathRequest::PublisherRemove { publisher_id, done } => {
                if let Slot::Publisher(p) = &self.slot {
                    if p.id == publisher_id {
                        self.do_publisher_remove(close_timer);
                    }
                }
                let _ = done.send(());
            }
            PathRequest::ReaderAdd { reader, result } => {
                self.handle_reader_add(reader, result, ready_timer, close_timer);
            }
            PathRequest::ReaderStart {
                reader_id,
                sender,
                result,
            } => {
                let _ = result.send(self.handle_reader_start(reader_id, sender));
            }
            PathRequest::ReaderPause { reader_id, done } => {
                self.handle_reader_pause(reader_id);
                let _ = done.send(());
            }
            PathRequest::ReaderRemove { reader_id, done } => {
                self.handle_reader_remove(reader_id, close_timer);
                let _ = done.send(());
            }
            PathRequest::SourceSetReady {
                source_id,
                tracks,
                result,
            } => {
                let assigned = matches!(&self.slot, Slot::Static { id, .. } if *id == source_id);
                if assigned {
                    let stream = self.source_set_ready(tracks, ready_timer, close_timer);
                    let _ = result.send(Ok(stream));
                } else {
                    let _ = result.send(Err(PathError::terminated()));
                }
            }
            PathRequest::SourceSetNotReady { source_id, done } => {
                let assigned = matches!(&self.slot, Slot::Static { id, .. } if *id == source_id);
                if assigned {
                    if self.conf.is_on_demand() && self.on_demand_state != OnDemandState::Initial
                    {
                        self.on_demand_close_source(close_timer);
                    } else {
                        self.source_set_not_ready();
                    }
                }
                let _ = done.send(());
            }
            PathRequest::ApiItem { result } => {
                let _ = result.send(self.api_item());
            }
            PathRequest::Close { done } => {
                let _ = done.send(());
                return true;
            }
        }
        false
    }

    fn should_close(&self) -> bool {
        self.is_regexp_child
            && self.slot.is_empty()
            && self.readers.is_empty()
            && self.pending_describes.is_empty()
            && self.pending_setups.is_empty()
    }

    fn hook_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("RTSP_PATH".to_string(), self.name.clone()),
            ("RTSP_PORT".to_string(), self.ctx.rtsp_port.to_string()),
        ];
        for (i, m) in self.matches.iter().skip(1).enumerate() {
            env.push((format!("G{}", i + 1), m.clone()));
        }
        env
    }

    // ---- on-demand machinery ----

    fn on_demand_start_source(&mut self, ready_timer: &mut Option<Pin<Box<Sleep>>>) {
        if self.conf.has_static_source() {
            self.static_source_start();
        } else {
            log::info!("{} runOnDemand command started", self.log_prefix());
            self.on_demand_cmd = Some(HookCommand::spawn(
                self.conf.run_on_demand.clone(),
                self.hook_env(),
                self.conf.run_on_demand_restart,
            ));
        }
        *ready_timer = Some(Box::pin(tokio::time::sleep(
            self.conf.on_demand_start_timeout(),
        )));
        self.on_demand_state = OnDemandState::WaitingReady;
    }

    fn on_demand_schedule_close(&mut self, close_timer: &mut Option<Pin<Box<Sleep>>>) {
        *close_timer = Some(Box::pin(tokio::time::sleep(
            self.conf.on_demand_close_after(),
        )));
        self.on_demand_state = OnDemandState::Closing;
    }

    fn on_demand_close_source(&mut self, close_timer: &mut Option<Pin<Box<Sleep>>>) {
        if self.on_demand_state == OnDemandState::Closing {
            *close_timer = None;
        }

        // state first: do_publisher_remove must not re-enter this branch
        self.on_demand_state = OnDemandState::Initial;

        match std::mem::replace(&mut self.slot, Slot::Empty) {
            Slot::Static { stop, .. } => {
                if self.source_ready {
                    self.source_set_not_ready();
                }
                let _ = stop.send(());
            }
            Slot::Publisher(publisher) => {
                let _ = publisher.close.send(CloseReason::StreamLost);
                if self.source_ready {
                    self.source_set_not_ready();
                }
                if let Some(cmd) = self.on_demand_cmd.take() {
                    cmd.close();
                    log::info!("{} runOnDemand command stopped", self.log_prefix());
                }
            }
            other => {
                self.slot = other;
                if let Some(cmd) = self.on_demand_cmd.take() {
                    cmd.close();
                    log::info!("{} runOnDemand command stopped", self.log_prefix());
                }
            }
        }
    }

    fn on_ready_timer(&mut self) {
        // the on-demand source did not become ready in time
        let err = || PathError {
            value: PathErrorValue::SourceTimeout(self.name.clone()),
        };
        for (_, result) in self.pending_describes.drain(..) {
            let _ = result.send(Err(err()));
        }
        for (_, result) in self.pending_setups.drain(..) {
            let _ = result.send(Err(err()));
        }
        let mut no_timer = None;
        self.on_demand_close_source(&mut no_timer);
    }

    fn on_close_timer(&mut self) {
        let mut no_timer = None;
        self.on_demand_close_source(&mut no_timer);
    }

    // ---- sources ----

    fn static_source_start(&mut self) {
        let Some(factory) = self.ctx.source_factory.clone() else {
            log::error!(
                "{} no source factory available for '{}'",
                self.log_prefix(),
                self.conf.source
            );
            return;
        };

        let source_id = new_handle_id();
        let (stop_tx, stop_rx) = broadcast::channel(1);

        factory.spawn(StaticSourceContext {
            path: self.handle.clone(),
            path_name: self.name.clone(),
            source_id,
            source_url: self.conf.source.clone(),
            conf: self.conf.clone(),
            stop: stop_rx,
        });

        self.slot = Slot::Static {
            id: source_id,
            kind: factory.kind_of(&self.conf.source),
            stop: stop_tx,
        };
    }

    // ---- ready / not ready ----

    fn source_set_ready(
        &mut self,
        tracks: Vec<Track>,
        ready_timer: &mut Option<Pin<Box<Sleep>>>,
        close_timer: &mut Option<Pin<Box<Sleep>>>,
    ) -> StreamHandle {
        let stream = StreamHandle::new(tracks, self.ctx.stream_config);
        self.stream = Some(stream.clone());
        self.source_ready = true;

        if self.conf.is_on_demand() {
            *ready_timer = None;

            for (_, result) in self.pending_describes.drain(..) {
                let _ = result.send(Ok(DescribeAnswer::Stream {
                    stream: stream.clone(),
                }));
            }

            let setups: Vec<_> = self.pending_setups.drain(..).collect();
            for (reader, result) in setups {
                self.readers.insert(reader.id, (reader, ReaderState::PrePlay));
                let _ = result.send(Ok(ReaderAttachment {
                    path: self.handle.clone(),
                    stream: stream.clone(),
                }));
            }

            if !self.readers.is_empty() {
                self.on_demand_state = OnDemandState::Ready;
            } else {
                self.on_demand_schedule_close(close_timer);
            }
        }

        let _ = self.ctx.hub_tx.send(HubEvent::PathSourceReady {
            path_name: self.name.clone(),
        });

        if !self.conf.run_on_ready.is_empty() {
            log::info!("{} runOnReady command started", self.log_prefix());
            self.on_ready_cmd = Some(HookCommand::spawn(
                self.conf.run_on_ready.clone(),
                self.hook_env(),
                self.conf.run_on_ready_restart,
            ));
        }

        stream
    }

    fn source_set_not_ready(&mut self) {
        // all reader attachments are torn down with the stream
        for (id, (reader, state)) in self.readers.drain() {
            if state == ReaderState::Play {
                if let Some(stream) = &self.stream {
                    stream.reader_remove(id);
                }
            }
            let _ = reader.close.send(CloseReason::StreamLost);
        }
        for (_, cmd) in self.on_read_cmds.drain() {
            cmd.close();
        }

        if let Some(cmd) = self.on_ready_cmd.take() {
            cmd.close();
            log::info!("{} runOnReady command stopped", self.log_prefix());
        }
        if let Some(cmd) = self.on_publish_cmd.take() {
            cmd.close();
        }

        self.source_ready = false;

        if let Some(stream) = self.stream.take() {
            stream.close();
        }

        let _ = self.ctx.hub_tx.send(HubEvent::PathSourceNotReady {
            path_name: self.name.clone(),
        });
    }

    fn do_publisher_remove(&mut self, close_timer: &mut Option<Pin<Box<Sleep>>>) {
        if self.source_ready {
            if self.conf.is_on_demand() && self.on_demand_state != OnDemandState::Initial {
                self.on_demand_close_source(close_timer);
                return;
            }
            self.source_set_not_ready();
        }
        self.slot = Slot::Empty;
    }

    // ---- request handlers ----

    fn handle_describe(
        &mut self,
        url: RequestUrl,
        result: DescribeResultSender,
        ready_timer: &mut Option<Pin<Box<Sleep>>>,
    ) {
        if matches!(self.slot, Slot::Redirect) {
            let _ = result.send(Ok(DescribeAnswer::Redirect {
                url: self.conf.source_redirect.clone(),
            }));
            return;
        }

        if self.source_ready {
            let _ = result.send(Ok(DescribeAnswer::Stream {
                stream: self.stream.clone().expect("ready without stream"),
            }));
            return;
        }

        if self.conf.is_on_demand() {
            if self.on_demand_state == OnDemandState::Initial {
                self.on_demand_start_source(ready_timer);
            }
            self.pending_describes.push((url, result));
            return;
        }

        if !self.conf.fallback.is_empty() {
            let fallback = if self.conf.fallback.starts_with('/') {
                // internal reference, rewritten to the caller's host
                format!("{}://{}{}", url.scheme, url.host, self.conf.fallback)
            } else {
                self.conf.fallback.clone()
            };
            let _ = result.send(Ok(DescribeAnswer::Redirect { url: fallback }));
            return;
        }

        let _ = result.send(Err(PathError {
            value: PathErrorValue::NoOnePublishing(self.name.clone()),
        }));
    }

    fn handle_publisher_add(
        &mut self,
        publisher: PublisherHandle,
    ) -> Result<PathHandle, PathError> {
        match &self.slot {
            Slot::Static { .. } | Slot::Redirect => {
                return Err(PathError {
                    value: PathErrorValue::StaticSourceSlot(self.name.clone()),
                });
            }
            Slot::Publisher(existing) => {
                if self.conf.disable_publisher_override {
                    return Err(PathError {
                        value: PathErrorValue::AlreadyPublishing(self.name.clone()),
                    });
                }
                log::info!("{} closing existing publisher", self.log_prefix());
                let _ = existing.close.send(CloseReason::Superseded);
                let mut no_timer = None;
                self.do_publisher_remove(&mut no_timer);
            }
            Slot::Empty => {}
        }

        self.slot = Slot::Publisher(publisher);
        Ok(self.handle.clone())
    }

    fn handle_publisher_start(
        &mut self,
        publisher_id: HandleId,
        tracks: Vec<Track>,
        ready_timer: &mut Option<Pin<Box<Sleep>>>,
        close_timer: &mut Option<Pin<Box<Sleep>>>,
    ) -> Result<StreamHandle, PathError> {
        match &self.slot {
            Slot::Publisher(p) if p.id == publisher_id => {}
            _ => {
                return Err(PathError {
                    value: PathErrorValue::StalePublisher,
                })
            }
        }

        let stream = self.source_set_ready(tracks, ready_timer, close_timer);

        if !self.conf.run_on_publish.is_empty() {
            log::info!("{} runOnPublish command started", self.log_prefix());
            self.on_publish_cmd = Some(HookCommand::spawn(
                self.conf.run_on_publish.clone(),
                self.hook_env(),
                self.conf.run_on_publish_restart,
            ));
        }

        Ok(stream)
    }

    fn handle_publisher_pause(
        &mut self,
        publisher_id: HandleId,
        close_timer: &mut Option<Pin<Box<Sleep>>>,
    ) {
        let matches_slot = matches!(&self.slot, Slot::Publisher(p) if p.id == publisher_id);
        if matches_slot && self.source_ready {
            if self.conf.is_on_demand() && self.on_demand_state != OnDemandState::Initial {
                self.on_demand_close_source(close_timer);
            } else {
                self.source_set_not_ready();
            }
        }
    }

    fn handle_reader_add(
        &mut self,
        reader: ReaderHandle,
        result: ReaderAddResult,
        ready_timer: &mut Option<Pin<Box<Sleep>>>,
        close_timer: &mut Option<Pin<Box<Sleep>>>,
    ) {
        if self.source_ready {
            self.readers.insert(reader.id, (reader, ReaderState::PrePlay));

            if self.conf.is_on_demand() && self.on_demand_state == OnDemandState::Closing {
                self.on_demand_state = OnDemandState::Ready;
                *close_timer = None;
            }

            let _ = result.send(Ok(ReaderAttachment {
                path: self.handle.clone(),
                stream: self.stream.clone().expect("ready without stream"),
            }));
            return;
        }

        if self.conf.is_on_demand() {
            if self.on_demand_state == OnDemandState::Initial {
                self.on_demand_start_source(ready_timer);
            }
            self.pending_setups.push((reader, result));
            return;
        }

        let _ = result.send(Err(PathError {
            value: PathErrorValue::NoOnePublishing(self.name.clone()),
        }));
    }

    fn handle_reader_start(
        &mut self,
        reader_id: HandleId,
        sender: ReaderDataSender,
    ) -> Result<(), PathError> {
        let Some((reader, state)) = self.readers.get_mut(&reader_id) else {
            return Err(PathError::terminated());
        };
        *state = ReaderState::Play;

        let stream = self.stream.as_ref().ok_or_else(PathError::terminated)?;
        stream.reader_add(reader_id, sender, reader.close.clone());

        if !self.conf.run_on_read.is_empty() {
            log::info!("{} runOnRead command started", self.log_prefix());
            self.on_read_cmds.insert(
                reader_id,
                HookCommand::spawn(
                    self.conf.run_on_read.clone(),
                    self.hook_env(),
                    self.conf.run_on_read_restart,
                ),
            );
        }

        Ok(())
    }

    fn handle_reader_pause(&mut self, reader_id: HandleId) {
        if let Some((_, state)) = self.readers.get_mut(&reader_id) {
            if *state == ReaderState::Play {
                *state = ReaderState::PrePlay;
                if let Some(stream) = &self.stream {
                    stream.reader_remove(reader_id);
                }
            }
        }
        if let Some(cmd) = self.on_read_cmds.remove(&reader_id) {
            cmd.close();
            log::info!("{} runOnRead command stopped", self.log_prefix());
        }
    }

    fn handle_reader_remove(
        &mut self,
        reader_id: HandleId,
        close_timer: &mut Option<Pin<Box<Sleep>>>,
    ) {
        if let Some((_, state)) = self.readers.remove(&reader_id) {
            if state == ReaderState::Play {
                if let Some(stream) = &self.stream {
                    stream.reader_remove(reader_id);
                }
            }
        }
        if let Some(cmd) = self.on_read_cmds.remove(&reader_id) {
            cmd.close();
        }

        if self.conf.is_on_demand()
            && self.readers.is_empty()
            && self.on_demand_state == OnDemandState::Ready
        {
            self.on_demand_schedule_close(close_timer);
        }
    }

    fn api_item(&self) -> ApiPathItem {
        let source = match &self.slot {
            Slot::Empty => None,
            Slot::Redirect => Some(ApiId {
                kind: SessionKind::Redirect,
                id: String::new(),
            }),
            Slot::Static { id, kind, .. } => Some(ApiId {
                kind: *kind,
                id: format!("{id:x}"),
            }),
            Slot::Publisher(p) => Some(ApiId {
                kind: p.kind,
                id: format!("{:x}", p.id),
            }),
        };

        ApiPathItem {
            conf_name: self.conf_name.clone(),
            conf: self.conf.clone(),
            source,
            source_ready: self.source_ready,
            readers: self
                .readers
                .values()
                .map(|(r, _)| ApiId {
                    kind: r.kind,
                    id: format!("{:x}", r.id),
                })
                .collect(),
        }
    }

    fn tear_down(&mut self) {
        if let Some(cmd) = self.on_init_cmd.take() {
            cmd.close();
            log::info!("{} runOnInit command stopped", self.log_prefix());
        }

        for (_, result) in self.pending_describes.drain(..) {
            let _ = result.send(Err(PathError::terminated()));
        }
        for (_, result) in self.pending_setups.drain(..) {
            let _ = result.send(Err(PathError::terminated()));
        }

        self.source_set_not_ready();

        match std::mem::replace(&mut self.slot, Slot::Empty) {
            Slot::Static { stop, .. } => {
                let _ = stop.send(());
            }
            Slot::Publisher(publisher) => {
                let _ = publisher.close.send(CloseReason::Terminated);
            }
            _ => {}
        }

        if let Some(cmd) = self.on_demand_cmd.take() {
            cmd.close();
            log::info!("{} runOnDemand command stopped", self.log_prefix());
        }
    }
}

use {
    crate::{
        conf::PathConf,
        errors::PathError,
        path::PathHandle,
        stream::StreamHandle,
        utils::HandleId,
    },
    baselib::auth::PresentedCredentials,
    bytes::BytesMut,
    rtp::RtpPacket,
    serde_derive::Serialize,
    std::net::IpAddr,
    tokio::sync::{broadcast, mpsc, oneshot},
};

/// Media pushed by a publisher into its stream, before format processing.
#[derive(Debug, Clone)]
pub enum StreamInput {
    /// Raw RTP from RTSP-transport publishers.
    Rtp { track_id: usize, packet: RtpPacket },
    /// Already-decoded units from RTMP / HLS / UDP publishers.
    Frame {
        track_id: usize,
        timestamp: u32,
        units: Vec<BytesMut>,
    },
}

/// What RTSP-cohort readers receive: the canonical RTP packets, fanned out
/// without re-packetization.
#[derive(Debug, Clone)]
pub struct PacketData {
    pub track_id: usize,
    pub packet: RtpPacket,
}

/// What non-RTSP readers receive: whole access units in track clock-rate
/// ticks.
#[derive(Debug, Clone)]
pub enum FrameData {
    Video {
        track_id: usize,
        timestamp: u32,
        key_frame: bool,
        nalus: Vec<BytesMut>,
    },
    Audio {
        track_id: usize,
        timestamp: u32,
        frames: Vec<BytesMut>,
    },
}

pub type PacketDataSender = mpsc::Sender<PacketData>;
pub type PacketDataReceiver = mpsc::Receiver<PacketData>;
pub type FrameDataSender = mpsc::Sender<FrameData>;
pub type FrameDataReceiver = mpsc::Receiver<FrameData>;

/// A reader subscribes with one of the two cohort senders; the bounded
/// capacity is `readBufferCount` and overflow drops the reader.
#[derive(Debug, Clone)]
pub enum ReaderDataSender {
    Packet(PacketDataSender),
    Frame(FrameDataSender),
}

/// Why a reader or publisher is being force-closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The reader's queue overflowed; drop the reader, never the stream.
    QueueFull,
    /// The stream went away (publisher left, source closed or replaced).
    StreamLost,
    /// A new publisher took the slot.
    Superseded,
    /// Server shutdown.
    Terminated,
}

pub type CloseSignalSender = mpsc::UnboundedSender<CloseReason>;
pub type CloseSignalReceiver = mpsc::UnboundedReceiver<CloseReason>;

pub fn close_signal() -> (CloseSignalSender, CloseSignalReceiver) {
    mpsc::unbounded_channel()
}

/// Identity tag of every entity that can hold a path role, used by the API
/// and by the RTSP/non-RTSP cohort split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionKind {
    RtspSession,
    RtmpConn,
    HlsMuxer,
    RtspSource,
    RtmpSource,
    HlsSource,
    UdpSource,
    Redirect,
}

impl SessionKind {
    /// RTSP sessions take the raw-RTP fan-out; everything else consumes
    /// decoded units.
    pub fn is_rtsp(&self) -> bool {
        matches!(self, SessionKind::RtspSession)
    }
}

/// Reader role handle stored by the path; backreference to the session is
/// the close signal, never an owning pointer.
#[derive(Debug, Clone)]
pub struct ReaderHandle {
    pub id: HandleId,
    pub kind: SessionKind,
    pub remote_addr: String,
    pub close: CloseSignalSender,
}

#[derive(Debug, Clone)]
pub struct PublisherHandle {
    pub id: HandleId,
    pub kind: SessionKind,
    pub remote_addr: String,
    pub close: CloseSignalSender,
}

/// Authentication material carried by every path-acquiring request.
#[derive(Debug, Clone)]
pub struct AccessContext {
    pub peer_ip: IpAddr,
    pub credentials: PresentedCredentials,
    /// RTSP method for Digest verification; empty elsewhere.
    pub method: String,
    pub query: String,
}

impl AccessContext {
    pub fn anonymous(peer_ip: IpAddr) -> Self {
        Self {
            peer_ip,
            credentials: PresentedCredentials::None,
            method: String::new(),
            query: String::new(),
        }
    }
}

/// Scheme/host of the request URL, needed to rewrite internal fallback
/// references into absolute redirect targets.
#[derive(Debug, Clone, Default)]
pub struct RequestUrl {
    pub scheme: String,
    pub host: String,
}

#[derive(Debug)]
pub enum DescribeAnswer {
    Stream { stream: StreamHandle },
    Redirect { url: String },
}

#[derive(Debug)]
pub struct ReaderAttachment {
    pub path: PathHandle,
    pub stream: StreamHandle,
}

pub type DescribeResultSender = oneshot::Sender<Result<DescribeAnswer, PathError>>;
pub type ReaderAddResultSender = oneshot::Sender<Result<ReaderAttachment, PathError>>;
pub type PublisherAddResultSender = oneshot::Sender<Result<PathHandle, PathError>>;

/// Requests consumed by the PathManager actor.
pub enum HubEvent {
    Describe {
        path_name: String,
        url: RequestUrl,
        access: AccessContext,
        result: DescribeResultSender,
    },
    AddReader {
        path_name: String,
        access: AccessContext,
        reader: ReaderHandle,
        result: ReaderAddResultSender,
    },
    AddPublisher {
        path_name: String,
        access: AccessContext,
        publisher: PublisherHandle,
        result: PublisherAddResultSender,
    },
    FindPath {
        path_name: String,
        result: oneshot::Sender<Option<PathHandle>>,
    },
    /// Pure gate check, no path acquisition: used by the HLS server which
    /// authenticates every HTTP request.
    Authenticate {
        path_name: String,
        access: AccessContext,
        publish: bool,
        result: oneshot::Sender<Result<(), PathError>>,
    },
    ApiPathsList {
        result: oneshot::Sender<serde_json::Value>,
    },
    /// Sent by a path actor when it became garbage-collectable.
    PathNotInUse { path_name: String },
    /// Sent by a path actor on ready transitions; fanned out to
    /// subscribers such as the always-remux HLS server.
    PathSourceReady { path_name: String },
    PathSourceNotReady { path_name: String },
}

/// Broadcast notification stream mirrored from path ready transitions.
#[derive(Debug, Clone)]
pub enum PathNotify {
    SourceReady { path_name: String },
    SourceNotReady { path_name: String },
}

pub type HubEventSender = mpsc::UnboundedSender<HubEvent>;
pub type HubEventReceiver = mpsc::UnboundedReceiver<HubEvent>;

/// API snapshot shapes (`GET /v1/paths/list`).
#[derive(Debug, Clone, Serialize)]
pub struct ApiId {
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPathItem {
    pub conf_name: String,
    pub conf: PathConf,
    pub source: Option<ApiId>,
    pub source_ready: bool,
    pub readers: Vec<ApiId>,
}

/// Context handed to a spawned static source task. The task connects,
/// declares tracks with `path.source_set_ready`, forwards media into the
/// returned stream, retries with a 5 s pause on failure, and exits when
/// `stop` fires.
pub struct StaticSourceContext {
    pub path: PathHandle,
    pub path_name: String,
    pub source_id: HandleId,
    pub source_url: String,
    pub conf: PathConf,
    pub stop: broadcast::Receiver<()>,
}

/// Implemented by the application: bridges the path core to the
/// protocol-specific pull clients without a dependency cycle.
pub trait StaticSourceFactory: Send + Sync + 'static {
    /// Spawn the task for `ctx.source_url`; classification already
    /// happened, the URL is one of the supported source schemes.
    fn spawn(&self, ctx: StaticSourceContext);

    /// API identity tag for the given source URL.
    fn kind_of(&self, source_url: &str) -> SessionKind;
}

pub const SOURCE_RETRY_PAUSE_SECS: u64 = 5;

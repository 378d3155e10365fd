use {
    crate::config::{
        config::{address_port, normalize_address, parse_duration},
        Config,
    },
    anyhow::Result,
    pathhub::{
        conf::{classify_source, SourceKind},
        define::{SessionKind, StaticSourceContext, StaticSourceFactory},
        manager::{PathManager, PathManagerConfig, PathManagerHandle},
        stream::StreamConfig,
    },
    std::sync::Arc,
};

/// Bridges the path core to the protocol pull clients.
struct SourceFactory;

impl StaticSourceFactory for SourceFactory {
    fn spawn(&self, ctx: StaticSourceContext) {
        match classify_source(&ctx.source_url) {
            Some(SourceKind::Rtsp) => rtsp::source::spawn(ctx),
            Some(SourceKind::Rtmp) => rtmp::source::spawn(ctx),
            Some(SourceKind::Hls) => hls::hls_source::spawn(ctx),
            Some(SourceKind::Udp) => hls::udp_source::spawn(ctx),
            _ => {
                log::error!(
                    "no static source driver for '{}' of path '{}'",
                    ctx.source_url,
                    ctx.path_name
                );
            }
        }
    }

    fn kind_of(&self, source_url: &str) -> SessionKind {
        match classify_source(source_url) {
            Some(SourceKind::Rtmp) => SessionKind::RtmpSource,
            Some(SourceKind::Hls) => SessionKind::HlsSource,
            Some(SourceKind::Udp) => SessionKind::UdpSource,
            _ => SessionKind::RtspSource,
        }
    }
}

pub struct Service {
    config: Config,
    pub hub: PathManagerHandle,
    pub rtsp_shared: Option<Arc<rtsp::server::ServerShared>>,
    pub rtmp_shared: Option<Arc<rtmp::server::ServerShared>>,
    pub hls_server: Option<Arc<hls::server::HlsServer>>,
}

impl Service {
    /// Build the path manager and every enabled listener; listeners start
    /// running in their own tasks. Bind failures surface here so startup
    /// can fail with a non-zero exit.
    pub async fn start(config: Config) -> Result<Self> {
        let rtsp_port = address_port(&config.rtsp_address)
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;

        let stream_config = StreamConfig {
            read_buffer_count: config.read_buffer_count,
            udp_max_payload_size: 1472,
        };

        let manager_config = PathManagerConfig {
            rtsp_port,
            stream_config,
            paths: config
                .paths
                .iter()
                .map(|(name, conf)| (name.clone(), conf.clone()))
                .collect(),
        };

        let (manager, hub) = PathManager::new(manager_config, Some(Arc::new(SourceFactory)))
            .map_err(|err| anyhow::anyhow!(err.to_string()))?;
        tokio::spawn(manager.run());

        let read_timeout = parse_duration(&config.read_timeout)?;
        let write_timeout = parse_duration(&config.write_timeout)?;

        let mut service = Service {
            config: config.clone(),
            hub: hub.clone(),
            rtsp_shared: None,
            rtmp_shared: None,
            hls_server: None,
        };

        if !config.rtsp_disable {
            let protocols = rtsp::server::AllowedProtocols {
                udp: config.protocols.iter().any(|p| p == "udp")
                    && config.encryption != "strict",
                multicast: config.protocols.iter().any(|p| p == "multicast")
                    && config.encryption != "strict",
                tcp: config.protocols.iter().any(|p| p == "tcp"),
            };

            let with_tls = config.encryption != "no";
            let rtsp_config = rtsp::server::RtspServerConfig {
                address: normalize_address(&config.rtsp_address),
                tls_address: with_tls.then(|| normalize_address(&config.rtsps_address)),
                server_cert: with_tls.then(|| config.server_cert.clone()),
                server_key: with_tls.then(|| config.server_key.clone()),
                rtp_port: address_port(&config.rtp_address)
                    .map_err(|err| anyhow::anyhow!(err.to_string()))?,
                rtcp_port: address_port(&config.rtcp_address)
                    .map_err(|err| anyhow::anyhow!(err.to_string()))?,
                multicast_ip_range: config.multicast_i_p_range.clone(),
                multicast_rtp_port: config.multicast_rtp_port,
                multicast_rtcp_port: config.multicast_rtcp_port,
                protocols,
                auth_methods: config.auth_methods_parsed(),
                read_timeout,
                write_timeout,
            };

            let server = rtsp::server::RtspServer::new(rtsp_config, hub.clone());
            service.rtsp_shared = Some(server.shared.clone());
            tokio::spawn(async move {
                if let Err(err) = server.run().await {
                    log::error!("rtsp server error: {}", err);
                    std::process::exit(1);
                }
            });
        }

        if !config.rtmp_disable {
            let rtmp_config = rtmp::server::RtmpServerConfig {
                address: normalize_address(&config.rtmp_address),
                read_timeout,
                write_timeout,
            };
            let server = rtmp::server::RtmpServer::new(rtmp_config, hub.clone());
            service.rtmp_shared = Some(server.shared.clone());
            tokio::spawn(async move {
                if let Err(err) = server.run().await {
                    log::error!("rtmp server error: {}", err);
                    std::process::exit(1);
                }
            });
        }

        if !config.hls_disable {
            let variant = if config.hls_variant == "lowLatency" {
                hls::muxer::HlsVariant::LowLatency
            } else {
                hls::muxer::HlsVariant::MpegTs
            };
            let hls_config = hls::server::HlsServerConfig {
                address: normalize_address(&config.hls_address),
                allow_origin: config.hls_allow_origin.clone(),
                muxer: hls::muxer::HlsMuxerConfig {
                    variant,
                    segment_count: config.hls_segment_count,
                    segment_duration: parse_duration(&config.hls_segment_duration)?,
                    part_duration: parse_duration(&config.hls_part_duration)?,
                    close_after_inactivity: std::time::Duration::from_secs(60),
                    always_remux: config.hls_always_remux,
                },
            };
            let server = Arc::new(hls::server::HlsServer::new(hls_config, hub.clone()));
            service.hls_server = Some(server.clone());
            tokio::spawn(async move {
                if let Err(err) = server.run().await {
                    log::error!("hls server error: {}", err);
                    std::process::exit(1);
                }
            });
        }

        if config.api {
            let api = crate::api::ApiState {
                hub: hub.clone(),
                rtsp_shared: service.rtsp_shared.clone(),
                rtmp_shared: service.rtmp_shared.clone(),
                hls_server: service.hls_server.clone(),
            };
            let address = normalize_address(&config.api_address);
            tokio::spawn(async move {
                crate::api::run(api, address).await;
            });
        }

        log::info!("medley started");
        Ok(service)
    }

    pub async fn shutdown(&self) {
        log::info!("shutting down");
        self.hub.shutdown().await;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

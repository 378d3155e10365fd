use {
    crate::{errors::HlsError, ts_bridge::TsBridge},
    pathhub::{
        define::{StaticSourceContext, SOURCE_RETRY_PAUSE_SECS},
        path::PathHandle,
        utils::HandleId,
    },
    std::{collections::VecDeque, time::Duration},
};

/// Pull an upstream HLS stream: poll the media playlist, fetch new
/// segments in order and feed them through the transport-stream bridge.
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
                        "[hls source {}] disconnected: {}, retrying in {}s",
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

/// Segment URIs of a media playlist, in order.
fn playlist_segments(playlist: &str) -> Vec<String> {
    playlist
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| l.to_string())
        .collect()
}

fn target_duration(playlist: &str) -> Duration {
    for line in playlist.lines() {
        if let Some(value) = line.trim().strip_prefix("#EXT-X-TARGETDURATION:") {
            if let Ok(secs) = value.trim().parse::<u64>() {
                return Duration::from_secs(secs.max(1));
            }
        }
    }
    Duration::from_secs(2)
}

fn resolve(base: &str, uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return uri.to_string();
    }
    match base.rfind('/') {
        Some(idx) => format!("{}/{}", &base[..idx], uri),
        None => uri.to_string(),
    }
}

async fn run_once(
    path: &PathHandle,
    path_name: &str,
    source_id: HandleId,
    source_url: &str,
) -> Result<(), HlsError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|err| HlsError::upstream(&err.to_string()))?;

    let mut bridge = TsBridge::new();
    let mut seen: VecDeque<String> = VecDeque::new();
    log::info!("[hls source {}] started", path_name);

    loop {
        let playlist = client
            .get(source_url)
            .send()
            .await
            .map_err(|err| HlsError::upstream(&err.to_string()))?
            .error_for_status()
            .map_err(|err| HlsError::upstream(&err.to_string()))?
            .text()
            .await
            .map_err(|err| HlsError::upstream(&err.to_string()))?;

        let wait = target_duration(&playlist) / 2;

        for uri in playlist_segments(&playlist) {
            if seen.contains(&uri) {
                continue;
            }
            seen.push_back(uri.clone());
            while seen.len() > 64 {
                seen.pop_front();
            }

            let segment_url = resolve(source_url, &uri);
            let data = client
                .get(&segment_url)
                .send()
                .await
                .map_err(|err| HlsError::upstream(&err.to_string()))?
                .error_for_status()
                .map_err(|err| HlsError::upstream(&err.to_string()))?
                .bytes()
                .await
                .map_err(|err| HlsError::upstream(&err.to_string()))?;

            if bridge.push(&data, path, source_id).await? && bridge.is_ready() {
                log::info!("[hls source {}] ready", path_name);
            }
        }

        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playlist_parsing() {
        let playlist = "#EXTM3U\r\n\
            #EXT-X-TARGETDURATION:4\r\n\
            #EXT-X-MEDIA-SEQUENCE:3\r\n\
            #EXTINF:4.000,\r\n\
            seg3.ts\r\n\
            #EXTINF:4.000,\r\n\
            seg4.ts\r\n";
        assert_eq!(playlist_segments(playlist), ["seg3.ts", "seg4.ts"]);
        assert_eq!(target_duration(playlist), Duration::from_secs(4));
    }

    #[test]
    fn uri_resolution() {
        assert_eq!(
            resolve("http://h/live/stream.m3u8", "seg1.ts"),
            "http://h/live/seg1.ts"
        );
        assert_eq!(
            resolve("http://h/live/stream.m3u8", "http://other/x.ts"),
            "http://other/x.ts"
        );
    }
}

//! Camera discovery: the vehicle publishes its address and the console
//! derives the stream url from it.

use std::sync::Arc;

use bytes::Bytes;
use futures::{FutureExt, future::BoxFuture};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{info, warn};

use crate::{
    capture::{FrameFetcher, FrameSlot, HttpFetcher, MjpegStream},
    channel::TelemetryChannel,
    config::CameraConfig,
    error::Error,
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CameraFeed {
    /// Nothing delivered from the store yet.
    #[default]
    Waiting,
    Streaming {
        ip: String,
        url: String,
    },
    /// The vehicle has not published an address.
    Missing,
}

impl CameraFeed {
    pub fn from_ip(ip: Option<&str>, port: u16) -> Self {
        match ip.map(str::trim).filter(|ip| !ip.is_empty()) {
            Some(ip) => CameraFeed::Streaming {
                ip: ip.to_string(),
                url: format!("http://{ip}:{port}/stream"),
            },
            None => CameraFeed::Missing,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            CameraFeed::Streaming { url, .. } => Some(url),
            _ => None,
        }
    }
}

/// Follows the camera address and keeps `slot` fed from whatever stream it
/// points at.
pub struct CameraWatcher {
    feed: watch::Receiver<CameraFeed>,
    task: JoinHandle<()>,
}

impl CameraWatcher {
    pub fn spawn(
        channel: &TelemetryChannel,
        config: &CameraConfig,
        client: reqwest::Client,
        slot: Arc<FrameSlot>,
    ) -> Self {
        let (tx, feed) = watch::channel(CameraFeed::Waiting);
        let mut ips = channel.subscribe::<String>(&config.ip_path);
        let port = config.stream_port;
        let task = tokio::spawn(async move {
            // dropping the guard stops the stream, including when this task is aborted
            let mut stream: Option<DropGuard> = None;
            while let Some(ip) = ips.next().await {
                let next = CameraFeed::from_ip(ip.as_deref(), port);
                if *tx.borrow() == next {
                    continue;
                }
                stream = None;
                slot.clear();
                match &next {
                    CameraFeed::Streaming { url, .. } => {
                        info!(%url, "camera found");
                        let cancel = CancellationToken::new();
                        MjpegStream::new(client.clone(), url.clone(), slot.clone())
                            .spawn(cancel.clone());
                        stream = Some(cancel.drop_guard());
                    }
                    _ => warn!("no camera address published"),
                }
                tx.send_replace(next);
            }
            drop(stream);
        });
        Self { feed, task }
    }

    pub fn feed(&self) -> CameraFeed {
        self.feed.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CameraFeed> {
        self.feed.clone()
    }
}

impl Drop for CameraWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Direct frame fetches against the currently discovered camera.
pub struct CameraFetcher {
    http: HttpFetcher,
    feed: watch::Receiver<CameraFeed>,
}

impl CameraFetcher {
    pub fn new(http: HttpFetcher, feed: watch::Receiver<CameraFeed>) -> Self {
        Self { http, feed }
    }
}

impl FrameFetcher for CameraFetcher {
    fn fetch(&self) -> BoxFuture<'_, Result<Bytes, Error>> {
        let url = self.feed.borrow().url().map(str::to_string);
        async move {
            let url = url.ok_or(Error::CaptureUnavailable)?;
            self.http.fetch_from(&url).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{paths, store::MemoryStore};
    use std::time::Duration;

    #[test]
    fn stream_url_from_ip() {
        assert_eq!(
            CameraFeed::from_ip(Some(" 192.168.4.7 "), 81).url(),
            Some("http://192.168.4.7:81/stream")
        );
        assert_eq!(CameraFeed::from_ip(Some(""), 81), CameraFeed::Missing);
        assert_eq!(CameraFeed::from_ip(None, 81), CameraFeed::Missing);
    }

    #[tokio::test]
    async fn missing_address_is_reported_after_first_delivery() {
        let channel = TelemetryChannel::new(Arc::new(MemoryStore::new()));
        let watcher = CameraWatcher::spawn(
            &channel,
            &CameraConfig::default(),
            reqwest::Client::new(),
            Arc::new(FrameSlot::new()),
        );
        let mut feed = watcher.watch();
        feed.wait_for(|f| *f == CameraFeed::Missing).await.unwrap();

        // an unroutable address; the stream task just keeps retrying
        channel.write(paths::CAMERA_IP, "127.0.0.1").await.unwrap();
        feed.wait_for(|f| f.url().is_some()).await.unwrap();
        assert_eq!(watcher.feed().url(), Some("http://127.0.0.1:81/stream"));
    }

    #[tokio::test]
    async fn fetcher_without_camera_is_unavailable() {
        let (_tx, rx) = watch::channel(CameraFeed::Missing);
        let fetcher = CameraFetcher::new(
            HttpFetcher::new(reqwest::Client::new(), Duration::from_millis(100)),
            rx,
        );
        assert!(matches!(fetcher.fetch().await, Err(Error::CaptureUnavailable)));
    }
}

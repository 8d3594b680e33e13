//! Where captured frames come from: a direct fetch of the camera url, or the
//! frame already on screen.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, future::BoxFuture};
use image::{DynamicImage, ImageFormat};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;

/// A stream that buffers this much without yielding a frame is resynchronized.
const MAX_FRAME_BYTES: usize = 4 << 20;

/// Pulls one encoded frame straight from the camera.
pub trait FrameFetcher: Send + Sync + 'static {
    fn fetch(&self) -> BoxFuture<'_, Result<Bytes, Error>>;
}

/// A frame that is already being displayed. `None` until it has fully
/// loaded with nonzero dimensions.
pub trait FrameElement: Send + Sync + 'static {
    fn frame(&self) -> Option<Arc<DynamicImage>>;
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Fetches `url` with a cache-busting query and returns the first complete
    /// JPEG in the body. Works against both stills and MJPEG streams.
    pub async fn fetch_from(&self, url: &str) -> Result<Bytes, Error> {
        let url = cache_busted(url, now_millis());
        debug!(%url, "fetching frame");
        tokio::time::timeout(self.timeout, self.first_frame(&url)).await?
    }

    async fn first_frame(&self, url: &str) -> Result<Bytes, Error> {
        let res = self.client.get(url).send().await?.error_for_status()?;
        let mut body = res.bytes_stream();
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
            if let Some(frame) = take_jpeg(&mut buf) {
                return Ok(frame);
            }
        }
        if buf.is_empty() {
            return Err(Error::CaptureUnavailable);
        }
        // not a jpeg; let the decoder sort it out
        Ok(buf.freeze())
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

pub fn cache_busted(url: &str, t: u128) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}t={t}")
}

/// Splits the first complete JPEG (SOI through EOI) off the front of `buf`,
/// discarding anything before it.
pub fn take_jpeg(buf: &mut BytesMut) -> Option<Bytes> {
    let start = find(buf, &[0xFF, 0xD8], 0)?;
    let end = find(buf, &[0xFF, 0xD9], start + 2)? + 2;
    let _ = buf.split_to(start);
    Some(buf.split_to(end - start).freeze())
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|i| i + from)
}

pub fn decode_frame(bytes: &[u8]) -> Result<DynamicImage, Error> {
    let img = match image::guess_format(bytes) {
        Ok(format) => image::load_from_memory_with_format(bytes, format)?,
        Err(_) => image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)?,
    };
    if img.width() == 0 || img.height() == 0 {
        return Err(Error::InvalidImage);
    }
    Ok(img)
}

#[derive(Default)]
struct SlotState {
    frame: Option<Arc<DynamicImage>>,
    error: Option<String>,
}

/// The frame currently rendered in the video panel.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, frame: DynamicImage) {
        if let Ok(mut state) = self.state.lock() {
            state.frame = Some(Arc::new(frame));
            state.error = None;
        }
    }

    pub fn set_encoded(&self, bytes: &[u8]) -> Result<(), Error> {
        self.set(decode_frame(bytes)?);
        Ok(())
    }

    /// Drops the current frame and remembers why.
    pub fn mark_stale(&self, error: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.frame = None;
            state.error = Some(error.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = SlotState::default();
        }
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().ok()?.error.clone()
    }
}

impl FrameElement for FrameSlot {
    fn frame(&self) -> Option<Arc<DynamicImage>> {
        let state = self.state.lock().ok()?;
        state
            .frame
            .clone()
            .filter(|f| f.width() > 0 && f.height() > 0)
    }
}

/// Keeps a [`FrameSlot`] fed from an MJPEG stream, reconnecting on failure.
pub struct MjpegStream {
    client: reqwest::Client,
    url: String,
    slot: Arc<FrameSlot>,
    reconnect: Duration,
}

impl MjpegStream {
    pub fn new(client: reqwest::Client, url: impl Into<String>, slot: Arc<FrameSlot>) -> Self {
        Self {
            client,
            url: url.into(),
            slot,
            reconnect: Duration::from_secs(1),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.run() => {}
            }
        })
    }

    async fn run(&self) {
        loop {
            match self.stream().await {
                Ok(()) => {
                    info!(url = %self.url, "camera stream ended");
                    self.slot.mark_stale("camera stream ended");
                }
                Err(err) => {
                    warn!(url = %self.url, %err, "camera stream failed");
                    self.slot.mark_stale(err.to_string());
                }
            }
            tokio::time::sleep(self.reconnect).await;
        }
    }

    async fn stream(&self) -> Result<(), Error> {
        let res = self.client.get(&self.url).send().await?.error_for_status()?;
        info!(url = %self.url, "camera stream connected");
        let mut body = res.bytes_stream();
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
            while let Some(frame) = take_jpeg(&mut buf) {
                if let Err(err) = self.slot.set_encoded(&frame) {
                    debug!(%err, "skipping undecodable frame");
                }
            }
            if buf.len() > MAX_FRAME_BYTES {
                warn!(url = %self.url, bytes = buf.len(), "no frame boundary, dropping buffer");
                buf.clear();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn cache_buster_respects_existing_query() {
        assert_eq!(
            cache_busted("http://10.0.0.7:81/stream", 42),
            "http://10.0.0.7:81/stream?t=42"
        );
        assert_eq!(
            cache_busted("http://cam/capture?res=hi", 42),
            "http://cam/capture?res=hi&t=42"
        );
    }

    #[test]
    fn multipart_body_splits_into_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        buf.extend_from_slice(&[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        buf.extend_from_slice(b"\r\n--frame\r\n\r\n");
        buf.extend_from_slice(&[0xFF, 0xD8, 0x03]);

        let first = take_jpeg(&mut buf).unwrap();
        assert_eq!(&first[..], &[0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9]);
        // second frame is incomplete
        assert!(take_jpeg(&mut buf).is_none());
        buf.extend_from_slice(&[0xFF, 0xD9]);
        assert_eq!(&take_jpeg(&mut buf).unwrap()[..], &[0xFF, 0xD8, 0x03, 0xFF, 0xD9]);
    }

    #[test]
    fn slot_reports_loaded_frames_only() {
        let slot = FrameSlot::new();
        assert!(slot.frame().is_none());
        slot.set(DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, Rgb([1, 2, 3]))));
        assert_eq!(slot.frame().unwrap().width(), 4);

        slot.mark_stale("connection reset");
        assert!(slot.frame().is_none());
        assert_eq!(slot.error().as_deref(), Some("connection reset"));

        slot.set(DynamicImage::new_rgb8(0, 0));
        assert!(slot.frame().is_none());
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(decode_frame(b"definitely not an image").is_err());
    }
}

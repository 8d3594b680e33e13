//! Frame capture with a fallback ladder that always yields a result.
//!
//! A capture tries, in order: a direct fetch of the camera, the frame
//! already rendered in the video panel (retried while it loads), and finally
//! the embedded placeholder. Every failure along the way is logged and
//! absorbed; [`CapturePipeline::capture`] cannot fail.

use std::sync::Arc;

use image::{DynamicImage, RgbImage};
use tracing::{debug, info, warn};

use crate::{
    classifier::Classifier,
    codec::{ImageData, is_jpeg},
    config::CaptureConfig,
    error::Error,
};

mod fallback;
pub mod raster;
pub mod source;

pub use fallback::{UNKNOWN_LABEL, placeholder};
use raster::{RasterSurface, encode_jpeg};
pub use source::{FrameElement, FrameFetcher, FrameSlot, HttpFetcher, MjpegStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Return as soon as an image is in hand; never touches the model.
    Fire,
    /// Wait for the model and classify the frame.
    Analysis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    Direct,
    Rendered,
    Placeholder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub image: ImageData,
    pub label: String,
    pub confidences: Option<Vec<f32>>,
    pub source: CaptureSource,
}

impl CaptureResult {
    pub fn is_placeholder(&self) -> bool {
        self.source == CaptureSource::Placeholder
    }
}

/// A frame that made it through the surface and the encoder.
struct Captured {
    raster: RgbImage,
    jpeg: Vec<u8>,
    source: CaptureSource,
}

pub struct CapturePipeline {
    fetcher: Option<Arc<dyn FrameFetcher>>,
    element: Option<Arc<dyn FrameElement>>,
    classifier: Classifier,
    config: CaptureConfig,
}

impl CapturePipeline {
    pub fn new(classifier: Classifier, config: CaptureConfig) -> Self {
        Self {
            fetcher: None,
            element: None,
            classifier,
            config,
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn FrameFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_element(mut self, element: Arc<dyn FrameElement>) -> Self {
        self.element = Some(element);
        self
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub async fn capture(&self, mode: CaptureMode) -> CaptureResult {
        let Some(captured) = self.grab().await else {
            warn!(?mode, "no usable frame, substituting placeholder");
            return placeholder();
        };
        info!(?mode, source = ?captured.source, bytes = captured.jpeg.len(), "frame captured");
        let image = ImageData::from_jpeg(&captured.jpeg);
        match mode {
            CaptureMode::Fire => CaptureResult {
                image,
                label: UNKNOWN_LABEL.to_string(),
                confidences: None,
                source: captured.source,
            },
            CaptureMode::Analysis => match self.classifier.classify(&captured.raster).await {
                Ok(prediction) => {
                    info!(label = %prediction.label, confidences = ?prediction.confidences, "classified");
                    CaptureResult {
                        image,
                        label: prediction.label,
                        confidences: Some(prediction.confidences),
                        source: captured.source,
                    }
                }
                Err(err) => {
                    warn!(%err, "classification unavailable");
                    CaptureResult {
                        image,
                        label: UNKNOWN_LABEL.to_string(),
                        confidences: None,
                        source: captured.source,
                    }
                }
            },
        }
    }

    async fn grab(&self) -> Option<Captured> {
        match self.direct().await {
            Ok(captured) => return Some(captured),
            Err(err) => debug!(%err, "direct capture failed"),
        }
        match self.rendered().await {
            Ok(captured) => Some(captured),
            Err(err) => {
                debug!(%err, "rendered capture failed");
                None
            }
        }
    }

    async fn direct(&self) -> Result<Captured, Error> {
        let fetcher = self.fetcher.as_ref().ok_or(Error::CaptureUnavailable)?;
        let bytes = fetcher.fetch().await?;
        let frame = source::decode_frame(&bytes)?;
        self.render(&frame, CaptureSource::Direct)
    }

    async fn rendered(&self) -> Result<Captured, Error> {
        let element = self.element.as_ref().ok_or(Error::CaptureUnavailable)?;
        let attempts = self.config.retry_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(frame) = element.frame() {
                return self.render(&frame, CaptureSource::Rendered);
            }
            debug!(attempt, attempts, "rendered frame not loaded yet");
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_interval()).await;
            }
        }
        Err(Error::CaptureUnavailable)
    }

    fn render(&self, frame: &DynamicImage, source: CaptureSource) -> Result<Captured, Error> {
        let raster = RasterSurface::shared().draw(frame, self.config.input_size)?;
        let jpeg = encode_jpeg(&raster, self.config.jpeg_quality)?;
        if !is_jpeg(&jpeg) {
            return Err(Error::InvalidImage);
        }
        Ok(Captured {
            raster,
            jpeg,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{FutureExt, future::BoxFuture};
    use image::{Rgb, RgbImage};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    struct Unreachable;

    impl FrameFetcher for Unreachable {
        fn fetch(&self) -> BoxFuture<'_, Result<Bytes, Error>> {
            async { Err(Error::Timeout) }.boxed()
        }
    }

    struct Fixed(Bytes);

    impl FrameFetcher for Fixed {
        fn fetch(&self) -> BoxFuture<'_, Result<Bytes, Error>> {
            let bytes = self.0.clone();
            async move { Ok(bytes) }.boxed()
        }
    }

    /// Reports loaded after a number of polls.
    struct SlowElement {
        polls: AtomicUsize,
        ready_after: usize,
    }

    impl FrameElement for SlowElement {
        fn frame(&self) -> Option<Arc<DynamicImage>> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            (n >= self.ready_after).then(|| {
                Arc::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                    32,
                    24,
                    Rgb([200, 10, 10]),
                )))
            })
        }
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            input_size: 16,
            ..CaptureConfig::default()
        }
    }

    fn jpeg_of(px: [u8; 3]) -> Bytes {
        let raster = RgbImage::from_pixel(20, 20, Rgb(px));
        Bytes::from(encode_jpeg(&raster, 90).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_available_yields_placeholder() {
        let pipeline = CapturePipeline::new(Classifier::new(), config())
            .with_fetcher(Arc::new(Unreachable))
            .with_element(Arc::new(FrameSlot::new()));
        let started = tokio::time::Instant::now();
        let result = pipeline.capture(CaptureMode::Analysis).await;
        assert_eq!(result, placeholder());
        // five attempts, four waits in between
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn direct_fetch_wins() {
        let pipeline = CapturePipeline::new(Classifier::new(), config())
            .with_fetcher(Arc::new(Fixed(jpeg_of([0, 200, 0]))));
        let result = pipeline.capture(CaptureMode::Fire).await;
        assert_eq!(result.source, CaptureSource::Direct);
        assert_eq!(result.label, UNKNOWN_LABEL);
        assert!(result.confidences.is_none());
        let decoded = image::load_from_memory(&result.image.decode_jpeg().unwrap()).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_fetch_falls_through_to_rendered_frame() {
        let element = Arc::new(SlowElement {
            polls: AtomicUsize::new(0),
            ready_after: 3,
        });
        let pipeline = CapturePipeline::new(Classifier::new(), config())
            .with_fetcher(Arc::new(Fixed(Bytes::from_static(b"<html>offline</html>"))))
            .with_element(element.clone());
        let result = pipeline.capture(CaptureMode::Fire).await;
        assert_eq!(result.source, CaptureSource::Rendered);
        assert_eq!(element.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn element_that_never_loads_is_bounded() {
        let element = Arc::new(SlowElement {
            polls: AtomicUsize::new(0),
            ready_after: usize::MAX,
        });
        let pipeline = CapturePipeline::new(Classifier::new(), config()).with_element(element.clone());
        assert!(pipeline.capture(CaptureMode::Fire).await.is_placeholder());
        assert_eq!(element.polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn analysis_without_model_keeps_the_frame() {
        let pipeline = CapturePipeline::new(Classifier::new(), config())
            .with_fetcher(Arc::new(Fixed(jpeg_of([10, 10, 10]))));
        let result = pipeline.capture(CaptureMode::Analysis).await;
        assert_eq!(result.source, CaptureSource::Direct);
        assert_eq!(result.label, UNKNOWN_LABEL);
    }
}

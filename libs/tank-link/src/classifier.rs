//! Image classification: the model lifecycle and the tensor conversion in
//! front of it.
//!
//! The model is loaded at most once per session. Readiness is a single
//! [`watch`] value that every consumer awaits; nothing polls.

use std::{fmt, path::PathBuf, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use image::{RgbImage, imageops::FilterType};
use serde::Deserialize;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{capture::UNKNOWN_LABEL, error::Error};

pub const DEFAULT_LABELS: [&str; 2] = ["IDF", "ENEMY"];

/// Batched NHWC tensor with values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl Tensor {
    /// Resizes `raster` to `size`×`size` (nearest neighbour), scales channels
    /// to `[0, 1]` and adds the batch dimension.
    pub fn from_raster(raster: &RgbImage, size: u32) -> Self {
        let resized;
        let raster = if raster.dimensions() == (size, size) {
            raster
        } else {
            resized = image::imageops::resize(raster, size, size, FilterType::Nearest);
            &resized
        };
        let data = raster
            .pixels()
            .flat_map(|p| p.0)
            .map(|c| c as f32 / 255.0)
            .collect();
        let size = size as usize;
        Tensor {
            shape: [1, size, size, 3],
            data,
        }
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    fn pixel(&self, y: usize, x: usize) -> &[f32] {
        let [_, _, w, c] = self.shape;
        let i = (y * w + x) * c;
        &self.data[i..i + c]
    }
}

/// Index of the largest value, first one wins on ties. NaN never wins.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

pub trait Model: Send + Sync + 'static {
    fn input_size(&self) -> u32;
    fn labels(&self) -> &[String];
    /// One confidence per label.
    fn predict(&self, input: &Tensor) -> Result<Vec<f32>, Error>;
}

pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn Model>, Error>>;
}

#[derive(Clone)]
pub enum ModelState {
    Uninitialized,
    Loading,
    Ready(Arc<dyn Model>),
    Failed(String),
}

impl fmt::Debug for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelState::Uninitialized => write!(f, "Uninitialized"),
            ModelState::Loading => write!(f, "Loading"),
            ModelState::Ready(model) => write!(f, "Ready({} labels)", model.labels().len()),
            ModelState::Failed(err) => write!(f, "Failed({err})"),
        }
    }
}

impl ModelState {
    pub fn is_loading(&self) -> bool {
        matches!(self, ModelState::Loading)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ModelState::Ready(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub confidences: Vec<f32>,
}

#[derive(Clone)]
pub struct Classifier {
    state: Arc<watch::Sender<ModelState>>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ModelState::Uninitialized);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> ModelState {
        self.state.borrow().clone()
    }

    /// Starts loading the model. Returns `None` if a load was already started.
    pub fn load(&self, loader: impl ModelLoader) -> Option<JoinHandle<()>> {
        let started = self.state.send_if_modified(|state| {
            if matches!(state, ModelState::Uninitialized) {
                *state = ModelState::Loading;
                true
            } else {
                false
            }
        });
        if !started {
            debug!("model load already started");
            return None;
        }
        info!("loading model");
        let state = self.state.clone();
        Some(tokio::spawn(async move {
            let next = match loader.load().await {
                Ok(model) => {
                    info!(labels = ?model.labels(), size = model.input_size(), "model ready");
                    ModelState::Ready(model)
                }
                Err(err) => {
                    warn!(%err, "model failed to load");
                    ModelState::Failed(err.to_string())
                }
            };
            state.send_replace(next);
        }))
    }

    /// Waits out a load in progress. Errors if no model is or will be ready.
    pub async fn ready(&self) -> Result<Arc<dyn Model>, Error> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| !s.is_loading())
            .await
            .map_err(|_| Error::ModelNotReady)?
            .clone();
        match state {
            ModelState::Ready(model) => Ok(model),
            _ => Err(Error::ModelNotReady),
        }
    }

    pub async fn classify(&self, raster: &RgbImage) -> Result<Prediction, Error> {
        let model = self.ready().await?;
        predict(model.as_ref(), raster)
    }
}

pub fn predict(model: &dyn Model, raster: &RgbImage) -> Result<Prediction, Error> {
    let input = Tensor::from_raster(raster, model.input_size());
    let confidences = model.predict(&input)?;
    let label = argmax(&confidences)
        .and_then(|i| model.labels().get(i))
        .cloned()
        .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
    Ok(Prediction { label, confidences })
}

/// Softmax over a linear layer of grid-pooled colour features.
///
/// Weights file:
///
/// ```json
/// { "labels": ["IDF", "ENEMY"], "input_size": 224, "grid": 4,
///   "weights": [[...48 floats...], [...]], "bias": [0.0, 0.0] }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct LinearModel {
    #[serde(default = "default_labels")]
    labels: Vec<String>,
    #[serde(default = "default_input_size")]
    input_size: u32,
    grid: u32,
    weights: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

fn default_labels() -> Vec<String> {
    DEFAULT_LABELS.iter().map(|l| l.to_string()).collect()
}

fn default_input_size() -> u32 {
    224
}

impl LinearModel {
    pub fn from_json(json: &[u8]) -> Result<Self, Error> {
        let model: LinearModel = serde_json::from_slice(json)?;
        model.validate()?;
        Ok(model)
    }

    fn features(&self) -> usize {
        (self.grid * self.grid * 3) as usize
    }

    fn validate(&self) -> Result<(), Error> {
        if self.grid == 0 || self.input_size < self.grid {
            return Err(Error::ModelShape(format!(
                "grid {} does not fit input size {}",
                self.grid, self.input_size
            )));
        }
        if self.weights.len() != self.labels.len() || self.bias.len() != self.labels.len() {
            return Err(Error::ModelShape(format!(
                "{} labels, {} weight rows, {} biases",
                self.labels.len(),
                self.weights.len(),
                self.bias.len()
            )));
        }
        if let Some(row) = self.weights.iter().find(|r| r.len() != self.features()) {
            return Err(Error::ModelShape(format!(
                "weight row has {} features, expected {}",
                row.len(),
                self.features()
            )));
        }
        Ok(())
    }

    /// Mean of each channel over each grid cell.
    fn pool(&self, input: &Tensor) -> Vec<f32> {
        let [_, h, w, c] = input.shape();
        let grid = self.grid as usize;
        let mut out = vec![0.0; grid * grid * c];
        let mut counts = vec![0u32; grid * grid];
        for y in 0..h {
            for x in 0..w {
                let cell = (y * grid / h) * grid + x * grid / w;
                counts[cell] += 1;
                for (ch, v) in input.pixel(y, x).iter().enumerate() {
                    out[cell * c + ch] += v;
                }
            }
        }
        for (cell, n) in counts.into_iter().enumerate() {
            if n > 0 {
                out[cell * c..(cell + 1) * c]
                    .iter_mut()
                    .for_each(|v| *v /= n as f32);
            }
        }
        out
    }
}

impl Model for LinearModel {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    fn predict(&self, input: &Tensor) -> Result<Vec<f32>, Error> {
        let expected = [1, self.input_size as usize, self.input_size as usize, 3];
        if input.shape() != expected {
            return Err(Error::ModelShape(format!(
                "input {:?}, expected {expected:?}",
                input.shape()
            )));
        }
        let features = self.pool(input);
        let logits = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(&features).map(|(w, f)| w * f).sum::<f32>() + b)
            .collect::<Vec<_>>();
        Ok(softmax(&logits))
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp = logits.iter().map(|l| (l - max).exp()).collect::<Vec<_>>();
    let sum: f32 = exp.iter().sum();
    exp.into_iter().map(|e| e / sum).collect()
}

/// Reads [`LinearModel`] weights from disk.
pub struct FileModelLoader {
    path: PathBuf,
}

impl FileModelLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ModelLoader for FileModelLoader {
    fn load(&self) -> BoxFuture<'_, Result<Arc<dyn Model>, Error>> {
        async move {
            let json = tokio::fs::read(&self.path).await?;
            let model = LinearModel::from_json(&json)?;
            Ok(Arc::new(model) as Arc<dyn Model>)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use serde_json::json;
    use tokio::sync::oneshot;

    /// Scores the red channel of the whole image: red is an enemy.
    fn red_detector(input_size: u32) -> LinearModel {
        LinearModel::from_json(
            json!({
                "input_size": input_size,
                "grid": 1,
                "weights": [[-4.0, 0.0, 0.0], [4.0, 0.0, 0.0]],
                "bias": [0.0, 0.0],
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap()
    }

    type Loaded = Result<Arc<dyn Model>, Error>;

    /// Finishes loading when the test says so.
    struct GatedLoader(tokio::sync::Mutex<Option<oneshot::Receiver<Loaded>>>);

    impl ModelLoader for GatedLoader {
        fn load(&self) -> BoxFuture<'_, Loaded> {
            async move {
                let rx = self.0.lock().await.take().ok_or(Error::ModelNotReady)?;
                rx.await.map_err(|_| Error::ModelNotReady)?
            }
            .boxed()
        }
    }

    #[test]
    fn tensor_is_batched_and_scaled() {
        let raster = RgbImage::from_pixel(10, 6, Rgb([255, 0, 51]));
        let tensor = Tensor::from_raster(&raster, 4);
        assert_eq!(tensor.shape(), [1, 4, 4, 3]);
        assert_eq!(tensor.data().len(), 48);
        assert_eq!(&tensor.data()[..3], &[1.0, 0.0, 0.2]);
    }

    #[test]
    fn argmax_is_stable() {
        assert_eq!(argmax(&[0.2, 0.5, 0.5, 0.1]), Some(1));
        assert_eq!(argmax(&[f32::NAN, 0.1]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn linear_model_prefers_matching_class() {
        let model = red_detector(8);
        let red = predict(&model, &RgbImage::from_pixel(16, 16, Rgb([250, 0, 0]))).unwrap();
        assert_eq!(red.label, "ENEMY");
        assert!((red.confidences.iter().sum::<f32>() - 1.0).abs() < 1e-5);

        let blue = predict(&model, &RgbImage::from_pixel(16, 16, Rgb([0, 0, 250]))).unwrap();
        // equal logits, first label wins
        assert_eq!(blue.label, "IDF");
    }

    #[test]
    fn malformed_weights_are_rejected() {
        let err = LinearModel::from_json(
            json!({"grid": 2, "weights": [[1.0], [1.0]], "bias": [0.0, 0.0]})
                .to_string()
                .as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ModelShape(_)));
    }

    #[tokio::test]
    async fn without_a_model_classification_is_not_ready() {
        let classifier = Classifier::new();
        let raster = RgbImage::new(4, 4);
        assert!(matches!(
            classifier.classify(&raster).await,
            Err(Error::ModelNotReady)
        ));
    }

    #[tokio::test]
    async fn capture_waits_for_load_then_classifies() {
        let classifier = Classifier::new();
        let (tx, rx) = oneshot::channel();
        let loader = GatedLoader(tokio::sync::Mutex::new(Some(rx)));
        let _load = classifier.load(loader).unwrap();
        assert!(classifier.state().is_loading());
        assert!(classifier.load(FileModelLoader::new("/nonexistent")).is_none());

        let pending = tokio::spawn({
            let classifier = classifier.clone();
            async move {
                classifier
                    .classify(&RgbImage::from_pixel(8, 8, Rgb([255, 0, 0])))
                    .await
            }
        });
        tx.send(Ok(Arc::new(red_detector(8)) as Arc<dyn Model>))
            .map_err(|_| ())
            .unwrap();
        assert_eq!(pending.await.unwrap().unwrap().label, "ENEMY");
        assert!(classifier.state().is_ready());
    }

    #[tokio::test]
    async fn file_loader_reads_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(
            &path,
            json!({"input_size": 8, "grid": 1, "weights": [[0.0, 0.0, 0.0], [0.0, 0.0, 0.0]], "bias": [0.0, 1.0]})
                .to_string(),
        )
        .unwrap();
        let classifier = Classifier::new();
        classifier.load(FileModelLoader::new(&path)).unwrap().await.unwrap();
        let model = classifier.ready().await.unwrap();
        assert_eq!(model.labels(), &["IDF".to_string(), "ENEMY".to_string()]);

        let missing = Classifier::new();
        missing.load(FileModelLoader::new(dir.path().join("nope.json"))).unwrap().await.unwrap();
        assert!(matches!(missing.state(), ModelState::Failed(_)));
    }
}

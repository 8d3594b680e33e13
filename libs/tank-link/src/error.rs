use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml parsing failed")]
    #[diagnostic(help = "check the tank console config file")]
    Toml(#[from] toml::de::Error),
    #[error("json {0}")]
    Json(#[from] serde_json::Error),
    #[error("image {0}")]
    Image(#[from] image::ImageError),
    #[error("http {0}")]
    Http(#[from] reqwest::Error),
    #[error("store unavailable")]
    StoreUnavailable,
    #[error("invalid store path {0:?}")]
    InvalidPath(String),
    #[error("not found {0}")]
    NotFound(String),
    #[error("value at {path} has an unexpected shape")]
    Decode { path: String },
    #[error("no capture source available")]
    CaptureUnavailable,
    #[error("invalid image data")]
    InvalidImage,
    #[error("raster surface unavailable")]
    SurfaceUnavailable,
    #[error("model not ready")]
    ModelNotReady,
    #[error("model shape mismatch: {0}")]
    ModelShape(String),
    #[error("missing field {0}")]
    #[diagnostic(help = "description, details and location are all required")]
    MissingField(&'static str),
    #[error("timed out")]
    Timeout,
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl From<base64::DecodeError> for Error {
    fn from(_: base64::DecodeError) -> Self {
        Error::InvalidImage
    }
}

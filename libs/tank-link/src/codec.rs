//! Image payloads as they live in the store: base64 without a `data:` prefix.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const JPEG_DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];

pub fn is_jpeg(bytes: &[u8]) -> bool {
    bytes.starts_with(&JPEG_MAGIC)
}

/// Base64 encoded JPEG, stored without any URI prefix.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ImageData(String);

impl From<String> for ImageData {
    fn from(value: String) -> Self {
        ImageData::parse(&value)
    }
}

impl From<ImageData> for String {
    fn from(value: ImageData) -> Self {
        value.0
    }
}

impl ImageData {
    pub fn from_jpeg(bytes: &[u8]) -> Self {
        ImageData(STANDARD.encode(bytes))
    }

    /// Accepts either a bare base64 payload or a full data uri.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        let bare = value
            .split_once(";base64,")
            .filter(|(head, _)| head.starts_with("data:"))
            .map(|(_, tail)| tail)
            .unwrap_or(value);
        ImageData(bare.to_string())
    }

    pub fn as_base64(&self) -> &str {
        &self.0
    }

    pub fn to_data_uri(&self) -> String {
        format!("{JPEG_DATA_URI_PREFIX}{}", self.0)
    }

    pub fn decode(&self) -> Result<Vec<u8>, Error> {
        Ok(STANDARD.decode(&self.0)?)
    }

    /// Decodes and checks the JPEG header.
    pub fn decode_jpeg(&self) -> Result<Vec<u8>, Error> {
        let bytes = self.decode()?;
        if is_jpeg(&bytes) {
            Ok(bytes)
        } else {
            Err(Error::InvalidImage)
        }
    }
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImageData({} base64 chars)", self.0.len())
    }
}

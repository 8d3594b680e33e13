use std::{marker::PhantomData, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::warn;

use crate::{
    error::Error,
    store::{Store, Subscription},
};

/// Typed access to the store shared with the vehicle.
///
/// Failed writes are returned to the caller; nothing here retries.
#[derive(Clone)]
pub struct TelemetryChannel {
    store: Arc<dyn Store>,
}

impl TelemetryChannel {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn subscribe<T: DeserializeOwned>(&self, path: &str) -> Feed<T> {
        Feed {
            sub: self.store.subscribe(path),
            _marker: PhantomData,
        }
    }

    pub async fn write<T: Serialize + ?Sized>(&self, path: &str, value: &T) -> Result<(), Error> {
        let value = serde_json::to_value(value)?;
        self.store.write(path, value).await
    }

    /// Writes several paths in one atomic update.
    pub async fn update(&self, writes: Vec<(&str, Value)>) -> Result<(), Error> {
        let writes = writes
            .into_iter()
            .map(|(path, value)| (path.to_string(), value))
            .collect();
        self.store.update(writes).await
    }

    pub async fn read<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, Error> {
        match self.store.read(path).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|_| Error::Decode {
                    path: path.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub async fn push<T: Serialize + ?Sized>(&self, path: &str, value: &T) -> Result<String, Error> {
        let value = serde_json::to_value(value)?;
        self.store.push(path, value).await
    }

    pub async fn remove(&self, path: &str) -> Result<(), Error> {
        self.store.remove(path).await
    }
}

/// A typed subscription. Values that fail to decode are logged and surface
/// as absent.
pub struct Feed<T> {
    sub: Subscription,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Feed<T> {
    pub fn path(&self) -> &str {
        self.sub.path()
    }

    /// The current value first, then every change. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Option<T>> {
        let value = self.sub.next().await?;
        Some(self.decode(value))
    }

    fn decode(&self, value: Option<Value>) -> Option<T> {
        let value = value?;
        match serde_json::from_value(value.clone()) {
            Ok(v) => Some(v),
            Err(err) => {
                warn!(path = self.sub.path(), ?value, %err, "dropping undecodable value");
                None
            }
        }
    }

    pub fn unsubscribe(self) {
        self.sub.unsubscribe();
    }
}

//! The realtime key-path store shared with the vehicle.
//!
//! A [`Store`] is a JSON tree addressed by slash separated paths. Writes
//! replace the value at a path, subscribers of any overlapping path are
//! notified with their new value. Delivery is last-value-wins: a slow
//! subscriber only ever observes the most recent value.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::{error::Error, paths};

pub trait Store: Send + Sync + 'static {
    /// Subscribes to `path`. The returned subscription yields the current
    /// value first and then every change.
    fn subscribe(&self, path: &str) -> Subscription;

    fn read(&self, path: &str) -> BoxFuture<'_, Result<Option<Value>, Error>>;

    /// Applies every write atomically. A `null` value removes the path.
    fn update(&self, writes: Vec<(String, Value)>) -> BoxFuture<'_, Result<(), Error>>;

    /// Appends `value` under `path` with a freshly generated key and returns the key.
    fn push(&self, path: &str, value: Value) -> BoxFuture<'_, Result<String, Error>>;

    fn remove(&self, path: &str) -> BoxFuture<'_, Result<(), Error>> {
        self.write(path, Value::Null)
    }

    fn write(&self, path: &str, value: Value) -> BoxFuture<'_, Result<(), Error>> {
        self.update(vec![(path.to_string(), value)])
    }
}

pub struct Subscription {
    path: String,
    rx: watch::Receiver<Option<Value>>,
    primed: bool,
}

impl Subscription {
    pub fn new(path: impl Into<String>, rx: watch::Receiver<Option<Value>>) -> Self {
        Self {
            path: path.into(),
            rx,
            primed: true,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn current(&self) -> Option<Value> {
        self.rx.borrow().clone()
    }

    /// Resolves with the current value on the first call and then on every
    /// change. Returns `None` once the store has gone away.
    pub async fn next(&mut self) -> Option<Option<Value>> {
        if self.primed {
            self.primed = false;
            return Some(self.rx.borrow_and_update().clone());
        }
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub fn unsubscribe(self) {
        trace!(path = %self.path, "unsubscribed");
    }
}

/// In-process [`Store`] backed by a JSON tree, optionally snapshotted to disk.
pub struct MemoryStore {
    inner: Mutex<Tree>,
    ids: Mutex<PushIds>,
    snapshot: Option<PathBuf>,
    offline: AtomicBool,
}

struct Tree {
    root: Value,
    watchers: HashMap<String, watch::Sender<Option<Value>>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_root(Value::Object(Map::new()), None)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_root(root: Value, snapshot: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Tree {
                root,
                watchers: HashMap::new(),
            }),
            ids: Mutex::new(PushIds::default()),
            snapshot,
            offline: AtomicBool::new(false),
        }
    }

    /// Opens a store whose contents are loaded from, and saved to, `path`.
    /// A missing file starts an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let root = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
            Err(err) => return Err(err.into()),
        };
        let root = if root.is_object() {
            root
        } else {
            Value::Object(Map::new())
        };
        info!(?path, "opened store");
        Ok(Self::with_root(root, Some(path)))
    }

    /// Writes the current tree to the snapshot file, if there is one.
    pub fn save(&self) -> Result<(), Error> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let contents = {
            let tree = self.inner.lock().map_err(|_| Error::StoreUnavailable)?;
            serde_json::to_string_pretty(&tree.root)?
        };
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, path)?;
        debug!(?path, "saved store snapshot");
        Ok(())
    }

    /// While offline every read and write fails with [`Error::StoreUnavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), Error> {
        if self.offline.load(Ordering::SeqCst) {
            Err(Error::StoreUnavailable)
        } else {
            Ok(())
        }
    }

    fn apply(&self, writes: Vec<(String, Value)>) -> Result<(), Error> {
        self.check_online()?;
        let writes = writes
            .into_iter()
            .map(|(path, value)| {
                let path = paths::normalize(&path);
                if path.is_empty() {
                    Err(Error::InvalidPath(path))
                } else {
                    Ok((path, value))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tree = self.inner.lock().map_err(|_| Error::StoreUnavailable)?;
        for (path, value) in &writes {
            let segs = paths::segments(path).collect::<Vec<_>>();
            set_at(&mut tree.root, &segs, value.clone());
            trace!(path, "write");
        }

        let Tree { root, watchers } = &mut *tree;
        watchers.retain(|watched, tx| {
            if tx.receiver_count() == 0 {
                return false;
            }
            if writes.iter().any(|(path, _)| paths::overlaps(path, watched)) {
                let next = get_at(root, watched).cloned();
                tx.send_if_modified(|current| {
                    if *current == next {
                        false
                    } else {
                        *current = next;
                        true
                    }
                });
            }
            true
        });
        Ok(())
    }

    fn next_push_id(&self) -> Result<String, Error> {
        let mut ids = self.ids.lock().map_err(|_| Error::StoreUnavailable)?;
        Ok(ids.next(chrono::Utc::now().timestamp_millis()))
    }
}

impl Store for MemoryStore {
    fn subscribe(&self, path: &str) -> Subscription {
        let path = paths::normalize(path);
        let rx = match self.inner.lock() {
            Ok(mut tree) => {
                let current = get_at(&tree.root, &path).cloned();
                match tree.watchers.get(&path) {
                    Some(tx) => tx.subscribe(),
                    None => {
                        let (tx, rx) = watch::channel(current);
                        tree.watchers.insert(path.clone(), tx);
                        rx
                    }
                }
            }
            // a poisoned tree never changes again, hand out a closed channel
            Err(_) => watch::channel(None).1,
        };
        Subscription::new(path, rx)
    }

    fn read(&self, path: &str) -> BoxFuture<'_, Result<Option<Value>, Error>> {
        let path = paths::normalize(path);
        async move {
            self.check_online()?;
            let tree = self.inner.lock().map_err(|_| Error::StoreUnavailable)?;
            Ok(get_at(&tree.root, &path).cloned())
        }
        .boxed()
    }

    fn update(&self, writes: Vec<(String, Value)>) -> BoxFuture<'_, Result<(), Error>> {
        async move { self.apply(writes) }.boxed()
    }

    fn push(&self, path: &str, value: Value) -> BoxFuture<'_, Result<String, Error>> {
        let path = paths::normalize(path);
        async move {
            self.check_online()?;
            let id = self.next_push_id()?;
            self.apply(vec![(format!("{path}/{id}"), value)])?;
            Ok(id)
        }
        .boxed()
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn get_at<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for seg in paths::segments(path) {
        node = node.as_object()?.get(seg)?;
    }
    (!is_empty(node)).then_some(node)
}

fn set_at(node: &mut Value, segs: &[&str], value: Value) {
    let Some((head, rest)) = segs.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let Value::Object(map) = node else { return };
    if rest.is_empty() {
        if is_empty(&value) {
            map.remove(*head);
        } else {
            map.insert(head.to_string(), value);
        }
        return;
    }
    let child = map.entry(head.to_string()).or_insert(Value::Null);
    set_at(child, rest, value);
    if is_empty(child) {
        map.remove(*head);
    }
}

const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Generates 20 character keys that sort lexicographically in creation order:
/// 8 characters of millisecond timestamp followed by 12 random characters
/// that are incremented, rather than re-rolled, within the same millisecond.
#[derive(Default)]
struct PushIds {
    last_time: i64,
    last_rand: [u8; 12],
}

impl PushIds {
    fn next(&mut self, now_ms: i64) -> String {
        let now = now_ms.max(self.last_time);
        if now == self.last_time {
            for r in self.last_rand.iter_mut().rev() {
                if *r == 63 {
                    *r = 0;
                } else {
                    *r += 1;
                    break;
                }
            }
        } else {
            for r in &mut self.last_rand {
                *r = fastrand::u8(..64);
            }
        }
        self.last_time = now;

        let mut id = [0u8; 20];
        let mut t = now;
        for slot in id[..8].iter_mut().rev() {
            *slot = PUSH_CHARS[(t % 64) as usize];
            t /= 64;
        }
        for (slot, r) in id[8..].iter_mut().zip(self.last_rand) {
            *slot = PUSH_CHARS[r as usize];
        }
        id.iter().map(|&b| b as char).collect()
    }
}

/// Wraps a store and keeps a log of every written path, in order.
pub struct RecordingStore<S> {
    inner: S,
    log: Mutex<Vec<(String, Value)>>,
}

impl<S: Store> RecordingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Every write so far, as `(path, value)`.
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Values written to exactly `path`.
    pub fn writes_to(&self, path: &str) -> Vec<Value> {
        let path = paths::normalize(path);
        self.writes()
            .into_iter()
            .filter(|(p, _)| *p == path)
            .map(|(_, v)| v)
            .collect()
    }

    /// Writes to `path` or anything below it.
    pub fn writes_under(&self, path: &str) -> Vec<(String, Value)> {
        let depth = paths::segments(path).count();
        self.writes()
            .into_iter()
            .filter(|(p, _)| paths::segments(p).count() >= depth && paths::overlaps(p, path))
            .collect()
    }

    /// Number of writes per path, sorted by path.
    pub fn counts(&self) -> Vec<(String, usize)> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for (path, _) in self.writes() {
            *counts.entry(path).or_default() += 1;
        }
        let mut counts = counts.into_iter().collect::<Vec<_>>();
        counts.sort();
        counts
    }

    fn record(&self, writes: &[(String, Value)]) {
        if let Ok(mut log) = self.log.lock() {
            log.extend(
                writes
                    .iter()
                    .map(|(path, value)| (paths::normalize(path), value.clone())),
            );
        }
    }
}

impl<S: Store> Store for RecordingStore<S> {
    fn subscribe(&self, path: &str) -> Subscription {
        self.inner.subscribe(path)
    }

    fn read(&self, path: &str) -> BoxFuture<'_, Result<Option<Value>, Error>> {
        self.inner.read(path)
    }

    fn update(&self, writes: Vec<(String, Value)>) -> BoxFuture<'_, Result<(), Error>> {
        async move {
            self.inner.update(writes.clone()).await?;
            self.record(&writes);
            Ok(())
        }
        .boxed()
    }

    fn push(&self, path: &str, value: Value) -> BoxFuture<'_, Result<String, Error>> {
        let path = paths::normalize(path);
        async move {
            let id = self.inner.push(&path, value.clone()).await?;
            self.record(&[(format!("{path}/{id}"), value)]);
            Ok(id)
        }
        .boxed()
    }
}

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::store::{Snapshot, Store, Subscription};
use crate::time::now_millis;

/// In-process [`Store`] backed by a sorted map of leaf paths.
///
/// Supports an artificial per-operation latency and fault injection so
/// races and outages can be reproduced under paused tokio time.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    latency: Duration,
    next_seq: AtomicU64,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Value>,
    watchers: Vec<Watcher>,
    failing_writes: Vec<String>,
    failing_reads: Vec<String>,
}

struct Watcher {
    key: String,
    last: Option<Value>,
    tx: mpsc::UnboundedSender<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            latency: Duration::ZERO,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Every operation sleeps for `latency` before touching the data.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::new()
        }
    }

    /// Make writes at or beneath `prefix` fail with `Unavailable`.
    pub fn fail_writes(&self, prefix: &str) {
        self.lock().failing_writes.push(prefix.to_string());
    }

    /// Make reads and new subscriptions at or beneath `prefix` fail with
    /// `Unavailable`.
    pub fn fail_reads(&self, prefix: &str) {
        self.lock().failing_reads.push(prefix.to_string());
    }

    /// Push `SubscriptionLost` to every subscription overlapping `prefix`
    /// and close it.
    pub fn drop_subscriptions(&self, prefix: &str) {
        let mut inner = self.lock();
        inner.watchers.retain(|w| {
            if !overlaps(&w.key, prefix) {
                return true;
            }
            let _ = w.tx.send(Err(StoreError::SubscriptionLost {
                key: w.key.clone(),
            }));
            false
        });
    }

    pub fn clear_faults(&self) {
        let mut inner = self.lock();
        inner.failing_writes.clear();
        inner.failing_reads.clear();
    }

    /// Number of open subscriptions overlapping `prefix`.
    pub fn watcher_count(&self, prefix: &str) -> usize {
        self.lock()
            .watchers
            .iter()
            .filter(|w| !w.tx.is_closed() && overlaps(&w.key, prefix))
            .count()
    }

    /// Synchronous read for tests and diagnostics.
    pub fn peek(&self, key: &str) -> Option<Value> {
        read_tree(&self.lock().entries, key)
    }

    /// Synchronous write that skips latency and injected faults.
    pub fn seed<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => self.lock().write(key, value),
            Err(e) => tracing::warn!(key, error = %e, "seed value not serializable"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn next_id(&self) -> String {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        format!("{:013x}{seq:08x}", now_millis())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn check_writable(&self, key: &str) -> Result<(), StoreError> {
        check_faults(&self.failing_writes, key)
    }

    fn check_readable(&self, key: &str) -> Result<(), StoreError> {
        check_faults(&self.failing_reads, key)
    }

    fn remove_subtree(&mut self, key: &str) {
        self.entries.retain(|k, _| !is_within(k, key));
    }

    fn write(&mut self, key: &str, value: Value) {
        self.remove_subtree(key);
        // A leaf cannot also be a parent.
        self.entries.retain(|k, _| !is_within(key, k));
        if !value.is_null() {
            self.entries.insert(key.to_string(), value);
        }
        self.notify(key);
    }

    fn notify(&mut self, changed: &str) {
        let entries = &self.entries;
        self.watchers.retain_mut(|w| {
            if w.tx.is_closed() {
                return false;
            }
            if !overlaps(&w.key, changed) {
                return true;
            }
            let snapshot = read_tree(entries, &w.key);
            if snapshot == w.last {
                return true;
            }
            w.last = snapshot.clone();
            w.tx.send(Ok(snapshot)).is_ok()
        });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.delay().await;
        let inner = self.lock();
        inner.check_readable(key)?;
        Ok(read_tree(&inner.entries, key))
    }

    async fn upsert(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.check_writable(key)?;
        inner.write(key, value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.check_writable(key)?;
        inner.remove_subtree(key);
        inner.notify(key);
        Ok(())
    }

    async fn append_to_list(&self, key: &str, value: Value) -> Result<String, StoreError> {
        self.delay().await;
        let id = self.next_id();
        let child = format!("{key}/{id}");
        let mut inner = self.lock();
        inner.check_writable(&child)?;
        inner.write(&child, value);
        Ok(id)
    }

    async fn subscribe(&self, key: &str) -> Result<Subscription, StoreError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.check_readable(key)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let current = read_tree(&inner.entries, key);
        let _ = tx.send(Ok(current.clone()));
        inner.watchers.push(Watcher {
            key: key.to_string(),
            last: current,
            tx,
        });
        Ok(Subscription::new(key, rx))
    }
}

fn check_faults(prefixes: &[String], key: &str) -> Result<(), StoreError> {
    if prefixes.iter().any(|p| is_within(key, p)) {
        return Err(StoreError::Unavailable {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// `path` equals `ancestor` or lies beneath it.
fn is_within(path: &str, ancestor: &str) -> bool {
    match path.strip_prefix(ancestor) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn overlaps(a: &str, b: &str) -> bool {
    is_within(a, b) || is_within(b, a)
}

fn read_tree(entries: &BTreeMap<String, Value>, key: &str) -> Option<Value> {
    if let Some(value) = entries.get(key) {
        return Some(value.clone());
    }
    let prefix = format!("{key}/");
    let mut root = Map::new();
    for (path, value) in entries
        .range(prefix.clone()..)
        .take_while(|(path, _)| path.starts_with(&prefix))
    {
        insert_path(&mut root, &path[prefix.len()..], value.clone());
    }
    if root.is_empty() {
        None
    } else {
        Some(Value::Object(root))
    }
}

fn insert_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('/') {
        None => {
            map.insert(path.to_string(), value);
        },
        Some((head, tail)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = child {
                insert_path(child, tail, value);
            }
        },
    }
}

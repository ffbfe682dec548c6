use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::StoreError;

/// One delivery from a live subscription: the value now at the key, or
/// `None` once it is absent.
pub type Snapshot = Result<Option<Value>, StoreError>;

/// Shared key-value store with live change subscriptions.
///
/// Keys are `/`-separated paths. Reading a key that has children returns
/// them as a JSON object keyed by the next path segment. Writes to
/// different keys are independent; there are no transactions.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Replaces the value at `key` and everything beneath it.
    async fn upsert(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Removes `key` and everything beneath it. Deleting an absent key is Ok.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Appends `value` under `key` with a fresh store-generated id and
    /// returns that id. Ids sort in append order.
    async fn append_to_list(&self, key: &str, value: Value) -> Result<String, StoreError>;

    /// Live view of `key`. The current value is delivered first, then one
    /// snapshot per change. Dropping the subscription unsubscribes.
    async fn subscribe(&self, key: &str) -> Result<Subscription, StoreError>;
}

/// Stream of [`Snapshot`]s for one key. Ends when the store closes it.
#[derive(Debug)]
pub struct Subscription {
    key: String,
    rx: mpsc::UnboundedReceiver<Snapshot>,
}

impl Subscription {
    pub fn new(key: impl Into<String>, rx: mpsc::UnboundedReceiver<Snapshot>) -> Self {
        Self {
            key: key.into(),
            rx,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Stream for Subscription {
    type Item = Snapshot;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Splits a list read at a parent key into `(child id, value)` pairs in id
/// order. Non-object values yield nothing.
pub fn children(value: Option<Value>) -> Vec<(String, Value)> {
    match value {
        Some(Value::Object(map)) => {
            let mut items: Vec<_> = map.into_iter().collect();
            items.sort_by(|a, b| a.0.cmp(&b.0));
            items
        },
        _ => Vec::new(),
    }
}

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use outreach_pipeline::db::{ClaimFilter, ItemUpdate, QueueStore, QueueTx, StoreError};
use outreach_pipeline::dispatch::{DispatchError, Dispatcher, Mailbox, OutgoingMessage};
use outreach_pipeline::model::{ItemId, OutreachItem};
use outreach_pipeline::pipeline::PassSettings;

pub fn settings(batch_size: usize) -> PassSettings {
    PassSettings {
        batch_size,
        throttle: Duration::ZERO,
    }
}

pub fn sender() -> Mailbox {
    Mailbox::new("me@example.com", Some("Me"))
}

/// Dispatcher that records every message and replays queued responses.
/// Once `hang_from` messages have been accepted, further sends never return.
#[derive(Clone, Default)]
pub struct RecordingDispatcher {
    responses: Arc<Mutex<VecDeque<Result<(), DispatchError>>>>,
    sent: Arc<Mutex<Vec<OutgoingMessage>>>,
    hang_from: Option<usize>,
}

impl RecordingDispatcher {
    pub fn with_responses(responses: Vec<Result<(), DispatchError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    pub fn hanging_after(n: usize) -> Self {
        Self {
            hang_from: Some(n),
            ..Default::default()
        }
    }

    pub async fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    fn transport(&self) -> &str {
        "recording"
    }

    async fn send(&self, message: &OutgoingMessage) -> Result<(), DispatchError> {
        let already = self.sent.lock().await.len();
        if self.hang_from.is_some_and(|n| already >= n) {
            std::future::pending::<()>().await;
        }
        self.sent.lock().await.push(message.clone());
        // let a concurrent worker make progress between sends
        tokio::task::yield_now().await;
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or(Ok(()))
    }
}

/// Wraps a store and fails the `fail_on`-th update (1-based) across all transactions.
pub struct FailingStore<S> {
    inner: S,
    fail_on: usize,
    updates: Arc<AtomicUsize>,
}

impl<S> FailingStore<S> {
    pub fn new(inner: S, fail_on: usize) -> Self {
        Self {
            inner,
            fail_on,
            updates: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl<S: QueueStore> QueueStore for FailingStore<S> {
    async fn begin(&self) -> Result<Box<dyn QueueTx>, StoreError> {
        Ok(Box::new(FailingTx {
            inner: self.inner.begin().await?,
            fail_on: self.fail_on,
            updates: Arc::clone(&self.updates),
        }))
    }
}

struct FailingTx {
    inner: Box<dyn QueueTx>,
    fail_on: usize,
    updates: Arc<AtomicUsize>,
}

#[async_trait]
impl QueueTx for FailingTx {
    async fn claim(&mut self, filter: &ClaimFilter) -> Result<Vec<OutreachItem>, StoreError> {
        self.inner.claim(filter).await
    }

    async fn update(&mut self, id: &ItemId, change: ItemUpdate) -> Result<(), StoreError> {
        let n = self.updates.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_on {
            return Err(StoreError::Corrupt("injected update failure".into()));
        }
        self.inner.update(id, change).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

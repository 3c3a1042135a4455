//! Correlation registry.
//!
//! Maps pending correlation keys to single-slot delivery channels. A test
//! announces a key with [`CorrelationRegistry::sent`] before triggering the
//! side effect, the webhook delivers matching records through
//! [`CorrelationRegistry::record`], and the test picks them up with
//! [`CorrelationRegistry::wait`] or [`CorrelationRegistry::wait_n`].
//!
//! # Invariants
//!
//! - A key is present iff `sent` succeeded and `delete` has not been called.
//! - Each slot buffers at most one message. Later deliveries are dropped
//!   until the buffered one is consumed (first message wins).
//! - `record` never blocks; the map lock is never held across an await.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use canary_context::{Context, ContextError};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

use crate::error::RegistryError;
use crate::record::{InboundRecord, RequestLogger};

type KeyFn<M> = dyn Fn(&M) -> String + Send + Sync;
type SharedReceiver<M> = Arc<AsyncMutex<mpsc::Receiver<M>>>;

/// Capacity-one delivery channel for a single key.
struct Slot<M> {
    tx: mpsc::Sender<M>,
    rx: SharedReceiver<M>,
}

impl<M> Slot<M> {
    fn new() -> Self {
        // One buffered message covers the gap between `sent` returning and
        // the caller reaching `wait`.
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }
}

/// Routes inbound messages to the invocation waiting on their key.
pub struct CorrelationRegistry<M = InboundRecord> {
    key: Box<KeyFn<M>>,
    slots: Mutex<HashMap<String, Slot<M>>>,
}

impl<M: Send + 'static> CorrelationRegistry<M> {
    /// Create a registry that derives correlation keys with `key`.
    pub fn new<F>(key: F) -> Self
    where
        F: Fn(&M) -> String + Send + Sync + 'static,
    {
        Self {
            key: Box::new(key),
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot<M>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn receiver(&self, key: &str) -> Option<SharedReceiver<M>> {
        self.slots().get(key).map(|slot| Arc::clone(&slot.rx))
    }

    /// Announce that a message with `key` is expected.
    ///
    /// Keys must be unique while pending.
    pub fn sent(&self, key: &str) -> Result<(), RegistryError> {
        let mut slots = self.slots();
        if slots.contains_key(key) {
            return Err(RegistryError::DuplicateKey(key.to_string()));
        }
        slots.insert(key.to_string(), Slot::new());
        Ok(())
    }

    /// Deliver a message to the slot for its key.
    ///
    /// Messages without a pending key, or arriving while the slot still holds
    /// an unconsumed message, are dropped.
    pub fn deliver(&self, message: M) {
        let key = (self.key)(&message);
        let slots = self.slots();

        let Some(slot) = slots.get(&key) else {
            debug!(key = %key, "No pending key, dropping message");
            return;
        };

        match slot.tx.try_send(message) {
            Ok(()) => debug!(key = %key, "Message delivered"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(key = %key, "Slot full, dropping message")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(key = %key, "Slot closed, dropping message")
            }
        }
    }

    /// Block until a message for `key` arrives or `ctx` is done.
    ///
    /// The slot is not released; call [`delete`](Self::delete) afterwards.
    /// If the key is deleted while waiting, the wait continues until `ctx`
    /// is done.
    pub async fn wait(&self, ctx: &Context, key: &str) -> Result<M, RegistryError> {
        let rx = self
            .receiver(key)
            .ok_or_else(|| RegistryError::NotSent(key.to_string()))?;

        tokio::select! {
            biased;
            (_, message) = receive(rx) => match message {
                Some(message) => Ok(message),
                None => {
                    ctx.done().await;
                    Err(context_error(ctx))
                }
            },
            _ = ctx.done() => Err(context_error(ctx)),
        }
    }

    /// Block until `n` messages have arrived across `keys` or `ctx` is done.
    ///
    /// Every key must already be sent. Messages are returned in arrival
    /// order. A key may contribute more than one message if its slot is
    /// refilled during the wait. Keys deleted during the wait stop
    /// contributing but do not fail the call.
    pub async fn wait_n<I, K>(
        &self,
        ctx: &Context,
        n: usize,
        keys: I,
    ) -> Result<Vec<M>, RegistryError>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut receivers = Vec::new();
        {
            let slots = self.slots();
            for key in keys {
                let key = key.as_ref();
                if !seen.insert(key.to_string()) {
                    continue;
                }
                let slot = slots
                    .get(key)
                    .ok_or_else(|| RegistryError::NotSent(key.to_string()))?;
                receivers.push(Arc::clone(&slot.rx));
            }
        }

        if receivers.is_empty() {
            return Err(RegistryError::NoKeys);
        }

        let mut messages = Vec::new();
        if n == 0 {
            return Ok(messages);
        }

        let mut pending: FuturesUnordered<_> = receivers.into_iter().map(receive).collect();

        loop {
            tokio::select! {
                biased;
                Some((rx, message)) = pending.next(), if !pending.is_empty() => {
                    // A closed slot yields `None` and is not re-armed.
                    if let Some(message) = message {
                        messages.push(message);
                        if messages.len() == n {
                            return Ok(messages);
                        }
                        pending.push(receive(rx));
                    }
                }
                _ = ctx.done() => return Err(context_error(ctx)),
            }
        }
    }

    /// Release the slot for `key`, consumed or not. No-op if absent.
    pub fn delete(&self, key: &str) {
        self.slots().remove(key);
    }

    /// Whether `key` is pending.
    pub fn contains(&self, key: &str) -> bool {
        self.slots().contains_key(key)
    }

    /// Number of pending keys.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Whether no keys are pending.
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

impl RequestLogger for CorrelationRegistry<InboundRecord> {
    fn record(&self, record: InboundRecord) {
        debug!(
            method = %record.method,
            url = %record.raw_url,
            body_len = record.body.len(),
            "Recording inbound request"
        );
        self.deliver(record);
    }
}

impl<M> fmt::Debug for CorrelationRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self
            .slots
            .lock()
            .map(|slots| slots.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len());
        f.debug_struct("CorrelationRegistry")
            .field("pending", &pending)
            .finish()
    }
}

async fn receive<M>(rx: SharedReceiver<M>) -> (SharedReceiver<M>, Option<M>) {
    let message = {
        let mut guard = rx.lock().await;
        guard.recv().await
    };
    (rx, message)
}

fn context_error(ctx: &Context) -> RegistryError {
    ctx.err().unwrap_or(ContextError::Canceled).into()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn body_key(record: &InboundRecord) -> String {
        record.body.clone()
    }

    fn registry() -> CorrelationRegistry {
        CorrelationRegistry::new(body_key)
    }

    #[tokio::test]
    async fn test_sent_record_wait() {
        let rl = registry();
        rl.sent("blah").unwrap();

        let record = InboundRecord::new("FOO", "blah");
        rl.record(record.clone());

        let received = rl.wait(&Context::background(), "blah").await.unwrap();
        assert_eq!(received, record);
    }

    #[test]
    fn test_duplicate_sent() {
        let rl = registry();
        rl.sent("k").unwrap();
        assert_eq!(
            rl.sent("k"),
            Err(RegistryError::DuplicateKey("k".to_string()))
        );

        rl.delete("k");
        assert!(rl.sent("k").is_ok());
    }

    #[tokio::test]
    async fn test_wait_before_sent_fails_immediately() {
        let rl = registry();
        let err = rl.wait(&Context::background(), "nope").await.unwrap_err();
        assert_eq!(err, RegistryError::NotSent("nope".to_string()));
    }

    #[test]
    fn test_record_without_sent_is_dropped() {
        let rl = registry();
        rl.record(InboundRecord::new("POST", "orphan"));
        assert!(rl.is_empty());
    }

    #[tokio::test]
    async fn test_first_message_wins() {
        let rl = registry();
        rl.sent("k").unwrap();

        let mut first = InboundRecord::new("POST", "k");
        first.raw_url = "/first".to_string();
        let mut second = InboundRecord::new("POST", "k");
        second.raw_url = "/second".to_string();

        rl.record(first);
        rl.record(second);

        let got = rl.wait(&Context::background(), "k").await.unwrap();
        assert_eq!(got.raw_url, "/first");

        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let err = rl.wait(&ctx, "k").await.unwrap_err();
        assert_eq!(err, RegistryError::Context(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let rl = registry();
        rl.sent("k").unwrap();

        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let err = rl.wait(&ctx, "k").await.unwrap_err();
        assert!(err.is_context());
    }

    #[tokio::test]
    async fn test_wait_observes_cancel() {
        let rl = registry();
        rl.sent("k").unwrap();

        let ctx = Context::background().with_cancel();
        ctx.cancel();
        let err = rl.wait(&ctx, "k").await.unwrap_err();
        assert_eq!(err, RegistryError::Context(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_wait_unblocks_on_late_delivery() {
        let rl = Arc::new(registry());
        rl.sent("late").unwrap();

        let waiter = {
            let rl = Arc::clone(&rl);
            tokio::spawn(async move {
                let ctx = Context::background().with_timeout(Duration::from_secs(5));
                rl.wait(&ctx, "late").await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        rl.record(InboundRecord::new("POST", "late"));

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.body, "late");
    }

    #[tokio::test]
    async fn test_delete_during_wait_waits_for_context() {
        let rl = Arc::new(registry());
        rl.sent("k").unwrap();

        let waiter = {
            let rl = Arc::clone(&rl);
            tokio::spawn(async move {
                let ctx = Context::background().with_timeout(Duration::from_millis(100));
                rl.wait(&ctx, "k").await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        rl.delete("k");

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err, RegistryError::Context(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_wait_n_empty_keys() {
        let rl = registry();
        let keys: [&str; 0] = [];
        let err = rl.wait_n(&Context::background(), 1, keys).await.unwrap_err();
        assert_eq!(err, RegistryError::NoKeys);
    }

    #[tokio::test]
    async fn test_wait_n_zero_returns_immediately() {
        let rl = registry();
        rl.sent("a").unwrap();
        let got = rl.wait_n(&Context::background(), 0, ["a"]).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_wait_n_arrival_order() {
        let rl = Arc::new(registry());
        for key in ["a", "b", "c"] {
            rl.sent(key).unwrap();
        }

        let waiter = {
            let rl = Arc::clone(&rl);
            tokio::spawn(async move {
                let ctx = Context::background().with_timeout(Duration::from_secs(5));
                rl.wait_n(&ctx, 3, ["a", "b", "c"]).await
            })
        };

        for key in ["c", "a", "b"] {
            tokio::time::sleep(Duration::from_millis(5)).await;
            rl.record(InboundRecord::new("POST", key));
        }

        let bodies: Vec<_> = waiter
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|r| r.body)
            .collect();
        assert_eq!(bodies, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn test_wait_n_refilled_slot_counts_again() {
        let rl = Arc::new(registry());
        rl.sent("a").unwrap();
        rl.sent("b").unwrap();

        let waiter = {
            let rl = Arc::clone(&rl);
            tokio::spawn(async move {
                let ctx = Context::background().with_timeout(Duration::from_secs(5));
                rl.wait_n(&ctx, 2, ["a", "b"]).await
            })
        };

        rl.record(InboundRecord::new("POST", "a"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        rl.record(InboundRecord::new("POST", "a"));

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|r| r.body == "a"));
    }

    #[tokio::test]
    async fn test_wait_n_deleted_key_is_not_an_error() {
        let rl = Arc::new(registry());
        rl.sent("a").unwrap();
        rl.sent("b").unwrap();

        let waiter = {
            let rl = Arc::clone(&rl);
            tokio::spawn(async move {
                let ctx = Context::background().with_timeout(Duration::from_secs(5));
                rl.wait_n(&ctx, 1, ["a", "b"]).await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        rl.delete("a");
        rl.record(InboundRecord::new("POST", "b"));

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got[0].body, "b");
    }

    #[test]
    fn test_generic_message_type() {
        let rl: CorrelationRegistry<(String, u32)> =
            CorrelationRegistry::new(|m: &(String, u32)| m.0.clone());
        rl.sent("x").unwrap();
        rl.deliver(("x".to_string(), 7));
        rl.deliver(("y".to_string(), 8));
        assert_eq!(rl.len(), 1);
        assert!(rl.contains("x"));
    }
}

//! Multi-key subscriptions on top of the registry.

use std::collections::HashSet;
use std::sync::Arc;

use canary_context::Context;

use crate::error::RegistryError;
use crate::record::InboundRecord;
use crate::registry::CorrelationRegistry;

/// Tracks a set of pending keys for a test that fans out several events.
///
/// Keys still tracked when the subscriber is dropped are released.
#[derive(Debug)]
pub struct Subscriber {
    registry: Arc<CorrelationRegistry<InboundRecord>>,
    keys: HashSet<String>,
}

impl Subscriber {
    /// Create a subscriber with no keys.
    pub fn new(registry: Arc<CorrelationRegistry<InboundRecord>>) -> Self {
        Self {
            registry,
            keys: HashSet::new(),
        }
    }

    /// Mark every key as sent and track it.
    ///
    /// If any key fails, the keys this call already sent are released again.
    /// Keys that were pending before the call are left alone.
    pub fn subscribe<I, K>(&mut self, keys: I) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut added: Vec<String> = Vec::new();

        for key in keys {
            let key = key.into();
            if let Err(e) = self.registry.sent(&key) {
                self.unsubscribe(&added);
                return Err(e);
            }
            self.keys.insert(key.clone());
            added.push(key);
        }
        Ok(())
    }

    /// Stop tracking the keys and release them in the registry.
    pub fn unsubscribe<K: AsRef<str>>(&mut self, keys: &[K]) {
        for key in keys {
            let key = key.as_ref();
            self.keys.remove(key);
            self.registry.delete(key);
        }
    }

    /// Wait for `n` callbacks across all tracked keys and return their bodies.
    pub async fn wait_n(&self, ctx: &Context, n: usize) -> Result<Vec<String>, RegistryError> {
        if self.keys.is_empty() {
            return Err(RegistryError::NoKeys);
        }

        let records = self.registry.wait_n(ctx, n, &self.keys).await?;
        Ok(records.into_iter().map(|r| r.body).collect())
    }

    /// Currently tracked keys.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.keys.iter().map(String::as_str)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        for key in self.keys.drain() {
            self.registry.delete(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::record::RequestLogger;

    fn registry() -> Arc<CorrelationRegistry> {
        Arc::new(CorrelationRegistry::new(|r: &InboundRecord| r.body.clone()))
    }

    #[tokio::test]
    async fn test_subscribe_and_wait() {
        let registry = registry();
        let mut sub = Subscriber::new(Arc::clone(&registry));
        sub.subscribe(["one", "two"]).unwrap();

        registry.record(InboundRecord::new("POST", "two"));
        registry.record(InboundRecord::new("POST", "one"));

        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        let mut bodies = sub.wait_n(&ctx, 2).await.unwrap();
        bodies.sort();
        assert_eq!(bodies, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_failed_subscribe_rolls_back_own_keys_only() {
        let registry = registry();
        registry.sent("taken").unwrap();

        let mut sub = Subscriber::new(Arc::clone(&registry));
        sub.subscribe(["earlier"]).unwrap();
        let err = sub.subscribe(["fresh", "taken", "never"]).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateKey("taken".to_string()));

        assert_eq!(sub.keys().collect::<Vec<_>>(), vec!["earlier"]);
        assert!(!registry.contains("fresh"));
        assert!(!registry.contains("never"));
        assert!(registry.contains("earlier"));

        // The other owner of "taken" can still receive its callback.
        assert!(registry.contains("taken"));
        registry.record(InboundRecord::new("POST", "taken"));
        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        assert_eq!(registry.wait(&ctx, "taken").await.unwrap().body, "taken");
    }

    #[test]
    fn test_subscribe_twice_with_same_key_keeps_first() {
        let registry = registry();
        let mut sub = Subscriber::new(Arc::clone(&registry));
        sub.subscribe(["a"]).unwrap();

        let err = sub.subscribe(["a"]).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateKey("a".to_string()));
        assert!(registry.contains("a"));
        assert_eq!(sub.keys().count(), 1);
    }

    #[tokio::test]
    async fn test_wait_without_keys() {
        let sub = Subscriber::new(registry());
        let err = sub.wait_n(&Context::background(), 1).await.unwrap_err();
        assert_eq!(err, RegistryError::NoKeys);
    }

    #[test]
    fn test_drop_releases_keys() {
        let registry = registry();
        {
            let mut sub = Subscriber::new(Arc::clone(&registry));
            sub.subscribe(["a", "b"]).unwrap();
            sub.unsubscribe(&["a"]);
            assert!(!registry.contains("a"));
            assert!(registry.contains("b"));
        }
        assert!(registry.is_empty());
    }
}

//! Feeds: append-only logs of JSON messages, addressed by URI, subdivided into named or
//! content-hashed subfeeds. This is the transport `hither-remote` and `hither-broker` speak over
//! instead of a raw socket -- replication and durability are left to an
//! external system, so this crate only specifies the trait shape plus an in-process
//! implementation ([`LocalFeed`]) strong enough to exercise the remote-handler and
//! compute-resource protocol end to end in tests without standing up a real feed daemon.

use async_trait::async_trait;
use hither_base::Sha256Hex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// How a subfeed is named: a short human-readable key (e.g. `"main"`), or a hash of its creator
/// and purpose, used for private per-job-handler subfeeds nobody should be able to guess.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SubfeedKey {
    Name(String),
    Hashed(Sha256Hex),
}

impl SubfeedKey {
    pub fn as_string(&self) -> String {
        match self {
            SubfeedKey::Name(n) => n.clone(),
            SubfeedKey::Hashed(h) => h.as_str().to_string(),
        }
    }
}

/// Read/write access a feed grants to a subfeed's messages. A local-only feed has nobody to
/// enforce this against but itself; it exists so [`hither_broker`] and [`hither_remote`] can be
/// written against the same access model a replicated feed would need to honor.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AccessRules {
    pub allow_append: bool,
}

/// One append-only sequence of JSON messages within a feed.
#[async_trait]
pub trait Subfeed: Send + Sync {
    fn key(&self) -> &SubfeedKey;

    async fn append(&self, message: serde_json::Value) -> anyhow::Result<()>;

    async fn append_many(&self, messages: Vec<serde_json::Value>) -> anyhow::Result<()> {
        for message in messages {
            self.append(message).await?;
        }
        Ok(())
    }

    /// Blocks until a message exists at `position`, or `timeout` elapses and `Ok(None)` is
    /// returned. Never blocks forever: callers must be able to poll a subfeed without risking an
    /// unbounded hang.
    async fn get_next(
        &self,
        position: u64,
        timeout: Duration,
    ) -> anyhow::Result<Option<serde_json::Value>>;

    async fn get_num_messages(&self) -> anyhow::Result<u64>;

    async fn set_access_rules(&self, rules: AccessRules) -> anyhow::Result<()>;
}

/// An append-only feed, subdivided into subfeeds.
#[async_trait]
pub trait Feed: Send + Sync {
    async fn subfeed(&self, key: SubfeedKey) -> anyhow::Result<Arc<dyn Subfeed>>;
}

struct SubfeedState {
    messages: Vec<serde_json::Value>,
    access: AccessRules,
}

/// An in-process feed backed by a shared, mutex-guarded message log per subfeed. Multiple
/// [`LocalFeed`] handles constructed from the same [`LocalFeedRegistry`] observe the same
/// subfeeds, which is what lets a test spin up a "remote" job handler and a "remote" compute
/// resource in the same process and have them actually talk to each other.
#[derive(Clone, Default)]
pub struct LocalFeedRegistry {
    subfeeds: Arc<Mutex<HashMap<SubfeedKey, Arc<LocalSubfeed>>>>,
}

impl LocalFeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self) -> LocalFeed {
        LocalFeed {
            registry: self.clone(),
        }
    }
}

#[derive(Clone)]
pub struct LocalFeed {
    registry: LocalFeedRegistry,
}

impl LocalFeed {
    pub fn new() -> Self {
        Self {
            registry: LocalFeedRegistry::new(),
        }
    }
}

impl Default for LocalFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Feed for LocalFeed {
    async fn subfeed(&self, key: SubfeedKey) -> anyhow::Result<Arc<dyn Subfeed>> {
        let mut subfeeds = self.registry.subfeeds.lock().expect("feed mutex poisoned");
        let entry = subfeeds.entry(key.clone()).or_insert_with(|| {
            Arc::new(LocalSubfeed {
                key: key.clone(),
                state: Mutex::new(SubfeedState {
                    messages: Vec::new(),
                    access: AccessRules { allow_append: true },
                }),
                notify: Notify::new(),
            })
        });
        Ok(entry.clone())
    }
}

pub struct LocalSubfeed {
    key: SubfeedKey,
    state: Mutex<SubfeedState>,
    notify: Notify,
}

#[async_trait]
impl Subfeed for LocalSubfeed {
    fn key(&self) -> &SubfeedKey {
        &self.key
    }

    async fn append(&self, message: serde_json::Value) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().expect("subfeed mutex poisoned");
            anyhow::ensure!(state.access.allow_append, "subfeed does not allow appends");
            state.messages.push(message);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn get_next(
        &self,
        position: u64,
        timeout: Duration,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking state, so an append that happens between the
            // check and the wait below still wakes us up instead of racing past us.
            let notified = self.notify.notified();
            if let Some(message) = self
                .state
                .lock()
                .expect("subfeed mutex poisoned")
                .messages
                .get(position as usize)
                .cloned()
            {
                return Ok(Some(message));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if tokio::time::timeout(deadline - now, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn get_num_messages(&self) -> anyhow::Result<u64> {
        Ok(self.state.lock().expect("subfeed mutex poisoned").messages.len() as u64)
    }

    async fn set_access_rules(&self, rules: AccessRules) -> anyhow::Result<()> {
        self.state.lock().expect("subfeed mutex poisoned").access = rules;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn appended_messages_are_readable_in_order() {
        let feed = LocalFeed::new();
        let sub = feed.subfeed(SubfeedKey::Name("main".into())).await.unwrap();
        sub.append(json!({"n": 1})).await.unwrap();
        sub.append(json!({"n": 2})).await.unwrap();
        assert_eq!(sub.get_num_messages().await.unwrap(), 2);
        assert_eq!(
            sub.get_next(0, Duration::from_millis(10)).await.unwrap(),
            Some(json!({"n": 1}))
        );
        assert_eq!(
            sub.get_next(1, Duration::from_millis(10)).await.unwrap(),
            Some(json!({"n": 2}))
        );
    }

    #[tokio::test]
    async fn get_next_times_out_when_nothing_arrives() {
        let feed = LocalFeed::new();
        let sub = feed.subfeed(SubfeedKey::Name("quiet".into())).await.unwrap();
        let result = sub.get_next(0, Duration::from_millis(20)).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn two_handles_on_the_same_key_see_the_same_log() {
        let registry = LocalFeedRegistry::new();
        let writer = registry.feed();
        let reader = registry.feed();

        let writer_sub = writer.subfeed(SubfeedKey::Name("shared".into())).await.unwrap();
        let reader_sub = reader.subfeed(SubfeedKey::Name("shared".into())).await.unwrap();

        writer_sub.append(json!("hello")).await.unwrap();
        assert_eq!(
            reader_sub.get_next(0, Duration::from_millis(50)).await.unwrap(),
            Some(json!("hello"))
        );
    }

    #[tokio::test]
    async fn append_blocked_by_access_rules_is_rejected() {
        let feed = LocalFeed::new();
        let sub = feed.subfeed(SubfeedKey::Name("locked".into())).await.unwrap();
        sub.set_access_rules(AccessRules { allow_append: false })
            .await
            .unwrap();
        assert!(sub.append(json!(1)).await.is_err());
    }
}

//! FSM session storage: a state string plus a JSON object of data per key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::Result;

/// Auxiliary session data.
pub type FsmData = Map<String, Value>;

/// Key-value store for FSM sessions.
///
/// Stores must tolerate concurrent access for distinct keys. Same-key ordering is
/// enforced upstream by the dispatcher.
#[async_trait]
pub trait FsmStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, state: &str) -> Result<()>;

    async fn clear(&self, key: &str) -> Result<()>;

    /// Missing data reads as an empty object.
    async fn get_data(&self, key: &str) -> Result<FsmData>;

    async fn set_data(&self, key: &str, data: FsmData) -> Result<()>;

    /// Shallow-merges `patch` over the stored data and returns the result.
    async fn update_data(&self, key: &str, patch: FsmData) -> Result<FsmData>;

    async fn clear_data(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

fn prune<T>(map: &mut HashMap<String, Entry<T>>, now: Instant) {
    map.retain(|_, entry| entry.live(now));
}

/// In-process store; optionally expires entries a fixed time after their last write.
///
/// Expired entries read as absent right away and are swept from memory by the
/// first write after each TTL period.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    states: RwLock<HashMap<String, Entry<String>>>,
    data: RwLock<HashMap<String, Entry<FsmData>>>,
    ttl: Option<Duration>,
    next_sweep: Mutex<Option<Instant>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    fn expiry(&self) -> Option<Instant> {
        self.ttl.map(|ttl| Instant::now() + ttl)
    }

    /// Whether a write should sweep expired entries now.
    fn sweep_due(&self, now: Instant) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        let mut next = self.next_sweep.lock().unwrap_or_else(|e| e.into_inner());
        match *next {
            Some(at) if at > now => false,
            _ => {
                *next = Some(now + ttl);
                true
            }
        }
    }

    async fn sweep(&self, now: Instant) {
        if self.sweep_due(now) {
            prune(&mut *self.states.write().await, now);
            prune(&mut *self.data.write().await, now);
        }
    }

    /// Number of live state entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.states.read().await.values().filter(|e| e.live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl FsmStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let states = self.states.read().await;
        Ok(states
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, state: &str) -> Result<()> {
        self.sweep(Instant::now()).await;
        let entry = Entry {
            value: state.to_string(),
            expires_at: self.expiry(),
        };
        self.states.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.states.write().await.remove(key);
        Ok(())
    }

    async fn get_data(&self, key: &str) -> Result<FsmData> {
        let now = Instant::now();
        let data = self.data.read().await;
        Ok(data
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone())
            .unwrap_or_default())
    }

    async fn set_data(&self, key: &str, data: FsmData) -> Result<()> {
        self.sweep(Instant::now()).await;
        let entry = Entry {
            value: data,
            expires_at: self.expiry(),
        };
        self.data.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn update_data(&self, key: &str, patch: FsmData) -> Result<FsmData> {
        let now = Instant::now();
        self.sweep(now).await;
        let mut data = self.data.write().await;
        let mut merged = data
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone())
            .unwrap_or_default();
        merged.extend(patch);
        data.insert(
            key.to_string(),
            Entry {
                value: merged.clone(),
                expires_at: self.expiry(),
            },
        );
        Ok(merged)
    }

    async fn clear_data(&self, key: &str) -> Result<()> {
        self.data.write().await.remove(key);
        Ok(())
    }
}

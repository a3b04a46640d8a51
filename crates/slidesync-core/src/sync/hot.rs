//! TTL-bounded working set for the ON_DEMAND tier.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::models::EntityType;

/// Entity instances recently marked as accessed by the web layer.
pub struct HotSet {
    ttl: Duration,
    entries: Mutex<HashMap<(EntityType, String), Instant>>,
    notify: Notify,
}

impl HotSet {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        }
    }

    /// Mark an instance hot, refreshing its expiry, and wake the sweeper.
    pub fn mark(&self, entity: EntityType, natural_key: &str) {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((entity, natural_key.to_string()), expires_at);
        self.notify.notify_one();
    }

    /// Unexpired entries, dropping expired ones as a side effect.
    pub fn active(&self) -> Vec<(EntityType, String)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, expires_at| *expires_at > now);
        let mut active: Vec<_> = entries.keys().cloned().collect();
        active.sort();
        active
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves after the next [`HotSet::mark`] (or immediately if one is pending).
    pub async fn marked(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let hot = HotSet::new(Duration::from_secs(60));
        hot.mark(EntityType::Document, "q3-review");
        assert_eq!(hot.len(), 1);

        tokio::time::advance(Duration::from_secs(30)).await;
        hot.mark(EntityType::Document, "q3-review");
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(
            hot.active(),
            vec![(EntityType::Document, "q3-review".to_string())]
        );

        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(hot.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn marking_wakes_waiter() {
        let hot = std::sync::Arc::new(HotSet::new(Duration::from_secs(60)));
        let waiter = {
            let hot = hot.clone();
            tokio::spawn(async move { hot.marked().await })
        };
        tokio::task::yield_now().await;
        hot.mark(EntityType::User, "alice");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}

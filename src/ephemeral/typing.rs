//! Typing indicators
//!
//! A subject is typing while its key exists. The per-scope index is scored
//! by expiry so `typing_in` can list who is typing without scanning keys;
//! lapsed index entries are trimmed lazily on read.

use bytes::Bytes;

use super::EphemeralStateTracker;

impl EphemeralStateTracker {
    fn typing_key(&self, scope: &str, subject: &str) -> String {
        self.key(&["typing", scope, subject])
    }

    fn typing_index_key(&self, scope: &str) -> String {
        self.key(&["typing_in", scope])
    }

    /// Mark `subject` as typing in `scope` for `typing_ttl`. Repeated calls
    /// extend the window; only the first publishes.
    pub async fn set_typing(&self, scope: &str, subject: &str) {
        let key = self.typing_key(scope, subject);
        let ttl = self.config.typing_ttl;

        let was_typing = self.store.exists(&key).await;
        let was_typing = self.degrade("typing.exists", was_typing, false);

        let set = self.store.set(&key, Bytes::from_static(b"1"), Some(ttl)).await;
        if self.degrade("typing.set", set.map(|_| true), false) {
            let until = self.now_ms() + ttl.as_millis() as i64;
            let indexed = self
                .store
                .zadd(&self.typing_index_key(scope), subject, until as f64)
                .await;
            self.degrade("typing.index", indexed, false);

            if !was_typing {
                self.hooks.on_typing_changed(scope, subject, true).await;
            }
        }
    }

    /// Stop the indicator early. Returns whether `subject` was typing.
    pub async fn clear_typing(&self, scope: &str, subject: &str) -> bool {
        let deleted = self.store.delete(&self.typing_key(scope, subject)).await;
        let deleted = self.degrade("typing.clear", deleted, false);

        let unindexed = self.store.zrem(&self.typing_index_key(scope), subject).await;
        self.degrade("typing.unindex", unindexed, false);

        if deleted {
            self.hooks.on_typing_changed(scope, subject, false).await;
        }
        deleted
    }

    /// Whether `subject` is typing in `scope`. A lapsed TTL reads as `false`.
    pub async fn is_typing(&self, scope: &str, subject: &str) -> bool {
        let exists = self.store.exists(&self.typing_key(scope, subject)).await;
        self.degrade("typing.is_typing", exists, false)
    }

    /// Subjects currently typing in `scope`
    pub async fn typing_in(&self, scope: &str) -> Vec<String> {
        let key = self.typing_index_key(scope);
        let now = self.now_ms() as f64;

        let trimmed = self.store.zpop_by_score(&key, now, None).await;
        self.degrade("typing.trim", trimmed, Vec::new());

        let live = self.store.zrange_by_score(&key, now, f64::INFINITY).await;
        self.degrade("typing.typing_in", live, Vec::new())
            .into_iter()
            .filter(|(_, until)| *until > now)
            .map(|(subject, _)| subject)
            .collect()
    }
}

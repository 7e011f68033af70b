//! Unread counters
//!
//! Unlike typing and presence these never expire: they live until reset.
//! Each subject has an aggregate total plus one counter per scope, and a
//! registry set naming the scopes that currently hold a counter.

use bytes::Bytes;
use tracing::warn;

use super::{EphemeralStateTracker, UnreadCounts};

impl EphemeralStateTracker {
    fn unread_total_key(&self, subject: &str) -> String {
        self.key(&["unread", subject, "total"])
    }

    fn unread_scope_key(&self, subject: &str, scope: &str) -> String {
        self.key(&["unread", subject, "scope", scope])
    }

    fn unread_scopes_key(&self, subject: &str) -> String {
        self.key(&["unread", subject, "scopes"])
    }

    /// Count one unread item for `subject`, optionally within `scope`.
    /// Returns the new count of the scope, or of the total when unscoped.
    pub async fn increment_unread(&self, subject: &str, scope: Option<&str>) -> i64 {
        let scoped = match scope {
            Some(scope) => {
                let count = self.store.incr_by(&self.unread_scope_key(subject, scope), 1).await;
                let Some(count) = self.degrade("unread.increment", count.map(Some), None) else {
                    return 0;
                };
                if let Err(e) = self.store.sadd(&self.unread_scopes_key(subject), scope).await {
                    warn!(subject, scope, error = %e, "Failed to register unread scope");
                }
                Some(count)
            }
            None => None,
        };

        let total = self.store.incr_by(&self.unread_total_key(subject), 1).await;
        let Some(total) = self.degrade("unread.increment_total", total.map(Some), None) else {
            return scoped.unwrap_or(0);
        };

        let count = scoped.unwrap_or(total);
        self.hooks.on_unread_changed(subject, scope, count, total).await;
        count
    }

    /// Clear unread state. With a scope, only that scope is cleared and its
    /// amount is subtracted from the total; without one, everything is.
    /// Returns the amount cleared.
    pub async fn reset_unread(&self, subject: &str, scope: Option<&str>) -> i64 {
        match scope {
            Some(scope) => self.reset_scope(subject, scope).await,
            None => self.reset_all(subject).await,
        }
    }

    /// Unregister the scope before popping its counter. An increment that
    /// lands after the pop registers the scope again with its own `sadd`,
    /// so a live counter is never left out of the registry.
    async fn reset_scope(&self, subject: &str, scope: &str) -> i64 {
        let scopes_key = self.unread_scopes_key(subject);
        let cleared = self.pop_scope(subject, &scopes_key, scope).await;
        if cleared == 0 {
            return 0;
        }

        let total = self
            .store
            .incr_by(&self.unread_total_key(subject), -cleared)
            .await;
        let total = self.degrade("unread.reset_total", total, 0);
        self.hooks.on_unread_changed(subject, Some(scope), 0, total).await;
        cleared
    }

    /// Subtracts what was read from the total rather than deleting it, so
    /// increments racing the reset stay counted on both sides.
    async fn reset_all(&self, subject: &str) -> i64 {
        let total_key = self.unread_total_key(subject);
        let total = self.store.get(&total_key).await;
        let cleared = parse_count(self.degrade("unread.reset", total, None));

        let scopes_key = self.unread_scopes_key(subject);
        let scopes = self.store.smembers(&scopes_key).await;
        for scope in self.degrade("unread.reset_scopes", scopes, Vec::new()) {
            self.pop_scope(subject, &scopes_key, &scope).await;
        }

        if cleared != 0 {
            let remaining = self.store.incr_by(&total_key, -cleared).await;
            let remaining = self.degrade("unread.reset_total", remaining, 0);
            self.hooks.on_unread_changed(subject, None, 0, remaining).await;
        }
        cleared
    }

    async fn pop_scope(&self, subject: &str, scopes_key: &str, scope: &str) -> i64 {
        if let Err(e) = self.store.srem(scopes_key, scope).await {
            warn!(subject, scope, error = %e, "Failed to unregister unread scope");
        }

        let scope_key = self.unread_scope_key(subject, scope);
        let popped = self.store.get_and_delete(&scope_key).await;
        let cleared = parse_count(self.degrade("unread.reset", popped, None));

        // a counter recreated since the pop must stay visible
        if matches!(self.store.exists(&scope_key).await, Ok(true)) {
            if let Err(e) = self.store.sadd(scopes_key, scope).await {
                warn!(subject, scope, error = %e, "Failed to re-register unread scope");
            }
        }
        cleared
    }

    /// Unread count of one scope, or the total when `scope` is `None`
    pub async fn get_unread(&self, subject: &str, scope: Option<&str>) -> i64 {
        let key = match scope {
            Some(scope) => self.unread_scope_key(subject, scope),
            None => self.unread_total_key(subject),
        };
        let raw = self.store.get(&key).await;
        parse_count(self.degrade("unread.get", raw, None))
    }

    /// Total plus every scoped counter of `subject`
    pub async fn get_all(&self, subject: &str) -> UnreadCounts {
        let scopes = self.store.smembers(&self.unread_scopes_key(subject)).await;
        let scopes = self.degrade("unread.scopes", scopes, Vec::new());

        let mut keys = Vec::with_capacity(scopes.len() + 1);
        keys.push(self.unread_total_key(subject));
        keys.extend(scopes.iter().map(|s| self.unread_scope_key(subject, s)));

        let raws = self.store.mget(&keys).await;
        let mut values = self
            .degrade("unread.get_all", raws, Vec::new())
            .into_iter()
            .map(parse_count);

        let total = values.next().unwrap_or(0);
        let by_scope = scopes
            .into_iter()
            .zip(values)
            .filter(|(_, count)| *count != 0)
            .collect();

        UnreadCounts { total, by_scope }
    }
}

/// Integers are stored as ASCII decimal; anything unreadable counts as zero
fn parse_count(raw: Option<Bytes>) -> i64 {
    raw.and_then(|raw| std::str::from_utf8(&raw).ok()?.trim().parse().ok())
        .unwrap_or(0)
}

//! Live viewer membership per room
//!
//! The reap job only visits rooms in the `viewer_rooms` registry, so every
//! join and touch (re)registers its room; a registry write lost to an
//! outage heals on the viewer's next touch.

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::EphemeralStateTracker;

impl EphemeralStateTracker {
    fn viewers_key(&self, room: &str) -> String {
        self.key(&["viewers", room])
    }

    fn rooms_key(&self) -> String {
        self.key(&["viewer_rooms"])
    }

    /// Oldest last-seen score that still counts as live
    fn viewer_cutoff(&self, now_ms: i64) -> f64 {
        (now_ms - self.config.viewer_timeout.as_millis() as i64) as f64
    }

    /// Add `viewer` to `room` (or refresh it) and return the live count
    pub async fn join(&self, room: &str, viewer: &str) -> usize {
        let now = self.now_ms();
        let added = self.store.zadd(&self.viewers_key(room), viewer, now as f64).await;
        let added = self.degrade("viewers.join", added, false);
        self.register_room(room).await;

        let count = self.count(room).await;
        if added {
            self.hooks.on_viewer_count_changed(room, count).await;
        }
        count
    }

    /// Liveness refresh. Returns `false` when the viewer was already reaped
    /// and must join again.
    pub async fn touch(&self, room: &str, viewer: &str) -> bool {
        let result = self
            .store
            .zupdate_score(&self.viewers_key(room), viewer, self.now_ms() as f64)
            .await;
        let touched = self.degrade("viewers.touch", result, false);
        if touched {
            self.register_room(room).await;
        }
        touched
    }

    async fn register_room(&self, room: &str) {
        if let Err(e) = self.store.sadd(&self.rooms_key(), room).await {
            warn!(room, error = %e, "Failed to register viewer room, reaping skips it until the next touch");
        }
    }

    /// Remove `viewer` from `room` and return the live count
    pub async fn leave(&self, room: &str, viewer: &str) -> usize {
        let removed = self.store.zrem(&self.viewers_key(room), viewer).await;
        let removed = self.degrade("viewers.leave", removed, false);

        let count = self.count(room).await;
        if removed {
            self.hooks.on_viewer_count_changed(room, count).await;
        }
        count
    }

    /// Live viewers in `room`
    pub async fn count(&self, room: &str) -> usize {
        self.members(room).await.len()
    }

    /// Ids of live viewers in `room`, least recently seen first
    pub async fn members(&self, room: &str) -> Vec<String> {
        let cutoff = self.viewer_cutoff(self.now_ms());
        let result = self
            .store
            .zrange_by_score(&self.viewers_key(room), cutoff, f64::INFINITY)
            .await;
        self.degrade("viewers.members", result, Vec::new())
            .into_iter()
            .filter(|(_, score)| *score > cutoff)
            .map(|(member, _)| member)
            .collect()
    }

    /// Drop viewers not touched within `viewer_timeout` of `now` in every
    /// known room, publishing the new counts. Returns how many were dropped.
    #[instrument(skip(self))]
    pub async fn reap_stale_viewers(&self, now: DateTime<Utc>) -> crate::error::Result<usize> {
        let cutoff = self.viewer_cutoff(now.timestamp_millis());
        let rooms_key = self.rooms_key();
        let rooms = self.store.smembers(&rooms_key).await?;

        let mut dropped = 0;
        for room in rooms {
            let key = self.viewers_key(&room);
            let stale = match self.store.zpop_by_score(&key, cutoff, None).await {
                Ok(stale) => stale,
                Err(e) => {
                    debug!(room = %room, error = %e, "Viewer reap failed for room");
                    continue;
                }
            };

            if !stale.is_empty() {
                dropped += stale.len();
                let count = self.count(&room).await;
                self.hooks.on_viewer_count_changed(&room, count).await;
            }

            self.forget_room_if_empty(&rooms_key, &room, &key).await;
        }

        if dropped > 0 {
            debug!(dropped, "Reaped stale viewers");
        }
        Ok(dropped)
    }

    async fn forget_room_if_empty(&self, rooms_key: &str, room: &str, key: &str) {
        if !matches!(self.store.zcard(key).await, Ok(0)) {
            return;
        }
        if self.store.srem(rooms_key, room).await.is_err() {
            return;
        }
        // a join may have landed between the two calls
        if matches!(self.store.zcard(key).await, Ok(n) if n > 0) {
            if let Err(e) = self.store.sadd(rooms_key, room).await {
                warn!(room, error = %e, "Failed to re-register viewer room after a concurrent join");
            }
        }
    }
}

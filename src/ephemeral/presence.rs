//! Presence with heartbeat-refreshed TTL

use bytes::Bytes;

use super::EphemeralStateTracker;
use crate::domain::PresenceState;

impl EphemeralStateTracker {
    fn presence_key(&self, subject: &str) -> String {
        self.key(&["presence", subject])
    }

    /// Set the presence of `subject`. `Offline` removes the key; any other
    /// state lives for `presence_ttl` unless refreshed.
    pub async fn set_presence(&self, subject: &str, state: PresenceState) {
        let previous = self.get_presence(subject).await;
        let key = self.presence_key(subject);

        let written = match state {
            PresenceState::Offline => self.store.delete(&key).await.map(|_| ()),
            _ => {
                self.store
                    .set(
                        &key,
                        Bytes::from_static(state.as_str().as_bytes()),
                        Some(self.config.presence_ttl),
                    )
                    .await
            }
        };

        if self.degrade("presence.set", written.map(|_| true), false) && previous != state {
            self.hooks.on_presence_changed(subject, state).await;
        }
    }

    /// Refresh the TTL of the current presence. Returns `false` when the key
    /// already lapsed and the subject reads as offline.
    pub async fn heartbeat(&self, subject: &str) -> bool {
        let refreshed = self
            .store
            .expire(&self.presence_key(subject), self.config.presence_ttl)
            .await;
        self.degrade("presence.heartbeat", refreshed, false)
    }

    /// Presence of `subject`; a missing or unreadable key is `Offline`
    pub async fn get_presence(&self, subject: &str) -> PresenceState {
        let raw = self.store.get(&self.presence_key(subject)).await;
        parse_presence(self.degrade("presence.get", raw, None))
    }

    /// Presence of several subjects with one batch read, in input order
    pub async fn get_presence_many(&self, subjects: &[String]) -> Vec<(String, PresenceState)> {
        let keys: Vec<String> = subjects.iter().map(|s| self.presence_key(s)).collect();
        let raws = self.store.mget(&keys).await;
        let raws = self.degrade("presence.get_many", raws, vec![None; subjects.len()]);

        subjects
            .iter()
            .cloned()
            .zip(raws.into_iter().map(parse_presence))
            .collect()
    }
}

fn parse_presence(raw: Option<Bytes>) -> PresenceState {
    raw.and_then(|raw| std::str::from_utf8(&raw).ok()?.parse().ok())
        .unwrap_or(PresenceState::Offline)
}

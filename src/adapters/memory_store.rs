//! In-Memory Key-Value Store
//!
//! Implements the [`KeyValueStore`] port on a sharded `DashMap`. Each
//! operation holds the shard lock for its key for the whole read-modify-write,
//! so it is atomic with respect to every other operation on that key. TTLs
//! are evaluated lazily against the injected [`Clock`].
//!
//! Used by tests and by single-process deployments. It also carries
//! fault-injection switches: [`set_available`](InMemoryKeyValueStore::set_available)
//! for a full outage, [`set_latency`](InMemoryKeyValueStore::set_latency), and
//! [`fail_after`](InMemoryKeyValueStore::fail_after) to fail single operations.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::clock::{SharedClock, SystemClock};
use crate::domain::ports::KeyValueStore;
use crate::error::{Error, Result};

// =============================================================================
// Stored Values
// =============================================================================

/// Total-ordered score wrapper so scores can key a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.total_cmp(&other.0)
    }
}

/// Sorted set: member lookup plus score ordering.
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(Score, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) -> bool {
        match self.scores.insert(member.to_string(), score) {
            Some(old) => {
                self.order.remove(&(Score(old), member.to_string()));
                self.order.insert((Score(score), member.to_string()));
                false
            }
            None => {
                self.order.insert((Score(score), member.to_string()));
                true
            }
        }
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.order.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn range(&self, min: f64, max: f64) -> Vec<(String, f64)> {
        self.order
            .range((Score(min), String::new())..)
            .take_while(|(score, _)| score.0 <= max)
            .map(|(score, member)| (member.clone(), score.0))
            .collect()
    }

    fn pop_upto(&mut self, max: f64, limit: Option<usize>) -> Vec<(String, f64)> {
        let limit = limit.unwrap_or(usize::MAX);
        let due: Vec<(Score, String)> = self
            .order
            .iter()
            .take_while(|(score, _)| score.0 <= max)
            .take(limit)
            .cloned()
            .collect();

        for entry in &due {
            self.order.remove(entry);
            self.scores.remove(&entry.1);
        }

        due.into_iter()
            .map(|(score, member)| (member, score.0))
            .collect()
    }

    fn len(&self) -> usize {
        self.scores.len()
    }
}

#[derive(Debug)]
enum Value {
    Str(Bytes),
    ZSet(SortedSet),
    Set(HashSet<String>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::ZSet(_) => "zset",
            Value::Set(_) => "set",
        }
    }

    fn is_empty_collection(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::ZSet(z) => z.len() == 0,
            Value::Set(s) => s.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: Value,
    /// Expiry as epoch millis, `None` = persistent
    expires_at: Option<i64>,
}

impl Slot {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    #[inline]
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> Error {
    Error::WrongType {
        key: key.to_string(),
        reason: format!("expected {}, found {}", expected, found.kind()),
    }
}

fn ttl_deadline(now: i64, ttl: Duration) -> i64 {
    now.saturating_add(ttl.as_millis() as i64)
}

// =============================================================================
// Statistics
// =============================================================================

/// Operation counters for the in-memory store
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreStats {
    /// Live and not-yet-purged keys
    pub keys: usize,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Operations rejected while marked unavailable
    pub rejected: u64,
}

/// Pending failures for one operation name
#[derive(Debug, Clone, Copy)]
struct Fault {
    skip: u32,
    fail: u32,
}

// =============================================================================
// Store
// =============================================================================

/// In-memory [`KeyValueStore`].
pub struct InMemoryKeyValueStore {
    data: DashMap<String, Slot>,
    clock: SharedClock,
    available: AtomicBool,
    latency: RwLock<Option<Duration>>,
    faults: Mutex<HashMap<String, Fault>>,
    reads: AtomicU64,
    writes: AtomicU64,
    rejected: AtomicU64,
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new(SystemClock::shared())
    }
}

impl InMemoryKeyValueStore {
    /// Create an empty store reading time from `clock`
    pub fn new(clock: SharedClock) -> Self {
        Self {
            data: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
            latency: RwLock::new(None),
            faults: Mutex::new(HashMap::new()),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Add artificial latency to every operation.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Fail the next `times` calls of `operation` (e.g. `"sadd"`).
    pub fn fail_next(&self, operation: &str, times: u32) {
        self.fail_after(operation, 0, times);
    }

    /// Let `skip` calls of `operation` through, then fail the next `times`.
    pub fn fail_after(&self, operation: &str, skip: u32, times: u32) {
        self.faults
            .lock()
            .insert(operation.to_string(), Fault { skip, fail: times });
    }

    fn injected_fault(&self, operation: &str) -> bool {
        let mut faults = self.faults.lock();
        let Some(fault) = faults.get_mut(operation) else {
            return false;
        };
        if fault.skip > 0 {
            fault.skip -= 1;
            return false;
        }
        if fault.fail > 0 {
            fault.fail -= 1;
            return true;
        }
        faults.remove(operation);
        false
    }

    /// Remaining TTL of a key, if it has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_millis();
        self.data
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .and_then(|slot| slot.expires_at)
            .map(|at| Duration::from_millis((at - now).max(0) as u64))
    }

    /// Drop every key
    pub fn clear(&self) {
        self.data.clear();
    }

    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            keys: self.data.len(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    async fn gate(&self, operation: &str, write: bool) -> Result<i64> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::unavailable(operation, "store marked unavailable"));
        }
        if self.injected_fault(operation) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::unavailable(operation, "injected fault"));
        }
        if write {
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(self.clock.now_millis())
    }

    /// Run `f` against the live slot for `key`, creating it with `make` when
    /// missing or expired. Collections left empty are removed afterwards.
    fn with_slot<R>(
        &self,
        key: &str,
        now: i64,
        make: impl FnOnce() -> Value,
        f: impl FnOnce(&mut Slot) -> Result<R>,
    ) -> Result<R> {
        let result = match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Slot::new(make()));
                }
                f(occupied.get_mut())
            }
            Entry::Vacant(vacant) => {
                let mut slot = vacant.insert(Slot::new(make()));
                f(&mut slot)
            }
        };

        self.data
            .remove_if(key, |_, slot| slot.value.is_empty_collection());
        result
    }

    /// Run `f` against the live slot for `key` without creating it.
    fn with_existing<R>(
        &self,
        key: &str,
        now: i64,
        f: impl FnOnce(&mut Slot) -> Result<R>,
    ) -> Result<Option<R>> {
        self.data.remove_if(key, |_, slot| slot.is_expired(now));
        let result = match self.data.get_mut(key) {
            Some(mut slot) => Some(f(&mut slot)?),
            None => None,
        };
        self.data
            .remove_if(key, |_, slot| slot.value.is_empty_collection());
        Ok(result)
    }

    fn read<R>(&self, key: &str, now: i64, f: impl FnOnce(&Value) -> Result<R>) -> Result<Option<R>> {
        match self.data.get(key) {
            Some(slot) if !slot.is_expired(now) => Ok(Some(f(&slot.value)?)),
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let now = self.gate("get", false).await?;
        self.read(key, now, |value| match value {
            Value::Str(bytes) => Ok(bytes.clone()),
            other => Err(wrong_type(key, "string", other)),
        })
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Bytes>>> {
        let now = self.gate("mget", false).await?;
        Ok(keys
            .iter()
            .map(|key| match self.data.get(key.as_str()) {
                Some(slot) if !slot.is_expired(now) => match &slot.value {
                    Value::Str(bytes) => Some(bytes.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect())
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let now = self.gate("set", true).await?;
        let slot = Slot {
            value: Value::Str(value),
            expires_at: ttl.map(|ttl| ttl_deadline(now, ttl)),
        };
        self.data.insert(key.to_string(), slot);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.gate("delete", true).await?;
        Ok(matches!(self.data.remove(key), Some((_, slot)) if !slot.is_expired(now)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.gate("exists", false).await?;
        Ok(self.read(key, now, |_| Ok(()))?.is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let now = self.gate("incr_by", true).await?;
        self.with_slot(
            key,
            now,
            || Value::Str(Bytes::from_static(b"0")),
            |slot| {
                let current = match &slot.value {
                    Value::Str(bytes) if bytes.is_empty() => 0,
                    Value::Str(bytes) => std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or_else(|| Error::WrongType {
                            key: key.to_string(),
                            reason: "value is not an integer".to_string(),
                        })?,
                    other => return Err(wrong_type(key, "string", other)),
                };
                let next = current.checked_add(delta).ok_or_else(|| Error::WrongType {
                    key: key.to_string(),
                    reason: "increment would overflow".to_string(),
                })?;
                slot.value = Value::Str(Bytes::from(next.to_string()));
                Ok(next)
            },
        )
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.gate("expire", true).await?;
        Ok(self
            .with_existing(key, now, |slot| {
                slot.expires_at = Some(ttl_deadline(now, ttl));
                Ok(())
            })?
            .is_some())
    }

    async fn get_and_delete(&self, key: &str) -> Result<Option<Bytes>> {
        let now = self.gate("get_and_delete", true).await?;
        let removed = self.data.remove_if(key, |_, slot| {
            !slot.is_expired(now) && matches!(slot.value, Value::Str(_))
        });
        match removed {
            Some((_, Slot { value: Value::Str(bytes), .. })) => Ok(Some(bytes)),
            Some(_) => Ok(None),
            None => {
                // Either absent, expired or not a string
                if let Some(slot) = self.data.get(key) {
                    if !slot.is_expired(now) {
                        return Err(wrong_type(key, "string", &slot.value));
                    }
                }
                Ok(None)
            }
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        let now = self.gate("zadd", true).await?;
        self.with_slot(
            key,
            now,
            || Value::ZSet(SortedSet::default()),
            |slot| match &mut slot.value {
                Value::ZSet(zset) => Ok(zset.insert(member, score)),
                other => Err(wrong_type(key, "zset", other)),
            },
        )
    }

    async fn zupdate_score(&self, key: &str, member: &str, score: f64) -> Result<bool> {
        let now = self.gate("zupdate_score", true).await?;
        Ok(self
            .with_existing(key, now, |slot| match &mut slot.value {
                Value::ZSet(zset) if zset.scores.contains_key(member) => {
                    zset.insert(member, score);
                    Ok(true)
                }
                Value::ZSet(_) => Ok(false),
                other => Err(wrong_type(key, "zset", other)),
            })?
            .unwrap_or(false))
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let now = self.gate("zscore", false).await?;
        Ok(self
            .read(key, now, |value| match value {
                Value::ZSet(zset) => Ok(zset.scores.get(member).copied()),
                other => Err(wrong_type(key, "zset", other)),
            })?
            .flatten())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let now = self.gate("zrem", true).await?;
        Ok(self
            .with_existing(key, now, |slot| match &mut slot.value {
                Value::ZSet(zset) => Ok(zset.remove(member)),
                other => Err(wrong_type(key, "zset", other)),
            })?
            .unwrap_or(false))
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let now = self.gate("zcard", false).await?;
        Ok(self
            .read(key, now, |value| match value {
                Value::ZSet(zset) => Ok(zset.len()),
                other => Err(wrong_type(key, "zset", other)),
            })?
            .unwrap_or(0))
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        let now = self.gate("zrange_by_score", false).await?;
        Ok(self
            .read(key, now, |value| match value {
                Value::ZSet(zset) => Ok(zset.range(min, max)),
                other => Err(wrong_type(key, "zset", other)),
            })?
            .unwrap_or_default())
    }

    async fn zpop_by_score(
        &self,
        key: &str,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<(String, f64)>> {
        let now = self.gate("zpop_by_score", true).await?;
        Ok(self
            .with_existing(key, now, |slot| match &mut slot.value {
                Value::ZSet(zset) => Ok(zset.pop_upto(max, limit)),
                other => Err(wrong_type(key, "zset", other)),
            })?
            .unwrap_or_default())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let now = self.gate("sadd", true).await?;
        self.with_slot(
            key,
            now,
            || Value::Set(HashSet::new()),
            |slot| match &mut slot.value {
                Value::Set(set) => Ok(set.insert(member.to_string())),
                other => Err(wrong_type(key, "set", other)),
            },
        )
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let now = self.gate("srem", true).await?;
        Ok(self
            .with_existing(key, now, |slot| match &mut slot.value {
                Value::Set(set) => Ok(set.remove(member)),
                other => Err(wrong_type(key, "set", other)),
            })?
            .unwrap_or(false))
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let now = self.gate("smembers", false).await?;
        Ok(self
            .read(key, now, |value| match value {
                Value::Set(set) => Ok(set.iter().cloned().collect()),
                other => Err(wrong_type(key, "set", other)),
            })?
            .unwrap_or_default())
    }

    async fn scard(&self, key: &str) -> Result<usize> {
        let now = self.gate("scard", false).await?;
        Ok(self
            .read(key, now, |value| match value {
                Value::Set(set) => Ok(set.len()),
                other => Err(wrong_type(key, "set", other)),
            })?
            .unwrap_or(0))
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        let now = self.gate("sismember", false).await?;
        Ok(self
            .read(key, now, |value| match value {
                Value::Set(set) => Ok(set.contains(member)),
                other => Err(wrong_type(key, "set", other)),
            })?
            .unwrap_or(false))
    }

    async fn ping(&self) -> Result<()> {
        self.gate("ping", false).await.map(|_| ())
    }
}

// =============================================================================
// Tests
// =============================================================================

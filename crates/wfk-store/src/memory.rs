// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory store: the reference implementation of the store contract.
//!
//! All state sits behind one mutex, which makes every operation — including
//! [`Store::counter_apply`] — trivially atomic. Blocking stream reads are
//! implemented with a [`Notify`] that appenders ping.

use crate::{
    ChannelSubscription, CounterOutcome, Store, StoreError, StreamBus, StreamMessage,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;
use tracing::trace;

/// Default capacity of each pub/sub channel.
const CHANNEL_CAPACITY: usize = 256;

/// How long a delivered stream message stays invisible before it becomes
/// eligible for redelivery to another consumer.
const DEFAULT_REDELIVER_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct KvEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct RunCounter {
    value: i64,
    applied: BTreeSet<String>,
}

#[derive(Debug)]
struct PendingDelivery {
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index into the stream's entry vec of the next fresh message.
    cursor: usize,
    pending: BTreeMap<u64, PendingDelivery>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<(u64, Value)>,
    next_id: u64,
    groups: BTreeMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    kv: BTreeMap<String, KvEntry>,
    hashes: BTreeMap<String, BTreeMap<String, Value>>,
    sets: BTreeMap<String, BTreeSet<String>>,
    counters: BTreeMap<String, i64>,
    run_counters: BTreeMap<uuid::Uuid, RunCounter>,
    blobs: BTreeMap<String, Vec<u8>>,
    streams: BTreeMap<String, StreamState>,
    channels: BTreeMap<String, broadcast::Sender<Value>>,
}

/// In-memory [`Store`] + [`StreamBus`] implementation.
///
/// Cloning is cheap; all clones share state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
    redeliver_after: Duration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with the default redelivery timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_redelivery(DEFAULT_REDELIVER_AFTER)
    }

    /// Create an empty store with a custom redelivery timeout.
    #[must_use]
    pub fn with_redelivery(redeliver_after: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            appended: Arc::new(Notify::new()),
            redeliver_after,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning cannot leave partial state: every critical section is a
        // single map mutation.
        match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    /// Attempt one delivery for a group. Returns the message, or the instant
    /// of the earliest future redelivery (for wakeup scheduling).
    fn try_deliver(
        &self,
        stream: &str,
        group: &str,
        now: Instant,
    ) -> Result<Option<StreamMessage>, Option<Instant>> {
        let mut inner = self.lock();
        let state = inner.streams.entry(stream.to_string()).or_default();
        let StreamState { entries, groups, .. } = state;
        let gs = groups.entry(group.to_string()).or_default();

        // Expired pending deliveries are redelivered before fresh messages.
        let mut next_wakeup: Option<Instant> = None;
        let mut redeliver: Option<u64> = None;
        for (id, p) in &gs.pending {
            let due = p.delivered_at + self.redeliver_after;
            if due <= now {
                redeliver = Some(*id);
                break;
            }
            next_wakeup = Some(next_wakeup.map_or(due, |w| w.min(due)));
        }
        if let Some(id) = redeliver
            && let Some(p) = gs.pending.get_mut(&id)
        {
            p.delivered_at = now;
            p.delivery_count += 1;
            let delivery_count = p.delivery_count;
            let payload = entries
                .iter()
                .find(|(eid, _)| *eid == id)
                .map(|(_, v)| v.clone())
                .unwrap_or(Value::Null);
            return Ok(Some(StreamMessage {
                id,
                stream: stream.to_string(),
                payload,
                delivery_count,
            }));
        }

        if gs.cursor < entries.len() {
            let (id, payload) = entries[gs.cursor].clone();
            gs.cursor += 1;
            gs.pending.insert(
                id,
                PendingDelivery {
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            return Ok(Some(StreamMessage {
                id,
                stream: stream.to_string(),
                payload,
                delivery_count: 1,
            }));
        }

        Err(next_wakeup)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn kv_get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.kv.get(key) {
            Some(e) if e.is_expired(now) => {
                inner.kv.remove(key);
                Ok(None)
            }
            Some(e) => Ok(Some(e.value.clone())),
            None => Ok(None),
        }
    }

    async fn kv_set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn kv_set_nx(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let live = inner.kv.get(key).is_some_and(|e| !e.is_expired(now));
        if live {
            return Ok(false);
        }
        inner.kv.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|d| now + d),
            },
        );
        Ok(true)
    }

    async fn kv_delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().kv.remove(key).is_some())
    }

    async fn kv_scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let inner = self.lock();
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn hash_set(&self, key: &str, field: &str, value: Value) -> Result<(), StoreError> {
        self.lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, Value>, StoreError> {
        Ok(self.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_len(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.lock().hashes.get(key).map_or(0, BTreeMap::len))
    }

    async fn hash_delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().hashes.remove(key).is_some())
    }

    async fn hash_scan(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .hashes
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .is_some_and(|s| s.contains(member)))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        let mut inner = self.lock();
        let v = inner.counters.entry(key.to_string()).or_insert(0);
        *v += delta;
        Ok(*v)
    }

    async fn counter_value(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.lock().counters.get(key).copied().unwrap_or(0))
    }

    async fn run_counter(&self, run_id: uuid::Uuid) -> Result<i64, StoreError> {
        Ok(self
            .lock()
            .run_counters
            .get(&run_id)
            .map_or(0, |c| c.value))
    }

    async fn counter_applied(&self, run_id: uuid::Uuid, op_key: &str) -> Result<bool, StoreError> {
        Ok(self
            .lock()
            .run_counters
            .get(&run_id)
            .is_some_and(|c| c.applied.contains(op_key)))
    }

    async fn counter_apply(
        &self,
        run_id: uuid::Uuid,
        op_key: &str,
        delta: i64,
    ) -> Result<CounterOutcome, StoreError> {
        let mut inner = self.lock();
        let rc = inner.run_counters.entry(run_id).or_default();
        if rc.applied.contains(op_key) {
            trace!(target: "wfk.store", %run_id, op_key, "counter op already applied");
            return Ok(CounterOutcome {
                counter: rc.value,
                applied: false,
                reached_zero: false,
            });
        }
        rc.applied.insert(op_key.to_string());
        rc.value += delta;
        trace!(target: "wfk.store", %run_id, op_key, delta, counter = rc.value, "counter op applied");
        Ok(CounterOutcome {
            counter: rc.value,
            applied: true,
            reached_zero: rc.value == 0,
        })
    }

    async fn counter_clear(&self, run_id: uuid::Uuid) -> Result<(), StoreError> {
        self.lock().run_counters.remove(&run_id);
        Ok(())
    }

    async fn blob_put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.lock().blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn blob_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().blobs.get(key).cloned())
    }

    async fn blob_delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock().blobs.remove(key).is_some())
    }

    async fn publish(&self, channel: &str, payload: Value) -> Result<usize, StoreError> {
        let tx = {
            let mut inner = self.lock();
            inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        };
        Ok(tx.send(payload).unwrap_or(0))
    }

    fn subscribe(&self, channel: &str) -> ChannelSubscription {
        let mut inner = self.lock();
        let tx = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        ChannelSubscription::new(tx.subscribe())
    }
}

#[async_trait]
impl StreamBus for MemoryStore {
    async fn append(&self, stream: &str, payload: Value) -> Result<u64, StoreError> {
        let id = {
            let mut inner = self.lock();
            let state = inner.streams.entry(stream.to_string()).or_default();
            state.next_id += 1;
            let id = state.next_id;
            state.entries.push((id, payload));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamMessage>, StoreError> {
        let _ = consumer;
        let deadline = Instant::now() + block;
        loop {
            let now = Instant::now();
            let wakeup = match self.try_deliver(stream, group, now) {
                Ok(msg) => return Ok(msg),
                Err(w) => w,
            };
            if now >= deadline {
                return Ok(None);
            }
            let until = wakeup.map_or(deadline, |w| w.min(deadline));
            tokio::select! {
                () = self.appended.notified() => {}
                () = tokio::time::sleep_until(until) => {}
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: u64) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(state) = inner.streams.get_mut(stream) else {
            return Ok(false);
        };
        let Some(gs) = state.groups.get_mut(group) else {
            return Ok(false);
        };
        Ok(gs.pending.remove(&id).is_some())
    }

    async fn pending_len(&self, stream: &str, group: &str) -> Result<usize, StoreError> {
        let inner = self.lock();
        Ok(inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len()))
    }

    async fn stream_len(&self, stream: &str) -> Result<usize, StoreError> {
        Ok(self.lock().streams.get(stream).map_or(0, |s| s.next_id as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn kv_set_get_delete() {
        let store = MemoryStore::new();
        store.kv_set("k", json!(1), None).await.unwrap();
        assert_eq!(store.kv_get("k").await.unwrap(), Some(json!(1)));
        assert!(store.kv_delete("k").await.unwrap());
        assert_eq!(store.kv_get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn kv_ttl_expires() {
        let store = MemoryStore::new();
        store
            .kv_set("k", json!("v"), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(store.kv_get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.kv_get("k").await.unwrap(), None);
        // Expired key loses to nobody: SETNX wins again.
        assert!(store.kv_set_nx("k", json!("w"), None).await.unwrap());
    }

    #[tokio::test]
    async fn set_nx_wins_once() {
        let store = MemoryStore::new();
        assert!(store.kv_set_nx("a", json!(1), None).await.unwrap());
        assert!(!store.kv_set_nx("a", json!(2), None).await.unwrap());
        assert_eq!(store.kv_get("a").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn scan_respects_prefix() {
        let store = MemoryStore::new();
        store.kv_set("run:1", json!(1), None).await.unwrap();
        store.kv_set("run:2", json!(2), None).await.unwrap();
        store.kv_set("tag:1", json!(3), None).await.unwrap();
        let keys = store.kv_scan("run:").await.unwrap();
        assert_eq!(keys, vec!["run:1".to_string(), "run:2".to_string()]);
    }

    #[tokio::test]
    async fn counter_apply_is_idempotent_per_op_key() {
        let store = MemoryStore::new();
        let run = Uuid::now_v7();

        let first = store.counter_apply(run, "init", 2).await.unwrap();
        assert!(first.applied);
        assert_eq!(first.counter, 2);
        assert!(!first.reached_zero);

        let dup = store.counter_apply(run, "init", 2).await.unwrap();
        assert!(!dup.applied);
        assert_eq!(dup.counter, 2);

        let a = store.counter_apply(run, "consume:a", -1).await.unwrap();
        assert_eq!(a.counter, 1);
        let b = store.counter_apply(run, "consume:b", -1).await.unwrap();
        assert_eq!(b.counter, 0);
        assert!(b.reached_zero);

        // Replaying the final consume does not re-report zero.
        let replay = store.counter_apply(run, "consume:b", -1).await.unwrap();
        assert!(!replay.applied);
        assert!(!replay.reached_zero);
        assert_eq!(store.run_counter(run).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stream_fifo_and_ack() {
        let store = MemoryStore::new();
        store.append("s", json!(1)).await.unwrap();
        store.append("s", json!(2)).await.unwrap();

        let m1 = store
            .read_group("s", "g", "c1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let m2 = store
            .read_group("s", "g", "c1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(m1.payload, json!(1));
        assert_eq!(m2.payload, json!(2));
        assert_eq!(store.pending_len("s", "g").await.unwrap(), 2);

        assert!(store.ack("s", "g", m1.id).await.unwrap());
        assert_eq!(store.pending_len("s", "g").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_message_is_redelivered() {
        let store = MemoryStore::with_redelivery(Duration::from_secs(5));
        store.append("s", json!("job")).await.unwrap();

        let first = store
            .read_group("s", "g", "c1", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.delivery_count, 1);

        // Not yet due.
        assert!(
            store
                .read_group("s", "g", "c2", Duration::from_millis(1))
                .await
                .unwrap()
                .is_none()
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = store
            .read_group("s", "g", "c2", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn two_groups_each_see_all_messages() {
        let store = MemoryStore::new();
        store.append("s", json!("x")).await.unwrap();
        for group in ["g1", "g2"] {
            let m = store
                .read_group("s", group, "c", Duration::from_millis(10))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(m.payload, json!("x"));
        }
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_append() {
        let store = MemoryStore::new();
        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_group("s", "g", "c", Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("s", json!("wake")).await.unwrap();
        let msg = reader.await.unwrap().unwrap();
        assert_eq!(msg.payload, json!("wake"));
    }

    #[tokio::test]
    async fn pubsub_delivers_to_live_subscribers() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("ch");
        let n = store.publish("ch", json!({"hello": 1})).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(sub.recv().await, Some(json!({"hello": 1})));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let store = MemoryStore::new();
        let n = store.publish("nobody", json!(1)).await.unwrap();
        assert_eq!(n, 0);
    }
}

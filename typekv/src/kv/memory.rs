//! A single-process, in-memory `Kv` implementation backed by a sorted map.
//! This is the reference backend: every higher-level invariant is specified
//! against its behavior, and it is what the collection runtime's unit tests
//! run against by default.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::CResult;
use crate::key::{Key, Versionstamp};
use crate::kv::atomic::{AtomicSink, CommitOutcome, KvCheck, KvMutation, MutationKind};
use crate::kv::queue::QueueMessage;
use crate::kv::watch::WatchEvent;
use crate::kv::{AtomicBuilder, Entry, Kv, ListOptions, ListSelector, WatchStream};

struct StoredEntry {
    value: Vec<u8>,
    versionstamp: Versionstamp,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

struct QueuedMessage {
    message: QueueMessage,
    visible_at: Instant,
}

struct State {
    data: BTreeMap<Vec<u8>, StoredEntry>,
    next_versionstamp: u64,
    queue: VecDeque<QueuedMessage>,
    next_queue_id: u64,
}

/// Single-threaded-semantics, multi-thread-safe in-memory `Kv`. A single
/// `Mutex` serializes every operation, matching the cooperative-suspension
/// model: a caller only ever blocks at a KV-boundary call, never mid
/// computation.
pub struct MemoryKv {
    state: Mutex<State>,
    events: tokio::sync::broadcast::Sender<WatchEvent>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        let (events, _) = tokio::sync::broadcast::channel(1024);
        MemoryKv {
            state: Mutex::new(State {
                data: BTreeMap::new(),
                next_versionstamp: 1,
                queue: VecDeque::new(),
                next_queue_id: 1,
            }),
            events,
        }
    }

    fn broadcast(&self, key: Key, entry: Option<Entry>) {
        // No receivers is not an error: watch is opt-in.
        let _ = self.events.send((key, entry));
    }
}

impl Kv for MemoryKv {
    fn get(&self, key: &Key) -> CResult<Option<Entry>> {
        let state = self.state.lock()?;
        Ok(state.data.get(&key.encode()).filter(|e| e.is_live()).map(|e| Entry {
            value: e.value.clone(),
            versionstamp: e.versionstamp,
        }))
    }

    fn set(&self, key: &Key, value: Vec<u8>, expire_in: Option<Duration>) -> CResult<Versionstamp> {
        let versionstamp = {
            let mut state = self.state.lock()?;
            let versionstamp = Versionstamp(state.next_versionstamp);
            state.next_versionstamp += 1;
            let expires_at = expire_in.map(|d| Instant::now() + d);
            state.data.insert(key.encode(), StoredEntry { value: value.clone(), versionstamp, expires_at });
            versionstamp
        };
        self.broadcast(key.clone(), Some(Entry { value, versionstamp }));
        Ok(versionstamp)
    }

    fn delete(&self, key: &Key) -> CResult<()> {
        {
            let mut state = self.state.lock()?;
            state.data.remove(&key.encode());
        }
        self.broadcast(key.clone(), None);
        Ok(())
    }

    fn list(&self, selector: ListSelector, opts: ListOptions) -> CResult<Vec<(Key, Entry)>> {
        let state = self.state.lock()?;
        let (start, end) = crate::kv::selector_bounds(&selector);
        let range: Box<dyn Iterator<Item = (&Vec<u8>, &StoredEntry)>> = match end {
            Some(end) => Box::new(state.data.range(start..end)),
            None => Box::new(state.data.range(start..)),
        };
        let decoded = range
            .filter(|(_, e)| e.is_live())
            .map(|(k, e)| {
                let key = Key::decode(k)?;
                Ok((key, Entry { value: e.value.clone(), versionstamp: e.versionstamp }))
            })
            .collect::<CResult<Vec<_>>>()?;
        Ok(crate::kv::paginate(decoded.into_iter(), &opts))
    }

    fn atomic(&self) -> AtomicBuilder<'_> {
        AtomicBuilder::new(self)
    }

    fn enqueue(&self, topic: &str, value: Vec<u8>, delay: Option<Duration>) -> CResult<()> {
        let mut state = self.state.lock()?;
        let id = state.next_queue_id;
        state.next_queue_id += 1;
        let visible_at = Instant::now() + delay.unwrap_or_default();
        state.queue.push_back(QueuedMessage {
            message: QueueMessage { id, topic: topic.to_string(), value, delivery_count: 0 },
            visible_at,
        });
        Ok(())
    }

    fn dequeue(&self, topic: &str) -> CResult<Option<QueueMessage>> {
        let mut state = self.state.lock()?;
        let now = Instant::now();
        let pos = state.queue.iter().position(|m| m.visible_at <= now && m.message.topic == topic);
        Ok(pos.map(|i| state.queue.remove(i).unwrap().message))
    }

    fn watch(&self, keys: Vec<Key>) -> WatchStream {
        WatchStream::new(keys, self.events.subscribe())
    }
}

impl AtomicSink for MemoryKv {
    fn apply(
        &self,
        checks: &[KvCheck],
        mutations: &[KvMutation],
        enqueues: &[(String, Vec<u8>, Option<Duration>)],
    ) -> CResult<CommitOutcome> {
        let mut state = self.state.lock()?;

        for check in checks {
            let current = state.data.get(&check.key.encode()).filter(|e| e.is_live()).map(|e| e.versionstamp);
            if current != check.versionstamp {
                return Ok(CommitOutcome::Conflict);
            }
        }

        let versionstamp = Versionstamp(state.next_versionstamp);
        state.next_versionstamp += 1;

        let mut applied = Vec::with_capacity(mutations.len());
        for m in mutations {
            let encoded = m.key.encode();
            match &m.kind {
                MutationKind::Set(value, expire_in) => {
                    let expires_at = expire_in.map(|d| Instant::now() + d);
                    state
                        .data
                        .insert(encoded, StoredEntry { value: value.clone(), versionstamp, expires_at });
                    applied.push((m.key.clone(), Some(value.clone())));
                }
                MutationKind::Delete => {
                    state.data.remove(&encoded);
                    applied.push((m.key.clone(), None));
                }
                MutationKind::Sum(operand) | MutationKind::Min(operand) | MutationKind::Max(operand) => {
                    let current = state
                        .data
                        .get(&encoded)
                        .filter(|e| e.is_live())
                        .map(|e| decode_u64(&e.value))
                        .transpose()?
                        .unwrap_or(0);
                    let next = match &m.kind {
                        MutationKind::Sum(_) => current.saturating_add(*operand),
                        MutationKind::Min(_) => current.min(*operand),
                        MutationKind::Max(_) => current.max(*operand),
                        _ => unreachable!(),
                    };
                    let value = next.to_le_bytes().to_vec();
                    state.data.insert(
                        encoded,
                        StoredEntry { value: value.clone(), versionstamp, expires_at: None },
                    );
                    applied.push((m.key.clone(), Some(value)));
                }
            }
        }

        for (topic, value, delay) in enqueues {
            let id = state.next_queue_id;
            state.next_queue_id += 1;
            let visible_at = Instant::now() + delay.unwrap_or_default();
            state.queue.push_back(QueuedMessage {
                message: QueueMessage { id, topic: topic.clone(), value: value.clone(), delivery_count: 0 },
                visible_at,
            });
        }

        drop(state);

        for (key, value) in applied {
            let entry = value.map(|value| Entry { value, versionstamp });
            self.broadcast(key, entry);
        }

        Ok(CommitOutcome::Ok(versionstamp))
    }
}

fn decode_u64(bytes: &[u8]) -> CResult<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| crate::error::Error::Value("sum/min/max operand is not an 8-byte integer".into()))?;
    Ok(u64::from_le_bytes(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyPart;

    fn key(s: &str) -> Key {
        Key::new(vec![KeyPart::String(s.into())])
    }

    #[test]
    fn set_then_get_round_trips() {
        let kv = MemoryKv::new();
        let vs = kv.set(&key("a"), b"hello".to_vec(), None).unwrap();
        let entry = kv.get(&key("a")).unwrap().unwrap();
        assert_eq!(entry.value, b"hello");
        assert_eq!(entry.versionstamp, vs);
    }

    #[test]
    fn delete_removes_entry() {
        let kv = MemoryKv::new();
        kv.set(&key("a"), b"x".to_vec(), None).unwrap();
        kv.delete(&key("a")).unwrap();
        assert!(kv.get(&key("a")).unwrap().is_none());
    }

    #[test]
    fn expire_in_makes_entry_absent_after_elapsed() {
        let kv = MemoryKv::new();
        kv.set(&key("a"), b"x".to_vec(), Some(Duration::from_millis(1))).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(kv.get(&key("a")).unwrap().is_none());
    }

    #[test]
    fn atomic_check_rejects_stale_versionstamp() {
        let kv = MemoryKv::new();
        let vs = kv.set(&key("a"), b"1".to_vec(), None).unwrap();
        kv.set(&key("a"), b"2".to_vec(), None).unwrap();

        let outcome = kv.atomic().check(key("a"), vs).set(key("a"), b"3".to_vec()).commit().unwrap();
        assert_eq!(outcome, CommitOutcome::Conflict);
        assert_eq!(kv.get(&key("a")).unwrap().unwrap().value, b"2");
    }

    #[test]
    fn atomic_check_absent_rejects_existing_key() {
        let kv = MemoryKv::new();
        kv.set(&key("a"), b"1".to_vec(), None).unwrap();
        let outcome = kv.atomic().check_absent(key("a")).set(key("a"), b"2".to_vec()).commit().unwrap();
        assert_eq!(outcome, CommitOutcome::Conflict);
    }

    #[test]
    fn atomic_commit_is_all_or_nothing() {
        let kv = MemoryKv::new();
        let outcome = kv
            .atomic()
            .check_absent(key("a"))
            .check_absent(key("b"))
            .set(key("a"), b"1".to_vec())
            .set(key("b"), b"2".to_vec())
            .commit()
            .unwrap();
        assert!(outcome.is_ok());
        assert_eq!(kv.get(&key("a")).unwrap().unwrap().value, b"1");
        assert_eq!(kv.get(&key("b")).unwrap().unwrap().value, b"2");
    }

    #[test]
    fn list_honors_prefix_cursor_and_limit() {
        let kv = MemoryKv::new();
        for id in ["1", "2", "3"] {
            kv.set(&Key::new(vec![KeyPart::String("users".into()), KeyPart::String(id.into())]), vec![], None)
                .unwrap();
        }
        let prefix = Key::new(vec![KeyPart::String("users".into())]);
        let page = kv.list(ListSelector::Prefix(prefix), ListOptions { limit: Some(2), ..Default::default() }).unwrap();
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn enqueue_then_dequeue_returns_value_in_order() {
        let kv = MemoryKv::new();
        kv.enqueue("jobs", b"first".to_vec(), None).unwrap();
        kv.enqueue("jobs", b"second".to_vec(), None).unwrap();
        assert_eq!(kv.dequeue("jobs").unwrap().unwrap().value, b"first");
        assert_eq!(kv.dequeue("jobs").unwrap().unwrap().value, b"second");
        assert!(kv.dequeue("jobs").unwrap().is_none());
    }

    #[test]
    fn dequeue_ignores_messages_on_other_topics() {
        let kv = MemoryKv::new();
        kv.enqueue("jobs", b"job".to_vec(), None).unwrap();
        kv.enqueue("notifications", b"note".to_vec(), None).unwrap();
        assert_eq!(kv.dequeue("notifications").unwrap().unwrap().value, b"note");
        assert_eq!(kv.dequeue("jobs").unwrap().unwrap().value, b"job");
        assert!(kv.dequeue("jobs").unwrap().is_none());
        assert!(kv.dequeue("notifications").unwrap().is_none());
    }

    #[test]
    fn delayed_enqueue_is_not_visible_immediately() {
        let kv = MemoryKv::new();
        kv.enqueue("jobs", b"later".to_vec(), Some(Duration::from_millis(50))).unwrap();
        assert!(kv.dequeue("jobs").unwrap().is_none());
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(kv.dequeue("jobs").unwrap().unwrap().value, b"later");
    }

    #[test]
    fn sum_accumulates_against_missing_key_as_zero() {
        let kv = MemoryKv::new();
        kv.atomic().sum(key("counter"), 5).commit().unwrap();
        kv.atomic().sum(key("counter"), 7).commit().unwrap();
        let value = kv.get(&key("counter")).unwrap().unwrap().value;
        assert_eq!(decode_u64(&value).unwrap(), 12);
    }
}

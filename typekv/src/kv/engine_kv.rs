//! `Kv` layered generically over any byte-oriented `storage::engine::Engine`,
//! giving the same atomic/versionstamp/watch/enqueue semantics `MemoryKv`
//! provides but backed by a durable engine (`storage::log_cask::LogCask`,
//! or `storage::memory::Memory` if the simpler `MemoryKv` isn't wanted).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;
use crate::key::{Key, Versionstamp};
use crate::kv::atomic::{AtomicSink, CommitOutcome, KvCheck, KvMutation, MutationKind};
use crate::kv::queue::QueueMessage;
use crate::kv::watch::WatchEvent;
use crate::kv::{AtomicBuilder, Entry, Kv, ListOptions, ListSelector, WatchStream};
use crate::storage::engine::Engine;

/// On-disk representation of one entry: the raw value plus the bookkeeping
/// `Kv` needs that the underlying `Engine` doesn't know about.
#[derive(Serialize, Deserialize)]
struct Envelope {
    value: Vec<u8>,
    versionstamp: u64,
    expires_at_millis: Option<u128>,
}

impl Envelope {
    fn is_live(&self) -> bool {
        match self.expires_at_millis {
            Some(at) => now_millis() < at,
            None => true,
        }
    }
}

fn now_millis() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis()
}

struct QueuedMessage {
    message: QueueMessage,
    visible_at_millis: u128,
}

pub struct EngineKv<E: Engine> {
    engine: Mutex<E>,
    next_versionstamp: Mutex<u64>,
    queue: Mutex<VecDeque<QueuedMessage>>,
    next_queue_id: Mutex<u64>,
    events: tokio::sync::broadcast::Sender<WatchEvent>,
}

impl<E: Engine> EngineKv<E> {
    /// Wraps `engine`, scanning it once to recover the next versionstamp to
    /// mint (one past the highest one found), the way `Log::build_keydir`
    /// recovers its keydir from the log on startup.
    pub fn new(mut engine: E) -> CResult<Self> {
        let mut max_versionstamp = 0u64;
        for item in engine.scan(..) {
            let (_, raw) = item?;
            if let Ok(envelope) = bincode::deserialize::<Envelope>(&raw) {
                max_versionstamp = max_versionstamp.max(envelope.versionstamp);
            }
        }
        let (events, _) = tokio::sync::broadcast::channel(1024);
        Ok(EngineKv {
            engine: Mutex::new(engine),
            next_versionstamp: Mutex::new(max_versionstamp + 1),
            queue: Mutex::new(VecDeque::new()),
            next_queue_id: Mutex::new(1),
            events,
        })
    }

    fn mint_versionstamp(&self) -> CResult<Versionstamp> {
        let mut next = self.next_versionstamp.lock()?;
        let versionstamp = Versionstamp(*next);
        *next += 1;
        Ok(versionstamp)
    }

    fn broadcast(&self, key: Key, entry: Option<Entry>) {
        let _ = self.events.send((key, entry));
    }

    fn read_envelope(&self, key: &Key) -> CResult<Option<Envelope>> {
        let mut engine = self.engine.lock()?;
        match engine.get(&key.encode())? {
            Some(raw) => Ok(Some(bincode::deserialize(&raw)?)),
            None => Ok(None),
        }
    }
}

impl<E: Engine> Kv for EngineKv<E> {
    fn get(&self, key: &Key) -> CResult<Option<Entry>> {
        Ok(self
            .read_envelope(key)?
            .filter(Envelope::is_live)
            .map(|e| Entry { value: e.value, versionstamp: Versionstamp(e.versionstamp) }))
    }

    fn set(&self, key: &Key, value: Vec<u8>, expire_in: Option<Duration>) -> CResult<Versionstamp> {
        let versionstamp = self.mint_versionstamp()?;
        let envelope = Envelope {
            value: value.clone(),
            versionstamp: versionstamp.0,
            expires_at_millis: expire_in.map(|d| now_millis() + d.as_millis()),
        };
        {
            let mut engine = self.engine.lock()?;
            engine.set(&key.encode(), bincode::serialize(&envelope)?)?;
        }
        self.broadcast(key.clone(), Some(Entry { value, versionstamp }));
        Ok(versionstamp)
    }

    fn delete(&self, key: &Key) -> CResult<()> {
        {
            let mut engine = self.engine.lock()?;
            engine.delete(&key.encode())?;
        }
        self.broadcast(key.clone(), None);
        Ok(())
    }

    fn list(&self, selector: ListSelector, opts: ListOptions) -> CResult<Vec<(Key, Entry)>> {
        let (start, end) = crate::kv::selector_bounds(&selector);
        let mut engine = self.engine.lock()?;
        let raw: Vec<(Vec<u8>, Vec<u8>)> = match end {
            Some(end) => engine.scan(start..end).collect::<CResult<Vec<_>>>()?,
            None => engine.scan(start..).collect::<CResult<Vec<_>>>()?,
        };
        drop(engine);

        let decoded = raw
            .into_iter()
            .map(|(k, v)| {
                let envelope: Envelope = bincode::deserialize(&v)?;
                Ok((envelope, k))
            })
            .collect::<CResult<Vec<(Envelope, Vec<u8>)>>>()?
            .into_iter()
            .filter(|(e, _)| e.is_live())
            .map(|(e, k)| {
                let key = Key::decode(&k)?;
                Ok((key, Entry { value: e.value, versionstamp: Versionstamp(e.versionstamp) }))
            })
            .collect::<CResult<Vec<_>>>()?;
        Ok(crate::kv::paginate(decoded.into_iter(), &opts))
    }

    fn atomic(&self) -> AtomicBuilder<'_> {
        AtomicBuilder::new(self)
    }

    fn enqueue(&self, topic: &str, value: Vec<u8>, delay: Option<Duration>) -> CResult<()> {
        let mut id_guard = self.next_queue_id.lock()?;
        let id = *id_guard;
        *id_guard += 1;
        drop(id_guard);
        let visible_at_millis = now_millis() + delay.unwrap_or_default().as_millis();
        self.queue.lock()?.push_back(QueuedMessage {
            message: QueueMessage { id, topic: topic.to_string(), value, delivery_count: 0 },
            visible_at_millis,
        });
        Ok(())
    }

    fn dequeue(&self, topic: &str) -> CResult<Option<QueueMessage>> {
        let mut queue = self.queue.lock()?;
        let now = now_millis();
        let pos = queue.iter().position(|m| m.visible_at_millis <= now && m.message.topic == topic);
        Ok(pos.map(|i| queue.remove(i).unwrap().message))
    }

    fn watch(&self, keys: Vec<Key>) -> WatchStream {
        WatchStream::new(keys, self.events.subscribe())
    }
}

impl<E: Engine> AtomicSink for EngineKv<E> {
    fn apply(
        &self,
        checks: &[KvCheck],
        mutations: &[KvMutation],
        enqueues: &[(String, Vec<u8>, Option<Duration>)],
    ) -> CResult<CommitOutcome> {
        for check in checks {
            let current = self.read_envelope(&check.key)?.filter(Envelope::is_live).map(|e| Versionstamp(e.versionstamp));
            if current != check.versionstamp {
                return Ok(CommitOutcome::Conflict);
            }
        }

        let versionstamp = self.mint_versionstamp()?;
        let mut applied = Vec::with_capacity(mutations.len());
        {
            let mut engine = self.engine.lock()?;
            for m in mutations {
                let encoded = m.key.encode();
                match &m.kind {
                    MutationKind::Set(value, expire_in) => {
                        let envelope = Envelope {
                            value: value.clone(),
                            versionstamp: versionstamp.0,
                            expires_at_millis: expire_in.map(|d| now_millis() + d.as_millis()),
                        };
                        engine.set(&encoded, bincode::serialize(&envelope)?)?;
                        applied.push((m.key.clone(), Some(value.clone())));
                    }
                    MutationKind::Delete => {
                        engine.delete(&encoded)?;
                        applied.push((m.key.clone(), None));
                    }
                    MutationKind::Sum(operand) | MutationKind::Min(operand) | MutationKind::Max(operand) => {
                        let current = match engine.get(&encoded)? {
                            Some(raw) => {
                                let envelope: Envelope = bincode::deserialize(&raw)?;
                                if envelope.is_live() { decode_u64(&envelope.value)? } else { 0 }
                            }
                            None => 0,
                        };
                        let next = match &m.kind {
                            MutationKind::Sum(_) => current.saturating_add(*operand),
                            MutationKind::Min(_) => current.min(*operand),
                            MutationKind::Max(_) => current.max(*operand),
                            _ => unreachable!(),
                        };
                        let value = next.to_le_bytes().to_vec();
                        let envelope =
                            Envelope { value: value.clone(), versionstamp: versionstamp.0, expires_at_millis: None };
                        engine.set(&encoded, bincode::serialize(&envelope)?)?;
                        applied.push((m.key.clone(), Some(value)));
                    }
                }
            }
        }

        if !enqueues.is_empty() {
            let mut id_guard = self.next_queue_id.lock()?;
            let mut queue = self.queue.lock()?;
            for (topic, value, delay) in enqueues {
                let id = *id_guard;
                *id_guard += 1;
                let visible_at_millis = now_millis() + delay.unwrap_or_default().as_millis();
                queue.push_back(QueuedMessage {
                    message: QueueMessage { id, topic: topic.clone(), value: value.clone(), delivery_count: 0 },
                    visible_at_millis,
                });
            }
        }

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

//! In-memory LRU cache of completed syntheses.
//!
//! Replies repeat often (greetings, rule-based answers), so a finished
//! synthesis is kept and replayed instead of calling the provider again.
//! Only streams that run to completion are stored.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::StreamExt;
use tracing::debug;

use crate::speech::AudioStream;

#[derive(Clone)]
pub struct SynthesisCache {
    inner: Arc<Mutex<Lru>>,
}

struct Lru {
    capacity: usize,
    entries: HashMap<String, Arc<[Bytes]>>,
    order: VecDeque<String>,
}

impl Lru {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }
}

impl SynthesisCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Lru {
                capacity: capacity.max(1),
                entries: HashMap::new(),
                order: VecDeque::new(),
            })),
        }
    }

    pub fn key(voice: &str, text: &str) -> String {
        format!("{voice}|{text}")
    }

    pub fn get(&self, key: &str) -> Option<Arc<[Bytes]>> {
        let mut lru = self.inner.lock().ok()?;
        let hit = lru.entries.get(key).cloned();
        if hit.is_some() {
            lru.touch(key);
        }
        hit
    }

    pub fn insert(&self, key: String, chunks: Vec<Bytes>) {
        let Ok(mut lru) = self.inner.lock() else {
            return;
        };
        if lru.entries.insert(key.clone(), chunks.into()).is_some() {
            lru.touch(&key);
        } else {
            lru.order.push_back(key);
        }
        while lru.entries.len() > lru.capacity {
            match lru.order.pop_front() {
                Some(oldest) => {
                    lru.entries.remove(&oldest);
                    debug!(key = %oldest, "Evicted synthesis from cache");
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|lru| lru.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pass `stream` through unchanged, storing its chunks if it completes cleanly.
    pub fn record(&self, key: String, stream: AudioStream) -> AudioStream {
        let state = Recorder {
            stream,
            cache: self.clone(),
            key,
            collected: Vec::new(),
            failed: false,
        };
        Box::pin(futures::stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            match state.stream.next().await {
                Some(Ok(chunk)) => {
                    state.collected.push(chunk.clone());
                    Some((Ok(chunk), Some(state)))
                }
                Some(Err(e)) => {
                    state.failed = true;
                    Some((Err(e), Some(state)))
                }
                None => {
                    if !state.failed && !state.collected.is_empty() {
                        state.cache.insert(state.key, state.collected);
                    }
                    None
                }
            }
        }))
    }
}

struct Recorder {
    stream: AudioStream,
    cache: SynthesisCache,
    key: String,
    collected: Vec<Bytes>,
    failed: bool,
}

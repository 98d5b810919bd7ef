//! Bounded, time-evicted dedup window
//!
//! Records which bindings reached a terminal status for an event id, so a
//! redelivered event only re-runs what has not settled yet.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

struct Entry {
    settled: HashSet<String>,
    recorded_at: Instant,
}

#[derive(Default)]
struct Window {
    entries: HashMap<Uuid, Entry>,
    order: VecDeque<Uuid>,
}

pub struct DedupWindow {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<Window>,
}

impl DedupWindow {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            inner: Mutex::new(Window::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `binding` reached a terminal status for `event_id`
    pub fn settle(&self, event_id: Uuid, binding: &str) {
        let now = Instant::now();
        let mut window = self.lock();
        self.evict(&mut window, now);

        if let Some(entry) = window.entries.get_mut(&event_id) {
            entry.settled.insert(binding.to_string());
            return;
        }

        while window.entries.len() >= self.capacity {
            match window.order.pop_front() {
                Some(oldest) => {
                    window.entries.remove(&oldest);
                }
                None => break,
            }
        }
        window.entries.insert(
            event_id,
            Entry {
                settled: HashSet::from([binding.to_string()]),
                recorded_at: now,
            },
        );
        window.order.push_back(event_id);
    }

    /// Bindings already settled for `event_id`
    pub fn settled(&self, event_id: Uuid) -> HashSet<String> {
        let mut window = self.lock();
        self.evict(&mut window, Instant::now());
        window
            .entries
            .get(&event_id)
            .map(|entry| entry.settled.clone())
            .unwrap_or_default()
    }

    pub fn is_settled(&self, event_id: Uuid, binding: &str) -> bool {
        let mut window = self.lock();
        self.evict(&mut window, Instant::now());
        window
            .entries
            .get(&event_id)
            .is_some_and(|entry| entry.settled.contains(binding))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, window: &mut Window, now: Instant) {
        while let Some(oldest) = window.order.front().copied() {
            let expired = window
                .entries
                .get(&oldest)
                .map_or(true, |entry| now.duration_since(entry.recorded_at) >= self.ttl);
            if !expired {
                break;
            }
            window.order.pop_front();
            window.entries.remove(&oldest);
        }
    }
}

//! Pipeline event bus: per-session topics fanning out to observer streams.
//!
//! Each topic owns a monotonic sequence counter, a bounded replay ring, and
//! the subscriber set. Publishing assigns the sequence number, appends to
//! the ring, and pushes into every subscriber queue under the topic lock;
//! the lock never spans external I/O. A slow subscriber sheds its oldest
//! undelivered event rather than blocking the publisher, and the next
//! event it does receive carries a `dropped` count.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use third_eye_core::response::PipelineEvent;
use tokio::sync::Notify;

pub struct PipelineBus {
    topics: Mutex<HashMap<String, Topic>>,
    ring_capacity: usize,
    queue_capacity: usize,
    dropped_total: AtomicU64,
}

struct Topic {
    next_seq: u64,
    ring: VecDeque<PipelineEvent>,
    subscribers: Vec<Arc<SubscriberShared>>,
}

impl Topic {
    fn new() -> Self {
        Self {
            next_seq: 1,
            ring: VecDeque::new(),
            subscribers: Vec::new(),
        }
    }
}

struct SubscriberShared {
    queue: Mutex<VecDeque<PipelineEvent>>,
    queue_capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl SubscriberShared {
    /// Returns true when the oldest undelivered event had to be shed.
    fn push(&self, event: PipelineEvent) -> bool {
        let shed;
        {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            shed = queue.len() >= self.queue_capacity;
            if shed {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
        shed
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Consumer half of a topic subscription. Dropping it detaches from the
/// topic; the publisher side is unaffected.
pub struct Subscription {
    shared: Arc<SubscriberShared>,
}

impl Subscription {
    /// Next event in sequence order. Returns `None` once the topic is
    /// closed and the queue is drained.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut queue = self
                    .shared
                    .queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if let Some(mut event) = queue.pop_front() {
                    let dropped = self.shared.dropped.swap(0, Ordering::Relaxed);
                    if dropped > 0 {
                        event.dropped = Some(dropped);
                    }
                    return Some(event);
                }
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl PipelineBus {
    pub fn new(ring_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            ring_capacity,
            queue_capacity,
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Publish one event: stamps the per-session sequence number, appends
    /// to the replay ring, fans out. Returns the stamped event so callers
    /// can persist it.
    pub fn publish(&self, session_id: &str, mut event: PipelineEvent) -> PipelineEvent {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let topic = topics
            .entry(session_id.to_string())
            .or_insert_with(Topic::new);

        event.session_id = session_id.to_string();
        event.seq = topic.next_seq;
        topic.next_seq += 1;

        if topic.ring.len() >= self.ring_capacity {
            topic.ring.pop_front();
        }
        topic.ring.push_back(event.clone());

        topic.subscribers.retain(|sub| {
            if sub.closed.load(Ordering::Acquire) {
                return false;
            }
            if sub.push(event.clone()) {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
            }
            true
        });

        event
    }

    /// Attach an observer. The ring replays from `last_seen` (exclusive)
    /// or from the oldest retained event.
    pub fn subscribe(&self, session_id: &str, last_seen: Option<u64>) -> Subscription {
        let shared = Arc::new(SubscriberShared {
            queue: Mutex::new(VecDeque::new()),
            queue_capacity: self.queue_capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        });

        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let topic = topics
            .entry(session_id.to_string())
            .or_insert_with(Topic::new);

        {
            let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            for event in topic.ring.iter() {
                if last_seen.map_or(true, |seen| event.seq > seen) {
                    queue.push_back(event.clone());
                }
            }
        }
        shared.notify.notify_one();
        topic.subscribers.push(shared.clone());

        Subscription { shared }
    }

    /// Drop a topic and wake all of its subscribers for shutdown.
    pub fn close(&self, session_id: &str) {
        let removed = {
            let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
            topics.remove(session_id)
        };
        if let Some(topic) = removed {
            for sub in topic.subscribers {
                sub.close();
            }
        }
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

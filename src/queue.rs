use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Registry of named FIFO byte queues.
///
/// Pushes are MPMC; the consumer side lives outside this process (replay
/// tooling, dead-letter drains). A bounded queue exerts backpressure on
/// `push` instead of dropping records. Push problems are logged and counted,
/// never surfaced as request failures.
pub struct QueueRegistry {
    queues: DashMap<String, Arc<ByteQueue>>,
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_init(&self, name: &str) -> Arc<ByteQueue> {
        if let Some(entry) = self.queues.get(name) {
            return entry.value().clone();
        }
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ByteQueue::unbounded(name)))
            .clone()
    }

    /// Pre-register a bounded queue. No effect if the name already exists.
    pub fn init_bounded(&self, name: &str, capacity: usize) {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ByteQueue::bounded(name, capacity)));
    }

    /// Append a record to the named queue, waiting out backpressure on a
    /// bounded queue.
    pub async fn push(&self, name: &str, record: Bytes) {
        let queue = self.get_or_init(name);
        metrics::counter!("gateway_queue_pushes_total", "queue" => name.to_string()).increment(1);
        loop {
            match queue.try_push(record.clone()) {
                Ok(()) => return,
                Err(_) => {
                    warn!("queue: full, waiting, name={}", name);
                    metrics::counter!("gateway_queue_backpressure_total", "queue" => name.to_string())
                        .increment(1);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            }
        }
    }

    pub fn len(&self, name: &str) -> usize {
        self.queues.get(name).map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, name: &str) -> bool {
        self.len(name) == 0
    }

    /// Consumer-side pop, used by external drains and tests.
    pub fn pop(&self, name: &str) -> Option<Bytes> {
        self.queues.get(name).and_then(|q| q.pop())
    }
}

pub struct ByteQueue {
    name: String,
    records: Mutex<VecDeque<Bytes>>,
    capacity: Option<usize>,
}

/// The queue was at capacity; the record was not appended.
pub struct QueueFull;

impl ByteQueue {
    fn unbounded(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: Mutex::new(VecDeque::new()),
            capacity: None,
        }
    }

    fn bounded(name: &str, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            records: Mutex::new(VecDeque::new()),
            capacity: Some(capacity.max(1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn try_push(&self, record: Bytes) -> Result<(), QueueFull> {
        let mut records = self.records.lock().expect("queue mutex poisoned");
        if let Some(cap) = self.capacity {
            if records.len() >= cap {
                return Err(QueueFull);
            }
        }
        records.push_back(record);
        Ok(())
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.records
            .lock()
            .expect("queue mutex poisoned")
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let registry = QueueRegistry::new();
        registry.push("failure_queue", Bytes::from_static(b"a")).await;
        registry.push("failure_queue", Bytes::from_static(b"b")).await;
        registry.push("failure_queue", Bytes::from_static(b"c")).await;

        assert_eq!(registry.pop("failure_queue").unwrap(), "a");
        assert_eq!(registry.pop("failure_queue").unwrap(), "b");
        assert_eq!(registry.pop("failure_queue").unwrap(), "c");
        assert!(registry.pop("failure_queue").is_none());
    }

    #[tokio::test]
    async fn test_queues_are_isolated_by_name() {
        let registry = QueueRegistry::new();
        registry.push("invalid_queue", Bytes::from_static(b"x")).await;
        assert_eq!(registry.len("invalid_queue"), 1);
        assert_eq!(registry.len("invalid_queue-bulk-error-messages"), 0);
    }

    #[tokio::test]
    async fn test_bounded_queue_backpressure() {
        let registry = Arc::new(QueueRegistry::new());
        registry.init_bounded("dead_letter", 1);
        registry.push("dead_letter", Bytes::from_static(b"a")).await;

        let pusher = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.push("dead_letter", Bytes::from_static(b"b")).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!pusher.is_finished());

        assert_eq!(registry.pop("dead_letter").unwrap(), "a");
        pusher.await.unwrap();
        assert_eq!(registry.pop("dead_letter").unwrap(), "b");
    }
}

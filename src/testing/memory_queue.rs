//! In-process work queue.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::services::queue::{Delivery, QueueError, QueueStats, ReceiveOptions, WorkQueue};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: String,
    enqueued_at: Instant,
    receive_count: u32,
}

#[derive(Debug, Clone)]
struct Lease {
    message_id: String,
    group: String,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct Topic {
    messages: HashMap<String, StoredMessage>,
    groups: HashMap<String, VecDeque<String>>,
    /// Unlocked groups with at least one waiting message, in service order.
    ready: VecDeque<String>,
    /// Groups whose head message is leased.
    locked: HashSet<String>,
    leases: HashMap<String, Lease>,
    dedup: HashMap<String, (String, Instant)>,
}

impl Topic {
    fn release_group(&mut self, group: &str) {
        self.locked.remove(group);
        if self.groups.get(group).is_some_and(|q| !q.is_empty()) {
            self.ready.push_back(group.to_string());
        }
    }

    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(lease) = self.leases.remove(&receipt) {
                tracing::debug!(
                    message_id = %lease.message_id,
                    group = %lease.group,
                    "Lease expired, message visible again"
                );
                self.release_group(&lease.group);
            }
        }
    }

    /// Head of the group, dropping messages past retention.
    fn live_head(&mut self, group: &str, now: Instant, retention: Option<Duration>) -> Option<String> {
        let queue = self.groups.get_mut(group)?;
        while let Some(id) = queue.front().cloned() {
            let expired = match (self.messages.get(&id), retention) {
                (None, _) => true,
                (Some(msg), Some(retention)) => now.duration_since(msg.enqueued_at) > retention,
                (Some(_), None) => false,
            };
            if !expired {
                return Some(id);
            }
            queue.pop_front();
            self.messages.remove(&id);
        }
        None
    }

    fn take(
        &mut self,
        now: Instant,
        options: ReceiveOptions,
        retention: Option<Duration>,
    ) -> Vec<Delivery> {
        self.reclaim_expired(now);

        let mut out = Vec::new();
        while out.len() < options.max_messages {
            let Some(group) = self.ready.pop_front() else {
                break;
            };
            let Some(id) = self.live_head(&group, now, retention) else {
                continue;
            };

            let receipt = Uuid::new_v4().to_string();
            self.locked.insert(group.clone());
            self.leases.insert(
                receipt.clone(),
                Lease {
                    message_id: id.clone(),
                    group,
                    deadline: now + options.visibility,
                },
            );

            if let Some(msg) = self.messages.get_mut(&id) {
                msg.receive_count += 1;
                out.push(Delivery {
                    message_id: msg.id.clone(),
                    receipt,
                    body: msg.body.clone(),
                    receive_count: msg.receive_count,
                });
            }
        }
        out
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.leases.values().map(|lease| lease.deadline).min()
    }
}

/// In-process implementation of [`WorkQueue`] with the same ordering, lease
/// and dedup semantics as the Redis backend. Time comes from the tokio clock,
/// so tests can pause and advance it.
///
/// # Example
///
/// ```rust,ignore
/// let queue = MemoryQueue::new(Duration::from_secs(300));
/// queue.enqueue("separation", "u1", "u1:song.wav", "{}").await?;
/// let batch = queue.receive("separation", options).await?;
/// ```
#[derive(Clone)]
pub struct MemoryQueue {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
    notify: Arc<Notify>,
    dedup_window: Duration,
    retention: Option<Duration>,
    fail_next_enqueues: Arc<AtomicUsize>,
}

impl MemoryQueue {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            dedup_window,
            retention: None,
            fail_next_enqueues: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    /// Make the next `count` enqueues fail like a dropped connection.
    pub fn fail_next_enqueues(&self, count: usize) {
        self.fail_next_enqueues.store(count, Ordering::SeqCst);
    }

    /// Total messages still stored (waiting or leased).
    pub async fn len(&self, queue: &str) -> usize {
        let topics = self.topics.lock().await;
        topics.get(queue).map(|t| t.messages.len()).unwrap_or(0)
    }

    pub async fn is_empty(&self, queue: &str) -> bool {
        self.len(queue).await == 0
    }

    /// Bodies of stored messages in the order a single consumer would see them.
    pub async fn bodies(&self, queue: &str) -> Vec<String> {
        let topics = self.topics.lock().await;
        let Some(topic) = topics.get(queue) else {
            return Vec::new();
        };
        let mut groups: Vec<&String> = topic.groups.keys().collect();
        groups.sort();
        groups
            .into_iter()
            .flat_map(|g| topic.groups[g].iter())
            .filter_map(|id| topic.messages.get(id).map(|m| m.body.clone()))
            .collect()
    }
}

fn transport_error() -> QueueError {
    QueueError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "injected connection failure",
    )))
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(
        &self,
        queue: &str,
        group_key: &str,
        dedup_key: &str,
        body: &str,
    ) -> Result<String, QueueError> {
        if self
            .fail_next_enqueues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(transport_error());
        }

        let now = Instant::now();
        let mut topics = self.topics.lock().await;
        let topic = topics.entry(queue.to_string()).or_default();

        topic.dedup.retain(|_, (_, expires)| *expires > now);
        if let Some((id, _)) = topic.dedup.get(dedup_key) {
            return Ok(id.clone());
        }

        let id = Uuid::new_v4().to_string();
        topic
            .dedup
            .insert(dedup_key.to_string(), (id.clone(), now + self.dedup_window));
        topic.messages.insert(
            id.clone(),
            StoredMessage {
                id: id.clone(),
                body: body.to_string(),
                enqueued_at: now,
                receive_count: 0,
            },
        );

        let group = topic.groups.entry(group_key.to_string()).or_default();
        group.push_back(id.clone());
        if group.len() == 1 && !topic.locked.contains(group_key) {
            topic.ready.push_back(group_key.to_string());
        }
        drop(topics);

        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        options: ReceiveOptions,
    ) -> Result<Vec<Delivery>, QueueError> {
        let deadline = Instant::now() + options.wait;

        loop {
            let mut topics = self.topics.lock().await;
            let now = Instant::now();
            let topic = topics.entry(queue.to_string()).or_default();
            let deliveries = topic.take(now, options, self.retention);
            if !deliveries.is_empty() || now >= deadline {
                return Ok(deliveries);
            }

            let wake_at = topic
                .earliest_deadline()
                .map_or(deadline, |lease_deadline| lease_deadline.min(deadline));
            // Registered before the lock is released so no enqueue can slip by.
            let notified = self.notify.notified();
            drop(topics);

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, queue: &str, receipt: &str) -> Result<(), QueueError> {
        let mut topics = self.topics.lock().await;
        let topic = topics
            .get_mut(queue)
            .ok_or_else(|| QueueError::StaleReceipt(receipt.to_string()))?;
        topic.reclaim_expired(Instant::now());
        let lease = topic
            .leases
            .remove(receipt)
            .ok_or_else(|| QueueError::StaleReceipt(receipt.to_string()))?;

        topic.messages.remove(&lease.message_id);
        if let Some(group) = topic.groups.get_mut(&lease.group) {
            group.retain(|id| *id != lease.message_id);
        }
        topic.release_group(&lease.group);
        drop(topics);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let topics = self.topics.lock().await;
        Ok(topics
            .get(queue)
            .map(|topic| {
                let in_flight = topic.leases.len() as u64;
                QueueStats {
                    visible: (topic.messages.len() as u64).saturating_sub(in_flight),
                    in_flight,
                }
            })
            .unwrap_or_default())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const Q: &str = "separation";

    fn options(max: usize, visibility_secs: u64) -> ReceiveOptions {
        ReceiveOptions {
            max_messages: max,
            wait: Duration::from_secs(1),
            visibility: Duration::from_secs(visibility_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_within_window() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        let a = queue.enqueue(Q, "u1", "u1:song", "a").await.unwrap();
        let b = queue.enqueue(Q, "u1", "u1:song", "b").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(queue.len(Q).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_window_expires() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        let a = queue.enqueue(Q, "u1", "u1:song", "a").await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        let b = queue.enqueue(Q, "u1", "u1:song", "b").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(queue.len(Q).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_head_blocks_rest_of_group() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        queue.enqueue(Q, "u1", "d1", "first").await.unwrap();
        queue.enqueue(Q, "u1", "d2", "second").await.unwrap();
        queue.enqueue(Q, "u2", "d3", "other").await.unwrap();

        let batch = queue.receive(Q, options(10, 60)).await.unwrap();
        let bodies: Vec<&str> = batch.iter().map(|d| d.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "other"]);

        let again = queue.receive(Q, options(10, 60)).await.unwrap();
        assert!(again.is_empty());

        let first = batch.iter().find(|d| d.body == "first").unwrap();
        queue.delete(Q, &first.receipt).await.unwrap();
        let next = queue.receive(Q, options(10, 60)).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].body, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_redelivers_same_message() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        let id = queue.enqueue(Q, "u1", "d1", "job").await.unwrap();

        let first = queue.receive(Q, options(1, 30)).await.unwrap();
        assert_eq!(first[0].receive_count, 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.receive(Q, options(1, 30)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, id);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(second[0].receipt, first[0].receipt);

        let stale = queue.delete(Q, &first[0].receipt).await;
        assert!(matches!(stale, Err(QueueError::StaleReceipt(_))));
        queue.delete(Q, &second[0].receipt).await.unwrap();
        assert!(queue.is_empty(Q).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_poll_wakes_on_enqueue() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        let consumer = queue.clone();
        let handle = tokio::spawn(async move {
            consumer
                .receive(
                    Q,
                    ReceiveOptions {
                        max_messages: 1,
                        wait: Duration::from_secs(20),
                        visibility: Duration::from_secs(60),
                    },
                )
                .await
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        queue.enqueue(Q, "u1", "d1", "late").await.unwrap();

        let batch = handle.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_receive_returns_after_wait() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        let started = Instant::now();
        let batch = queue.receive(Q, options(1, 30)).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_drops_old_messages() {
        let queue = MemoryQueue::new(Duration::from_secs(300)).with_retention(Duration::from_secs(60));
        queue.enqueue(Q, "u1", "d1", "old").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        queue.enqueue(Q, "u1", "d2", "fresh").await.unwrap();

        let batch = queue.receive(Q, options(1, 30)).await.unwrap();
        assert_eq!(batch[0].body, "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_counts_in_flight() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        queue.enqueue(Q, "u1", "d1", "a").await.unwrap();
        queue.enqueue(Q, "u2", "d2", "b").await.unwrap();
        queue.receive(Q, options(1, 30)).await.unwrap();

        let stats = queue.stats(Q).await.unwrap();
        assert_eq!(stats, QueueStats { visible: 1, in_flight: 1 });
    }

    #[tokio::test]
    async fn test_injected_enqueue_failure_is_transient() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        queue.fail_next_enqueues(1);
        let err = queue.enqueue(Q, "u1", "d1", "a").await.unwrap_err();
        assert!(err.is_transient());
        queue.enqueue(Q, "u1", "d1", "a").await.unwrap();
    }
}

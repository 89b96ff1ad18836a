//! In-process request queue with visibility-timeout redelivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::message::{QueueMessage, RequestQueue};
use crate::error::QueueError;

/// Default time a received message stays invisible before redelivery.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

struct Pending {
    body: String,
    receive_count: u32,
}

struct InFlight {
    body: String,
    receive_count: u32,
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    in_flight: HashMap<String, InFlight>,
}

impl QueueState {
    /// Move deliveries whose visibility timeout expired back to the front.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(m) = self.in_flight.remove(&receipt) {
                self.ready.push_front(Pending {
                    body: m.body,
                    receive_count: m.receive_count,
                });
            }
        }
    }

    fn next_visibility(&self) -> Option<Instant> {
        self.in_flight.values().map(|m| m.visible_at).min()
    }
}

/// Queue used by the local backend and by tests.
///
/// Mirrors the at-least-once contract of a managed queue: received messages
/// become visible again after the visibility timeout unless deleted.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
    next_receipt: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
            next_receipt: AtomicU64::new(1),
        }
    }

    /// Messages waiting to be received.
    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    /// Messages received but not yet deleted.
    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Total undeleted messages.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.ready.len() + state.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_batch(&self, max_messages: usize) -> (Vec<QueueMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut state = self.lock();
        state.reclaim_expired(now);

        let mut batch = Vec::new();
        while batch.len() < max_messages {
            let Some(pending) = state.ready.pop_front() else {
                break;
            };
            let receipt = format!(
                "receipt-{}",
                self.next_receipt.fetch_add(1, Ordering::Relaxed)
            );
            let receive_count = pending.receive_count + 1;
            state.in_flight.insert(
                receipt.clone(),
                InFlight {
                    body: pending.body.clone(),
                    receive_count,
                    visible_at: now + self.visibility_timeout,
                },
            );
            batch.push(QueueMessage {
                body: pending.body,
                receipt_handle: receipt,
                receive_count,
            });
        }

        (batch, state.next_visibility())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestQueue for MemoryQueue {
    async fn send(&self, body: String) -> Result<(), QueueError> {
        self.lock().ready.push_back(Pending {
            body,
            receive_count: 0,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        let max_messages = max_messages.max(1);

        loop {
            let (batch, next_visible) = self.take_batch(max_messages);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }

            // Wake on a send, on the next redelivery, or at the deadline.
            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.lock().in_flight.remove(receipt_handle);
        Ok(())
    }
}

//! Bounded per-session queue of undelivered alerts

use crate::alert::Alert;
use crate::error::DeliveryError;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// An alert waiting for redelivery
#[derive(Debug, Clone)]
pub struct QueuedAlert {
    pub alert: Alert,
    pub queued_at: DateTime<Utc>,

    /// Failed redelivery attempts so far
    pub attempts: u32,
}

/// Result of one redelivery pass over a queue
#[derive(Debug, Default)]
pub struct RetryPass {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: Vec<QueuedAlert>,
}

/// FIFO of undelivered alerts that never grows past its capacity
#[derive(Debug)]
pub struct RetryQueue {
    entries: VecDeque<QueuedAlert>,
    capacity: usize,
}

impl RetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Queue an alert. When the queue is full the oldest entry is evicted
    /// and handed back.
    pub fn push(&mut self, alert: Alert) -> Option<QueuedAlert> {
        if self.capacity == 0 {
            return Some(QueuedAlert {
                alert,
                queued_at: Utc::now(),
                attempts: 0,
            });
        }

        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };

        self.entries.push_back(QueuedAlert {
            alert,
            queued_at: Utc::now(),
            attempts: 0,
        });

        evicted
    }

    /// Drop queued copies of a transaction that has since been delivered
    pub fn remove_transaction(&mut self, transaction_id: &str) -> usize {
        if transaction_id.is_empty() {
            return 0;
        }
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.alert.transaction_id != transaction_id);
        before - self.entries.len()
    }

    /// Try every queued entry once, oldest first.
    ///
    /// Delivered entries leave the queue. Failed ones stay with their attempt
    /// count bumped, unless that reaches `max_attempts`, in which case they
    /// are dropped and returned in [`RetryPass::dropped`].
    pub fn retry_with<F>(&mut self, max_attempts: u32, mut deliver: F) -> RetryPass
    where
        F: FnMut(&Alert) -> Result<(), DeliveryError>,
    {
        let mut pass = RetryPass::default();
        let pending = std::mem::take(&mut self.entries);

        for mut entry in pending {
            match deliver(&entry.alert) {
                Ok(()) => pass.delivered += 1,
                Err(_) => {
                    pass.failed += 1;
                    entry.attempts += 1;
                    if entry.attempts >= max_attempts {
                        pass.dropped.push(entry);
                    } else {
                        self.entries.push_back(entry);
                    }
                }
            }
        }

        pass
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedAlert> {
        self.entries.iter()
    }
}

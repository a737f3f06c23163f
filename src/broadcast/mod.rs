//! Alert broadcaster - card subscriptions and fan-out delivery
//!
//! Keeps the card -> sessions index and a bounded retry queue per session.
//! Delivery is best effort: a failed write lands in the session's retry
//! queue and is retried by [`AlertBroadcaster::retry_queued_messages`].

mod retry;

pub use retry::{QueuedAlert, RetryPass, RetryQueue};

use crate::alert::{format_transaction_alert, Alert, RawTransaction};
use crate::config::DeliveryConfig;
use crate::error::{BroadcastError, DeliveryError, ValidationError};
use crate::metrics::Metrics;
use crate::protocol::ServerMessage;
use crate::transport::Transport;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Notifications for admin and metrics consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcasterEvent {
    ConnectionRegistered { session_id: Uuid, card_token: String },
    ConnectionRemoved { session_id: Uuid },
    /// A queued alert was given up on
    AlertDropped {
        session_id: Uuid,
        transaction_id: String,
        attempts: u32,
    },
}

/// What happened to one session during a broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    Delivered,
    QueuedForRetry(DeliveryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDelivery {
    pub session_id: Uuid,
    pub outcome: DeliveryOutcome,
}

impl SessionDelivery {
    pub fn status(&self) -> &'static str {
        match self.outcome {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::QueuedForRetry(_) => "queued",
        }
    }

    pub fn error(&self) -> Option<&DeliveryError> {
        match &self.outcome {
            DeliveryOutcome::Delivered => None,
            DeliveryOutcome::QueuedForRetry(e) => Some(e),
        }
    }
}

/// Aggregate result of [`AlertBroadcaster::broadcast_alert`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub successful: usize,
    pub failed: usize,
    pub sessions: Vec<SessionDelivery>,
}

/// Totals for one retry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
}

struct Subscriber {
    transport: Arc<dyn Transport>,
    cards: HashSet<String>,
    queue: RetryQueue,
}

#[derive(Default)]
struct BroadcasterState {
    card_index: HashMap<String, HashSet<Uuid>>,
    subscribers: HashMap<Uuid, Subscriber>,
}

/// Routes formatted transaction alerts to the sessions watching a card
pub struct AlertBroadcaster {
    state: Mutex<BroadcasterState>,
    config: DeliveryConfig,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<BroadcasterEvent>,
}

impl AlertBroadcaster {
    pub fn new(config: DeliveryConfig, metrics: Arc<Metrics>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(BroadcasterState::default()),
            config,
            metrics,
            events,
        }
    }

    /// Receive registration, removal and drop notifications
    pub fn subscribe_events(&self) -> broadcast::Receiver<BroadcasterEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn lock(&self) -> Result<MutexGuard<'_, BroadcasterState>, BroadcastError> {
        self.state.lock().map_err(|_| {
            tracing::error!("Broadcaster state lock poisoned");
            BroadcastError::Poisoned
        })
    }

    fn emit(&self, event: BroadcasterEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Register a session as a subscriber of `card_token`.
    ///
    /// Idempotent: registering again keeps the existing retry queue and
    /// swaps in the given transport. Returns `false` only when the
    /// broadcaster can no longer be used.
    pub fn register_connection(
        &self,
        session_id: Uuid,
        card_token: &str,
        transport: Arc<dyn Transport>,
    ) -> bool {
        if card_token.trim().is_empty() {
            tracing::warn!("Refusing to register session {} without a card token", session_id);
            return false;
        }

        let Ok(mut state) = self.lock() else {
            return false;
        };

        let capacity = self.config.retry_queue_capacity;
        let subscriber = state
            .subscribers
            .entry(session_id)
            .or_insert_with(|| Subscriber {
                transport: Arc::clone(&transport),
                cards: HashSet::new(),
                queue: RetryQueue::new(capacity),
            });
        subscriber.transport = transport;
        subscriber.cards.insert(card_token.to_string());

        let entry = state.card_index.entry(card_token.to_string()).or_default();
        entry.insert(session_id);

        tracing::debug!(
            "Registered session {} for card {}, subscribers: {}",
            session_id,
            card_token,
            entry.len()
        );

        self.emit(BroadcasterEvent::ConnectionRegistered {
            session_id,
            card_token: card_token.to_string(),
        });
        true
    }

    /// Watch another card on an already registered session
    pub fn subscribe(&self, session_id: Uuid, card_token: &str) -> Result<(), BroadcastError> {
        if card_token.trim().is_empty() {
            return Err(ValidationError::EmptyCardToken.into());
        }

        let mut state = self.lock()?;
        let subscriber = state
            .subscribers
            .get_mut(&session_id)
            .ok_or(ValidationError::UnknownSession(session_id))?;
        subscriber.cards.insert(card_token.to_string());
        state
            .card_index
            .entry(card_token.to_string())
            .or_default()
            .insert(session_id);

        tracing::debug!("Session {} now also watches card {}", session_id, card_token);
        Ok(())
    }

    /// Stop watching one card. Returns `false` if the session was not
    /// subscribed to it.
    pub fn unsubscribe(&self, session_id: Uuid, card_token: &str) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };

        let removed = state
            .subscribers
            .get_mut(&session_id)
            .map(|s| s.cards.remove(card_token))
            .unwrap_or(false);

        if removed {
            unindex(&mut state.card_index, card_token, session_id);
        }
        removed
    }

    /// Drop a session from every card it watches and discard its retry
    /// queue. Returns `false` if the session was unknown.
    pub fn remove_connection(&self, session_id: Uuid) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };

        let Some(subscriber) = state.subscribers.remove(&session_id) else {
            return false;
        };

        for card in &subscriber.cards {
            unindex(&mut state.card_index, card, session_id);
        }

        if !subscriber.queue.is_empty() {
            tracing::debug!(
                "Discarding {} queued alerts for session {}",
                subscriber.queue.len(),
                session_id
            );
        }

        drop(state);
        self.emit(BroadcasterEvent::ConnectionRemoved { session_id });
        true
    }

    /// Format `raw` once and push it to every session watching `card_token`.
    ///
    /// A failed write never fails the broadcast: the alert is queued for
    /// that session and reported as [`DeliveryOutcome::QueuedForRetry`].
    /// Order across broadcasts is not preserved for a session once retries
    /// are involved; a queued older alert can arrive after a newer one.
    pub fn broadcast_alert(
        &self,
        card_token: &str,
        raw: &RawTransaction,
    ) -> Result<BroadcastReport, BroadcastError> {
        let mut state = self.lock()?;
        let BroadcasterState {
            card_index,
            subscribers,
        } = &mut *state;

        let Some(session_ids) = card_index.get(card_token) else {
            return Ok(BroadcastReport::default());
        };

        let mut targets: Vec<Uuid> = session_ids.iter().copied().collect();
        targets.sort();

        if let Some(missing) = targets.iter().find(|id| !subscribers.contains_key(id)) {
            tracing::error!(
                "Session {} indexed under card {} has no transport",
                missing,
                card_token
            );
            return Err(BroadcastError::CorruptIndex {
                card_token: card_token.to_string(),
                session_id: *missing,
            });
        }

        let alert = format_transaction_alert(raw, Utc::now());
        let mut report = BroadcastReport::default();
        let mut dropped = Vec::new();

        for session_id in targets {
            let Some(subscriber) = subscribers.get_mut(&session_id) else {
                continue;
            };

            let outcome = match subscriber.transport.send(ServerMessage::Alert(alert.clone())) {
                Ok(()) => {
                    subscriber.queue.remove_transaction(&alert.transaction_id);
                    report.successful += 1;
                    DeliveryOutcome::Delivered
                }
                Err(e) => {
                    tracing::warn!(
                        "Alert {} to session {} failed, queued for retry: {}",
                        alert.transaction_id,
                        session_id,
                        e
                    );
                    if let Some(evicted) = subscriber.queue.push(alert.clone()) {
                        dropped.push((session_id, evicted));
                    }
                    report.failed += 1;
                    DeliveryOutcome::QueuedForRetry(e)
                }
            };

            report.sessions.push(SessionDelivery {
                session_id,
                outcome,
            });
        }

        drop(state);

        self.metrics.alerts_sent(report.successful as u64);
        self.metrics.deliveries_failed(report.failed as u64);
        for (session_id, entry) in dropped {
            self.record_drop(session_id, &entry, "retry queue full");
        }

        tracing::info!(
            "Broadcast {} for card {}: {} delivered, {} queued",
            alert.transaction_id,
            card_token,
            report.successful,
            report.failed
        );

        Ok(report)
    }

    /// Redeliver queued alerts, oldest first, for every session.
    pub fn retry_queued_messages(&self) -> RetrySummary {
        let Ok(mut state) = self.lock() else {
            return RetrySummary::default();
        };

        let max_attempts = self.config.max_retry_attempts;
        let mut summary = RetrySummary::default();
        let mut dropped = Vec::new();

        for (session_id, subscriber) in state.subscribers.iter_mut() {
            if subscriber.queue.is_empty() {
                continue;
            }

            let transport = Arc::clone(&subscriber.transport);
            let pass = subscriber
                .queue
                .retry_with(max_attempts, |alert| transport.send(ServerMessage::Alert(alert.clone())));

            summary.delivered += pass.delivered;
            summary.failed += pass.failed;
            dropped.extend(pass.dropped.into_iter().map(|entry| (*session_id, entry)));
        }

        drop(state);

        for _ in 0..summary.delivered {
            self.metrics.delivery_retried();
        }
        self.metrics.alerts_sent(summary.delivered as u64);
        self.metrics.deliveries_failed(summary.failed as u64);

        summary.dropped = dropped.len();
        for (session_id, entry) in dropped {
            self.record_drop(session_id, &entry, "retry attempts exhausted");
        }

        if summary != RetrySummary::default() {
            tracing::debug!(
                "Retry sweep: {} delivered, {} failed, {} dropped",
                summary.delivered,
                summary.failed,
                summary.dropped
            );
        }

        summary
    }

    fn record_drop(&self, session_id: Uuid, entry: &QueuedAlert, why: &str) {
        tracing::warn!(
            "Dropping alert {} for session {} after {} attempts ({})",
            entry.alert.transaction_id,
            session_id,
            entry.attempts,
            why
        );
        self.metrics.alert_dropped();
        self.emit(BroadcasterEvent::AlertDropped {
            session_id,
            transaction_id: entry.alert.transaction_id.clone(),
            attempts: entry.attempts,
        });
    }

    /// Sessions currently watching `card_token`, sorted
    pub fn subscribers(&self, card_token: &str) -> Vec<Uuid> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut ids: Vec<Uuid> = state
            .card_index
            .get(card_token)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Cards a session is registered against, sorted
    pub fn cards_for(&self, session_id: Uuid) -> Vec<String> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut cards: Vec<String> = state
            .subscribers
            .get(&session_id)
            .map(|s| s.cards.iter().cloned().collect())
            .unwrap_or_default();
        cards.sort();
        cards
    }

    /// Length of a session's retry queue, `None` for unknown sessions
    pub fn queue_len(&self, session_id: Uuid) -> Option<usize> {
        self.lock()
            .ok()?
            .subscribers
            .get(&session_id)
            .map(|s| s.queue.len())
    }

    /// Alerts waiting in a session's retry queue, oldest first
    pub fn queued_alerts(&self, session_id: Uuid) -> Vec<Alert> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        state
            .subscribers
            .get(&session_id)
            .map(|s| s.queue.iter().map(|e| e.alert.clone()).collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.lock().map(|s| s.subscribers.len()).unwrap_or(0)
    }

    pub fn card_count(&self) -> usize {
        self.lock().map(|s| s.card_index.len()).unwrap_or(0)
    }

    /// Forget every subscription and queued alert
    pub fn clear(&self) {
        if let Ok(mut state) = self.lock() {
            state.card_index.clear();
            state.subscribers.clear();
        }
    }
}

fn unindex(card_index: &mut HashMap<String, HashSet<Uuid>>, card_token: &str, session_id: Uuid) {
    if let Some(ids) = card_index.get_mut(card_token) {
        ids.remove(&session_id);
        if ids.is_empty() {
            card_index.remove(card_token);
            tracing::debug!("Removed empty card {} from index", card_token);
        }
    }
}

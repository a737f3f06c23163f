//! Shared test fixtures

#![allow(dead_code)]

use cardwatch::alert::{Alert, Merchant, MerchantInfo, RawTransaction};
use cardwatch::error::DeliveryError;
use cardwatch::protocol::ServerMessage;
use cardwatch::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Transport that records everything written to it and can be told to fail
#[derive(Default)]
pub struct RecordingTransport {
    messages: Mutex<Vec<ServerMessage>>,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let transport = Self::new();
        transport.set_failing(true);
        transport
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<ServerMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                ServerMessage::Alert(alert) => Some(alert),
                _ => None,
            })
            .collect()
    }

    pub fn alert_ids(&self) -> Vec<String> {
        self.alerts().into_iter().map(|a| a.transaction_id).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.messages().iter().filter(|m| m.kind() == kind).count()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, msg: ServerMessage) -> Result<(), DeliveryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeliveryError::Closed);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Io("simulated write failure".to_string()));
        }
        self.messages.lock().unwrap().push(msg);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A fully populated transaction event
pub fn sample_event(token: &str, card_token: &str) -> RawTransaction {
    RawTransaction {
        token: Some(token.to_string()),
        card_token: Some(card_token.to_string()),
        amount: Some(1250),
        status: Some("PENDING".to_string()),
        network: Some("VISA".to_string()),
        network_transaction_id: Some("nt-001".to_string()),
        authorization_code: Some("123456".to_string()),
        acquirer_reference_number: Some("arn-42".to_string()),
        created: None,
        merchant: Some(Merchant {
            descriptor: Some("Starbucks".to_string()),
            mcc: Some("5814".to_string()),
            city: Some("Seattle".to_string()),
            state: Some("WA".to_string()),
            country: Some("USA".to_string()),
        }),
        merchant_info: Some(MerchantInfo {
            mcc_description: Some("Fast Food Restaurants".to_string()),
            mcc_category: Some("Food & Dining".to_string()),
        }),
        is_first_transaction: Some(true),
        merchant_history: None,
        geographic_pattern: None,
    }
}

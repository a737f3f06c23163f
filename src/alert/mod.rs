//! Transaction events and the canonical alert pushed to agents
//!
//! Raw events come from the ingestion side (webhooks, simulations) and are
//! loosely shaped: every field is optional. [`format_transaction_alert`]
//! turns one into an [`Alert`] with documented defaults for anything absent.

mod format;

pub use format::{format_amount, format_location, format_transaction_alert};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert type tag for transaction notifications
pub const NEW_TRANSACTION: &str = "NEW_TRANSACTION";

/// Raw transaction event as supplied by the ingestion collaborator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawTransaction {
    /// Transaction token
    pub token: Option<String>,
    pub card_token: Option<String>,

    /// Amount in integer cents
    pub amount: Option<i64>,
    pub status: Option<String>,
    pub network: Option<String>,
    pub network_transaction_id: Option<String>,
    pub authorization_code: Option<String>,
    pub acquirer_reference_number: Option<String>,

    /// When the issuer recorded the transaction
    pub created: Option<DateTime<Utc>>,

    pub merchant: Option<Merchant>,
    pub merchant_info: Option<MerchantInfo>,

    // Enrichment computed upstream; passed through untouched
    #[serde(rename = "isFirstTransaction")]
    pub is_first_transaction: Option<bool>,
    #[serde(rename = "merchantHistory")]
    pub merchant_history: Option<String>,
    #[serde(rename = "geographicPattern")]
    pub geographic_pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Merchant {
    pub descriptor: Option<String>,
    pub mcc: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MerchantInfo {
    pub mcc_description: Option<String>,
    pub mcc_category: Option<String>,
}

/// Canonical notification for one transaction. Immutable once formatted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_type: String,
    pub timestamp: String,
    pub transaction_id: String,
    pub card_token: String,
    pub immediate: ImmediateDetails,
    pub verification: VerificationDetails,
    pub intelligence: Intelligence,
}

/// What the agent reads out first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmediateDetails {
    pub amount: String,
    pub merchant: String,
    pub location: String,
    pub status: String,
    pub network: String,
    #[serde(rename = "networkTransactionID")]
    pub network_transaction_id: String,
}

/// Details an agent can use to challenge the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationDetails {
    pub mcc_code: String,
    pub merchant_type: String,
    pub merchant_category: String,
    pub authorization_code: String,
    pub retrieval_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intelligence {
    pub is_first_transaction: bool,
    pub merchant_history: String,
    pub geographic_pattern: String,
}

impl Alert {
    /// Render the alert as a single JSON document
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

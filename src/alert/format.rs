//! Raw event -> Alert mapping

use super::{
    Alert, ImmediateDetails, Intelligence, Merchant, RawTransaction, VerificationDetails,
    NEW_TRANSACTION,
};
use chrono::{DateTime, SecondsFormat, Utc};

const UNKNOWN_MERCHANT: &str = "Unknown Merchant";
const UNKNOWN_LOCATION: &str = "Unknown Location";
const UNKNOWN: &str = "Unknown";
const NEW_MERCHANT: &str = "New merchant for this card";
const NEW_LOCATION: &str = "New location for this card";

/// Format a raw transaction event into the canonical alert.
///
/// Pure and infallible: the same `raw` and `observed_at` always produce the
/// same alert. The alert timestamp is the event's own `created` instant,
/// falling back to `observed_at` when the event carries none.
pub fn format_transaction_alert(raw: &RawTransaction, observed_at: DateTime<Utc>) -> Alert {
    let merchant = raw.merchant.clone().unwrap_or_default();
    let info = raw.merchant_info.clone().unwrap_or_default();

    Alert {
        alert_type: NEW_TRANSACTION.to_string(),
        timestamp: raw
            .created
            .unwrap_or(observed_at)
            .to_rfc3339_opts(SecondsFormat::Millis, true),
        transaction_id: or_empty(&raw.token),
        card_token: or_empty(&raw.card_token),
        immediate: ImmediateDetails {
            amount: format_amount(raw.amount.unwrap_or(0)),
            merchant: non_empty(&merchant.descriptor).unwrap_or(UNKNOWN_MERCHANT).to_string(),
            location: format_location(&merchant),
            status: or_empty(&raw.status),
            network: or_empty(&raw.network),
            network_transaction_id: or_empty(&raw.network_transaction_id),
        },
        verification: VerificationDetails {
            mcc_code: or_empty(&merchant.mcc),
            merchant_type: non_empty(&info.mcc_description).unwrap_or(UNKNOWN).to_string(),
            merchant_category: non_empty(&info.mcc_category).unwrap_or(UNKNOWN).to_string(),
            authorization_code: or_empty(&raw.authorization_code),
            retrieval_reference: or_empty(&raw.acquirer_reference_number),
        },
        intelligence: Intelligence {
            is_first_transaction: raw.is_first_transaction.unwrap_or(false),
            merchant_history: non_empty(&raw.merchant_history)
                .unwrap_or(NEW_MERCHANT)
                .to_string(),
            geographic_pattern: non_empty(&raw.geographic_pattern)
                .unwrap_or(NEW_LOCATION)
                .to_string(),
        },
    }
}

/// Render integer cents as dollars, e.g. `1250` -> `$12.50`
pub fn format_amount(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}${}.{:02}", sign, abs / 100, abs % 100)
}

/// Join the non-empty parts of city, state and country with ", "
pub fn format_location(merchant: &Merchant) -> String {
    let parts: Vec<&str> = [&merchant.city, &merchant.state, &merchant.country]
        .into_iter()
        .filter_map(non_empty)
        .collect();

    if parts.is_empty() {
        UNKNOWN_LOCATION.to_string()
    } else {
        parts.join(", ")
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn or_empty(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_amount_formatting() {
        assert_eq!(format_amount(1250), "$12.50");
        assert_eq!(format_amount(0), "$0.00");
        assert_eq!(format_amount(7), "$0.07");
        assert_eq!(format_amount(100000), "$1000.00");
        assert_eq!(format_amount(-1999), "-$19.99");
        assert_eq!(format_amount(i64::MIN), "-$92233720368547758.08");
    }

    #[test]
    fn test_location_skips_empty_parts() {
        let merchant = Merchant {
            city: Some("Portland".into()),
            state: Some("".into()),
            country: Some("USA".into()),
            ..Default::default()
        };
        assert_eq!(format_location(&merchant), "Portland, USA");
        assert_eq!(format_location(&Merchant::default()), "Unknown Location");
    }

    #[test]
    fn test_timestamp_prefers_created() {
        let created = Utc.with_ymd_and_hms(2023, 12, 24, 8, 30, 15).unwrap();
        let raw = RawTransaction {
            created: Some(created),
            ..Default::default()
        };
        let alert = format_transaction_alert(&raw, observed());
        assert_eq!(alert.timestamp, "2023-12-24T08:30:15.000Z");

        let alert = format_transaction_alert(&RawTransaction::default(), observed());
        assert_eq!(alert.timestamp, "2024-03-01T12:00:00.000Z");
    }

    #[test]
    fn test_defaults_for_empty_event() {
        let alert = format_transaction_alert(&RawTransaction::default(), observed());
        assert_eq!(alert.alert_type, "NEW_TRANSACTION");
        assert_eq!(alert.immediate.amount, "$0.00");
        assert_eq!(alert.verification.mcc_code, "");
        assert_eq!(alert.verification.merchant_type, "Unknown");
        assert_eq!(alert.verification.merchant_category, "Unknown");
        assert!(!alert.intelligence.is_first_transaction);
        assert_eq!(alert.intelligence.merchant_history, "New merchant for this card");
        assert_eq!(alert.intelligence.geographic_pattern, "New location for this card");
    }
}

//! Core domain model for Therabook: therapist records, accounts, booking
//! statuses and the derived combined status, profile options, sitemap URLs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "therabook-core";

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_CONFIRMED: &str = "confirmed";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_CANCELLED: &str = "cancelled";

/// Multi-valued trait facets attached to a therapist search row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TherapistTraits {
    pub mbti_type: Option<String>,
    pub age: Option<i32>,
    pub height: Option<i32>,
    pub service_style: Option<String>,
    pub facial_features: Option<String>,
    pub body_type: Option<String>,
    #[serde(default)]
    pub personality_traits: Vec<String>,
}

/// Client-facing flattened shape of one search-procedure row. Never
/// persisted; rebuilt on every search response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TherapistRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub detailed_area: Option<String>,
    pub price: i64,
    pub rating: f64,
    pub review_count: i64,
    pub image_url: Option<String>,
    pub traits: TherapistTraits,
}

/// Admin-facing view of a profile row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub account_type: String,
    /// Human-readable registration date shown in the dashboard.
    pub registered: String,
    pub registered_at: DateTime<Utc>,
    pub status: String,
}

impl Account {
    pub fn from_row_parts(
        id: Uuid,
        name: String,
        email: String,
        account_type: String,
        registered_at: DateTime<Utc>,
        status: String,
    ) -> Self {
        Self {
            id,
            name,
            email,
            account_type,
            registered: registered_at.format("%Y-%m-%d").to_string(),
            registered_at,
            status,
        }
    }
}

/// Status tracked independently for each booking party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyStatus {
    Unset,
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl PartyStatus {
    /// Raw DB strings; empty or unknown values read as not-yet-set.
    pub fn parse(raw: &str) -> Self {
        match raw {
            STATUS_PENDING => Self::Pending,
            STATUS_CONFIRMED => Self::Confirmed,
            STATUS_COMPLETED => Self::Completed,
            STATUS_CANCELLED => Self::Cancelled,
            _ => Self::Unset,
        }
    }

    fn at_least_confirmed(self) -> bool {
        matches!(self, Self::Confirmed | Self::Completed)
    }
}

/// Single display status derived from the two party statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombinedStatus {
    Pending,
    Cancelled,
    Confirmed,
    Completed,
}

impl CombinedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => STATUS_PENDING,
            Self::Cancelled => STATUS_CANCELLED,
            Self::Confirmed => STATUS_CONFIRMED,
            Self::Completed => STATUS_COMPLETED,
        }
    }
}

/// Maps the independent therapist/store status pair to exactly one display
/// status. Cancellation by either party dominates; completion requires both
/// parties at least confirmed.
pub fn calculate_combined_status(
    therapist: PartyStatus,
    store: PartyStatus,
) -> CombinedStatus {
    use PartyStatus::*;
    if therapist == Cancelled || store == Cancelled {
        return CombinedStatus::Cancelled;
    }
    if (therapist == Completed || store == Completed)
        && therapist.at_least_confirmed()
        && store.at_least_confirmed()
    {
        return CombinedStatus::Completed;
    }
    if therapist.at_least_confirmed() && store.at_least_confirmed() {
        return CombinedStatus::Confirmed;
    }
    CombinedStatus::Pending
}

/// Booking row as held transiently by the client; the combined display
/// status is always computed, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingData {
    pub therapist_id: Uuid,
    pub user_id: Uuid,
    pub service_id: Uuid,
    pub date: DateTime<Utc>,
    pub therapist_status: PartyStatus,
    pub store_status: PartyStatus,
}

impl BookingData {
    pub fn combined_status(&self) -> CombinedStatus {
        calculate_combined_status(self.therapist_status, self.store_status)
    }
}

/// One entry of a static or DB-sourced enumeration; no lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileOption {
    pub value: String,
    pub label: String,
}

impl ProfileOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// One `<url>` entry of the sitemap, assembled per request and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitemapUrl {
    pub loc: String,
    pub lastmod: Option<String>,
    pub changefreq: String,
    pub priority: String,
}

impl SitemapUrl {
    pub fn new(loc: impl Into<String>, changefreq: &str, priority: &str) -> Self {
        Self {
            loc: loc.into(),
            lastmod: None,
            changefreq: changefreq.to_string(),
            priority: priority.to_string(),
        }
    }

    pub fn with_lastmod(mut self, lastmod: impl Into<String>) -> Self {
        self.lastmod = Some(lastmod.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn combined(t: &str, s: &str) -> CombinedStatus {
        calculate_combined_status(PartyStatus::parse(t), PartyStatus::parse(s))
    }

    #[test]
    fn cancellation_dominates() {
        assert_eq!(combined("cancelled", "confirmed"), CombinedStatus::Cancelled);
        assert_eq!(combined("confirmed", "cancelled"), CombinedStatus::Cancelled);
        assert_eq!(combined("cancelled", "completed"), CombinedStatus::Cancelled);
    }

    #[test]
    fn both_confirmed_is_confirmed() {
        assert_eq!(combined("confirmed", "confirmed"), CombinedStatus::Confirmed);
    }

    #[test]
    fn completion_requires_both_at_least_confirmed() {
        assert_eq!(combined("completed", "confirmed"), CombinedStatus::Completed);
        assert_eq!(combined("confirmed", "completed"), CombinedStatus::Completed);
        assert_eq!(combined("completed", "completed"), CombinedStatus::Completed);
        assert_eq!(combined("completed", "pending"), CombinedStatus::Pending);
    }

    #[test]
    fn unset_party_reads_as_pending() {
        assert_eq!(combined("", "confirmed"), CombinedStatus::Pending);
        assert_eq!(combined("pending", "confirmed"), CombinedStatus::Pending);
        assert_eq!(combined("", ""), CombinedStatus::Pending);
    }

    #[test]
    fn booking_data_derives_display_status() {
        let booking = BookingData {
            therapist_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            date: Utc.with_ymd_and_hms(2026, 3, 1, 14, 0, 0).single().unwrap(),
            therapist_status: PartyStatus::Confirmed,
            store_status: PartyStatus::Confirmed,
        };
        assert_eq!(booking.combined_status(), CombinedStatus::Confirmed);
    }

    #[test]
    fn account_formats_registration_date() {
        let registered_at = Utc.with_ymd_and_hms(2026, 1, 15, 9, 30, 0).single().unwrap();
        let account = Account::from_row_parts(
            Uuid::new_v4(),
            "Kim Minji".into(),
            "minji@example.com".into(),
            "user".into(),
            registered_at,
            "active".into(),
        );
        assert_eq!(account.registered, "2026-01-15");
    }
}

//! Core domain model for the membership helper.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "mbh-core";

/// Membership state of a subscriber. Records are never removed, only flipped to `Deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberStatus {
    Subscribed,
    Deleted,
}

impl SubscriberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribed => "subscribed",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for SubscriberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown subscriber status `{}`", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for SubscriberStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscribed" => Ok(Self::Subscribed),
            "deleted" => Ok(Self::Deleted),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A newsletter list tracked by the dashboard. Every sync and attribution run is scoped to one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Newsletter {
    pub list_id: String,
    pub name: String,
    pub subscriber_count: i64,
    pub last_synced: Option<DateTime<Utc>>,
}

/// Stored subscriber row, keyed by the provider-assigned hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub subscriber_hash: String,
    pub status: SubscriberStatus,
    pub list_ids: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub total_clicks: i64,
}

impl Subscriber {
    pub fn is_member_of(&self, list_id: &str) -> bool {
        self.list_ids.iter().any(|id| id == list_id)
    }
}

/// One member record as returned by a roster page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterMember {
    pub subscriber_hash: String,
    pub opted_in_at: Option<DateTime<Utc>>,
}

/// Row handed to the store when a roster member is upserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberUpsert {
    pub subscriber_hash: String,
    pub list_id: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Raw provider activity event. Only `click` events carry meaning downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub action: String,
    pub url: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ActivityEvent {
    pub fn is_click(&self) -> bool {
        self.action == "click"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickRecord {
    pub id: i64,
    pub subscriber_hash: String,
    pub clicked_headline: String,
    pub newsletter: String,
    pub click_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewClickRecord {
    pub subscriber_hash: String,
    pub clicked_headline: String,
    pub newsletter: String,
    pub click_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadlineCount {
    pub clicked_headline: String,
    pub click_count: i64,
}

/// Member browsing query: ordered by `total_clicks` descending.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriberQuery {
    pub list_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl SubscriberQuery {
    pub fn top(limit: i64) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn for_list(mut self, list_id: impl Into<String>) -> Self {
        self.list_id = Some(list_id.into());
        self
    }

    pub fn created_after(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.created_after = at;
        self
    }
}

/// Click browsing query: newest first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClickQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub newsletter: Option<String>,
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_its_column_text() {
        for status in [SubscriberStatus::Subscribed, SubscriberStatus::Deleted] {
            assert_eq!(status.as_str().parse::<SubscriberStatus>(), Ok(status));
        }
        assert!("pending".parse::<SubscriberStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SubscriberStatus::Deleted).unwrap();
        assert_eq!(json, "\"deleted\"");
    }

    #[test]
    fn only_click_actions_count_as_clicks() {
        let click = ActivityEvent {
            action: "click".into(),
            url: None,
            timestamp: None,
        };
        let open = ActivityEvent {
            action: "open".into(),
            ..click.clone()
        };
        assert!(click.is_click());
        assert!(!open.is_click());
    }

    #[test]
    fn membership_checks_every_list() {
        let sub = Subscriber {
            subscriber_hash: "abc".into(),
            status: SubscriberStatus::Subscribed,
            list_ids: vec!["L1".into(), "L2".into()],
            created_at: None,
            total_clicks: 0,
        };
        assert!(sub.is_member_of("L2"));
        assert!(!sub.is_member_of("L3"));
    }
}
